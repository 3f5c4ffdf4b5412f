mod support;

use common::storage::types::chunk::{Chunk, ChunkEvaluation, DomainTag};
use common::storage::types::knowledge::causes::KnowledgeCause;
use common::storage::types::knowledge::DtcMaster;
use common::storage::types::refined::{Cause, DtcCode, DiagnosticStep};
use scoring::entity_score::{
    compute_score, EntityKind, EntityVehicleInfo, PracticalImpactInput, ScoreInput, VehicleContext,
};

async fn chunks_for(ctx: &pipeline::StageContext, document_id: &str) -> Vec<Chunk> {
    ctx.db
        .query("SELECT * FROM chunk WHERE document_id = $document_id ORDER BY chunk_index ASC")
        .bind(("document_id", document_id.to_string()))
        .await
        .expect("query chunks")
        .take(0)
        .expect("deserialize chunks")
}

const EVALUATE_RESPONSE: &str =
    r#"{"trust": 0.8, "relevance": 0.9, "domain": "engine", "reasoning": "consistent with known P0420 causes"}"#;

fn extract_response(cause_text: &str) -> String {
    format!(
        r#"{{"dtc_codes": [{{"code": "P0420", "description": "Catalyst system efficiency below threshold", "category": "emissions", "severity": "moderate"}}], "causes": [{{"dtc_code": "P0420", "text": "{cause_text}", "likelihood": 0.8}}], "diagnostic_steps": [], "sensors": [], "tsb_references": []}}"#
    )
}

/// A single document runs through every stage and lands on a resolved
/// DTC master row whose confidence reflects one source at 0.8 trust.
#[tokio::test]
async fn single_document_reaches_resolved_dtc_with_expected_confidence() {
    let ctx = support::test_stage_context(
        vec![vec![0.1, 0.2, 0.3]],
        vec![EVALUATE_RESPONSE.to_string(), extract_response("Failed downstream oxygen sensor")],
    )
    .await;
    let doc_id = support::seed_document(&ctx, "P0420 is a catalyst efficiency code below threshold.").await;

    pipeline::stages::chunk::run(&ctx, &doc_id).await.expect("chunk");
    pipeline::stages::embed::run(&ctx, &doc_id).await.expect("embed");
    pipeline::stages::evaluate::run(&ctx, &doc_id).await.expect("evaluate");
    pipeline::stages::extract::run(&ctx, &doc_id).await.expect("extract");
    pipeline::stages::resolve::run(&ctx, &doc_id).await.expect("resolve");

    let chunks = chunks_for(&ctx, &doc_id).await;
    assert_eq!(chunks.len(), 1);

    let evaluation: ChunkEvaluation = ctx
        .db
        .get_item(&chunks[0].id)
        .await
        .expect("query evaluation")
        .expect("evaluation exists");
    assert_eq!(evaluation.trust, 0.8);
    assert_eq!(evaluation.relevance, 0.9);
    assert_eq!(evaluation.domain, DomainTag::Engine);

    let dtc_codes: Vec<DtcCode> = ctx.db.get_all_stored_items().await.expect("dtc codes");
    assert_eq!(dtc_codes.len(), 1);
    assert_eq!(dtc_codes[0].code, "P0420");

    let causes: Vec<Cause> = ctx.db.get_all_stored_items().await.expect("causes");
    assert_eq!(causes.len(), 1);

    let steps: Vec<DiagnosticStep> = ctx.db.get_all_stored_items().await.expect("steps");
    assert!(steps.is_empty());

    let masters: Vec<DtcMaster> = ctx.db.get_all_stored_items().await.expect("dtc masters");
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].source_count, 1);
    assert!((masters[0].confidence - 0.62).abs() < 1e-9);
}

/// Two documents that each contribute one cause for the same code merge
/// into a single knowledge_cause row once resolution runs, rather than
/// two separate entries.
#[tokio::test]
async fn two_documents_merge_into_one_knowledge_cause() {
    let ctx = support::test_stage_context(
        vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]],
        vec![
            EVALUATE_RESPONSE.to_string(),
            extract_response("Failed downstream oxygen sensor"),
            r#"{"trust": 0.6, "relevance": 0.7, "domain": "engine", "reasoning": "matches a similar report"}"#
                .to_string(),
            extract_response("failed downstream oxygen sensor "),
        ],
    )
    .await;

    let doc1 = support::seed_document(&ctx, "P0420 catalyst code, first report.").await;
    let doc2 = support::seed_document(&ctx, "P0420 catalyst code, second report.").await;

    for doc_id in [&doc1, &doc2] {
        pipeline::stages::chunk::run(&ctx, doc_id).await.expect("chunk");
        pipeline::stages::embed::run(&ctx, doc_id).await.expect("embed");
        pipeline::stages::evaluate::run(&ctx, doc_id).await.expect("evaluate");
        pipeline::stages::extract::run(&ctx, doc_id).await.expect("extract");
    }

    // Both documents extract into the same shared refined_dtc_code row (same
    // code), so resolving either one picks up both documents' causes in a
    // single upsert pass.
    pipeline::stages::resolve::run(&ctx, &doc1).await.expect("resolve");

    let causes: Vec<KnowledgeCause> = ctx.db.get_all_stored_items().await.expect("knowledge causes");
    assert_eq!(causes.len(), 1);
    assert_eq!(causes[0].evidence_count, 2);
    assert!((causes[0].avg_trust - 0.7).abs() < 1e-9);
    assert!((causes[0].avg_relevance - 0.8).abs() < 1e-9);
}

/// A vehicle-make mismatch drags a cause's overall score down by more than
/// 20 points relative to scoring it with no vehicle context at all.
#[test]
fn vehicle_make_mismatch_drops_score_by_at_least_twenty_points() {
    let base = ScoreInput {
        kind: Some(EntityKind::Cause),
        avg_trust: 0.8,
        avg_relevance: 0.9,
        evidence_count: 3,
        vehicle: EntityVehicleInfo {
            make: Some("Toyota".to_string()),
            ..Default::default()
        },
        impact: PracticalImpactInput {
            probability_weight: 0.7,
            ..Default::default()
        },
    };
    let ford_context = VehicleContext {
        make: Some("Ford".to_string()),
        model: None,
        year: None,
    };

    let mismatched_score = compute_score(&base, &ford_context);
    let neutral_score = compute_score(
        &ScoreInput {
            vehicle: EntityVehicleInfo::default(),
            ..base
        },
        &ford_context,
    );

    assert!(neutral_score - mismatched_score >= 20.0);
}
