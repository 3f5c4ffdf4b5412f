//! Upserts `refined_*` rows for a single DTC into the `knowledge_*` tables,
//! scoring and merging candidates along the way and leaving a resolution
//! log + provenance trail behind.

use std::time::Duration;

use common::error::AppError;
use common::storage::db::SurrealDbClient;
use common::storage::types::chunk::ChunkEvaluation;
use common::storage::types::knowledge::{
    causes::KnowledgeCause, diagnostic_steps::KnowledgeDiagnosticStep, sensors::KnowledgeSensor,
    DtcCategory, DtcMaster, VerificationStatus,
};
use common::storage::types::provenance::{ProvenanceSource, ResolutionAction, ResolutionLogEntry};
use common::storage::types::refined::{Cause, DiagnosticStep, DtcChunkLink, DtcCode, Sensor};

use scoring::entity_score::{
    compute_score, EntityKind, EntityVehicleInfo, PracticalImpactInput, ScoreInput,
    VehicleContext,
};
use scoring::merger::{merge_text_entities, MergeCandidate};

const STORE_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 800;

#[derive(Debug, Default, Clone, Copy)]
pub struct UpsertStats {
    pub dtc_master_upserted: u32,
    pub causes_upserted: u32,
    pub steps_upserted: u32,
    pub sensors_upserted: u32,
    pub sources_recorded: u32,
    pub entities_merged: u32,
}

/// Resolves every `refined_*` row currently attached to `dtc_id` into the
/// `knowledge_*` tables. Idempotent: callers may re-run this for a DTC any
/// number of times as new source documents contribute evidence.
pub async fn upsert_dtc_knowledge(
    db: &SurrealDbClient,
    run_id: &str,
    dtc_id: &str,
) -> Result<UpsertStats, AppError> {
    let mut stats = UpsertStats::default();

    let Some(master_id) = upsert_dtc_master(db, run_id, dtc_id, &mut stats).await? else {
        return Ok(stats);
    };

    upsert_causes(db, &master_id, dtc_id, &mut stats).await?;
    upsert_diagnostic_steps(db, &master_id, dtc_id, &mut stats).await?;
    upsert_sensors(db, &master_id, dtc_id, &mut stats).await?;

    Ok(stats)
}

async fn avg_trust_for_dtc(db: &SurrealDbClient, dtc_id: &str) -> Result<f64, AppError> {
    let links: Vec<DtcChunkLink> = {
        let mut response = db
            .query("SELECT * FROM refined_dtc_chunk_link WHERE dtc_id = $dtc_id")
            .bind(("dtc_id", dtc_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    if links.is_empty() {
        return Ok(0.5);
    }

    let mut total = 0.0;
    let mut count = 0u32;
    for link in links {
        if let Some(evaluation) = db.get_item::<ChunkEvaluation>(&link.chunk_id).await? {
            total += evaluation.trust;
            count += 1;
        }
    }

    if count == 0 {
        Ok(0.5)
    } else {
        Ok(total / f64::from(count))
    }
}

async fn upsert_dtc_master(
    db: &SurrealDbClient,
    run_id: &str,
    dtc_id: &str,
    stats: &mut UpsertStats,
) -> Result<Option<String>, AppError> {
    let Some(refined) = db.get_item::<DtcCode>(dtc_id).await? else {
        return Ok(None);
    };

    let code = DtcCode::normalize_code(&refined.code);
    let avg_trust = avg_trust_for_dtc(db, dtc_id).await?;
    let now = chrono::Utc::now();
    let emissions_related = code.starts_with("P0") && code.len() == 5;

    let existing: Option<DtcMaster> = {
        let mut response = db
            .query("SELECT * FROM knowledge_dtc_master WHERE code = $code LIMIT 1")
            .bind(("code", code.clone()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    let action = if existing.is_some() {
        ResolutionAction::Updated
    } else {
        ResolutionAction::Created
    };

    let mut master = existing.unwrap_or_else(|| DtcMaster {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        code: code.clone(),
        category: DtcCategory::from_free_text(&refined.category),
        severity_level: common::storage::types::knowledge::severity_from_free_text(
            &refined.severity,
        ),
        emissions_related,
        description: None,
        confidence: 0.0,
        source_count: refined.source_count,
        verification_status: VerificationStatus::Unverified,
        verified_at: None,
    });

    if master.description.is_none() && !refined.description.is_empty() {
        master.description = Some(refined.description.clone());
    }
    master.source_count = refined.source_count;
    master.recompute_confidence(avg_trust);
    master.updated_at = now;

    let master_id = master.id.clone();
    store_with_retry(db, master).await?;
    stats.dtc_master_upserted += 1;

    record_resolution(
        db,
        run_id,
        &master_id,
        action,
        "knowledge_dtc_master",
        &master_id,
        serde_json::json!({"code": code, "source_count": refined.source_count}),
    )
    .await?;

    Ok(Some(master_id))
}

async fn upsert_causes(
    db: &SurrealDbClient,
    master_id: &str,
    dtc_id: &str,
    stats: &mut UpsertStats,
) -> Result<(), AppError> {
    let rows: Vec<Cause> = {
        let mut response = db
            .query("SELECT * FROM refined_cause WHERE dtc_id = $dtc_id")
            .bind(("dtc_id", dtc_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };
    if rows.is_empty() {
        return Ok(());
    }

    let ctx = VehicleContext::default();
    let mut candidates = Vec::with_capacity(rows.len());
    for cause in &rows {
        let evaluation = db.get_item::<ChunkEvaluation>(&cause.chunk_id).await?;
        let trust = evaluation.as_ref().map_or(0.5, |e| e.trust);
        let relevance = evaluation.as_ref().map_or(0.5, |e| e.relevance);
        let score = compute_score(
            &ScoreInput {
                kind: Some(EntityKind::Cause),
                avg_trust: trust,
                avg_relevance: relevance,
                evidence_count: 1,
                vehicle: EntityVehicleInfo::default(),
                impact: PracticalImpactInput {
                    probability_weight: cause.likelihood,
                    ..Default::default()
                },
            },
            &ctx,
        );
        candidates.push(MergeCandidate {
            id: cause.id.clone(),
            text: cause.text.clone(),
            score,
            evidence_count: 1,
            avg_trust: trust,
            avg_relevance: relevance,
            source_chunk_ids: vec![cause.chunk_id.clone()],
        });
    }

    let (merged, rejected) = merge_text_entities(candidates);
    stats.entities_merged += u32::try_from(rejected.len()).unwrap_or(u32::MAX);

    for candidate in merged {
        upsert_knowledge_cause(db, master_id, &candidate).await?;
        stats.causes_upserted += 1;
        for chunk_id in &candidate.source_chunk_ids {
            record_provenance(
                db,
                "knowledge_cause",
                &candidate.id,
                chunk_id,
                candidate.avg_trust,
                candidate.avg_relevance,
            )
            .await?;
            stats.sources_recorded += 1;
        }
    }

    Ok(())
}

/// `avg_trust`/`avg_relevance` update with `(old + new) / 2` on every
/// re-delivery rather than a count-weighted running mean. Matches the
/// original upserter's behavior exactly; not fixed per standing guidance
/// to preserve documented quirks rather than silently correct them.
async fn upsert_knowledge_cause(
    db: &SurrealDbClient,
    master_id: &str,
    candidate: &MergeCandidate,
) -> Result<(), AppError> {
    let existing: Option<KnowledgeCause> = {
        let mut response = db
            .query(
                "SELECT * FROM knowledge_cause WHERE dtc_id = $dtc_id AND string::lowercase(text) = $text LIMIT 1",
            )
            .bind(("dtc_id", master_id.to_string()))
            .bind(("text", candidate.text.to_ascii_lowercase()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    let now = chrono::Utc::now();
    let row = match existing {
        Some(mut current) => {
            current.evidence_count += candidate.evidence_count;
            current.avg_trust = (current.avg_trust + candidate.avg_trust) / 2.0;
            current.avg_relevance = (current.avg_relevance + candidate.avg_relevance) / 2.0;
            for chunk_id in &candidate.source_chunk_ids {
                if !current.source_chunk_ids.contains(chunk_id) {
                    current.source_chunk_ids.push(chunk_id.clone());
                }
            }
            current.updated_at = now;
            current
        }
        None => KnowledgeCause {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            dtc_id: master_id.to_string(),
            text: candidate.text.clone(),
            evidence_count: candidate.evidence_count,
            avg_trust: candidate.avg_trust,
            avg_relevance: candidate.avg_relevance,
            vehicle_make: None,
            vehicle_model: None,
            year_start: None,
            year_end: None,
            priority_rank: None,
            source_chunk_ids: candidate.source_chunk_ids.clone(),
        },
    };
    store_with_retry(db, row).await?;
    Ok(())
}

async fn upsert_diagnostic_steps(
    db: &SurrealDbClient,
    master_id: &str,
    dtc_id: &str,
    stats: &mut UpsertStats,
) -> Result<(), AppError> {
    let rows: Vec<DiagnosticStep> = {
        let mut response = db
            .query("SELECT * FROM refined_diagnostic_step WHERE dtc_id = $dtc_id ORDER BY step_order ASC")
            .bind(("dtc_id", dtc_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    for step in rows {
        let evaluation = db.get_item::<ChunkEvaluation>(&step.chunk_id).await?;
        let trust = evaluation.as_ref().map_or(0.5, |e| e.trust);
        let relevance = evaluation.as_ref().map_or(0.5, |e| e.relevance);

        let existing: Option<KnowledgeDiagnosticStep> = {
            let mut response = db
                .query(
                    "SELECT * FROM knowledge_diagnostic_step WHERE dtc_id = $dtc_id AND string::lowercase(text) = $text LIMIT 1",
                )
                .bind(("dtc_id", master_id.to_string()))
                .bind(("text", step.text.to_ascii_lowercase()))
                .await
                .map_err(AppError::Database)?;
            response.take(0).map_err(AppError::Database)?
        };
        if existing.is_some() {
            continue;
        }

        let now = chrono::Utc::now();
        let row = KnowledgeDiagnosticStep {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            dtc_id: master_id.to_string(),
            text: step.text.clone(),
            evidence_count: 1,
            avg_trust: trust,
            avg_relevance: relevance,
            vehicle_make: None,
            vehicle_model: None,
            year_start: None,
            year_end: None,
            priority_rank: Some(step.step_order),
            source_chunk_ids: vec![step.chunk_id.clone()],
        };
        let row_id = row.id.clone();
        store_with_retry(db, row).await?;
        stats.steps_upserted += 1;
        record_provenance(
            db,
            "knowledge_diagnostic_step",
            &row_id,
            &step.chunk_id,
            trust,
            relevance,
        )
        .await?;
        stats.sources_recorded += 1;
    }

    Ok(())
}

async fn upsert_sensors(
    db: &SurrealDbClient,
    master_id: &str,
    dtc_id: &str,
    stats: &mut UpsertStats,
) -> Result<(), AppError> {
    let Some(refined_dtc) = db.get_item::<DtcCode>(dtc_id).await? else {
        return Ok(());
    };

    let rows: Vec<Sensor> = {
        let mut response = db
            .query("SELECT * FROM refined_sensor WHERE $code IN related_dtc_codes")
            .bind(("code", refined_dtc.code.clone()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    for sensor in rows {
        let evaluation = db.get_item::<ChunkEvaluation>(&sensor.chunk_id).await?;
        let trust = evaluation.as_ref().map_or(0.5, |e| e.trust);
        let relevance = evaluation.as_ref().map_or(0.5, |e| e.relevance);

        let existing: Option<KnowledgeSensor> = {
            let mut response = db
                .query(
                    "SELECT * FROM knowledge_sensor WHERE dtc_id = $dtc_id AND string::lowercase(text) = $text LIMIT 1",
                )
                .bind(("dtc_id", master_id.to_string()))
                .bind(("text", sensor.name.to_ascii_lowercase()))
                .await
                .map_err(AppError::Database)?;
            response.take(0).map_err(AppError::Database)?
        };

        let now = chrono::Utc::now();
        let row = match existing {
            Some(mut current) => {
                current.evidence_count += 1;
                current.avg_trust = (current.avg_trust + trust) / 2.0;
                current.avg_relevance = (current.avg_relevance + relevance) / 2.0;
                if !current.source_chunk_ids.contains(&sensor.chunk_id) {
                    current.source_chunk_ids.push(sensor.chunk_id.clone());
                }
                current.updated_at = now;
                current
            }
            None => KnowledgeSensor {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                dtc_id: master_id.to_string(),
                text: sensor.name.clone(),
                evidence_count: 1,
                avg_trust: trust,
                avg_relevance: relevance,
                vehicle_make: None,
                vehicle_model: None,
                year_start: None,
                year_end: None,
                priority_rank: None,
                source_chunk_ids: vec![sensor.chunk_id.clone()],
            },
        };

        let row_id = row.id.clone();
        store_with_retry(db, row).await?;
        stats.sensors_upserted += 1;
        record_provenance(
            db,
            "knowledge_sensor",
            &row_id,
            &sensor.chunk_id,
            trust,
            relevance,
        )
        .await?;
        stats.sources_recorded += 1;
    }

    Ok(())
}

async fn record_provenance(
    db: &SurrealDbClient,
    entity_table: &str,
    entity_id: &str,
    chunk_id: &str,
    trust: f64,
    relevance: f64,
) -> Result<(), AppError> {
    let now = chrono::Utc::now();
    db.store_item(ProvenanceSource {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        entity_table: entity_table.to_string(),
        entity_id: entity_id.to_string(),
        chunk_id: chunk_id.to_string(),
        trust,
        relevance,
    })
    .await?;
    Ok(())
}

async fn record_resolution(
    db: &SurrealDbClient,
    run_id: &str,
    dtc_master_id: &str,
    action: ResolutionAction,
    entity_table: &str,
    entity_id: &str,
    details: serde_json::Value,
) -> Result<(), AppError> {
    let now = chrono::Utc::now();
    db.store_item(ResolutionLogEntry {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        run_id: run_id.to_string(),
        action,
        entity_table: entity_table.to_string(),
        entity_id: format!("{dtc_master_id}:{entity_id}"),
        details,
    })
    .await?;
    Ok(())
}

/// Retries a `store_item` on SurrealDB's optimistic-concurrency conflict
/// error with exponential backoff; any other error is fatal immediately.
async fn store_with_retry<T>(db: &SurrealDbClient, item: T) -> Result<(), AppError>
where
    T: common::storage::types::StoredObject + Clone + Send + Sync + 'static,
{
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let last_attempt = STORE_ATTEMPTS.saturating_sub(1);

    for attempt in 0..STORE_ATTEMPTS {
        match db.update_item(item.clone()).await {
            Ok(_) => return Ok(()),
            Err(err) if is_retryable_conflict(&err) && attempt < last_attempt => {
                tracing::warn!(attempt = attempt + 1, "transient conflict storing knowledge row, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
            Err(err) => return Err(AppError::Database(err)),
        }
    }

    Err(AppError::InternalError(
        "failed to store knowledge row after retries".to_string(),
    ))
}

fn is_retryable_conflict(error: &surrealdb::Error) -> bool {
    error
        .to_string()
        .contains("Failed to commit transaction due to a read or write conflict")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_dtc_master_creates_row_from_refined_code() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");

        let now = chrono::Utc::now();
        db.store_item(DtcCode {
            id: "refined-1".into(),
            created_at: now,
            updated_at: now,
            code: " p0301 ".into(),
            description: "Cylinder 1 misfire".into(),
            category: "powertrain".into(),
            severity: "high".into(),
            confidence: 0.0,
            source_count: 2,
        })
        .await
        .expect("store refined code");

        let mut stats = UpsertStats::default();
        let master_id = upsert_dtc_master(&db, "run-1", "refined-1", &mut stats)
            .await
            .expect("upsert master")
            .expect("master created");

        let master: DtcMaster = db
            .get_item(&master_id)
            .await
            .expect("query")
            .expect("master row exists");
        assert_eq!(master.code, "P0301");
        assert_eq!(master.category, DtcCategory::Powertrain);
        assert_eq!(master.severity_level, 4);
    }
}
