//! Terminal stage: resolves every DTC touched by this document's chunks
//! into the knowledge graph and links catalog vehicles, then marks the
//! document complete.

use std::collections::HashMap;
use std::time::Instant;

use common::error::AppError;
use common::storage::types::chunk::Chunk;
use common::storage::types::document::{Document, ProcessingStage};
use common::storage::types::refined::{Cause, DiagnosticStep, DtcChunkLink};

use crate::context::StageContext;
use crate::stages::{begin_stage, complete_stage, fail_stage};

const STAGE_LABEL: &str = "resolving";

pub async fn run(ctx: &StageContext, document_id: &str) -> Result<(), AppError> {
    let document = ctx
        .db
        .get_item::<Document>(document_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

    let document = begin_stage(
        ctx,
        document,
        STAGE_LABEL,
        Some(ProcessingStage::Resolving),
    )
    .await?;

    let started_at = Instant::now();
    match resolve_document(ctx, &document).await {
        Ok(()) => {
            complete_stage(
                ctx,
                document,
                STAGE_LABEL,
                started_at,
                ProcessingStage::Complete,
            )
            .await?;
            Ok(())
        }
        Err(err) => {
            fail_stage(ctx, document, STAGE_LABEL, &err).await?;
            Err(err)
        }
    }
}

async fn resolve_document(ctx: &StageContext, document: &Document) -> Result<(), AppError> {
    let run_id = uuid::Uuid::new_v4().to_string();

    for dtc_id in distinct_dtc_ids(ctx, &document.id).await? {
        dedup_causes(ctx, &dtc_id).await?;
        dedup_diagnostic_steps(ctx, &dtc_id).await?;
        knowledge::upsert_dtc_knowledge(&ctx.db, &run_id, &dtc_id).await?;
    }

    knowledge::link_vehicles_for_document(&ctx.db, &document.id).await?;

    Ok(())
}

fn dedup_key(text: &str) -> String {
    text.trim().to_ascii_lowercase()
}

/// Given each row's `(id, text)`, groups by `lower(trim(text))` and returns the
/// ids of every row except the lowest-id member of each group.
fn duplicate_ids(rows: &[(String, String)]) -> Vec<String> {
    let mut groups: HashMap<String, Vec<&str>> = HashMap::new();
    for (id, text) in rows {
        groups.entry(dedup_key(text)).or_default().push(id);
    }

    let mut duplicates = Vec::new();
    for mut ids in groups.into_values() {
        if ids.len() < 2 {
            continue;
        }
        ids.sort_unstable();
        duplicates.extend(ids.into_iter().skip(1).map(str::to_string));
    }
    duplicates
}

/// Collapses `refined_cause` rows for a DTC that share `(dtc_id, lower(trim(text)))`
/// down to the lowest-id row, discarding the rest before they reach scoring.
async fn dedup_causes(ctx: &StageContext, dtc_id: &str) -> Result<(), AppError> {
    let rows: Vec<Cause> = ctx
        .db
        .query("SELECT * FROM refined_cause WHERE dtc_id = $dtc_id")
        .bind(("dtc_id", dtc_id.to_string()))
        .await
        .map_err(AppError::Database)?
        .take(0)
        .map_err(AppError::Database)?;

    let pairs: Vec<(String, String)> = rows.iter().map(|r| (r.id.clone(), r.text.clone())).collect();
    for id in duplicate_ids(&pairs) {
        ctx.db
            .delete_item::<Cause>(&id)
            .await
            .map_err(AppError::Database)?;
    }

    Ok(())
}

/// Same dedup as [`dedup_causes`], applied to `refined_diagnostic_step` rows.
async fn dedup_diagnostic_steps(ctx: &StageContext, dtc_id: &str) -> Result<(), AppError> {
    let rows: Vec<DiagnosticStep> = ctx
        .db
        .query("SELECT * FROM refined_diagnostic_step WHERE dtc_id = $dtc_id")
        .bind(("dtc_id", dtc_id.to_string()))
        .await
        .map_err(AppError::Database)?
        .take(0)
        .map_err(AppError::Database)?;

    let pairs: Vec<(String, String)> = rows.iter().map(|r| (r.id.clone(), r.text.clone())).collect();
    for id in duplicate_ids(&pairs) {
        ctx.db
            .delete_item::<DiagnosticStep>(&id)
            .await
            .map_err(AppError::Database)?;
    }

    Ok(())
}

async fn distinct_dtc_ids(ctx: &StageContext, document_id: &str) -> Result<Vec<String>, AppError> {
    let chunks: Vec<Chunk> = ctx
        .db
        .query("SELECT * FROM chunk WHERE document_id = $document_id")
        .bind(("document_id", document_id.to_string()))
        .await
        .map_err(AppError::Database)?
        .take(0)
        .map_err(AppError::Database)?;

    let mut dtc_ids = Vec::new();
    for chunk in chunks {
        let links: Vec<DtcChunkLink> = ctx
            .db
            .query("SELECT * FROM refined_dtc_chunk_link WHERE chunk_id = $chunk_id")
            .bind(("chunk_id", chunk.id.clone()))
            .await
            .map_err(AppError::Database)?
            .take(0)
            .map_err(AppError::Database)?;
        for link in links {
            if !dtc_ids.contains(&link.dtc_id) {
                dtc_ids.push(link.dtc_id);
            }
        }
    }

    Ok(dtc_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_keeps_lowest_id_per_normalized_text() {
        let rows = vec![
            ("b".to_string(), "Failed oxygen sensor".to_string()),
            ("a".to_string(), "  failed OXYGEN sensor ".to_string()),
            ("c".to_string(), "unrelated cause".to_string()),
        ];

        assert_eq!(duplicate_ids(&rows), vec!["b".to_string()]);
    }

    #[test]
    fn duplicate_ids_empty_when_no_group_has_more_than_one_member() {
        let rows = vec![
            ("a".to_string(), "first cause".to_string()),
            ("b".to_string(), "second cause".to_string()),
        ];

        assert!(duplicate_ids(&rows).is_empty());
    }
}
