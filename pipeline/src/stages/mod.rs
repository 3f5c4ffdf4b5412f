//! One module per DAG stage. Each exposes a single `run` entry point taking
//! the claimed queue payload and a `StageContext`, following the skeleton
//! every worker shares: transition in, do the work, transition out (or
//! fail) across six independently-claimed queues.

pub mod chunk;
pub mod crawl;
pub mod embed;
pub mod evaluate;
pub mod extract;
pub mod resolve;

use std::time::Instant;

use common::error::AppError;
use common::queue::{SurrealWorkQueue, WorkQueue};
use common::storage::types::document::{Document, LogStatus, ProcessingStage};

use crate::context::StageContext;

const MAX_ERROR_MESSAGE_CHARS: usize = 500;

pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
    }
}

/// Marks the start of a stage's work. `in_progress` is `Some` for stages
/// that have a dedicated in-progress variant (`Crawling`, `Chunking`,
/// `Embedding`, `Resolving`); evaluate and extract have no such variant and
/// simply log `started` without moving the document off its current stage.
pub async fn begin_stage(
    ctx: &StageContext,
    mut document: Document,
    label: &str,
    in_progress: Option<ProcessingStage>,
) -> Result<Document, AppError> {
    if let Some(stage) = in_progress {
        document.processing_stage = stage;
    }
    document.append_log(label, LogStatus::Started, None, None);
    let id = document.id.clone();
    ctx.db
        .update_item(document)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {id}")))
}

/// Marks a stage as completed: logs duration, advances `processing_stage`,
/// and pushes onto the next queue (best-effort, per the stage-transition
/// contract — a push failure leaves the document in its new stage for the
/// sweeper to recover).
pub async fn complete_stage(
    ctx: &StageContext,
    mut document: Document,
    label: &str,
    started_at: Instant,
    done_stage: ProcessingStage,
) -> Result<Document, AppError> {
    let duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    document.append_log(label, LogStatus::Completed, None, Some(duration_ms));
    document.processing_stage = done_stage;
    let id = document.id.clone();
    let document = ctx
        .db
        .update_item(document)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {id}")))?;

    if let Some(queue_name) = done_stage.queue_name() {
        let queue = SurrealWorkQueue::new(&ctx.db);
        if let Err(err) = queue.push(queue_name, &document.id).await {
            tracing::warn!(document_id = %document.id, queue_name, error = %err, "failed to push next-stage job; sweeper will recover");
        }
    }

    Ok(document)
}

/// Marks a stage as failed: logs the truncated error and moves the document
/// to `error`. Per the propagation rule, this never itself fails the worker
/// loop — callers log and continue consuming.
pub async fn fail_stage(
    ctx: &StageContext,
    mut document: Document,
    label: &str,
    error: &AppError,
) -> Result<(), AppError> {
    let message = truncate_message(&error.to_string());
    document.append_log(label, LogStatus::Failed, Some(message.clone()), None);
    document.processing_stage = ProcessingStage::Error;
    document.error_message = Some(message);
    ctx.db.update_item(document).await?;
    Ok(())
}

/// Three-fallback JSON recovery shared by the Evaluate and Extract stages:
/// direct parse, a fenced code block, then the outermost `{...}` span.
/// Returns `None` if none of the three produce valid JSON for `T`.
pub fn parse_json_with_fallbacks<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    if let Ok(parsed) = serde_json::from_str::<T>(raw) {
        return Some(parsed);
    }

    if let Some(fenced) = extract_fenced_block(raw) {
        if let Ok(parsed) = serde_json::from_str::<T>(&fenced) {
            return Some(parsed);
        }
    }

    if let Some(braces) = extract_outermost_braces(raw) {
        if let Ok(parsed) = serde_json::from_str::<T>(&braces) {
            return Some(parsed);
        }
    }

    None
}

fn extract_fenced_block(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim().to_string())
}

fn extract_outermost_braces(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(raw[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn truncate_message_respects_500_char_bound() {
        let long = "x".repeat(600);
        assert_eq!(truncate_message(&long).chars().count(), 500);
        assert_eq!(truncate_message("short"), "short");
    }

    #[derive(Deserialize, PartialEq, Debug)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn parse_json_with_fallbacks_tries_direct_then_fenced_then_braces() {
        assert_eq!(
            parse_json_with_fallbacks::<Sample>(r#"{"value": 1}"#),
            Some(Sample { value: 1 })
        );
        assert_eq!(
            parse_json_with_fallbacks::<Sample>("```json\n{\"value\": 2}\n```"),
            Some(Sample { value: 2 })
        );
        assert_eq!(
            parse_json_with_fallbacks::<Sample>("noise {\"value\": 3} trailing"),
            Some(Sample { value: 3 })
        );
        assert_eq!(parse_json_with_fallbacks::<Sample>("not json"), None);
    }
}
