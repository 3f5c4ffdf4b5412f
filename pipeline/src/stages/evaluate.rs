//! Scores each chunk's trustworthiness and domain relevance with the
//! reasoning model, optionally grounded with a best-effort web search.

use std::time::Instant;

use serde::Deserialize;

use common::error::AppError;
use common::storage::types::chunk::{Chunk, ChunkEvaluation, DomainTag};
use common::storage::types::document::{Document, ProcessingStage};

use crate::context::StageContext;
use crate::stages::{begin_stage, complete_stage, fail_stage, parse_json_with_fallbacks};

const STAGE_LABEL: &str = "evaluating";
const SYSTEM_PROMPT: &str = "You are an automotive diagnostic document evaluator. \
Given a chunk of technical text, rate how trustworthy and how relevant it is to \
vehicle diagnostics, and classify its mechanical domain. Respond with JSON only: \
{\"trust\": <0-1>, \"relevance\": <0-1>, \"domain\": <string>, \"reasoning\": <string>}.";

#[derive(Deserialize, Default)]
struct RawEvaluation {
    #[serde(default)]
    trust: f64,
    #[serde(default)]
    relevance: f64,
    #[serde(default = "default_domain")]
    domain: String,
    #[serde(default)]
    reasoning: String,
}

fn default_domain() -> String {
    "unknown".to_string()
}

pub async fn run(ctx: &StageContext, document_id: &str) -> Result<(), AppError> {
    let document = ctx
        .db
        .get_item::<Document>(document_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

    let document = begin_stage(ctx, document, STAGE_LABEL, None).await?;

    let started_at = Instant::now();
    match evaluate_chunks(ctx, &document).await {
        Ok(()) => {
            complete_stage(
                ctx,
                document,
                STAGE_LABEL,
                started_at,
                ProcessingStage::Evaluating,
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

async fn evaluate_chunks(ctx: &StageContext, document: &Document) -> Result<(), AppError> {
    let chunks: Vec<Chunk> = ctx
        .db
        .query("SELECT * FROM chunk WHERE document_id = $document_id ORDER BY chunk_index ASC")
        .bind(("document_id", document.id.clone()))
        .await
        .map_err(AppError::Database)?
        .take(0)
        .map_err(AppError::Database)?;

    for chunk in chunks {
        let search_context = gather_search_context(ctx, &chunk.text).await;
        let user_prompt = build_user_prompt(&chunk.text, search_context.as_deref());
        let raw_response = ctx
            .llm
            .complete(SYSTEM_PROMPT, &user_prompt, true, 0.1)
            .await?;
        let parsed = parse_evaluation_response(&raw_response);

        let evaluation = ChunkEvaluation {
            id: chunk.id.clone(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            chunk_id: chunk.id.clone(),
            trust: parsed.trust,
            relevance: parsed.relevance,
            domain: DomainTag::parse_or_unknown(&parsed.domain),
            reasoning: parsed.reasoning,
            model: ctx.config.reasoning_model.clone(),
        }
        .clamp_scores()
        .truncate_reasoning();

        ctx.db.update_item(evaluation).await?;
    }

    Ok(())
}

async fn gather_search_context(ctx: &StageContext, chunk_text: &str) -> Option<String> {
    let query: String = chunk_text.chars().take(200).collect();
    match ctx.search.search(&query).await {
        Ok(results) => {
            if results.is_empty() {
                None
            } else {
                Some(
                    results
                        .into_iter()
                        .take(3)
                        .map(|r| format!("{}: {}", r.title, r.snippet))
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "search enrichment failed, continuing without it");
            None
        }
    }
}

fn build_user_prompt(chunk_text: &str, search_context: Option<&str>) -> String {
    match search_context {
        Some(context) => format!(
            "Chunk:\n{chunk_text}\n\nRelated search results:\n{context}\n\nEvaluate the chunk."
        ),
        None => format!("Chunk:\n{chunk_text}\n\nEvaluate the chunk."),
    }
}

/// Malformed output never fails the stage — it becomes a safe default
/// record with `domain=unknown` and empty reasoning.
fn parse_evaluation_response(raw: &str) -> RawEvaluation {
    parse_json_with_fallbacks(raw).unwrap_or_else(|| RawEvaluation {
        trust: 0.0,
        relevance: 0.0,
        domain: default_domain(),
        reasoning: "unparseable evaluation response".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_json() {
        let raw = r#"{"trust": 0.8, "relevance": 0.9, "domain": "engine", "reasoning": "clear"}"#;
        let parsed = parse_evaluation_response(raw);
        assert_eq!(parsed.trust, 0.8);
        assert_eq!(parsed.domain, "engine");
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Here is the result:\n```json\n{\"trust\": 0.5, \"relevance\": 0.4, \"domain\": \"brakes\", \"reasoning\": \"ok\"}\n```";
        let parsed = parse_evaluation_response(raw);
        assert_eq!(parsed.trust, 0.5);
        assert_eq!(parsed.domain, "brakes");
    }

    #[test]
    fn parses_outermost_braces_with_surrounding_prose() {
        let raw = "Sure! {\"trust\": 0.3, \"relevance\": 0.2, \"domain\": \"unknown\", \"reasoning\": \"n/a\"} Hope that helps.";
        let parsed = parse_evaluation_response(raw);
        assert_eq!(parsed.trust, 0.3);
    }

    #[test]
    fn falls_back_to_safe_default_on_garbage() {
        let parsed = parse_evaluation_response("not json at all");
        assert_eq!(parsed.trust, 0.0);
        assert_eq!(parsed.domain, "unknown");
    }
}
