//! Periodically fact-checks a batch of DTCs against the reasoning model,
//! rotating across configured API keys by remaining budget headroom and
//! retrying with the next key on a rate-limit response.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::error::AppError;
use common::llm::{LlmClient, OpenAiLlmClient};
use common::storage::db::SurrealDbClient;
use common::storage::types::knowledge::{DtcMaster, VerificationOutcome, VerificationResult, VerificationStatus};
use common::storage::types::rate_limit::ApiKeyBudget;
use common::utils::config::AppConfig;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_KEY_RETRY_DEPTH: usize = 5;
const DEFAULT_KEY_BUDGET: f64 = 1000.0;
const BUDGET_RESET_HOURS: i64 = 24;
const CONFIDENCE_DELTA_CLAMP: f64 = 0.2;
const VERIFY_BATCH_SIZE: usize = 5;

const SYSTEM_PROMPT: &str = "You are a fact-checker for automotive diagnostic trouble code \
knowledge. Given a DTC code and its stored description, respond with JSON: \
{\"outcome\": \"confirmed\" | \"corrected\" | \"disputed\" | \"uncertain\", \
\"detail\": \"short explanation\", \"confidence_delta\": number between -1 and 1}.";

#[derive(Debug, Deserialize)]
struct VerificationJudgment {
    outcome: String,
    detail: Option<String>,
    confidence_delta: f64,
}

fn fingerprint(api_key: &str) -> String {
    let tail = &api_key[api_key.len().saturating_sub(6)..];
    format!("key-{tail}")
}

async fn budget_for_key(db: &SurrealDbClient, api_key: &str) -> Result<ApiKeyBudget, AppError> {
    let fp = fingerprint(api_key);
    let mut response = db
        .query("SELECT * FROM api_key_budget WHERE key_fingerprint = $fp LIMIT 1")
        .bind(("fp", fp.clone()))
        .await
        .map_err(AppError::Database)?;
    let existing: Option<ApiKeyBudget> = response.take(0).map_err(AppError::Database)?;

    if let Some(budget) = existing {
        if budget.reset_time <= Utc::now() {
            let mut reset = budget;
            reset.requests_made = 0;
            reset.tokens_used = 0;
            reset.remaining = DEFAULT_KEY_BUDGET as i64;
            reset.reset_time = Utc::now() + chrono::Duration::hours(BUDGET_RESET_HOURS);
            db.update_item(reset.clone()).await.map_err(AppError::Database)?;
            return Ok(reset);
        }
        return Ok(budget);
    }

    let now = Utc::now();
    let budget = ApiKeyBudget {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        key_fingerprint: fp,
        requests_made: 0,
        tokens_used: 0,
        remaining: DEFAULT_KEY_BUDGET as i64,
        reset_time: now + chrono::Duration::hours(BUDGET_RESET_HOURS),
        budget: DEFAULT_KEY_BUDGET,
    };
    db.store_item(budget.clone()).await.map_err(AppError::Database)?;
    Ok(budget)
}

/// Ranks configured keys by remaining headroom, highest first.
async fn ranked_keys(db: &SurrealDbClient, config: &AppConfig) -> Result<Vec<(String, ApiKeyBudget)>, AppError> {
    let mut ranked = Vec::new();
    for key in config.api_keys() {
        let budget = budget_for_key(db, &key).await?;
        ranked.push((key, budget));
    }
    ranked.sort_by(|a, b| b.1.headroom().partial_cmp(&a.1.headroom()).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked)
}

async fn record_usage(db: &SurrealDbClient, mut budget: ApiKeyBudget) -> Result<(), AppError> {
    budget.requests_made += 1;
    budget.remaining = (budget.budget - budget.requests_made as f64) as i64;
    db.update_item(budget).await.map_err(AppError::Database)?;
    Ok(())
}

fn looks_rate_limited(err: &AppError) -> bool {
    matches!(err, AppError::RateLimited(_)) || err.to_string().contains("429")
}

async fn judge(config: &AppConfig, db: &SurrealDbClient, dtc: &DtcMaster) -> Result<VerificationJudgment, AppError> {
    let keys = ranked_keys(db, config).await?;
    if keys.is_empty() {
        return Err(AppError::RateLimited("no api keys configured for verifier".to_string()));
    }

    let user_prompt = format!(
        "DTC code: {}\nStored description: {}\nCategory: {:?}\nCurrent confidence: {:.2}",
        dtc.code,
        dtc.description.as_deref().unwrap_or("(none)"),
        dtc.category,
        dtc.confidence
    );

    let mut last_err = None;
    for (key, budget) in keys.into_iter().take(MAX_KEY_RETRY_DEPTH) {
        if budget.headroom() <= 0.0 {
            continue;
        }
        let client = OpenAiLlmClient::with_api_key(config, Some(key.clone()));
        match client.complete(SYSTEM_PROMPT, &user_prompt, true, 0.0).await {
            Ok(raw) => {
                record_usage(db, budget).await?;
                let judgment: VerificationJudgment = serde_json::from_str(&raw).map_err(|err| {
                    AppError::LlmParsing(format!("verifier response not valid JSON: {err}"))
                })?;
                return Ok(judgment);
            }
            Err(err) if looks_rate_limited(&err) => {
                warn!(error = %err, "verifier key rate limited, trying next");
                last_err = Some(err);
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| AppError::RateLimited("exhausted all api keys".to_string())))
}

fn outcome_from_str(outcome: &str) -> VerificationOutcome {
    match outcome {
        "confirmed" => VerificationOutcome::Confirmed,
        "corrected" => VerificationOutcome::Corrected,
        "disputed" => VerificationOutcome::Disputed,
        _ => VerificationOutcome::Uncertain,
    }
}

fn status_for_outcome(outcome: VerificationOutcome) -> VerificationStatus {
    match outcome {
        VerificationOutcome::Confirmed | VerificationOutcome::Corrected => VerificationStatus::Verified,
        VerificationOutcome::Disputed => VerificationStatus::Disputed,
        VerificationOutcome::Uncertain => VerificationStatus::Uncertain,
    }
}

/// Fact-checks a single DTC's description, applying a clamped confidence
/// adjustment and recording the outcome.
pub async fn verify_dtc(config: &AppConfig, db: &SurrealDbClient, mut dtc: DtcMaster) -> Result<(), AppError> {
    let judgment = judge(config, db, &dtc).await?;
    let outcome = outcome_from_str(&judgment.outcome);
    let clamped_delta = judgment.confidence_delta.clamp(-CONFIDENCE_DELTA_CLAMP, CONFIDENCE_DELTA_CLAMP);

    let result = VerificationResult {
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        dtc_id: dtc.id.clone(),
        field: "description".to_string(),
        outcome,
        detail: judgment.detail,
        confidence_delta: clamped_delta,
    };
    db.store_item(result).await.map_err(AppError::Database)?;

    dtc.confidence = (dtc.confidence + clamped_delta).clamp(0.0, 1.0);
    dtc.verification_status = status_for_outcome(outcome);
    dtc.verified_at = Some(Utc::now());
    db.update_item(dtc).await.map_err(AppError::Database)?;

    Ok(())
}

async fn next_batch(db: &SurrealDbClient) -> Result<Vec<DtcMaster>, AppError> {
    let mut response = db
        .query(
            "SELECT * FROM knowledge_dtc_master
             WHERE verification_status = 'unverified'
             ORDER BY created_at ASC
             LIMIT $limit",
        )
        .bind(("limit", VERIFY_BATCH_SIZE))
        .await
        .map_err(AppError::Database)?;
    response.take(0).map_err(AppError::Database)
}

pub async fn run_verifier_loop(
    db: Arc<SurrealDbClient>,
    config: AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match next_batch(&db).await {
            Ok(batch) if batch.is_empty() => {
                info!("verifier found nothing unverified this cycle");
            }
            Ok(batch) => {
                for dtc in batch {
                    let code = dtc.code.clone();
                    if let Err(err) = verify_dtc(&config, &db, dtc).await {
                        warn!(code, error = %err, "verification failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to load verification batch"),
        }
        tokio::time::sleep(Duration::from_secs(config.verify_interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_delta_is_clamped_to_bounds() {
        let raw = 0.9_f64;
        assert_eq!(raw.clamp(-CONFIDENCE_DELTA_CLAMP, CONFIDENCE_DELTA_CLAMP), CONFIDENCE_DELTA_CLAMP);
        let raw_negative = -0.9_f64;
        assert_eq!(
            raw_negative.clamp(-CONFIDENCE_DELTA_CLAMP, CONFIDENCE_DELTA_CLAMP),
            -CONFIDENCE_DELTA_CLAMP
        );
    }

    #[test]
    fn outcome_maps_to_expected_status() {
        assert_eq!(status_for_outcome(VerificationOutcome::Confirmed), VerificationStatus::Verified);
        assert_eq!(status_for_outcome(VerificationOutcome::Disputed), VerificationStatus::Disputed);
        assert_eq!(status_for_outcome(VerificationOutcome::Uncertain), VerificationStatus::Uncertain);
    }

    #[test]
    fn fingerprint_uses_key_tail_only() {
        let fp = fingerprint("sk-test-abcdef123456");
        assert_eq!(fp, "key-123456");
        assert!(!fp.contains("sk-test"));
    }
}
