//! Consumes alerts off `monitoring:alerts`, gates them against the
//! allow/deny lists and a cooldown, asks the reasoning model for a
//! remediation, and records what happened to `HealingLog` whether or not
//! anything was actually executed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::error::AppError;
use common::llm::LlmClient;
use common::queue::{SurrealWorkQueue, WorkQueue};
use common::storage::db::SurrealDbClient;
use common::storage::types::control_plane::HealingLog;
use common::storage::types::rate_limit::TtlCounter;
use common::utils::config::AppConfig;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::monitor::Alert;

const ACTIONS_PER_HOUR_KEY: &str = "healer:actions_per_hour";
const RATE_WINDOW_SECS: i64 = 3600;

const SYSTEM_PROMPT: &str = "You are the automated remediation planner for an automotive \
diagnostic knowledge pipeline. Given an alert, respond with a JSON object \
{\"action\": \"restart_stage\" | \"requeue_stuck\" | \"throttle_ingestion\" | \"escalate\", \
\"reasoning\": \"short explanation\"}. Prefer escalate when unsure.";

#[derive(Debug, Deserialize)]
struct RemediationPlan {
    action: String,
    reasoning: String,
}

/// Abstraction over whatever can actually carry out a remediation
/// (restart a worker process, requeue documents, throttle a queue).
/// Returns whether the action was applied.
#[async_trait]
pub trait RemediationExecutor: Send + Sync {
    async fn apply(&self, action: &str, component: &str) -> Result<bool, AppError>;
}

/// Default executor for environments with nothing wired in: records the
/// decision without touching anything, so every alert still produces a
/// `HealingLog` entry an operator can review.
pub struct NoopRemediationExecutor;

#[async_trait]
impl RemediationExecutor for NoopRemediationExecutor {
    async fn apply(&self, _action: &str, _component: &str) -> Result<bool, AppError> {
        Ok(false)
    }
}

pub struct HealContext {
    pub db: Arc<SurrealDbClient>,
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<dyn RemediationExecutor>,
    pub config: AppConfig,
}

fn is_in_list(component: &str, list: &[String]) -> bool {
    list.iter().any(|entry| entry == component)
}

async fn actions_rate_limit_ok(db: &SurrealDbClient, limit: u32) -> Result<bool, AppError> {
    let now = Utc::now();
    let mut response = db
        .query("SELECT * FROM ttl_counter WHERE key = $key LIMIT 1")
        .bind(("key", ACTIONS_PER_HOUR_KEY.to_string()))
        .await
        .map_err(AppError::Database)?;
    let existing: Option<TtlCounter> = response.take(0).map_err(AppError::Database)?;

    match existing {
        Some(counter) if !counter.is_expired(now) => {
            if counter.count >= limit as u64 {
                return Ok(false);
            }
            let mut updated = counter;
            updated.count += 1;
            db.update_item(updated).await.map_err(AppError::Database)?;
            Ok(true)
        }
        _ => {
            let counter = TtlCounter {
                id: Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                key: ACTIONS_PER_HOUR_KEY.to_string(),
                count: 1,
                expires_at: now + ChronoDuration::seconds(RATE_WINDOW_SECS),
            };
            db.store_item(counter).await.map_err(AppError::Database)?;
            Ok(true)
        }
    }
}

async fn recently_healed(db: &SurrealDbClient, component: &str, cooldown_secs: i64) -> Result<bool, AppError> {
    let cutoff = Utc::now() - ChronoDuration::seconds(cooldown_secs);
    let mut response = db
        .query(
            "SELECT * FROM healing_log
             WHERE component = $component AND created_at > $cutoff
             LIMIT 1",
        )
        .bind(("component", component.to_string()))
        .bind(("cutoff", cutoff))
        .await
        .map_err(AppError::Database)?;
    let existing: Vec<HealingLog> = response.take(0).map_err(AppError::Database)?;
    Ok(!existing.is_empty())
}

async fn record(
    db: &SurrealDbClient,
    alert_id: &str,
    action: &str,
    component: &str,
    decision: &str,
    success: bool,
    reasoning: &str,
) -> Result<(), AppError> {
    let now = Utc::now();
    let log = HealingLog {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        alert_id: alert_id.to_string(),
        action: action.to_string(),
        component: component.to_string(),
        decision: decision.to_string(),
        success,
        reasoning: reasoning.to_string(),
    };
    db.store_item(log).await.map_err(AppError::Database)?;
    Ok(())
}

/// Runs the full gate-plan-execute sequence for one alert payload.
pub async fn heal_alert(ctx: &HealContext, alert_id: &str, payload: &str) -> Result<(), AppError> {
    let alert: Alert = serde_json::from_str(payload)
        .map_err(|err| AppError::InternalError(format!("invalid alert payload: {err}")))?;

    if !ctx.config.auto_fix_enabled {
        record(&ctx.db, alert_id, "none", &alert.component, "escalated: auto-fix disabled", false, &alert.detail).await?;
        return Ok(());
    }

    let deny_list = ctx.config.auto_fix_deny_list();
    if is_in_list(&alert.component, &deny_list) {
        record(&ctx.db, alert_id, "none", &alert.component, "escalated: component denied", false, &alert.detail).await?;
        return Ok(());
    }

    let allow_list = ctx.config.auto_fix_allow_list();
    if !allow_list.is_empty() && !is_in_list(&alert.component, &allow_list) {
        record(&ctx.db, alert_id, "none", &alert.component, "escalated: component not allow-listed", false, &alert.detail).await?;
        return Ok(());
    }

    if recently_healed(&ctx.db, &alert.component, ctx.config.cooldown_between_actions_secs).await? {
        info!(component = %alert.component, "skipping heal attempt, component in cooldown");
        return Ok(());
    }

    if !actions_rate_limit_ok(&ctx.db, ctx.config.max_actions_per_hour).await? {
        record(&ctx.db, alert_id, "none", &alert.component, "escalated: rate limited", false, &alert.detail).await?;
        return Ok(());
    }

    let user_prompt = format!(
        "Alert kind: {}\nComponent: {}\nSeverity: {:?}\nDetail: {}",
        alert.kind, alert.component, alert.severity, alert.detail
    );
    let plan = match ctx.llm.complete(SYSTEM_PROMPT, &user_prompt, true, 0.0).await {
        Ok(raw) => serde_json::from_str::<RemediationPlan>(&raw).unwrap_or(RemediationPlan {
            action: "escalate".to_string(),
            reasoning: "could not parse remediation plan".to_string(),
        }),
        Err(err) => {
            warn!(error = %err, "healer LLM call failed, escalating");
            RemediationPlan {
                action: "escalate".to_string(),
                reasoning: format!("LLM call failed: {err}"),
            }
        }
    };

    if plan.action == "escalate" {
        record(&ctx.db, alert_id, &plan.action, &alert.component, "escalated by planner", false, &plan.reasoning).await?;
        return Ok(());
    }

    let success = ctx.executor.apply(&plan.action, &alert.component).await?;
    record(
        &ctx.db,
        alert_id,
        &plan.action,
        &alert.component,
        if success { "applied" } else { "executor declined" },
        success,
        &plan.reasoning,
    )
    .await?;

    Ok(())
}

pub async fn run_healer_loop(ctx: Arc<HealContext>) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = format!("healer-{}", Uuid::new_v4());
    let queue = SurrealWorkQueue::new(&ctx.db);
    loop {
        let lease = ChronoDuration::seconds(ctx.config.lease_duration_secs);
        match queue.claim_next("monitoring:alerts", &worker_id, lease).await {
            Ok(Some(message)) => {
                if let Err(err) = heal_alert(&ctx, &message.id, &message.payload).await {
                    warn!(error = %err, "healer failed to process alert");
                    queue.fail(&message.id, &err.to_string(), message.attempts < ctx.config.max_attempts).await?;
                } else {
                    queue.complete(&message.id).await?;
                }
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_secs(ctx.config.poll_timeout_secs)).await;
            }
            Err(err) => {
                warn!(error = %err, "failed to claim alert");
                tokio::time::sleep(Duration::from_secs(ctx.config.poll_timeout_secs)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_listed_component_is_recognized() {
        let deny = vec!["extract-worker".to_string()];
        assert!(is_in_list("extract-worker", &deny));
        assert!(!is_in_list("embed-worker", &deny));
    }

    #[tokio::test]
    async fn rate_limit_blocks_after_max_actions() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        assert!(actions_rate_limit_ok(&db, 1).await.unwrap());
        assert!(!actions_rate_limit_ok(&db, 1).await.unwrap());
    }

    #[tokio::test]
    async fn auto_fix_disabled_escalates_without_calling_executor() {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
                .await
                .expect("in-memory db"),
        );
        let mut config = AppConfig::test_config();
        config.auto_fix_enabled = false;
        let ctx = HealContext {
            db: db.clone(),
            llm: Arc::new(common::llm::test_utils::FakeLlmClient::new(vec![], vec![])),
            executor: Arc::new(NoopRemediationExecutor),
            config,
        };
        let alert = Alert {
            kind: "error_rate_spike".to_string(),
            component: "embedding".to_string(),
            severity: crate::monitor::AlertSeverity::Critical,
            detail: "error rate high".to_string(),
        };
        let payload = serde_json::to_string(&alert).unwrap();
        heal_alert(&ctx, "alert-1", &payload).await.unwrap();

        let logs: Vec<HealingLog> = db.get_all_stored_items().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
    }
}
