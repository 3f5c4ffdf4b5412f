//! Fixed-interval anomaly detection over the pipeline's own audit metrics.
//! Each anomaly is fingerprinted and deduplicated against a 10-minute TTL
//! window before being pushed to `monitoring:alerts`, so a sustained
//! problem produces one alert per window rather than one per cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::error::AppError;
use common::queue::{SurrealWorkQueue, WorkQueue};
use common::storage::db::SurrealDbClient;
use common::storage::types::rate_limit::TtlCounter;
use common::utils::config::AppConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auditor::{self, PipelineHealth};

const DEDUP_WINDOW_SECS: i64 = 600;
const STUCK_DOCUMENT_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: String,
    pub component: String,
    pub severity: AlertSeverity,
    pub detail: String,
}

impl Alert {
    fn fingerprint(&self) -> String {
        format!("monitor:alert:{}:{}", self.kind, self.component)
    }
}

/// Abstraction over whatever orchestrates the pipeline's own compute
/// (containers, systemd units, processes). The monitor only needs a
/// health snapshot; the healer is the one that acts on it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn unhealthy_components(&self) -> Result<Vec<String>, AppError>;
}

/// Default runtime for environments with no container orchestration
/// wired in: reports nothing unhealthy rather than guessing.
pub struct NoopContainerRuntime;

#[async_trait]
impl ContainerRuntime for NoopContainerRuntime {
    async fn unhealthy_components(&self) -> Result<Vec<String>, AppError> {
        Ok(Vec::new())
    }
}

pub fn detect_anomalies(
    pipeline: &auditor::PipelineAnalysis,
    config: &AppConfig,
    unhealthy_components: &[String],
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if pipeline.health == PipelineHealth::Degraded {
        for stage in &pipeline.stages {
            if stage.queue_depth > 0 && stage.error_rate == 0.0 && stage.completed == 0 {
                alerts.push(Alert {
                    kind: "stalled_queue".to_string(),
                    component: stage.stage.clone(),
                    severity: AlertSeverity::Warning,
                    detail: format!("{} has {} queued items with no completions", stage.stage, stage.queue_depth),
                });
            }
        }
    }

    for stage in &pipeline.stages {
        if stage.error_rate > config.error_rate_threshold {
            alerts.push(Alert {
                kind: "error_rate_spike".to_string(),
                component: stage.stage.clone(),
                severity: AlertSeverity::Critical,
                detail: format!(
                    "{} error rate {:.2} exceeds threshold {:.2}",
                    stage.stage, stage.error_rate, config.error_rate_threshold
                ),
            });
        }
    }

    let durations: Vec<f64> = pipeline
        .stages
        .iter()
        .map(|s| s.avg_duration_ms)
        .filter(|d| *d > 0.0)
        .collect();
    if !durations.is_empty() {
        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        for stage in &pipeline.stages {
            if stage.avg_duration_ms > mean * config.processing_time_multiplier {
                alerts.push(Alert {
                    kind: "processing_slowdown".to_string(),
                    component: stage.stage.clone(),
                    severity: AlertSeverity::Warning,
                    detail: format!(
                        "{} averaging {:.0}ms, {:.1}x the pipeline mean",
                        stage.stage, stage.avg_duration_ms, stage.avg_duration_ms / mean.max(1.0)
                    ),
                });
            }
        }
    }

    if pipeline.stuck_documents > STUCK_DOCUMENT_THRESHOLD {
        alerts.push(Alert {
            kind: "stuck_documents".to_string(),
            component: "document_pipeline".to_string(),
            severity: AlertSeverity::Warning,
            detail: format!("{} documents stuck past their dwell window", pipeline.stuck_documents),
        });
    }

    for component in unhealthy_components {
        alerts.push(Alert {
            kind: "unhealthy_container".to_string(),
            component: component.clone(),
            severity: AlertSeverity::Critical,
            detail: format!("{component} failed its health check"),
        });
    }

    alerts
}

async fn already_alerted(db: &SurrealDbClient, fingerprint: &str) -> Result<bool, AppError> {
    let now = Utc::now();
    let mut response = db
        .query("SELECT * FROM ttl_counter WHERE key = $key LIMIT 1")
        .bind(("key", fingerprint.to_string()))
        .await
        .map_err(AppError::Database)?;
    let existing: Option<TtlCounter> = response.take(0).map_err(AppError::Database)?;

    if let Some(counter) = existing {
        if !counter.is_expired(now) {
            return Ok(true);
        }
        let mut updated = counter;
        updated.expires_at = now + ChronoDuration::seconds(DEDUP_WINDOW_SECS);
        updated.count += 1;
        db.update_item(updated).await.map_err(AppError::Database)?;
        return Ok(false);
    }

    let counter = TtlCounter {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        key: fingerprint.to_string(),
        count: 1,
        expires_at: now + ChronoDuration::seconds(DEDUP_WINDOW_SECS),
    };
    db.store_item(counter).await.map_err(AppError::Database)?;
    Ok(false)
}

/// Runs one monitor cycle: analyzes pipeline health, checks container
/// health, deduplicates, and pushes fresh alerts to `monitoring:alerts`.
pub async fn run_monitor_cycle(
    db: &SurrealDbClient,
    config: &AppConfig,
    runtime: &dyn ContainerRuntime,
) -> Result<usize, AppError> {
    let pipeline = auditor::analyze_pipeline(db).await?;
    let unhealthy = runtime.unhealthy_components().await?;
    let candidates = detect_anomalies(&pipeline, config, &unhealthy);

    let queue = SurrealWorkQueue::new(db);
    let mut pushed = 0;
    for alert in candidates {
        let fingerprint = alert.fingerprint();
        if already_alerted(db, &fingerprint).await? {
            continue;
        }
        let payload = serde_json::to_string(&alert)
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        queue.push("monitoring:alerts", &payload).await?;
        info!(kind = %alert.kind, component = %alert.component, "monitor raised alert");
        pushed += 1;
    }
    Ok(pushed)
}

pub async fn run_monitor_loop(
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        if let Err(err) = run_monitor_cycle(&db, &config, runtime.as_ref()).await {
            warn!(error = %err, "monitor cycle failed");
        }
        tokio::time::sleep(Duration::from_secs(config.monitor_interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auditor::{PipelineAnalysis, StageStats};

    fn config() -> AppConfig {
        AppConfig::test_config()
    }

    fn stage(name: &str, error_rate: f64, avg_duration_ms: f64, queue_depth: u64) -> StageStats {
        StageStats {
            stage: name.to_string(),
            completed: 10,
            failed: 0,
            error_rate,
            avg_duration_ms,
            queue_depth,
        }
    }

    #[test]
    fn error_rate_above_threshold_raises_alert() {
        let pipeline = PipelineAnalysis {
            stages: vec![stage("embedding", 0.5, 100.0, 0)],
            bottleneck: None,
            slowest_stage: None,
            health: PipelineHealth::Degraded,
            stuck_documents: 0,
        };
        let alerts = detect_anomalies(&pipeline, &config(), &[]);
        assert!(alerts.iter().any(|a| a.kind == "error_rate_spike"));
    }

    #[test]
    fn healthy_pipeline_raises_no_alerts() {
        let pipeline = PipelineAnalysis {
            stages: vec![stage("embedding", 0.0, 100.0, 0), stage("extracting", 0.0, 120.0, 0)],
            bottleneck: None,
            slowest_stage: None,
            health: PipelineHealth::Healthy,
            stuck_documents: 0,
        };
        let alerts = detect_anomalies(&pipeline, &config(), &[]);
        assert!(alerts.is_empty());
    }

    #[test]
    fn unhealthy_component_raises_critical_alert() {
        let pipeline = PipelineAnalysis {
            stages: vec![],
            bottleneck: None,
            slowest_stage: None,
            health: PipelineHealth::Healthy,
            stuck_documents: 0,
        };
        let alerts = detect_anomalies(&pipeline, &config(), &["extract-worker-2".to_string()]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn second_identical_alert_within_window_is_deduplicated() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        assert!(!already_alerted(&db, "monitor:alert:error_rate_spike:embedding").await.unwrap());
        assert!(already_alerted(&db, "monitor:alert:error_rate_spike:embedding").await.unwrap());
    }
}
