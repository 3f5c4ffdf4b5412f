use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::error::AppError;
use common::llm::test_utils::FakeLlmClient;
use common::storage::db::SurrealDbClient;
use common::storage::types::control_plane::HealingLog;
use common::utils::config::AppConfig;
use control_plane::auditor::{PipelineAnalysis, PipelineHealth, StageStats};
use control_plane::healer::{heal_alert, HealContext, RemediationExecutor};
use control_plane::monitor::detect_anomalies;

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RemediationExecutor for RecordingExecutor {
    async fn apply(&self, action: &str, component: &str) -> Result<bool, AppError> {
        self.calls.lock().unwrap().push((action.to_string(), component.to_string()));
        Ok(true)
    }
}

fn stalled_stage(name: &str, queue_depth: u64) -> StageStats {
    StageStats {
        stage: name.to_string(),
        completed: 0,
        failed: 0,
        error_rate: 0.0,
        avg_duration_ms: 0.0,
        queue_depth,
    }
}

/// A stalled embed queue raises a `stalled_queue` alert, and the healer,
/// once auto-fix is enabled and the component is allow-listed, carries
/// out the planner's recommendation and logs the outcome.
#[tokio::test]
async fn stalled_queue_alert_is_healed_end_to_end() {
    let pipeline = PipelineAnalysis {
        stages: vec![stalled_stage("embed", 12)],
        bottleneck: None,
        slowest_stage: None,
        health: PipelineHealth::Degraded,
        stuck_documents: 0,
    };

    let mut config = AppConfig::test_config();
    let alerts = detect_anomalies(&pipeline, &config, &[]);
    let alert = alerts
        .iter()
        .find(|a| a.kind == "stalled_queue" && a.component == "embed")
        .expect("stalled_queue alert raised for embed");
    let payload = serde_json::to_string(alert).unwrap();

    config.auto_fix_enabled = true;
    config.auto_fix_allow = "embed".to_string();

    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db"),
    );
    let executor = Arc::new(RecordingExecutor::default());
    let plan = r#"{"action": "restart_stage", "reasoning": "embed queue has items but no completions"}"#;
    let ctx = HealContext {
        db: db.clone(),
        llm: Arc::new(FakeLlmClient::new(vec![], vec![plan.to_string()])),
        executor: executor.clone(),
        config,
    };

    heal_alert(&ctx, "alert-1", &payload).await.expect("heal_alert");

    assert_eq!(executor.calls.lock().unwrap().as_slice(), &[("restart_stage".to_string(), "embed".to_string())]);

    let logs: Vec<HealingLog> = db.get_all_stored_items().await.expect("healing logs");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
    assert_eq!(logs[0].action, "restart_stage");
    assert_eq!(logs[0].decision, "applied");
}

/// A component absent from the allow list is escalated without ever
/// reaching the executor, regardless of what the planner would say.
#[tokio::test]
async fn non_allow_listed_component_escalates_without_executing() {
    let pipeline = PipelineAnalysis {
        stages: vec![stalled_stage("embed", 12)],
        bottleneck: None,
        slowest_stage: None,
        health: PipelineHealth::Degraded,
        stuck_documents: 0,
    };

    let mut config = AppConfig::test_config();
    let alerts = detect_anomalies(&pipeline, &config, &[]);
    let alert = alerts.iter().find(|a| a.kind == "stalled_queue").expect("alert raised");
    let payload = serde_json::to_string(alert).unwrap();

    config.auto_fix_enabled = true;
    config.auto_fix_allow = "crawl".to_string();

    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db"),
    );
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = HealContext {
        db: db.clone(),
        llm: Arc::new(FakeLlmClient::new(vec![], vec![])),
        executor: executor.clone(),
        config,
    };

    heal_alert(&ctx, "alert-2", &payload).await.expect("heal_alert");

    assert!(executor.calls.lock().unwrap().is_empty());
    let logs: Vec<HealingLog> = db.get_all_stored_items().await.expect("healing logs");
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
    assert_eq!(logs[0].decision, "escalated: component not allow-listed");
}
