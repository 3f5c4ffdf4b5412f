//! Observe -> Orient -> Decide -> Act. One fixed-interval cycle samples
//! queue depths and the latest audit report, derives a situation, decides
//! a priority-ordered set of actions, and dispatches them as tasks plus
//! directives on the control queues.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use common::error::AppError;
use common::queue::{QueueMessageStatus, SurrealWorkQueue, WorkQueue};
use common::storage::db::SurrealDbClient;
use common::storage::types::control_plane::{AuditReport, OrchestratorTask, TaskStatus};
use common::utils::config::AppConfig;
use tracing::{error, info, warn};

use crate::auditor;

const STAGE_QUEUES: &[&str] = &[
    "jobs:crawl",
    "jobs:chunk",
    "jobs:embed",
    "jobs:evaluate",
    "jobs:extract",
    "jobs:resolve",
];
const GPU_QUEUES: &[&str] = &["jobs:embed", "jobs:evaluate", "jobs:extract"];
const CRAWL_QUEUES: &[&str] = &["jobs:crawl", "jobs:chunk"];
const TOTAL_QUEUED_BUSY_THRESHOLD: u64 = 50;
const COMMANDS_BATCH_SIZE: usize = 10;
const RING_BUFFER_CAPACITY: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct SystemState {
    pub queue_depths: Vec<(String, u64)>,
    pub gpu_load: u64,
    pub crawl_load: u64,
    pub total_queued: u64,
    pub pipeline_idle: bool,
    pub pending_tasks: u64,
    pub in_progress_tasks: u64,
}

#[derive(Debug, Clone)]
pub struct Situation {
    pub crawl_available: bool,
    pub gpu_busy: bool,
    pub pipeline_busy: bool,
    pub has_audit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorAction {
    Wait,
    TriggerAudit,
    Research { directive: serde_json::Value, priority: u8 },
    Alert { directive: serde_json::Value, priority: u8 },
    Idle,
}

impl OrchestratorAction {
    fn priority(&self) -> u8 {
        match self {
            Self::Wait => 0,
            Self::TriggerAudit => 1,
            Self::Research { priority, .. } | Self::Alert { priority, .. } => *priority,
            Self::Idle => 6,
        }
    }

    fn task_type(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::TriggerAudit => "trigger_audit",
            Self::Research { .. } => "research",
            Self::Alert { .. } => "alert",
            Self::Idle => "idle",
        }
    }
}

pub async fn observe(db: &SurrealDbClient) -> Result<SystemState, AppError> {
    let mut queue_depths = Vec::with_capacity(STAGE_QUEUES.len());
    let mut total_queued = 0u64;
    let mut gpu_load = 0u64;
    let mut crawl_load = 0u64;

    for queue in STAGE_QUEUES {
        let depth = depth_of(db, queue).await?;
        total_queued += depth;
        if GPU_QUEUES.contains(queue) {
            gpu_load += depth;
        }
        if CRAWL_QUEUES.contains(queue) {
            crawl_load += depth;
        }
        queue_depths.push((queue.to_string(), depth));
    }

    let (pending_tasks, in_progress_tasks) = task_counts(db).await?;

    Ok(SystemState {
        queue_depths,
        gpu_load,
        crawl_load,
        total_queued,
        pipeline_idle: total_queued == 0,
        pending_tasks,
        in_progress_tasks,
    })
}

async fn depth_of(db: &SurrealDbClient, queue_name: &str) -> Result<u64, AppError> {
    #[derive(serde::Deserialize)]
    struct CountRow {
        count: u64,
    }
    let mut response = db
        .query(
            "SELECT count() FROM queue_message
             WHERE queue_name = $queue_name AND status != $completed
             GROUP ALL",
        )
        .bind(("queue_name", queue_name.to_string()))
        .bind(("completed", QueueMessageStatus::Completed))
        .await
        .map_err(AppError::Database)?;
    let counted: Option<CountRow> = response.take(0).map_err(AppError::Database)?;
    Ok(counted.map(|c| c.count).unwrap_or(0))
}

async fn task_counts(db: &SurrealDbClient) -> Result<(u64, u64), AppError> {
    let tasks: Vec<OrchestratorTask> = db.get_all_stored_items().await.map_err(AppError::Database)?;
    let pending = tasks.iter().filter(|t| t.status == TaskStatus::Pending).count() as u64;
    let in_progress = tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count() as u64;
    Ok((pending, in_progress))
}

async fn latest_audit_report(db: &SurrealDbClient) -> Result<Option<AuditReport>, AppError> {
    let mut response = db
        .query("SELECT * FROM audit_report ORDER BY created_at DESC LIMIT 1")
        .await
        .map_err(AppError::Database)?;
    let reports: Vec<AuditReport> = response.take(0).map_err(AppError::Database)?;
    Ok(reports.into_iter().next())
}

pub fn orient(state: &SystemState, config: &AppConfig, has_audit: bool) -> Situation {
    Situation {
        crawl_available: state.crawl_load < config.max_concurrent_crawls,
        gpu_busy: state.gpu_load > config.max_gpu_queue_items,
        pipeline_busy: state.total_queued > TOTAL_QUEUED_BUSY_THRESHOLD,
        has_audit,
    }
}

pub fn decide(
    state: &SystemState,
    situation: &Situation,
    audit_report: Option<&AuditReport>,
) -> Vec<OrchestratorAction> {
    let mut actions = Vec::new();

    if state.total_queued > TOTAL_QUEUED_BUSY_THRESHOLD {
        actions.push(OrchestratorAction::Wait);
    } else if situation.gpu_busy && situation.pipeline_busy {
        actions.push(OrchestratorAction::Wait);
    } else if !situation.has_audit {
        actions.push(OrchestratorAction::TriggerAudit);
    } else if let Some(report) = audit_report {
        for recommendation in &report.recommendations {
            match recommendation.kind.as_str() {
                "improve_confidence" | "fill_gaps" if situation.crawl_available => {
                    actions.push(OrchestratorAction::Research {
                        directive: serde_json::json!({
                            "type": recommendation.kind,
                            "reason": recommendation.detail,
                        }),
                        priority: recommendation.priority,
                    });
                }
                "expand_coverage" => {
                    actions.push(OrchestratorAction::Research {
                        directive: serde_json::json!({
                            "type": "expand_coverage",
                            "target_ranges": extract_ranges(&recommendation.detail),
                        }),
                        priority: recommendation.priority,
                    });
                }
                "fix_pipeline" | "reprocess_errors" => {
                    actions.push(OrchestratorAction::Alert {
                        directive: serde_json::json!({
                            "type": recommendation.kind,
                            "reason": recommendation.detail,
                        }),
                        priority: recommendation.priority,
                    });
                }
                _ => {}
            }
        }
    }

    if actions.is_empty() && state.pipeline_idle {
        actions.push(OrchestratorAction::Idle);
    }

    actions.sort_by_key(|a| a.priority());
    actions
}

fn extract_ranges(detail: &str) -> Vec<String> {
    detail
        .split_whitespace()
        .filter(|token| token.contains('-') && token.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

pub async fn act(db: &SurrealDbClient, actions: &[OrchestratorAction]) -> Result<(), AppError> {
    let queue = SurrealWorkQueue::new(db);
    for action in actions {
        if matches!(action, OrchestratorAction::Wait | OrchestratorAction::Idle) {
            continue;
        }
        if has_active_task_of_type(db, action.task_type()).await? {
            continue;
        }

        let now = Utc::now();
        let payload = match action {
            OrchestratorAction::Research { directive, .. } => directive.clone(),
            OrchestratorAction::Alert { directive, .. } => directive.clone(),
            _ => serde_json::json!({}),
        };
        let mut task = OrchestratorTask {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            task_type: action.task_type().to_string(),
            status: TaskStatus::Pending,
            priority: action.priority(),
            payload: payload.clone(),
            assigned_to: None,
            retry_count: 0,
            correlation_id: None,
        };
        task.status = TaskStatus::InProgress;
        task.assigned_to = Some("orchestrator".to_string());
        let task_id = task.id.clone();
        db.store_item(task).await.map_err(AppError::Database)?;

        if matches!(action, OrchestratorAction::TriggerAudit) {
            auditor::run_audit(db).await?;
            if let Some(mut task) = db.get_item::<OrchestratorTask>(&task_id).await? {
                task.status = TaskStatus::Completed;
                task.updated_at = Utc::now();
                db.update_item(task).await?;
            }
            continue;
        }

        let target_queue = match action {
            OrchestratorAction::Research { .. } => "orchestrator:research",
            OrchestratorAction::Alert { .. } => "monitoring:alerts",
            _ => continue,
        };
        queue.push(target_queue, &payload.to_string()).await?;
    }
    Ok(())
}

async fn has_active_task_of_type(db: &SurrealDbClient, task_type: &str) -> Result<bool, AppError> {
    let mut response = db
        .query(
            "SELECT * FROM orchestrator_task
             WHERE task_type = $task_type
               AND (status = 'pending' OR status = 'in_progress')
             LIMIT 1",
        )
        .bind(("task_type", task_type.to_string()))
        .await
        .map_err(AppError::Database)?;
    let existing: Vec<OrchestratorTask> = response.take(0).map_err(AppError::Database)?;
    Ok(!existing.is_empty())
}

/// Consumes up to `COMMANDS_BATCH_SIZE` messages from `orchestrator:commands`,
/// handling manual directives and researcher/auditor callbacks.
pub async fn drain_commands(db: &SurrealDbClient, worker_id: &str) -> Result<usize, AppError> {
    let queue = SurrealWorkQueue::new(db);
    let mut drained = 0;
    for _ in 0..COMMANDS_BATCH_SIZE {
        let lease = chrono::Duration::seconds(60);
        let Some(message) = queue.claim_next("orchestrator:commands", worker_id, lease).await? else {
            break;
        };
        if let Err(err) = handle_command(db, &message.payload).await {
            warn!(error = %err, "failed to handle orchestrator command");
        }
        queue.complete(&message.id).await?;
        drained += 1;
    }
    Ok(drained)
}

async fn handle_command(db: &SurrealDbClient, payload: &str) -> Result<(), AppError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|err| AppError::InternalError(format!("invalid command payload: {err}")))?;
    let command_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
    match command_type {
        "trigger_audit" => {
            auditor::run_audit(db).await?;
        }
        "trigger_research" | "audit_findings" | "research_complete" => {
            info!(command_type, "acknowledged orchestrator command");
        }
        other => {
            warn!(command_type = other, "unrecognized orchestrator command");
        }
    }
    Ok(())
}

/// Bounded, in-process record of recent cycles, for operator visibility.
/// Not persisted: restarting the orchestrator process is an acceptable
/// reason to lose this history, unlike the durable tables it reads.
#[derive(Debug, Default)]
pub struct CycleLog {
    entries: VecDeque<CycleRecord>,
}

#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub cycle: u64,
    pub actions: Vec<String>,
    pub state: SystemState,
}

impl CycleLog {
    pub fn push(&mut self, record: CycleRecord) {
        if self.entries.len() >= RING_BUFFER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn recent(&self) -> impl Iterator<Item = &CycleRecord> {
        self.entries.iter()
    }
}

/// Runs a single OODA cycle and records it to `log`.
pub async fn run_cycle(
    db: &SurrealDbClient,
    config: &AppConfig,
    log: &mut CycleLog,
    cycle: u64,
) -> Result<Vec<OrchestratorAction>, AppError> {
    let worker_id = format!("orchestrator-{cycle}");
    drain_commands(db, &worker_id).await?;

    let state = observe(db).await?;
    let audit_report = latest_audit_report(db).await?;
    let situation = orient(&state, config, audit_report.is_some());
    let actions = decide(&state, &situation, audit_report.as_ref());
    act(db, &actions).await?;

    log.push(CycleRecord {
        cycle,
        actions: actions.iter().map(|a| a.task_type().to_string()).collect(),
        state: state.clone(),
    });

    Ok(actions)
}

pub async fn run_orchestrator_loop(
    db: std::sync::Arc<SurrealDbClient>,
    config: AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut log = CycleLog::default();
    let mut cycle = 0u64;
    loop {
        cycle += 1;
        if let Err(err) = run_cycle(&db, &config, &mut log, cycle).await {
            error!(cycle, error = %err, "orchestrator cycle failed");
        }
        tokio::time::sleep(Duration::from_secs(config.orchestrator_cycle_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orient_gates_crawl_availability_on_max_concurrent_crawls_not_hourly_budget() {
        let config = AppConfig::test_config();
        let under_limit = SystemState {
            crawl_load: config.max_concurrent_crawls - 1,
            ..Default::default()
        };
        let at_limit = SystemState {
            crawl_load: config.max_concurrent_crawls,
            ..Default::default()
        };

        assert!(orient(&under_limit, &config, true).crawl_available);
        assert!(!orient(&at_limit, &config, true).crawl_available);
    }

    #[test]
    fn busy_pipeline_emits_wait_regardless_of_audit() {
        let state = SystemState {
            total_queued: 51,
            ..Default::default()
        };
        let situation = Situation {
            crawl_available: true,
            gpu_busy: false,
            pipeline_busy: true,
            has_audit: true,
        };
        let actions = decide(&state, &situation, None);
        assert_eq!(actions, vec![OrchestratorAction::Wait]);
    }

    #[test]
    fn missing_audit_triggers_audit_when_not_busy() {
        let state = SystemState::default();
        let situation = Situation {
            crawl_available: true,
            gpu_busy: false,
            pipeline_busy: false,
            has_audit: false,
        };
        let actions = decide(&state, &situation, None);
        assert_eq!(actions, vec![OrchestratorAction::TriggerAudit]);
    }

    #[test]
    fn idle_pipeline_with_no_recommendations_emits_idle() {
        let state = SystemState {
            pipeline_idle: true,
            ..Default::default()
        };
        let situation = Situation {
            crawl_available: true,
            gpu_busy: false,
            pipeline_busy: false,
            has_audit: true,
        };
        let report = AuditReport {
            id: "r1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            report_type: "full".into(),
            summary: "ok".into(),
            metrics: serde_json::json!({}),
            recommendations: vec![],
        };
        let actions = decide(&state, &situation, Some(&report));
        assert_eq!(actions, vec![OrchestratorAction::Idle]);
    }
}
