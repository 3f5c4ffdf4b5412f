use serde::{Deserialize, Serialize};

use crate::stored_object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

stored_object!(OrchestratorTask, "orchestrator_task", {
    task_type: String,
    status: TaskStatus,
    priority: u8,
    payload: serde_json::Value,
    assigned_to: Option<String>,
    retry_count: u32,
    correlation_id: Option<String>
});

impl OrchestratorTask {
    pub const MAX_RETRIES: u32 = 3;
}

stored_object!(AuditReport, "audit_report", {
    report_type: String,
    summary: String,
    metrics: serde_json::Value,
    recommendations: Vec<AuditRecommendation>
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecommendation {
    pub kind: String,
    pub priority: u8,
    pub detail: String,
}

stored_object!(CoverageSnapshot, "coverage_snapshot", {
    snapshot_date: chrono::NaiveDate,
    totals_by_category: serde_json::Value,
    totals_by_confidence_tier: serde_json::Value,
    gap_ranges: serde_json::Value,
    completeness_score: f64
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlQueueStatus {
    Pending,
    Crawling,
    Completed,
    Failed,
}

stored_object!(CrawlQueueEntry, "crawl_queue_entry", {
    url: String,
    domain: String,
    max_depth: u32,
    status: CrawlQueueStatus,
    attempts: u32,
    last_error: Option<String>
});

stored_object!(HealingLog, "healing_log", {
    alert_id: String,
    action: String,
    component: String,
    decision: String,
    success: bool,
    reasoning: String
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_retry_bound_is_three() {
        assert_eq!(OrchestratorTask::MAX_RETRIES, 3);
    }
}
