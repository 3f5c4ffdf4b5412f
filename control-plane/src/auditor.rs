//! Confidence, completeness, coverage-gap, and pipeline-health analyses,
//! bundled into a single report the orchestrator reads each cycle.

use std::collections::HashMap;

use chrono::Utc;
use common::error::AppError;
use common::storage::db::SurrealDbClient;
use common::storage::types::control_plane::{AuditRecommendation, AuditReport, CoverageSnapshot};
use common::storage::types::document::{Document, LogStatus};
use common::storage::types::knowledge::{DtcCategory, DtcMaster};
use common::storage::types::refined::TsbReference;
use common::queue::QueueMessageStatus;
use regex::Regex;

const COMPLETENESS_LOWEST_N: usize = 20;
const COVERAGE_TOP_N: usize = 30;
const GAP_WINDOW: u32 = 100;
const GAP_MIN_CODES_PER_PREFIX: usize = 10;
const GAP_MIN_CODES_PER_WINDOW: usize = 5;
const BUSY_QUEUE_THRESHOLD: u64 = 50;
const DEGRADED_STUCK_THRESHOLD: usize = 5;
const STUCK_DOCUMENT_AGE_SECS: i64 = 30 * 60;

const STAGES: &[&str] = &[
    "chunking",
    "embedding",
    "evaluating",
    "extracting",
    "resolving",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceHistogram {
    pub below_0_2: u32,
    pub below_0_4: u32,
    pub below_0_6: u32,
    pub below_0_8: u32,
    pub below_1_0: u32,
}

impl ConfidenceHistogram {
    fn record(&mut self, confidence: f64) {
        if confidence < 0.2 {
            self.below_0_2 += 1;
        } else if confidence < 0.4 {
            self.below_0_4 += 1;
        } else if confidence < 0.6 {
            self.below_0_6 += 1;
        } else if confidence < 0.8 {
            self.below_0_8 += 1;
        } else {
            self.below_1_0 += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct DtcCompleteness {
    pub dtc_id: String,
    pub code: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct QualityAnalysis {
    pub histogram: ConfidenceHistogram,
    pub average_confidence: f64,
    pub lowest_completeness: Vec<DtcCompleteness>,
}

/// Score a single DTC's completeness against the fixed weight table:
/// description 0.15, category 0.05, severity 0.05, causes 0.25,
/// diagnostic_steps 0.30, sensors 0.10, tsb 0.10.
async fn completeness_score(db: &SurrealDbClient, dtc: &DtcMaster) -> Result<f64, AppError> {
    let mut score = 0.0;
    if dtc.description.as_ref().is_some_and(|d| !d.trim().is_empty()) {
        score += 0.15;
    }
    if dtc.category != DtcCategory::Unknown {
        score += 0.05;
    }
    if dtc.severity_level > 0 {
        score += 0.05;
    }
    if count_rows(db, "knowledge_cause", &dtc.id).await? > 0 {
        score += 0.25;
    }
    if count_rows(db, "knowledge_diagnostic_step", &dtc.id).await? > 0 {
        score += 0.30;
    }
    if count_rows(db, "knowledge_sensor", &dtc.id).await? > 0 {
        score += 0.10;
    }
    if count_tsb(db, &dtc.id).await? > 0 {
        score += 0.10;
    }
    Ok(score)
}

async fn count_rows(db: &SurrealDbClient, table: &str, dtc_id: &str) -> Result<u64, AppError> {
    let mut response = db
        .query("SELECT count() FROM type::table($table) WHERE dtc_id = $dtc_id GROUP ALL")
        .bind(("table", table.to_string()))
        .bind(("dtc_id", dtc_id.to_string()))
        .await
        .map_err(AppError::Database)?;
    let counted: Option<CountRow> = response.take(0).map_err(AppError::Database)?;
    Ok(counted.map(|c| c.count).unwrap_or(0))
}

async fn count_tsb(db: &SurrealDbClient, dtc_id: &str) -> Result<u64, AppError> {
    let tsbs: Vec<TsbReference> = {
        let mut response = db
            .query("SELECT * FROM refined_tsb_reference WHERE dtc_id = $dtc_id")
            .bind(("dtc_id", dtc_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };
    Ok(tsbs.len() as u64)
}

#[derive(serde::Deserialize)]
struct CountRow {
    count: u64,
}

pub async fn analyze_quality(db: &SurrealDbClient) -> Result<QualityAnalysis, AppError> {
    let dtcs: Vec<DtcMaster> = db.get_all_stored_items().await.map_err(AppError::Database)?;

    let mut histogram = ConfidenceHistogram::default();
    let mut total = 0.0;
    let mut completeness = Vec::with_capacity(dtcs.len());

    for dtc in &dtcs {
        histogram.record(dtc.confidence);
        total += dtc.confidence;
        let score = completeness_score(db, dtc).await?;
        completeness.push(DtcCompleteness {
            dtc_id: dtc.id.clone(),
            code: dtc.code.clone(),
            score,
        });
    }

    let average_confidence = if dtcs.is_empty() { 0.0 } else { total / dtcs.len() as f64 };

    completeness.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
    completeness.truncate(COMPLETENESS_LOWEST_N);

    Ok(QualityAnalysis {
        histogram,
        average_confidence,
        lowest_completeness: completeness,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GapPriority {
    High,
    Medium,
}

#[derive(Debug, Clone)]
pub struct CoverageGap {
    pub priority: GapPriority,
    pub range: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct CoverageAnalysis {
    pub gaps: Vec<CoverageGap>,
    pub totals_by_prefix: HashMap<String, usize>,
}

fn dtc_pattern() -> Regex {
    Regex::new(r"^([PBCU])([0-9])([0-9]{3})$").expect("static DTC pattern")
}

fn parse_dtc_code(code: &str) -> Option<(String, u32)> {
    let pattern = dtc_pattern();
    let captures = pattern.captures(code)?;
    let prefix = format!("{}{}", &captures[1], &captures[2]);
    let number: u32 = captures[3].parse().ok()?;
    Some((prefix, number))
}

pub async fn analyze_coverage(db: &SurrealDbClient) -> Result<CoverageAnalysis, AppError> {
    let dtcs: Vec<DtcMaster> = db.get_all_stored_items().await.map_err(AppError::Database)?;

    let mut by_prefix: HashMap<String, Vec<u32>> = HashMap::new();
    for dtc in &dtcs {
        if let Some((prefix, number)) = parse_dtc_code(&dtc.code) {
            by_prefix.entry(prefix).or_default().push(number);
        }
    }

    let totals_by_prefix = by_prefix
        .iter()
        .map(|(prefix, numbers)| (prefix.clone(), numbers.len()))
        .collect();

    let mut gaps = Vec::new();
    for (prefix, numbers) in &by_prefix {
        if numbers.len() <= GAP_MIN_CODES_PER_PREFIX {
            continue;
        }
        let mut window_start = 0u32;
        while window_start < 1000 {
            let window_end = window_start + GAP_WINDOW;
            let count = numbers
                .iter()
                .filter(|n| **n >= window_start && **n < window_end)
                .count();
            if count < GAP_MIN_CODES_PER_WINDOW {
                let priority = if count == 0 { GapPriority::High } else { GapPriority::Medium };
                gaps.push(CoverageGap {
                    priority,
                    range: format!(
                        "{prefix}{window_start:03}-{prefix}{:03}",
                        window_end - 1
                    ),
                    count,
                });
            }
            window_start += GAP_WINDOW;
        }
    }

    gaps.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.range.cmp(&b.range)));
    gaps.truncate(COVERAGE_TOP_N);

    Ok(CoverageAnalysis { gaps, totals_by_prefix })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineHealth {
    Healthy,
    Busy,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct StageStats {
    pub stage: String,
    pub completed: u32,
    pub failed: u32,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
    pub queue_depth: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineAnalysis {
    pub stages: Vec<StageStats>,
    pub bottleneck: Option<String>,
    pub slowest_stage: Option<String>,
    pub health: PipelineHealth,
    pub stuck_documents: usize,
}

async fn queue_depth(db: &SurrealDbClient, queue_name: &str) -> Result<u64, AppError> {
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

pub async fn analyze_pipeline(db: &SurrealDbClient) -> Result<PipelineAnalysis, AppError> {
    let documents: Vec<Document> = db.get_all_stored_items().await.map_err(AppError::Database)?;

    let mut stats: HashMap<&str, (u32, u32, Vec<u64>)> =
        STAGES.iter().map(|s| (*s, (0, 0, Vec::new()))).collect();

    for document in &documents {
        for entry in &document.processing_log {
            let Some(bucket) = stats.get_mut(entry.stage.as_str()) else {
                continue;
            };
            match entry.status {
                LogStatus::Completed => {
                    bucket.0 += 1;
                    if let Some(duration) = entry.duration_ms {
                        bucket.2.push(duration);
                    }
                }
                LogStatus::Failed => bucket.1 += 1,
                LogStatus::Started => {}
            }
        }
    }

    let mut stage_stats = Vec::with_capacity(STAGES.len());
    for stage in STAGES {
        let (completed, failed, durations) = stats.remove(stage).unwrap_or_default();
        let total = completed + failed;
        let error_rate = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
        let avg_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };
        let queue_name = format!("jobs:{}", stage_to_queue_suffix(stage));
        let queue_depth = queue_depth(db, &queue_name).await?;
        stage_stats.push(StageStats {
            stage: stage.to_string(),
            completed,
            failed,
            error_rate,
            avg_duration_ms,
            queue_depth,
        });
    }

    let bottleneck = stage_stats
        .iter()
        .max_by_key(|s| s.queue_depth)
        .filter(|s| s.queue_depth > 0)
        .map(|s| s.stage.clone());

    let slowest_stage = stage_stats
        .iter()
        .max_by(|a, b| a.avg_duration_ms.partial_cmp(&b.avg_duration_ms).unwrap())
        .filter(|s| s.avg_duration_ms > 0.0)
        .map(|s| s.stage.clone());

    let now = Utc::now();
    let stuck_documents = documents
        .iter()
        .filter(|d| !d.is_terminal())
        .filter(|d| (now - d.updated_at).num_seconds() > STUCK_DOCUMENT_AGE_SECS)
        .count();

    let total_queued: u64 = stage_stats.iter().map(|s| s.queue_depth).sum();
    let any_error_rate_high = stage_stats.iter().any(|s| s.error_rate > 0.15);
    let health = if stuck_documents > DEGRADED_STUCK_THRESHOLD || any_error_rate_high {
        PipelineHealth::Degraded
    } else if total_queued > BUSY_QUEUE_THRESHOLD {
        PipelineHealth::Busy
    } else {
        PipelineHealth::Healthy
    };

    Ok(PipelineAnalysis {
        stages: stage_stats,
        bottleneck,
        slowest_stage,
        health,
        stuck_documents,
    })
}

fn stage_to_queue_suffix(stage: &str) -> &'static str {
    match stage {
        "chunking" => "chunk",
        "embedding" => "embed",
        "evaluating" => "evaluate",
        "extracting" => "extract",
        "resolving" => "resolve",
        _ => "unknown",
    }
}

/// Runs all three analyses, writes a dated coverage snapshot, and returns
/// the combined report (already persisted).
pub async fn run_audit(db: &SurrealDbClient) -> Result<AuditReport, AppError> {
    let quality = analyze_quality(db).await?;
    let coverage = analyze_coverage(db).await?;
    let pipeline = analyze_pipeline(db).await?;

    upsert_coverage_snapshot(db, &quality, &coverage).await?;

    let recommendations = build_recommendations(&quality, &coverage, &pipeline);
    let summary = format!(
        "avg_confidence={:.2} gaps={} pipeline_health={:?} stuck_documents={}",
        quality.average_confidence,
        coverage.gaps.len(),
        pipeline.health,
        pipeline.stuck_documents
    );

    let metrics = serde_json::json!({
        "quality": {
            "histogram": {
                "below_0_2": quality.histogram.below_0_2,
                "below_0_4": quality.histogram.below_0_4,
                "below_0_6": quality.histogram.below_0_6,
                "below_0_8": quality.histogram.below_0_8,
                "below_1_0": quality.histogram.below_1_0,
            },
            "average_confidence": quality.average_confidence,
        },
        "coverage": {
            "gap_count": coverage.gaps.len(),
            "totals_by_prefix": coverage.totals_by_prefix,
        },
        "pipeline": {
            "bottleneck": pipeline.bottleneck,
            "slowest_stage": pipeline.slowest_stage,
            "health": format!("{:?}", pipeline.health),
            "stuck_documents": pipeline.stuck_documents,
        },
    });

    let now = Utc::now();
    let report = AuditReport {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        report_type: "full".to_string(),
        summary,
        metrics,
        recommendations,
    };

    db.store_item(report.clone()).await.map_err(AppError::Database)?;
    Ok(report)
}

fn build_recommendations(
    quality: &QualityAnalysis,
    coverage: &CoverageAnalysis,
    pipeline: &PipelineAnalysis,
) -> Vec<AuditRecommendation> {
    let mut recommendations = Vec::new();

    if quality.average_confidence < 0.6 {
        recommendations.push(AuditRecommendation {
            kind: "improve_confidence".to_string(),
            priority: 1,
            detail: format!("average confidence {:.2} below 0.6", quality.average_confidence),
        });
    }
    if !quality.lowest_completeness.is_empty() {
        recommendations.push(AuditRecommendation {
            kind: "fill_gaps".to_string(),
            priority: 2,
            detail: format!(
                "{} DTCs below full completeness, lowest is {}",
                quality.lowest_completeness.len(),
                quality.lowest_completeness[0].code
            ),
        });
    }
    if !coverage.gaps.is_empty() {
        recommendations.push(AuditRecommendation {
            kind: "expand_coverage".to_string(),
            priority: 3,
            detail: format!("{} coverage gaps detected", coverage.gaps.len()),
        });
    }
    if pipeline.health == PipelineHealth::Degraded {
        recommendations.push(AuditRecommendation {
            kind: "fix_pipeline".to_string(),
            priority: 1,
            detail: format!(
                "pipeline degraded: bottleneck={:?} slowest={:?} stuck={}",
                pipeline.bottleneck, pipeline.slowest_stage, pipeline.stuck_documents
            ),
        });
    }
    if pipeline.stuck_documents > 0 {
        recommendations.push(AuditRecommendation {
            kind: "reprocess_errors".to_string(),
            priority: 4,
            detail: format!("{} stuck documents", pipeline.stuck_documents),
        });
    }

    recommendations.sort_by_key(|r| r.priority);
    recommendations
}

async fn upsert_coverage_snapshot(
    db: &SurrealDbClient,
    quality: &QualityAnalysis,
    coverage: &CoverageAnalysis,
) -> Result<(), AppError> {
    let today = Utc::now().date_naive();
    let existing: Option<CoverageSnapshot> = {
        let mut response = db
            .query("SELECT * FROM coverage_snapshot WHERE snapshot_date = $today LIMIT 1")
            .bind(("today", today))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    let completeness_score = if quality.lowest_completeness.is_empty() {
        1.0
    } else {
        quality.lowest_completeness.iter().map(|c| c.score).sum::<f64>()
            / quality.lowest_completeness.len() as f64
    };

    let totals_by_category = serde_json::to_value(&coverage.totals_by_prefix)
        .map_err(|err| AppError::InternalError(err.to_string()))?;
    let gap_ranges = serde_json::to_value(
        coverage
            .gaps
            .iter()
            .map(|g| g.range.clone())
            .collect::<Vec<_>>(),
    )
    .map_err(|err| AppError::LlmParsing(err.to_string()))?;

    let now = Utc::now();
    let snapshot = CoverageSnapshot {
        id: existing.as_ref().map(|s| s.id.clone()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        created_at: existing.as_ref().map(|s| s.created_at).unwrap_or(now),
        updated_at: now,
        snapshot_date: today,
        totals_by_category,
        totals_by_confidence_tier: serde_json::json!({
            "below_0_2": quality.histogram.below_0_2,
            "below_0_4": quality.histogram.below_0_4,
            "below_0_6": quality.histogram.below_0_6,
            "below_0_8": quality.histogram.below_0_8,
            "below_1_0": quality.histogram.below_1_0,
        }),
        gap_ranges,
        completeness_score,
    };

    if existing.is_some() {
        db.update_item(snapshot).await.map_err(AppError::Database)?;
    } else {
        db.store_item(snapshot).await.map_err(AppError::Database)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_dtc_code_into_prefix_and_number() {
        assert_eq!(parse_dtc_code("P0301"), Some(("P0".to_string(), 301)));
        assert_eq!(parse_dtc_code("B1045"), Some(("B1".to_string(), 45)));
        assert_eq!(parse_dtc_code("not-a-code"), None);
    }

    #[test]
    fn histogram_buckets_are_half_open() {
        let mut histogram = ConfidenceHistogram::default();
        for value in [0.0, 0.19, 0.2, 0.39, 0.4, 0.59, 0.6, 0.79, 0.8, 1.0] {
            histogram.record(value);
        }
        assert_eq!(histogram.below_0_2, 2);
        assert_eq!(histogram.below_0_4, 2);
        assert_eq!(histogram.below_0_6, 2);
        assert_eq!(histogram.below_0_8, 2);
        assert_eq!(histogram.below_1_0, 2);
    }

    #[tokio::test]
    async fn empty_database_produces_zero_average_confidence() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        let quality = analyze_quality(&db).await.expect("analyze quality");
        assert_eq!(quality.average_confidence, 0.0);
        assert!(quality.lowest_completeness.is_empty());
    }

    #[tokio::test]
    async fn coverage_flags_empty_window_as_high_priority() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        let now = Utc::now();

        // 11 P0 codes, all in the 0-99 window, leaving every later window in
        // the P0 range empty.
        for i in 0..11u32 {
            db.store_item(DtcMaster {
                id: format!("dtc-{i}"),
                created_at: now,
                updated_at: now,
                code: format!("P0{i:03}"),
                category: DtcCategory::Powertrain,
                severity_level: 3,
                emissions_related: false,
                description: None,
                confidence: 0.5,
                source_count: 1,
                verification_status: common::storage::types::knowledge::VerificationStatus::Unverified,
                verified_at: None,
            })
            .await
            .expect("store dtc");
        }

        let coverage = analyze_coverage(&db).await.expect("analyze coverage");
        assert!(coverage
            .gaps
            .iter()
            .any(|g| g.range == "P0100-P0199" && g.priority == GapPriority::High));
    }
}
