//! Turns orchestrator directives (and, in autonomous mode, coverage gaps)
//! into validated crawl jobs. Tiered by domain quality, rate-limited per
//! domain and globally via `TtlCounter`, blocked domains skipped outright.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::error::AppError;
use common::queue::{SurrealWorkQueue, WorkQueue};
use common::search::SearchClient;
use common::storage::db::SurrealDbClient;
use common::storage::types::control_plane::{CrawlQueueEntry, CrawlQueueStatus};
use common::storage::types::rate_limit::{DomainRegistryEntry, TtlCounter};
use common::utils::config::AppConfig;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

const GLOBAL_RATE_KEY: &str = "researcher:global:urls_per_hour";
const RATE_WINDOW_SECS: i64 = 3600;
const MAX_DEPTH: u32 = 2;

pub struct ResearchContext {
    pub db: Arc<SurrealDbClient>,
    pub search: Arc<dyn SearchClient>,
    pub config: AppConfig,
}

/// Builds search queries from an orchestrator directive. Unrecognized
/// directive types produce no queries rather than erroring, since a new
/// recommendation kind showing up should not stall the researcher.
pub fn build_queries(directive: &serde_json::Value) -> Vec<String> {
    let directive_type = directive.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match directive_type {
        "improve_confidence" | "fill_gaps" => {
            let reason = directive.get("reason").and_then(|v| v.as_str()).unwrap_or("");
            vec![format!("{reason} diagnostic trouble code forum discussion")]
        }
        "expand_coverage" => directive
            .get("target_ranges")
            .and_then(|v| v.as_array())
            .map(|ranges| {
                ranges
                    .iter()
                    .filter_map(|r| r.as_str())
                    .map(|range| format!("{range} OBD-II diagnostic trouble codes"))
                    .collect()
            })
            .unwrap_or_default(),
        other => {
            warn!(directive_type = other, "no query strategy for directive");
            Vec::new()
        }
    }
}

async fn rate_limit_allows(
    db: &SurrealDbClient,
    key: &str,
    limit: u64,
    window_secs: i64,
) -> Result<bool, AppError> {
    let now = Utc::now();
    let mut response = db
        .query("SELECT * FROM ttl_counter WHERE key = $key LIMIT 1")
        .bind(("key", key.to_string()))
        .await
        .map_err(AppError::Database)?;
    let existing: Option<TtlCounter> = response.take(0).map_err(AppError::Database)?;

    match existing {
        Some(counter) if !counter.is_expired(now) => {
            if counter.count >= limit {
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
                key: key.to_string(),
                count: 1,
                expires_at: now + ChronoDuration::seconds(window_secs),
            };
            db.store_item(counter).await.map_err(AppError::Database)?;
            Ok(true)
        }
    }
}

async fn domain_registry_entry(db: &SurrealDbClient, domain: &str) -> Result<DomainRegistryEntry, AppError> {
    let mut response = db
        .query("SELECT * FROM domain_registry_entry WHERE domain = $domain LIMIT 1")
        .bind(("domain", domain.to_string()))
        .await
        .map_err(AppError::Database)?;
    let existing: Option<DomainRegistryEntry> = response.take(0).map_err(AppError::Database)?;
    if let Some(entry) = existing {
        return Ok(entry);
    }
    let now = Utc::now();
    let entry = DomainRegistryEntry {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        domain: domain.to_string(),
        quality_tier: DomainRegistryEntry::DEFAULT_QUALITY_TIER,
        blocked: false,
        total_submitted: 0,
        total_accepted: 0,
    };
    db.store_item(entry.clone()).await.map_err(AppError::Database)?;
    Ok(entry)
}

/// Validates a candidate URL against domain blocklist and per-domain /
/// global rate limits, enqueuing a crawl job if it passes.
pub async fn validate_and_enqueue(
    db: &SurrealDbClient,
    config: &AppConfig,
    url: &str,
) -> Result<bool, AppError> {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(url, error = %err, "researcher dropped unparseable url");
            return Ok(false);
        }
    };
    let Some(domain) = parsed.host_str().map(str::to_string) else {
        return Ok(false);
    };

    let mut registry_entry = domain_registry_entry(db, &domain).await?;
    if registry_entry.blocked {
        return Ok(false);
    }

    if !rate_limit_allows(db, GLOBAL_RATE_KEY, config.max_urls_per_hour as u64, RATE_WINDOW_SECS).await? {
        return Ok(false);
    }
    let domain_key = format!("researcher:domain:{domain}:per_hour");
    if !rate_limit_allows(db, &domain_key, config.max_per_domain_per_hour as u64, RATE_WINDOW_SECS).await? {
        return Ok(false);
    }

    let now = Utc::now();
    let entry = CrawlQueueEntry {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        url: url.to_string(),
        domain: domain.clone(),
        max_depth: MAX_DEPTH,
        status: CrawlQueueStatus::Pending,
        attempts: 0,
        last_error: None,
    };
    db.store_item(entry).await.map_err(AppError::Database)?;

    registry_entry.total_submitted += 1;
    db.update_item(registry_entry).await.map_err(AppError::Database)?;

    let queue = SurrealWorkQueue::new(db);
    queue.push("jobs:crawl", url).await?;
    Ok(true)
}

/// Processes a single directive payload pulled from `orchestrator:research`.
pub async fn process_directive(ctx: &ResearchContext, payload: &str) -> Result<usize, AppError> {
    let directive: serde_json::Value = serde_json::from_str(payload)
        .map_err(|err| AppError::InternalError(format!("invalid research directive: {err}")))?;
    let queries = build_queries(&directive);

    let mut enqueued = 0;
    for query in queries {
        let results = ctx.search.search(&query).await?;
        for result in results {
            if validate_and_enqueue(&ctx.db, &ctx.config, &result.url).await? {
                enqueued += 1;
            }
        }
    }
    Ok(enqueued)
}

/// Runs one autonomous discovery pass: queries for the widest coverage
/// gap and submits up to `autonomous_urls_per_cycle` candidate URLs.
pub async fn run_autonomous_cycle(ctx: &ResearchContext) -> Result<usize, AppError> {
    let coverage = crate::auditor::analyze_coverage(&ctx.db).await?;
    let Some(gap) = coverage.gaps.first() else {
        info!("autonomous researcher found no coverage gaps");
        return Ok(0);
    };

    let query = format!("{} OBD-II diagnostic trouble codes repair guide", gap.range);
    let results = ctx.search.search(&query).await?;

    let mut enqueued = 0;
    for result in results.into_iter().take(ctx.config.autonomous_urls_per_cycle as usize) {
        if validate_and_enqueue(&ctx.db, &ctx.config, &result.url).await? {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

pub async fn run_researcher_loop(ctx: Arc<ResearchContext>) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = format!("researcher-{}", Uuid::new_v4());
    let queue = SurrealWorkQueue::new(&ctx.db);
    let mut last_autonomous = Utc::now() - ChronoDuration::seconds(ctx.config.autonomous_interval_secs as i64);

    loop {
        let lease = ChronoDuration::seconds(ctx.config.lease_duration_secs);
        match queue.claim_next("orchestrator:research", &worker_id, lease).await {
            Ok(Some(message)) => {
                match process_directive(&ctx, &message.payload).await {
                    Ok(count) => {
                        info!(enqueued = count, "researcher processed directive");
                        queue.complete(&message.id).await?;
                    }
                    Err(err) => {
                        warn!(error = %err, "researcher directive failed");
                        queue.fail(&message.id, &err.to_string(), message.attempts < ctx.config.max_attempts).await?;
                    }
                }
            }
            Ok(None) => {
                if ctx.config.autonomous_mode {
                    let elapsed = Utc::now() - last_autonomous;
                    if elapsed.num_seconds() >= ctx.config.autonomous_interval_secs as i64 {
                        if let Err(err) = run_autonomous_cycle(&ctx).await {
                            warn!(error = %err, "autonomous research cycle failed");
                        }
                        last_autonomous = Utc::now();
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(ctx.config.poll_timeout_secs)).await;
            }
            Err(err) => {
                warn!(error = %err, "failed to claim research directive");
                tokio::time::sleep(std::time::Duration::from_secs(ctx.config.poll_timeout_secs)).await;
            }
        }
    }
}
