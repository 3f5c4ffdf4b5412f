use std::sync::Arc;
use std::time::Duration;

use common::llm::OpenAiLlmClient;
use common::queue::StageSweeper;
use common::search::HttpSearchClient;
use common::storage::{db::SurrealDbClient, store::StorageManager};
use common::utils::config::get_config;
use control_plane::healer::{HealContext, NoopRemediationExecutor};
use control_plane::monitor::NoopContainerRuntime;
use control_plane::researcher::ResearchContext;
use control_plane::{healer, monitor, orchestrator, researcher, verifier};
use pipeline::StageContext;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Single-process entrypoint: runs the stage worker, the stale-document
/// sweep, and all five control-plane daemons together. Split deployments
/// should run the `pipeline-worker` and `control-plane` binaries instead.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let storage = StorageManager::new(&config).await?;
    let search = Arc::new(HttpSearchClient::new(&config, config.search_base_url.clone())?);
    let llm = Arc::new(OpenAiLlmClient::new(&config));

    let stage_ctx = Arc::new(StageContext::new(
        db.clone(),
        storage,
        llm.clone(),
        search.clone(),
        config.clone(),
    ));

    let research_ctx = Arc::new(ResearchContext {
        db: db.clone(),
        search,
        config: config.clone(),
    });
    let heal_ctx = Arc::new(HealContext {
        db: db.clone(),
        llm,
        executor: Arc::new(NoopRemediationExecutor),
        config: config.clone(),
    });
    let container_runtime = Arc::new(NoopContainerRuntime);

    let worker_handle = tokio::spawn(async move {
        if let Err(err) = pipeline::run_stage_worker(stage_ctx).await {
            error!(error = %err, "pipeline worker exited");
        }
    });

    let sweeper_db = db.clone();
    let dwell_seconds = config.dwell_seconds;
    let poll_timeout_secs = config.poll_timeout_secs;
    let sweeper_handle = tokio::spawn(async move {
        loop {
            let sweeper = StageSweeper::new(&sweeper_db, dwell_seconds);
            match sweeper.sweep().await {
                Ok(requeued) if !requeued.is_empty() => {
                    info!(count = requeued.len(), "stage sweeper requeued stalled documents");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "stage sweeper failed"),
            }
            tokio::time::sleep(Duration::from_secs(poll_timeout_secs * 6)).await;
        }
    });

    let orchestrator_db = db.clone();
    let orchestrator_config = config.clone();
    let orchestrator_handle = tokio::spawn(async move {
        if let Err(err) = orchestrator::run_orchestrator_loop(orchestrator_db, orchestrator_config).await {
            error!(error = %err, "orchestrator loop exited");
        }
    });

    let researcher_handle = tokio::spawn(async move {
        if let Err(err) = researcher::run_researcher_loop(research_ctx).await {
            error!(error = %err, "researcher loop exited");
        }
    });

    let monitor_db = db.clone();
    let monitor_config = config.clone();
    let monitor_handle = tokio::spawn(async move {
        if let Err(err) = monitor::run_monitor_loop(monitor_db, monitor_config, container_runtime).await {
            error!(error = %err, "monitor loop exited");
        }
    });

    let healer_handle = tokio::spawn(async move {
        if let Err(err) = healer::run_healer_loop(heal_ctx).await {
            error!(error = %err, "healer loop exited");
        }
    });

    let verifier_handle = tokio::spawn(async move {
        if let Err(err) = verifier::run_verifier_loop(db, config).await {
            error!(error = %err, "verifier loop exited");
        }
    });

    let _ = tokio::join!(
        worker_handle,
        sweeper_handle,
        orchestrator_handle,
        researcher_handle,
        monitor_handle,
        healer_handle,
        verifier_handle,
    );

    Ok(())
}
