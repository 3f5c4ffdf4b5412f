use std::sync::Arc;

use common::llm::OpenAiLlmClient;
use common::search::HttpSearchClient;
use common::storage::db::SurrealDbClient;
use common::utils::config::get_config;
use control_plane::healer::{HealContext, NoopRemediationExecutor};
use control_plane::monitor::NoopContainerRuntime;
use control_plane::researcher::ResearchContext;
use control_plane::{healer, monitor, orchestrator, researcher, verifier};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Runs the five control-plane daemons side by side in one process:
/// orchestrator (OODA loop), researcher (directive + autonomous crawl
/// discovery), monitor/healer (anomaly detection and remediation), and
/// verifier (LLM fact-checking). Each is independently fallible; one
/// daemon's panic-free error loop doesn't take the others down.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
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

    let search = Arc::new(HttpSearchClient::new(&config, config.search_base_url.clone())?);
    let llm = Arc::new(OpenAiLlmClient::new(&config));

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

    let verifier_db = db.clone();
    let verifier_config = config.clone();
    let verifier_handle = tokio::spawn(async move {
        if let Err(err) = verifier::run_verifier_loop(verifier_db, verifier_config).await {
            error!(error = %err, "verifier loop exited");
        }
    });

    let _ = tokio::join!(
        orchestrator_handle,
        researcher_handle,
        monitor_handle,
        healer_handle,
        verifier_handle,
    );

    Ok(())
}
