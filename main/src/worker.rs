use std::sync::Arc;

use common::llm::OpenAiLlmClient;
use common::search::HttpSearchClient;
use common::storage::{db::SurrealDbClient, store::StorageManager};
use common::utils::config::get_config;
use pipeline::StageContext;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Runs the six-stage document pipeline: claims jobs off `jobs:crawl`
/// through `jobs:resolve` in round-robin and dispatches each to its
/// stage function.
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

    let storage = StorageManager::new(&config).await?;
    let llm = Arc::new(OpenAiLlmClient::new(&config));
    let search = Arc::new(HttpSearchClient::new(&config, config.search_base_url.clone())?);

    let ctx = Arc::new(StageContext::new(db, storage, llm, search, config));

    pipeline::run_stage_worker(ctx).await
}
