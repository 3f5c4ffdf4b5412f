use std::sync::Arc;

use common::llm::LlmClient;
use common::search::SearchClient;
use common::storage::{db::SurrealDbClient, store::StorageManager};
use common::utils::config::AppConfig;

/// Everything a stage function needs, shared across every worker in a
/// process. Workers release their database connection before any external
/// call (the contract each stage function below follows by not holding a
/// `&SurrealDbClient` borrow across an `.await` on `llm`/`search`).
pub struct StageContext {
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub llm: Arc<dyn LlmClient>,
    pub search: Arc<dyn SearchClient>,
    pub config: AppConfig,
}

impl StageContext {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchClient>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            storage,
            llm,
            search,
            config,
        }
    }
}
