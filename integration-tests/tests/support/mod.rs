use std::sync::Arc;

use common::llm::test_utils::FakeLlmClient;
use common::search::test_utils::FakeSearchClient;
use common::storage::db::SurrealDbClient;
use common::storage::store::StorageManager;
use common::storage::types::document::{Document, ProcessingStage};
use common::utils::config::{test_config, AppConfig};
use pipeline::StageContext;

/// Builds a `StageContext` wired to an in-memory database and object
/// store, with the given scripted LLM completions/embeddings and no
/// search results. Each completion is consumed in call order, matching
/// the order the pipeline's stages issue them.
pub async fn test_stage_context(
    embeddings: Vec<Vec<f32>>,
    completions: Vec<String>,
) -> StageContext {
    test_stage_context_with_config(embeddings, completions, test_config()).await
}

pub async fn test_stage_context_with_config(
    embeddings: Vec<Vec<f32>>,
    completions: Vec<String>,
    config: AppConfig,
) -> StageContext {
    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db"),
    );
    db.ensure_initialized().await.expect("initialize db");

    let storage = StorageManager::new(&config).await.expect("in-memory storage");
    let llm = Arc::new(FakeLlmClient::new(embeddings, completions));
    let search = Arc::new(FakeSearchClient::new(Vec::new()));

    StageContext::new(db, storage, llm, search, config)
}

/// Stores `text` as a pending document's raw object and database row,
/// returning its id so stage `run` functions can be called against it.
pub async fn seed_document(ctx: &StageContext, text: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    let raw_object_key = format!("raw/{id}");
    ctx.storage
        .put(&raw_object_key, bytes::Bytes::from(text.to_string()))
        .await
        .expect("put raw text");

    let now = chrono::Utc::now();
    let document = Document {
        id: id.clone(),
        created_at: now,
        updated_at: now,
        title: "test document".to_string(),
        source_url: None,
        mime_type: "text/plain".to_string(),
        content_hash: format!("{:x}", content_hash_stub(text)),
        raw_object_key,
        processing_stage: ProcessingStage::Pending,
        error_message: None,
        chunk_count: 0,
        retry_count: 0,
        worker_id: None,
        processing_log: Vec::new(),
    };
    ctx.db.store_item(document).await.expect("store document");
    id
}

/// Good enough content-addressing for test fixtures; the real crawl
/// stage uses `sha2`, which these tests never exercise directly.
fn content_hash_stub(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}
