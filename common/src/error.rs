use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Single error boundary for the whole workspace. One variant per external
/// failure domain, matching the way each stage/daemon reports up to its
/// worker loop.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("LLM error: {0}")]
    Llm(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("LLM response parsing error: {0}")]
    LlmParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
