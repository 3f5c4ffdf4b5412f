//! LLM service contract: embeddings and chat completions behind a trait,
//! so the Evaluate/Extract stages and the researcher/verifier can each be
//! tested against a fake instead of a live OpenAI-compatible endpoint.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, ResponseFormat,
};
use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppError;
use crate::utils::config::AppConfig;

/// A single text embedding request/response pair, kept trait-object-safe
/// by not exposing `async-openai`'s request builders past this boundary.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError>;

    /// Runs a chat completion. `json_mode` requests `response_format:
    /// json_object`, used by the Evaluate/Extract stages to get
    /// machine-parseable output.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_mode: bool,
        temperature: f32,
    ) -> Result<String, AppError>;
}

pub struct OpenAiLlmClient {
    client: async_openai::Client<OpenAIConfig>,
    embedding_model: String,
    embedding_dimensions: u32,
    reasoning_model: String,
    embed_timeout: Duration,
    generate_timeout: Duration,
}

impl OpenAiLlmClient {
    /// Builds a client against `config.llm_base_url` using the first key
    /// from `config.api_keys()`. Callers that need key rotation across
    /// requests (the verifier) construct one `OpenAiLlmClient` per key and
    /// pick between them themselves.
    pub fn new(config: &AppConfig) -> Self {
        Self::with_api_key(config, config.api_keys().into_iter().next())
    }

    pub fn with_api_key(config: &AppConfig, api_key: Option<String>) -> Self {
        let mut openai_config = OpenAIConfig::new().with_api_base(config.llm_base_url.clone());
        if let Some(key) = api_key {
            openai_config = openai_config.with_api_key(key);
        }

        Self {
            client: async_openai::Client::with_config(openai_config),
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
            reasoning_model: config.reasoning_model.clone(),
            embed_timeout: Duration::from_secs(config.embed_timeout_secs),
            generate_timeout: Duration::from_secs(config.generate_timeout_secs),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .dimensions(self.embedding_dimensions)
            .input([input])
            .build()?;

        let response = tokio::time::timeout(self.embed_timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| AppError::InternalError("embedding request timed out".into()))??;

        let embedding = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LlmParsing("no embedding data received".into()))?
            .embedding;

        Ok(embedding)
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_mode: bool,
        temperature: f32,
    ) -> Result<String, AppError> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.reasoning_model)
            .temperature(temperature)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt).into(),
                ChatCompletionRequestUserMessage::from(user_prompt).into(),
            ]);
        if json_mode {
            builder.response_format(ResponseFormat::JsonObject);
        }
        let request = builder.build()?;

        let response = tokio::time::timeout(self.generate_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| AppError::InternalError("completion request timed out".into()))??;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::LlmParsing("no content in LLM response".into()))?;

        Ok(content)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// A scripted `LlmClient` for stage/daemon unit tests: returns queued
    /// responses in order, recording every call it receives.
    pub struct FakeLlmClient {
        embeddings: Mutex<Vec<Vec<f32>>>,
        completions: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeLlmClient {
        pub fn new(embeddings: Vec<Vec<f32>>, completions: Vec<String>) -> Self {
            Self {
                embeddings: Mutex::new(embeddings),
                completions: Mutex::new(completions),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlmClient {
        async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
            self.calls.lock().unwrap().push(format!("embed:{input}"));
            let mut queue = self.embeddings.lock().unwrap();
            if queue.is_empty() {
                return Err(AppError::InternalError("no fake embedding queued".into()));
            }
            Ok(queue.remove(0))
        }

        async fn complete(
            &self,
            _system_prompt: &str,
            user_prompt: &str,
            _json_mode: bool,
            _temperature: f32,
        ) -> Result<String, AppError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("complete:{user_prompt}"));
            let mut queue = self.completions.lock().unwrap();
            if queue.is_empty() {
                return Err(AppError::InternalError("no fake completion queued".into()));
            }
            Ok(queue.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::FakeLlmClient;
    use super::*;

    #[tokio::test]
    async fn fake_client_returns_queued_embedding() {
        let client = FakeLlmClient::new(vec![vec![0.1, 0.2, 0.3]], vec![]);
        let embedding = client.embed("hello").await.expect("embed");
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fake_client_errors_when_queue_exhausted() {
        let client = FakeLlmClient::new(vec![], vec!["{}".to_string()]);
        assert!(client.embed("hello").await.is_err());

        let completion = client
            .complete("system", "user", true, 0.0)
            .await
            .expect("completion");
        assert_eq!(completion, "{}");
    }
}
