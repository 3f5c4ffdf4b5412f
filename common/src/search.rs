//! Web search collaborator: a thin HTTP client over a
//! search endpoint that accepts `q` and `format=json` query parameters and
//! returns a list of results, built on the same `reqwest` client pattern
//! used for other outbound HTTP calls, with a timeout sourced from config.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::AppError;
use crate::utils::config::AppConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError>;
}

pub struct HttpSearchClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSearchClient {
    pub fn new(config: &AppConfig, base_url: impl Into<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.search_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await?
            .error_for_status()?;

        let body: SearchResponse = response.json().await?;
        Ok(body.results)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeSearchClient {
        results: Mutex<Vec<SearchResult>>,
        pub queries: Mutex<Vec<String>>,
    }

    impl FakeSearchClient {
        pub fn new(results: Vec<SearchResult>) -> Self {
            Self {
                results: Mutex::new(results),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SearchClient for FakeSearchClient {
        async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.results.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::FakeSearchClient;
    use super::*;

    #[tokio::test]
    async fn fake_client_records_query_and_returns_results() {
        let client = FakeSearchClient::new(vec![SearchResult {
            title: "P0420 diagnosis".into(),
            url: "https://example.com/p0420".into(),
            snippet: "catalyst efficiency below threshold".into(),
        }]);

        let results = client.search("P0420").await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "https://example.com/p0420");
        assert_eq!(client.queries.lock().unwrap()[0], "P0420");
    }

    #[test]
    fn search_response_defaults_missing_results_to_empty() {
        let parsed: SearchResponse = serde_json::from_str("{}").expect("parse");
        assert!(parsed.results.is_empty());
    }
}
