use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Storage backend selector for raw document/chunk blobs.
#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_ollama_base_url() -> String {
    "http://llm-embed:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_reasoning_model() -> String {
    "llama3".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    5
}

fn default_worker_queue() -> String {
    "jobs:default".to_string()
}

fn default_next_queue() -> String {
    String::new()
}

fn default_lease_duration_secs() -> i64 {
    300
}

fn default_dwell_seconds() -> i64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_embedding_dimensions() -> u32 {
    768
}

fn default_orchestrator_cycle_secs() -> u64 {
    60
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_audit_interval_secs() -> u64 {
    300
}

fn default_verify_interval_secs() -> u64 {
    600
}

fn default_autonomous_interval_secs() -> u64 {
    60
}

fn default_autonomous_urls_per_cycle() -> u32 {
    4
}

fn default_queue_stall_threshold_secs() -> i64 {
    300
}

fn default_error_rate_threshold() -> f64 {
    0.15
}

fn default_processing_time_multiplier() -> f64 {
    3.0
}

fn default_unhealthy_container_grace_period_secs() -> i64 {
    120
}

fn default_max_gpu_queue_items() -> u64 {
    8
}

fn default_max_concurrent_crawls() -> u64 {
    5
}

fn default_max_urls_per_hour() -> u32 {
    30
}

fn default_max_per_domain_per_hour() -> u32 {
    5
}

fn default_cooldown_seconds() -> i64 {
    30
}

fn default_max_actions_per_hour() -> u32 {
    10
}

fn default_cooldown_between_actions_secs() -> i64 {
    60
}

fn default_auto_fix_enabled() -> bool {
    false
}

fn default_auto_fix_allow() -> String {
    "restart_worker,requeue_documents,clear_stale_locks".to_string()
}

fn default_auto_fix_deny() -> String {
    "restart_container,database_operations,delete_data".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_embed_timeout_secs() -> u64 {
    120
}

fn default_generate_timeout_secs() -> u64 {
    300
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_head_timeout_secs() -> u64 {
    10
}

fn default_search_base_url() -> String {
    "http://search:8080/search".to_string()
}

/// Typed, layered application configuration for every worker and daemon
/// in the workspace, with defaults matching the documented environment
/// variables for storage, the LLM backend, queue behavior, chunking, and
/// the control-plane daemons' cadence and safety gates.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default)]
    pub object_store_bucket: Option<String>,

    #[serde(default = "default_ollama_base_url")]
    pub llm_base_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_reasoning_model")]
    pub reasoning_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,

    #[serde(default = "default_worker_queue")]
    pub worker_queue: String,
    #[serde(default = "default_next_queue")]
    pub next_queue: String,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: i64,
    #[serde(default = "default_dwell_seconds")]
    pub dwell_seconds: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_orchestrator_cycle_secs")]
    pub orchestrator_cycle_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    #[serde(default = "default_autonomous_interval_secs")]
    pub autonomous_interval_secs: u64,
    #[serde(default = "default_autonomous_urls_per_cycle")]
    pub autonomous_urls_per_cycle: u32,
    #[serde(default)]
    pub autonomous_mode: bool,

    #[serde(default = "default_queue_stall_threshold_secs")]
    pub queue_stall_threshold_secs: i64,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_processing_time_multiplier")]
    pub processing_time_multiplier: f64,
    #[serde(default = "default_unhealthy_container_grace_period_secs")]
    pub unhealthy_container_grace_period_secs: i64,
    #[serde(default = "default_max_gpu_queue_items")]
    pub max_gpu_queue_items: u64,
    #[serde(default = "default_max_concurrent_crawls")]
    pub max_concurrent_crawls: u64,

    #[serde(default = "default_max_urls_per_hour")]
    pub max_urls_per_hour: u32,
    #[serde(default = "default_max_per_domain_per_hour")]
    pub max_per_domain_per_hour: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_max_actions_per_hour")]
    pub max_actions_per_hour: u32,
    #[serde(default = "default_cooldown_between_actions_secs")]
    pub cooldown_between_actions_secs: i64,

    #[serde(default = "default_auto_fix_enabled")]
    pub auto_fix_enabled: bool,
    #[serde(default = "default_auto_fix_allow")]
    pub auto_fix_allow: String,
    #[serde(default = "default_auto_fix_deny")]
    pub auto_fix_deny: String,

    #[serde(default)]
    pub openai_api_keys: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_head_timeout_secs")]
    pub head_timeout_secs: u64,

    #[serde(default = "default_search_base_url")]
    pub search_base_url: String,
}

/// Collects the API keys configured for verifier rotation (`S6`):
/// `OPENAI_API_KEYS` (comma-separated) takes precedence, then any
/// `OPENAI_API_KEY_<N>` numbered variables, falling back to the single
/// `OPENAI_API_KEY`.
impl AppConfig {
    pub fn api_keys(&self) -> Vec<String> {
        if let Some(keys) = &self.openai_api_keys {
            let parsed: Vec<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }

        let mut numbered = Vec::new();
        for n in 1..=16 {
            if let Ok(key) = std::env::var(format!("OPENAI_API_KEY_{n}")) {
                if !key.is_empty() {
                    numbered.push(key);
                }
            }
        }
        if !numbered.is_empty() {
            return numbered;
        }

        self.openai_api_key.clone().into_iter().collect()
    }

    pub fn auto_fix_allow_list(&self) -> Vec<String> {
        split_csv(&self.auto_fix_allow)
    }

    pub fn auto_fix_deny_list(&self) -> Vec<String> {
        split_csv(&self.auto_fix_deny)
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    pub fn test_config() -> AppConfig {
        test_config()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub fn test_config() -> AppConfig {
    AppConfig {
        surrealdb_address: "mem://".into(),
        surrealdb_username: "test".into(),
        surrealdb_password: "test".into(),
        surrealdb_namespace: "test".into(),
        surrealdb_database: "test".into(),
        data_dir: "/tmp/refinery-test".into(),
        storage: StorageKind::Memory,
        object_store_bucket: None,
        llm_base_url: "http://localhost:0".into(),
        llm_api_key: Some("test".into()),
        embedding_model: default_embedding_model(),
        reasoning_model: default_reasoning_model(),
        embedding_dimensions: default_embedding_dimensions(),
        worker_queue: default_worker_queue(),
        next_queue: default_next_queue(),
        poll_timeout_secs: default_poll_timeout_secs(),
        lease_duration_secs: default_lease_duration_secs(),
        dwell_seconds: default_dwell_seconds(),
        max_attempts: default_max_attempts(),
        chunk_size: default_chunk_size(),
        chunk_overlap: default_chunk_overlap(),
        orchestrator_cycle_secs: default_orchestrator_cycle_secs(),
        monitor_interval_secs: default_monitor_interval_secs(),
        audit_interval_secs: default_audit_interval_secs(),
        verify_interval_secs: default_verify_interval_secs(),
        autonomous_interval_secs: default_autonomous_interval_secs(),
        autonomous_urls_per_cycle: default_autonomous_urls_per_cycle(),
        autonomous_mode: false,
        queue_stall_threshold_secs: default_queue_stall_threshold_secs(),
        error_rate_threshold: default_error_rate_threshold(),
        processing_time_multiplier: default_processing_time_multiplier(),
        unhealthy_container_grace_period_secs: default_unhealthy_container_grace_period_secs(),
        max_gpu_queue_items: default_max_gpu_queue_items(),
        max_concurrent_crawls: default_max_concurrent_crawls(),
        max_urls_per_hour: default_max_urls_per_hour(),
        max_per_domain_per_hour: default_max_per_domain_per_hour(),
        cooldown_seconds: default_cooldown_seconds(),
        max_actions_per_hour: default_max_actions_per_hour(),
        cooldown_between_actions_secs: default_cooldown_between_actions_secs(),
        auto_fix_enabled: false,
        auto_fix_allow: default_auto_fix_allow(),
        auto_fix_deny: default_auto_fix_deny(),
        openai_api_keys: None,
        openai_api_key: Some("test".into()),
        http_timeout_secs: default_http_timeout_secs(),
        embed_timeout_secs: default_embed_timeout_secs(),
        generate_timeout_secs: default_generate_timeout_secs(),
        search_timeout_secs: default_search_timeout_secs(),
        head_timeout_secs: default_head_timeout_secs(),
        search_base_url: default_search_base_url(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_prefers_csv_list() {
        let mut cfg = test_config();
        cfg.openai_api_keys = Some("a, b ,c".into());
        assert_eq!(cfg.api_keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn api_keys_falls_back_to_single_key() {
        let mut cfg = test_config();
        cfg.openai_api_keys = None;
        cfg.openai_api_key = Some("solo".into());
        assert_eq!(cfg.api_keys(), vec!["solo".to_string()]);
    }

    #[test]
    fn auto_fix_lists_split_on_comma() {
        let cfg = test_config();
        assert!(cfg.auto_fix_allow_list().contains(&"restart_worker".to_string()));
        assert!(cfg.auto_fix_deny_list().contains(&"delete_data".to_string()));
    }
}
