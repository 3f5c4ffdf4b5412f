use common::storage::db::SurrealDbClient;
use common::storage::types::knowledge::{DtcCategory, DtcMaster, VerificationStatus};
use common::storage::types::rate_limit::ApiKeyBudget;
use common::utils::config::AppConfig;
use control_plane::verifier::verify_dtc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
            "logprobs": null,
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30},
    })
}

fn rate_limited_error_body() -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": "429 rate limit reached for this key",
            "type": "rate_limit_error",
            "param": null,
            "code": null,
        }
    })
}

/// The first configured key gets rate limited; the verifier rotates to
/// the second key, completes the fact-check, and only the key that
/// actually succeeded has its usage recorded.
#[tokio::test]
async fn rate_limited_key_rotates_to_next_configured_key() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer key1"))
        .respond_with(ResponseTemplate::new(429).set_body_json(rate_limited_error_body()))
        .mount(&server)
        .await;

    let judgment = r#"{"outcome": "confirmed", "detail": "matches known repair data", "confidence_delta": 0.15}"#;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer key2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body(judgment)))
        .mount(&server)
        .await;

    let mut config = AppConfig::test_config();
    config.llm_base_url = server.uri();
    config.openai_api_keys = Some("key1,key2".to_string());

    let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
        .await
        .expect("in-memory db");

    let now = chrono::Utc::now();
    let dtc = DtcMaster {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        code: "P0420".to_string(),
        category: DtcCategory::Emissions,
        severity_level: 3,
        emissions_related: true,
        description: Some("Catalyst system efficiency below threshold".to_string()),
        confidence: 0.5,
        source_count: 2,
        verification_status: VerificationStatus::Unverified,
        verified_at: None,
    };
    let dtc_id = dtc.id.clone();
    db.store_item(dtc.clone()).await.expect("seed dtc master");

    verify_dtc(&config, &db, dtc).await.expect("verify_dtc");

    let updated: DtcMaster = db.get_item(&dtc_id).await.expect("query").expect("dtc still present");
    assert_eq!(updated.verification_status, VerificationStatus::Verified);
    assert!((updated.confidence - 0.65).abs() < 1e-9);
    assert!(updated.verified_at.is_some());

    let budgets: Vec<ApiKeyBudget> = db.get_all_stored_items().await.expect("budgets");
    let key1_budget = budgets.iter().find(|b| b.key_fingerprint == "key-key1").expect("key1 budget recorded");
    let key2_budget = budgets.iter().find(|b| b.key_fingerprint == "key-key2").expect("key2 budget recorded");
    assert_eq!(key1_budget.requests_made, 0);
    assert_eq!(key2_budget.requests_made, 1);
}
