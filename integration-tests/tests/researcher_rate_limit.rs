use common::storage::db::SurrealDbClient;
use common::utils::config::AppConfig;
use control_plane::researcher::validate_and_enqueue;

/// The global per-hour cap applies across domains: six distinct-domain
/// submissions against a cap of five yield exactly five accepted.
#[tokio::test]
async fn global_rate_limit_caps_distinct_domain_submissions() {
    let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
        .await
        .expect("in-memory db");

    let mut config = AppConfig::test_config();
    config.max_urls_per_hour = 5;

    let mut accepted = 0;
    for i in 0..6 {
        let url = format!("https://domain-{i}.example/p0420-repair-guide");
        if validate_and_enqueue(&db, &config, &url).await.expect("validate") {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 5);
}

/// The per-domain cap fires independently of the global one: repeated
/// submissions for a single domain stop well before the global cap when
/// the domain limit is tighter.
#[tokio::test]
async fn per_domain_rate_limit_is_enforced_independently() {
    let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
        .await
        .expect("in-memory db");

    let mut config = AppConfig::test_config();
    config.max_urls_per_hour = 100;
    config.max_per_domain_per_hour = 2;

    let mut accepted = 0;
    for i in 0..4 {
        let url = format!("https://same-domain.example/code-{i}");
        if validate_and_enqueue(&db, &config, &url).await.expect("validate") {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 2);
}
