//! Index definitions applied once at startup (`SurrealDbClient::ensure_initialized`).
//! Plain field indexes over the document/queue/knowledge tables this
//! workspace actually queries by. This system has no full-text search or
//! embedding-similarity surface of its own (both are external, non-goal
//! collaborators), so there is no HNSW/analyzer machinery to define here.

/// Every `DEFINE INDEX` statement run against the database on startup.
/// Each is idempotent (`DEFINE INDEX` overwrites by name in SurrealDB), so
/// re-running this on an already-initialized database is a no-op.
pub fn define_indexes() -> Vec<&'static str> {
    vec![
        "DEFINE INDEX idx_document_stage ON document FIELDS processing_stage",
        "DEFINE INDEX idx_document_worker ON document FIELDS worker_id",
        "DEFINE INDEX idx_chunk_document ON chunk FIELDS document_id",
        "DEFINE INDEX idx_chunk_order ON chunk FIELDS document_id, chunk_index UNIQUE",
        "DEFINE INDEX idx_queue_name_status ON queue_message FIELDS queue_name, status",
        "DEFINE INDEX idx_queue_lease ON queue_message FIELDS lease_expires_at",
        "DEFINE INDEX idx_ttl_counter_key ON ttl_counter FIELDS key UNIQUE",
        "DEFINE INDEX idx_ttl_counter_expiry ON ttl_counter FIELDS expires_at",
        "DEFINE INDEX idx_dtc_master_code ON knowledge_dtc_master FIELDS code UNIQUE",
        "DEFINE INDEX idx_crawl_queue_status ON crawl_queue_entry FIELDS status",
        "DEFINE INDEX idx_crawl_queue_domain ON crawl_queue_entry FIELDS domain",
        "DEFINE INDEX idx_api_key_budget_fingerprint ON api_key_budget FIELDS key_fingerprint UNIQUE",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_index_has_a_name_and_a_table() {
        for statement in define_indexes() {
            assert!(statement.starts_with("DEFINE INDEX "));
            assert!(statement.contains(" ON "));
        }
    }
}
