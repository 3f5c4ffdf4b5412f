use serde::{Deserialize, Serialize};

use crate::stored_object;

/// A generic TTL-keyed counter, the SurrealDB-backed stand-in for a
/// Redis `INCR` + `EXPIRE` rate-limiting pattern. SurrealDB has no native
/// key expiry, so `expires_at` is swept lazily on read rather than
/// relying on a background reaper.
stored_object!(TtlCounter, "ttl_counter", {
    key: String,
    count: u64,
    expires_at: chrono::DateTime<chrono::Utc>
});

impl TtlCounter {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-domain researcher bookkeeping: quality tier, block flag, rolling
/// accept/submit counts.
stored_object!(DomainRegistryEntry, "domain_registry_entry", {
    domain: String,
    quality_tier: u8,
    blocked: bool,
    total_submitted: u64,
    total_accepted: u64
});

impl DomainRegistryEntry {
    pub const DEFAULT_QUALITY_TIER: u8 = 3;
}

/// Per-API-key budget state for the verifier's multi-key manager.
/// Persisted (not just in-process) so rotation state survives a restart.
stored_object!(ApiKeyBudget, "api_key_budget", {
    key_fingerprint: String,
    requests_made: u64,
    tokens_used: u64,
    remaining: i64,
    reset_time: chrono::DateTime<chrono::Utc>,
    budget: f64
});

impl ApiKeyBudget {
    pub fn headroom(&self) -> f64 {
        (self.budget - self.requests_made as f64).max(0.0)
    }
}
