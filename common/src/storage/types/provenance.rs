use serde::{Deserialize, Serialize};

use crate::stored_object;

stored_object!(ProvenanceSource, "provenance_source", {
    entity_table: String,
    entity_id: String,
    chunk_id: String,
    trust: f64,
    relevance: f64
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Created,
    Updated,
    Rejected,
    Merged,
}

stored_object!(ResolutionLogEntry, "resolution_log_entry", {
    run_id: String,
    action: ResolutionAction,
    entity_table: String,
    entity_id: String,
    details: serde_json::Value
});
