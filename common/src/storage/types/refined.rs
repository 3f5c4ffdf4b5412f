use serde::{Deserialize, Serialize};

use crate::stored_object;

/// The Extract stage's per-chunk output before resolution/scoring — one
/// unscored candidate entity per chunk. Table names carry the `refined_`
/// prefix since SurrealDB has no schema concept, keeping this group of
/// tables visually distinct from the upserted `knowledge_*` tables.
stored_object!(DtcCode, "refined_dtc_code", {
    code: String,
    description: String,
    category: String,
    severity: String,
    confidence: f64,
    source_count: u32
});

stored_object!(DtcChunkLink, "refined_dtc_chunk_link", {
    dtc_id: String,
    chunk_id: String
});

stored_object!(Cause, "refined_cause", {
    dtc_id: String,
    chunk_id: String,
    text: String,
    likelihood: f64
});

stored_object!(DiagnosticStep, "refined_diagnostic_step", {
    dtc_id: String,
    chunk_id: String,
    step_order: u32,
    text: String,
    tools: Vec<String>,
    expected_values: Option<String>
});

stored_object!(Sensor, "refined_sensor", {
    name: String,
    sensor_type: String,
    related_dtc_codes: Vec<String>,
    chunk_id: String
});

stored_object!(TsbReference, "refined_tsb_reference", {
    tsb_number: String,
    dtc_id: Option<String>,
    chunk_id: String,
    summary: String
});

stored_object!(VehicleMention, "refined_vehicle_mention", {
    chunk_id: String,
    make: String,
    model: String,
    year_start: Option<u16>,
    year_end: Option<u16>,
    related_dtc_codes: Vec<String>
});

impl DtcCode {
    pub fn normalize_code(raw: &str) -> String {
        raw.trim().to_ascii_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtc_code_normalizes_case_and_whitespace() {
        assert_eq!(DtcCode::normalize_code("  p0301 "), "P0301");
    }
}
