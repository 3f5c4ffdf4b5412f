use serde::{Deserialize, Serialize};

use crate::stored_object;

/// Closed category enum the upserter maps free-form category text into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
    Electrical,
    Emissions,
    Unknown,
}

impl DtcCategory {
    pub fn from_free_text(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("powertrain") || lower.contains("engine") || lower.contains("transmission") {
            Self::Powertrain
        } else if lower.contains("chassis") || lower.contains("brake") || lower.contains("suspension") {
            Self::Chassis
        } else if lower.contains("body") {
            Self::Body
        } else if lower.contains("network") || lower.contains("can") || lower.contains("bus") {
            Self::Network
        } else if lower.contains("electrical") || lower.contains("wiring") {
            Self::Electrical
        } else if lower.contains("emission") {
            Self::Emissions
        } else {
            Self::Unknown
        }
    }
}

/// Maps free-form severity text to the knowledge graph's 1-5 scale, highest
/// severity first.
pub fn severity_from_free_text(raw: &str) -> u8 {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("critical") || lower.contains("severe") {
        5
    } else if lower.contains("high") {
        4
    } else if lower.contains("moderate") || lower.contains("medium") {
        3
    } else if lower.contains("low") || lower.contains("minor") {
        2
    } else if lower.contains("info") || lower.contains("cosmetic") {
        1
    } else {
        3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Disputed,
    Corrected,
    Uncertain,
}

stored_object!(DtcMaster, "knowledge_dtc_master", {
    code: String,
    category: DtcCategory,
    severity_level: u8,
    emissions_related: bool,
    description: Option<String>,
    confidence: f64,
    source_count: u32,
    verification_status: VerificationStatus,
    verified_at: Option<chrono::DateTime<chrono::Utc>>
});

impl DtcMaster {
    pub fn recompute_confidence(&mut self, avg_trust: f64) {
        let source_term = 0.3 * (self.source_count as f64 / 5.0).min(1.0);
        let trust_term = 0.7 * avg_trust.clamp(0.0, 1.0);
        self.confidence = (source_term + trust_term).min(1.0);
    }
}

/// Common aggregate shape for every per-DTC child row — causes, symptoms,
/// diagnostic steps, sensors, parts, fixes, forum threads, live-data
/// parameters, OEM variants, AI explanations. Each lives in its own table
/// since they're distinct child relations, not variants of one row.
macro_rules! knowledge_child_table {
    ($name:ident, $table:expr) => {
        stored_object!($name, $table, {
            dtc_id: String,
            text: String,
            evidence_count: u32,
            avg_trust: f64,
            avg_relevance: f64,
            vehicle_make: Option<String>,
            vehicle_model: Option<String>,
            year_start: Option<u16>,
            year_end: Option<u16>,
            priority_rank: Option<u32>,
            source_chunk_ids: Vec<String>
        });
    };
}

pub mod causes {
    use super::*;
    knowledge_child_table!(KnowledgeCause, "knowledge_cause");
}
pub mod symptoms {
    use super::*;
    knowledge_child_table!(KnowledgeSymptom, "knowledge_symptom");
}
pub mod diagnostic_steps {
    use super::*;
    knowledge_child_table!(KnowledgeDiagnosticStep, "knowledge_diagnostic_step");
}
pub mod sensors {
    use super::*;
    knowledge_child_table!(KnowledgeSensor, "knowledge_sensor");
}
pub mod parts {
    use super::*;
    knowledge_child_table!(KnowledgePart, "knowledge_part");
}
pub mod fixes {
    use super::*;
    knowledge_child_table!(KnowledgeFix, "knowledge_fix");
}
pub mod forum_threads {
    use super::*;
    knowledge_child_table!(KnowledgeForumThread, "knowledge_forum_thread");
}
pub mod live_data {
    use super::*;
    knowledge_child_table!(KnowledgeLiveDataParameter, "knowledge_live_data_parameter");
}
pub mod oem_variants {
    use super::*;
    knowledge_child_table!(KnowledgeOemVariant, "knowledge_oem_variant");
}
pub mod ai_explanations {
    use super::*;
    knowledge_child_table!(KnowledgeAiExplanation, "knowledge_ai_explanation");
}

/// Per-field verification outcome written by the Verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Confirmed,
    Corrected,
    Disputed,
    Uncertain,
}

stored_object!(VerificationResult, "knowledge_verification_result", {
    dtc_id: String,
    field: String,
    outcome: VerificationOutcome,
    detail: Option<String>,
    confidence_delta: f64
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_classification_prefers_first_match() {
        assert_eq!(DtcCategory::from_free_text("Powertrain control module"), DtcCategory::Powertrain);
        assert_eq!(DtcCategory::from_free_text("weird text"), DtcCategory::Unknown);
    }

    #[test]
    fn severity_mapping_is_1_to_5() {
        assert_eq!(severity_from_free_text("critical failure"), 5);
        assert_eq!(severity_from_free_text("minor issue"), 2);
        assert_eq!(severity_from_free_text("nonsense"), 3);
    }

    #[test]
    fn recompute_confidence_weights_source_count_and_trust() {
        let mut dtc = DtcMaster {
            id: "P0301".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            code: "P0301".into(),
            category: DtcCategory::Powertrain,
            severity_level: 3,
            emissions_related: false,
            description: None,
            confidence: 0.0,
            source_count: 1,
            verification_status: VerificationStatus::Unverified,
            verified_at: None,
        };
        dtc.recompute_confidence(0.8);
        assert!((dtc.confidence - 0.62).abs() < 1e-9);
    }
}
