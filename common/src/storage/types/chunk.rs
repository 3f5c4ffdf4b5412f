use serde::{Deserialize, Serialize};

use crate::stored_object;

stored_object!(Chunk, "chunk", {
    document_id: String,
    chunk_index: u32,
    text: String,
    start: usize,
    end: usize,
    embedding: Option<Vec<f32>>
});

impl Chunk {
    pub fn is_valid_range(&self) -> bool {
        self.end > self.start
    }
}

/// Closed domain-tag set validated by the Evaluate stage; anything outside
/// this set is replaced with `Unknown` rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainTag {
    Engine,
    Transmission,
    Electrical,
    Brakes,
    Suspension,
    Emissions,
    Body,
    Network,
    Unknown,
}

impl DomainTag {
    pub fn parse_or_unknown(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "engine" => Self::Engine,
            "transmission" => Self::Transmission,
            "electrical" => Self::Electrical,
            "brakes" => Self::Brakes,
            "suspension" => Self::Suspension,
            "emissions" => Self::Emissions,
            "body" => Self::Body,
            "network" => Self::Network,
            _ => Self::Unknown,
        }
    }
}

stored_object!(ChunkEvaluation, "chunk_evaluation", {
    chunk_id: String,
    trust: f64,
    relevance: f64,
    domain: DomainTag,
    reasoning: String,
    model: String
});

impl ChunkEvaluation {
    pub const MAX_REASONING_CHARS: usize = 1000;

    pub fn clamp_scores(mut self) -> Self {
        self.trust = self.trust.clamp(0.0, 1.0);
        self.relevance = self.relevance.clamp(0.0, 1.0);
        self
    }

    pub fn truncate_reasoning(mut self) -> Self {
        if self.reasoning.chars().count() > Self::MAX_REASONING_CHARS {
            self.reasoning = self.reasoning.chars().take(Self::MAX_REASONING_CHARS).collect();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_tag_falls_back_to_unknown() {
        assert_eq!(DomainTag::parse_or_unknown("Engine"), DomainTag::Engine);
        assert_eq!(DomainTag::parse_or_unknown("not-a-domain"), DomainTag::Unknown);
    }

    #[test]
    fn chunk_range_invariant() {
        let chunk = Chunk {
            id: "c1".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            document_id: "doc-1".into(),
            chunk_index: 0,
            text: "hello".into(),
            start: 0,
            end: 5,
            embedding: None,
        };
        assert!(chunk.is_valid_range());
    }
}
