use serde::{Deserialize, Serialize};

use crate::stored_object;

/// Where a document sits in the six-stage DAG. Monotonically non-decreasing
/// along the happy path except for `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Pending,
    Crawling,
    Chunking,
    Chunked,
    Embedding,
    Embedded,
    Evaluating,
    Extracting,
    Resolving,
    Complete,
    Error,
}

impl ProcessingStage {
    pub fn queue_name(self) -> Option<&'static str> {
        match self {
            Self::Pending => Some("jobs:chunk"),
            Self::Chunked => Some("jobs:embed"),
            Self::Embedded => Some("jobs:evaluate"),
            Self::Evaluating => Some("jobs:extract"),
            Self::Extracting => Some("jobs:resolve"),
            Self::Crawling
            | Self::Chunking
            | Self::Embedding
            | Self::Resolving
            | Self::Complete
            | Self::Error => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
}

/// One row per (stage, attempt) appended to a document's processing log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingLogEntry {
    pub stage: String,
    pub status: LogStatus,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

stored_object!(Document, "document", {
    title: String,
    source_url: Option<String>,
    mime_type: String,
    content_hash: String,
    raw_object_key: String,
    processing_stage: ProcessingStage,
    error_message: Option<String>,
    chunk_count: u32,
    retry_count: u32,
    worker_id: Option<String>,
    processing_log: Vec<ProcessingLogEntry>
});

impl Document {
    pub const MAX_ATTEMPTS: u32 = 3;

    pub fn append_log(&mut self, stage: &str, status: LogStatus, message: Option<String>, duration_ms: Option<u64>) {
        self.processing_log.push(ProcessingLogEntry {
            stage: stage.to_string(),
            status,
            message,
            duration_ms,
            recorded_at: chrono::Utc::now(),
        });
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.processing_stage, ProcessingStage::Complete | ProcessingStage::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_only_defined_for_handoff_stages() {
        assert_eq!(ProcessingStage::Pending.queue_name(), Some("jobs:chunk"));
        assert_eq!(ProcessingStage::Chunked.queue_name(), Some("jobs:embed"));
        assert_eq!(ProcessingStage::Complete.queue_name(), None);
        assert_eq!(ProcessingStage::Crawling.queue_name(), None);
    }

    #[test]
    fn terminal_stages() {
        let mut doc = Document {
            id: "doc-1".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            title: "t".into(),
            source_url: None,
            mime_type: "text/html".into(),
            content_hash: "abc".into(),
            raw_object_key: "raw/doc-1".into(),
            processing_stage: ProcessingStage::Pending,
            error_message: None,
            chunk_count: 0,
            retry_count: 0,
            worker_id: None,
            processing_log: Vec::new(),
        };
        assert!(!doc.is_terminal());
        doc.processing_stage = ProcessingStage::Complete;
        assert!(doc.is_terminal());
    }
}
