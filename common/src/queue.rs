//! Durable work queues. Built around a single claim-by-lease pattern
//! generalized from a single `job` table into a named-queue abstraction
//! covering the six stage queues and the five control-plane queues.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::opt::PatchOp;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::document::{Document, ProcessingStage};
use crate::stored_object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMessageStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

stored_object!(QueueMessage, "queue_message", {
    queue_name: String,
    payload: String,
    status: QueueMessageStatus,
    attempts: u32,
    claimed_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>
});

/// A named durable FIFO with `push`/claim semantics. The SurrealDB-backed
/// implementation polls rather than blocks natively — the worker loop
/// supplies the poll interval (`poll_timeout_secs`).
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, queue_name: &str, payload: &str) -> Result<(), AppError>;

    /// Claim the oldest pending (or lease-expired) message, marking it
    /// `Claimed` by `worker_id` with a lease of `lease_duration`.
    async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        lease_duration: ChronoDuration,
    ) -> Result<Option<QueueMessage>, AppError>;

    async fn complete(&self, message_id: &str) -> Result<(), AppError>;

    async fn fail(&self, message_id: &str, error: &str, requeue: bool) -> Result<(), AppError>;
}

pub struct SurrealWorkQueue<'a> {
    db: &'a SurrealDbClient,
}

impl<'a> SurrealWorkQueue<'a> {
    pub fn new(db: &'a SurrealDbClient) -> Self {
        Self { db }
    }
}

#[async_trait]
impl<'a> WorkQueue for SurrealWorkQueue<'a> {
    async fn push(&self, queue_name: &str, payload: &str) -> Result<(), AppError> {
        let message = QueueMessage {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            queue_name: queue_name.to_string(),
            payload: payload.to_string(),
            status: QueueMessageStatus::Pending,
            attempts: 0,
            claimed_by: None,
            lease_expires_at: None,
            last_error: None,
        };
        self.db.store_item(message).await.map_err(AppError::Database)?;
        Ok(())
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        worker_id: &str,
        lease_duration: ChronoDuration,
    ) -> Result<Option<QueueMessage>, AppError> {
        let now = Utc::now();
        let lease_expires_at = now + lease_duration;

        let mut response = self
            .db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE queue_name = $queue_name
                   AND (status = 'pending'
                        OR (status = 'claimed' AND lease_expires_at < $now))
                 ORDER BY created_at ASC
                 LIMIT 1",
            )
            .bind(("table", QueueMessage::table_name()))
            .bind(("queue_name", queue_name.to_string()))
            .bind(("now", now))
            .await
            .map_err(AppError::Database)?;

        let candidates: Vec<QueueMessage> = response.take(0).map_err(AppError::Database)?;
        let Some(candidate) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Option<QueueMessage> = self
            .db
            .update((QueueMessage::table_name(), candidate.id.as_str()))
            .patch(PatchOp::replace("/status", QueueMessageStatus::Claimed))
            .patch(PatchOp::replace("/claimed_by", worker_id))
            .patch(PatchOp::replace("/lease_expires_at", lease_expires_at))
            .patch(PatchOp::replace(
                "/attempts",
                candidate.attempts.saturating_add(1),
            ))
            .await
            .map_err(AppError::Database)?;

        Ok(claimed)
    }

    async fn complete(&self, message_id: &str) -> Result<(), AppError> {
        let _updated: Option<QueueMessage> = self
            .db
            .update((QueueMessage::table_name(), message_id))
            .patch(PatchOp::replace("/status", QueueMessageStatus::Completed))
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    async fn fail(&self, message_id: &str, error: &str, requeue: bool) -> Result<(), AppError> {
        let status = if requeue {
            QueueMessageStatus::Pending
        } else {
            QueueMessageStatus::Failed
        };
        let _updated: Option<QueueMessage> = self
            .db
            .update((QueueMessage::table_name(), message_id))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace("/last_error", error))
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

/// Periodic recovery task: re-enqueues documents whose `processing_stage`
/// has not advanced in `dwell_seconds`, covering the gap left when a stage
/// commits its transition but the best-effort queue push after it fails.
pub struct StageSweeper<'a> {
    db: &'a SurrealDbClient,
    dwell: ChronoDuration,
}

impl<'a> StageSweeper<'a> {
    pub fn new(db: &'a SurrealDbClient, dwell_seconds: i64) -> Self {
        Self {
            db,
            dwell: ChronoDuration::seconds(dwell_seconds),
        }
    }

    /// Returns the ids of documents re-enqueued this sweep.
    pub async fn sweep(&self) -> Result<Vec<String>, AppError> {
        let cutoff = Utc::now() - self.dwell;
        let documents: Vec<Document> = self
            .db
            .query(
                "SELECT * FROM document
                 WHERE processing_stage NOT IN ['complete', 'error']
                   AND updated_at < $cutoff",
            )
            .bind(("cutoff", cutoff))
            .await
            .map_err(AppError::Database)?
            .take(0)
            .map_err(AppError::Database)?;

        let queue = SurrealWorkQueue::new(self.db);
        let mut requeued = Vec::new();
        for document in documents {
            if let Some(queue_name) = document.processing_stage.queue_name() {
                queue.push(queue_name, &document.id).await?;
                requeued.push(document.id);
            } else if matches!(
                document.processing_stage,
                ProcessingStage::Crawling
                    | ProcessingStage::Chunking
                    | ProcessingStage::Embedding
                    | ProcessingStage::Resolving
            ) {
                // mid-stage with no hand-off queue of its own: re-enqueue
                // onto the queue that feeds the stage currently owning it.
                let queue_name = match document.processing_stage {
                    ProcessingStage::Crawling => None,
                    ProcessingStage::Chunking => Some("jobs:chunk"),
                    ProcessingStage::Embedding => Some("jobs:embed"),
                    ProcessingStage::Resolving => Some("jobs:resolve"),
                    _ => None,
                };
                if let Some(queue_name) = queue_name {
                    queue.push(queue_name, &document.id).await?;
                    requeued.push(document.id);
                }
            }
        }

        Ok(requeued)
    }
}
