#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod context;
pub mod state;
pub mod stages;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use common::queue::{SurrealWorkQueue, WorkQueue};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use context::StageContext;

/// The six queues a document's id (or, for `jobs:crawl`, a crawl-queue
/// entry id) hops across on its way from `Pending` to `Complete`, paired
/// with the stage function that consumes messages from it.
const STAGE_QUEUES: &[&str] = &[
    "jobs:crawl",
    "jobs:chunk",
    "jobs:embed",
    "jobs:evaluate",
    "jobs:extract",
    "jobs:resolve",
];

/// Claims from every stage queue in round-robin order and dispatches each
/// claimed payload to its matching stage function, generalizing the
/// teacher's single-queue claim/process/backoff loop across the six
/// independently-claimed queues of the document DAG.
pub async fn run_stage_worker(ctx: Arc<StageContext>) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = format!("pipeline-worker-{}", Uuid::new_v4());
    let lease_duration = ChronoDuration::seconds(ctx.config.lease_duration_secs as i64);
    let poll_backoff = StdDuration::from_secs(ctx.config.poll_timeout_secs);

    loop {
        let mut claimed_any = false;

        for queue_name in STAGE_QUEUES {
            let queue = SurrealWorkQueue::new(&ctx.db);
            match queue.claim_next(queue_name, &worker_id, lease_duration).await {
                Ok(Some(message)) => {
                    claimed_any = true;
                    info!(%worker_id, queue = %queue_name, message_id = %message.id, "claimed stage job");

                    let result = dispatch(&ctx, queue_name, &message.payload).await;
                    match result {
                        Ok(()) => {
                            if let Err(err) = queue.complete(&message.id).await {
                                error!(%worker_id, queue = %queue_name, error = %err, "failed to mark stage job complete");
                            }
                        }
                        Err(err) => {
                            error!(%worker_id, queue = %queue_name, error = %err, "stage job failed");
                            let requeue = message.attempts < ctx.config.max_attempts;
                            if let Err(fail_err) = queue
                                .fail(&message.id, &err.to_string(), requeue)
                                .await
                            {
                                error!(%worker_id, queue = %queue_name, error = %fail_err, "failed to record stage job failure");
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(%worker_id, queue = %queue_name, error = %err, "failed to claim stage job");
                }
            }
        }

        if !claimed_any {
            sleep(poll_backoff).await;
        }
    }
}

async fn dispatch(
    ctx: &StageContext,
    queue_name: &str,
    payload: &str,
) -> Result<(), common::error::AppError> {
    match queue_name {
        "jobs:crawl" => stages::crawl::run(ctx, payload).await,
        "jobs:chunk" => stages::chunk::run(ctx, payload).await,
        "jobs:embed" => stages::embed::run(ctx, payload).await,
        "jobs:evaluate" => stages::evaluate::run(ctx, payload).await,
        "jobs:extract" => stages::extract::run(ctx, payload).await,
        "jobs:resolve" => stages::resolve::run(ctx, payload).await,
        other => {
            warn!(queue = %other, "no stage registered for queue");
            Ok(())
        }
    }
}
