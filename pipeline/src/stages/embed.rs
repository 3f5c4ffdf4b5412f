//! Embeds every chunk of a document, in order. A single chunk failure fails
//! the whole document rather than leaving it half-embedded, per the no
//! partial-embedding-state rule.

use std::time::Instant;

use common::error::AppError;
use common::storage::types::chunk::Chunk;
use common::storage::types::document::{Document, ProcessingStage};

use crate::context::StageContext;
use crate::stages::{begin_stage, complete_stage, fail_stage};

const STAGE_LABEL: &str = "embedding";

pub async fn run(ctx: &StageContext, document_id: &str) -> Result<(), AppError> {
    let document = ctx
        .db
        .get_item::<Document>(document_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

    let document = begin_stage(
        ctx,
        document,
        STAGE_LABEL,
        Some(ProcessingStage::Embedding),
    )
    .await?;

    let started_at = Instant::now();
    match embed_chunks(ctx, &document).await {
        Ok(()) => {
            complete_stage(
                ctx,
                document,
                STAGE_LABEL,
                started_at,
                ProcessingStage::Embedded,
            )
            .await?;
            Ok(())
        }
        Err(err) => {
            fail_stage(ctx, document, STAGE_LABEL, &err).await?;
            Err(err)
        }
    }
}

async fn embed_chunks(ctx: &StageContext, document: &Document) -> Result<(), AppError> {
    let chunks = ordered_chunks(ctx, &document.id).await?;
    for mut chunk in chunks {
        let embedding = ctx.llm.embed(&chunk.text).await?;
        chunk.embedding = Some(embedding);
        ctx.db.update_item(chunk).await?;
    }
    Ok(())
}

async fn ordered_chunks(ctx: &StageContext, document_id: &str) -> Result<Vec<Chunk>, AppError> {
    let chunks: Vec<Chunk> = ctx
        .db
        .query("SELECT * FROM chunk WHERE document_id = $document_id ORDER BY chunk_index ASC")
        .bind(("document_id", document_id.to_string()))
        .await
        .map_err(AppError::Database)?
        .take(0)
        .map_err(AppError::Database)?;
    Ok(chunks)
}
