//! Splits a document's raw text into fixed-size overlapping windows. The
//! windowing is a plain deterministic character slide rather than a
//! semantic splitter — chunk boundaries must be exactly reproducible
//! (`char_start_{i+1} = char_start_i + size - overlap`) for contiguity to
//! hold across re-delivery.

use std::time::Instant;

use common::error::AppError;
use common::storage::types::chunk::Chunk;
use common::storage::types::document::{Document, ProcessingStage};

use crate::context::StageContext;
use crate::stages::{begin_stage, complete_stage, fail_stage};

const STAGE_LABEL: &str = "chunking";

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
        Some(ProcessingStage::Chunking),
    )
    .await?;

    let started_at = Instant::now();
    match chunk_document(ctx, &document).await {
        Ok(chunk_count) => {
            let mut document = document;
            document.chunk_count = chunk_count;
            complete_stage(
                ctx,
                document,
                STAGE_LABEL,
                started_at,
                ProcessingStage::Chunked,
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

async fn chunk_document(ctx: &StageContext, document: &Document) -> Result<u32, AppError> {
    let raw = ctx
        .storage
        .get(&document.raw_object_key)
        .await
        .map_err(AppError::ObjectStore)?;
    let text = String::from_utf8_lossy(&raw).into_owned();

    let windows = slide_windows(&text, ctx.config.chunk_size, ctx.config.chunk_overlap);
    let chunk_count = u32::try_from(windows.len()).unwrap_or(u32::MAX);

    for (index, (start, end, window_text)) in windows.into_iter().enumerate() {
        let chunk_index = u32::try_from(index).unwrap_or(u32::MAX);
        upsert_chunk(ctx, document, chunk_index, start, end, window_text).await?;
    }

    Ok(chunk_count)
}

/// Returns `(char_start, char_end, text)` for every window. Windows advance
/// by `size - overlap` characters; the final window may be shorter than
/// `size`.
fn slide_windows(text: &str, size: usize, overlap: usize) -> Vec<(usize, usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let stride = size.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        windows.push((start, end, window));
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    windows
}

async fn upsert_chunk(
    ctx: &StageContext,
    document: &Document,
    chunk_index: u32,
    start: usize,
    end: usize,
    text: String,
) -> Result<(), AppError> {
    let existing: Option<Chunk> = {
        let mut response = ctx
            .db
            .query(
                "SELECT * FROM chunk WHERE document_id = $document_id AND chunk_index = $chunk_index LIMIT 1",
            )
            .bind(("document_id", document.id.clone()))
            .bind(("chunk_index", chunk_index))
            .await
            .map_err(AppError::Database)?
            .take(0)
            .map_err(AppError::Database)?;
        response
    };

    let now = chrono::Utc::now();
    let chunk = Chunk {
        id: existing.map_or_else(|| uuid::Uuid::new_v4().to_string(), |c| c.id),
        created_at: now,
        updated_at: now,
        document_id: document.id.clone(),
        chunk_index,
        text,
        start,
        end,
        embedding: None,
    };
    ctx.db.update_item(chunk).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slide_windows_covers_full_range_contiguously() {
        let text = "x".repeat(1200);
        let windows = slide_windows(&text, 500, 50);
        assert_eq!(windows[0], (0, 500, "x".repeat(500)));
        assert_eq!(windows[1].0, 450);
        assert_eq!(windows.last().unwrap().1, 1200);
    }

    #[test]
    fn slide_windows_handles_short_text() {
        let text = "short text";
        let windows = slide_windows(text, 500, 50);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0], (0, text.chars().count(), text.to_string()));
    }

    #[test]
    fn slide_windows_empty_text_yields_no_windows() {
        assert!(slide_windows("", 500, 50).is_empty());
    }
}
