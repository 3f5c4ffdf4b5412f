//! First stage of the DAG. Input is a crawl-queue row id rather than a
//! document id, since the document doesn't exist until the fetch succeeds.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

use common::error::AppError;
use common::queue::{SurrealWorkQueue, WorkQueue};
use common::storage::types::control_plane::{CrawlQueueEntry, CrawlQueueStatus};
use common::storage::types::document::{Document, ProcessingStage};

use crate::context::StageContext;
use crate::stages::truncate_message;

const USER_AGENT: &str = "dtc-refinery-crawler/1.0";
const MIN_TEXT_CHARS: usize = 50;
const STRIP_TAGS: [&str; 5] = ["script", "style", "nav", "footer", "header"];

pub async fn run(ctx: &StageContext, crawl_entry_id: &str) -> Result<(), AppError> {
    let mut entry = ctx
        .db
        .get_item::<CrawlQueueEntry>(crawl_entry_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("crawl_queue_entry {crawl_entry_id}")))?;

    entry.status = CrawlQueueStatus::Crawling;
    entry = ctx
        .db
        .update_item(entry)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("crawl_queue_entry {crawl_entry_id}")))?;

    match fetch_and_store(ctx, &entry).await {
        Ok(()) => {
            entry.status = CrawlQueueStatus::Completed;
            ctx.db.update_item(entry).await?;
            Ok(())
        }
        Err(err) => {
            entry.status = CrawlQueueStatus::Failed;
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(truncate_message(&err.to_string()));
            ctx.db.update_item(entry).await?;
            Err(err)
        }
    }
}

async fn fetch_and_store(ctx: &StageContext, entry: &CrawlQueueEntry) -> Result<(), AppError> {
    let url = Url::parse(&entry.url)
        .map_err(|err| AppError::Validation(format!("invalid crawl URL: {err}")))?;
    ensure_crawl_url_allowed(&url).await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(ctx.config.http_timeout_secs))
        .user_agent(USER_AGENT)
        .build()?;

    let response = client.get(url.clone()).send().await?.error_for_status()?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.bytes().await?;

    let (text, title, mime_type) = if content_type.contains("application/pdf") {
        (
            extract_pdf_text(body.to_vec()).await?,
            derive_title_from_url(&url),
            "application/pdf".to_string(),
        )
    } else {
        let (text, title) = extract_html_text(&body)?;
        (text, title, "text/html".to_string())
    };

    if text.chars().count() < MIN_TEXT_CHARS {
        return Err(AppError::Validation(format!(
            "extracted text below minimum length ({} < {MIN_TEXT_CHARS})",
            text.chars().count()
        )));
    }

    let content_hash = sha256_hex(text.as_bytes());
    if document_with_hash_exists(ctx, &content_hash).await? {
        return Ok(());
    }

    let doc_id = uuid::Uuid::new_v4().to_string();
    let raw_key = format!("raw/{doc_id}");
    ctx.storage
        .put(&raw_key, Bytes::from(text.into_bytes()))
        .await
        .map_err(AppError::ObjectStore)?;

    let now = chrono::Utc::now();
    let document = Document {
        id: doc_id,
        created_at: now,
        updated_at: now,
        title: if title.is_empty() {
            entry.url.clone()
        } else {
            title
        },
        source_url: Some(entry.url.clone()),
        mime_type,
        content_hash,
        raw_object_key: raw_key,
        processing_stage: ProcessingStage::Pending,
        error_message: None,
        chunk_count: 0,
        retry_count: 0,
        worker_id: None,
        processing_log: Vec::new(),
    };
    let document = ctx
        .db
        .store_item(document)
        .await?
        .ok_or_else(|| AppError::InternalError("failed to persist crawled document".into()))?;

    if let Some(queue_name) = document.processing_stage.queue_name() {
        let queue = SurrealWorkQueue::new(&ctx.db);
        queue.push(queue_name, &document.id).await?;
    }

    Ok(())
}

async fn document_with_hash_exists(ctx: &StageContext, hash: &str) -> Result<bool, AppError> {
    let mut response = ctx
        .db
        .query("SELECT id FROM document WHERE content_hash = $hash LIMIT 1")
        .bind(("hash", hash.to_string()))
        .await
        .map_err(AppError::Database)?;
    let existing: Vec<serde_json::Value> = response.take(0).map_err(AppError::Database)?;
    Ok(!existing.is_empty())
}

fn extract_html_text(bytes: &[u8]) -> Result<(String, String), AppError> {
    let html = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&html);

    let title_selector =
        Selector::parse("title").map_err(|err| AppError::Processing(format!("{err:?}")))?;
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let mut text = String::new();
    for node in document.root_element().descendants() {
        let Some(fragment) = node.value().as_text() else {
            continue;
        };
        let under_stripped_ancestor = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| STRIP_TAGS.contains(&el.name()))
        });
        if !under_stripped_ancestor {
            text.push_str(fragment);
            text.push(' ');
        }
    }

    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok((normalized, title))
}

async fn extract_pdf_text(bytes: Vec<u8>) -> Result<String, AppError> {
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await?
        .map_err(|err| AppError::Processing(format!("failed to extract PDF text: {err}")))?;
    Ok(text.trim().to_string())
}

fn derive_title_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("untitled")
        .to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_link_local()
                || v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

/// Resolves the URL's host before checking it, so a domain that merely
/// resolves to a private or loopback address (rebinding, attacker-controlled
/// DNS) is blocked the same as a literal private IP in the URL.
async fn ensure_crawl_url_allowed(url: &Url) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(AppError::Validation(format!("unsupported URL scheme: {other}"))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("URL has no host".into()))?;

    if host.eq_ignore_ascii_case("localhost") {
        return Err(AppError::Validation("refusing to crawl localhost".into()));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(AppError::Validation(format!(
                "refusing to crawl private/internal address {host}"
            )));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| AppError::Validation(format!("failed to resolve host {host}: {err}")))?;

    for addr in resolved {
        if is_blocked_ip(addr.ip()) {
            return Err(AppError::Validation(format!(
                "refusing to crawl {host}: resolves to private/internal address {}",
                addr.ip()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unsupported_scheme() {
        let url = Url::parse("ftp://example.com/file").expect("parse");
        assert!(ensure_crawl_url_allowed(&url).await.is_err());
    }

    #[tokio::test]
    async fn rejects_localhost() {
        let url = Url::parse("http://localhost:8080/x").expect("parse");
        assert!(ensure_crawl_url_allowed(&url).await.is_err());
    }

    #[tokio::test]
    async fn rejects_private_ipv4() {
        let url = Url::parse("http://10.0.0.5/x").expect("parse");
        assert!(ensure_crawl_url_allowed(&url).await.is_err());
    }

    #[tokio::test]
    async fn rejects_metadata_endpoint_ipv4() {
        let url = Url::parse("http://169.254.169.254/latest/meta-data/").expect("parse");
        assert!(ensure_crawl_url_allowed(&url).await.is_err());
    }

    #[tokio::test]
    async fn allows_public_ip_literal() {
        let url = Url::parse("http://203.0.113.5/p0301").expect("parse");
        assert!(ensure_crawl_url_allowed(&url).await.is_ok());
    }

    #[test]
    fn strips_script_and_style_text() {
        let html = b"<html><head><title>P0301</title></head><body><script>evil()</script><p>Cylinder 1 misfire detected.</p></body></html>";
        let (text, title) = extract_html_text(html).expect("extract");
        assert_eq!(title, "P0301");
        assert!(text.contains("Cylinder 1 misfire detected."));
        assert!(!text.contains("evil"));
    }

    #[test]
    fn derives_title_from_pdf_url_path() {
        let url = Url::parse("https://example.com/manuals/p0301.pdf").expect("parse");
        assert_eq!(derive_title_from_url(&url), "p0301.pdf");
    }
}
