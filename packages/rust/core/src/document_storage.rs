//! Chunking, embedding and persistence of crawled documents.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use docharvest_markdown::{count_words, first_paragraph, smart_chunk};
use docharvest_shared::{
    CRAWL_STATUS_KEY, CancellationToken, CrawlRequest, CrawlResult, CrawlStatus, CrawlType,
    DocumentChunk, HarvestError, Metadata, PageRecord, Result, SourceId, SourceRepository,
    SourceUpsert,
};

use crate::embeddings::EmbeddingService;

/// Longest source summary kept, in characters.
const SUMMARY_MAX_CHARS: usize = 500;

/// Aggregate of one processing pass.
///
/// The URL maps hold exactly the pages whose chunks were persisted.
#[derive(Debug, Clone, Default)]
pub struct StorageResult {
    pub source_id: SourceId,
    /// Chunks produced by the splitter.
    pub chunk_count: usize,
    pub chunks_stored: usize,
    /// Chunks skipped after an embedding or storage failure.
    pub chunks_failed: usize,
    pub total_word_count: u64,
    pub url_to_full_document: HashMap<String, String>,
    pub url_to_page_id: HashMap<String, String>,
}

/// Progress of a processing pass, reported once per document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingProgress {
    pub processed: usize,
    pub total: usize,
    pub chunks_stored: usize,
    pub url: String,
}

/// A page waiting for the next flush.
struct PendingPage {
    record: PageRecord,
    chunks: Vec<DocumentChunk>,
}

/// Turns crawl results into stored, embedded chunks.
pub struct DocumentProcessingOrchestrator {
    repository: Arc<dyn SourceRepository>,
    embedder: Arc<dyn EmbeddingService>,
    batch_size: usize,
}

impl DocumentProcessingOrchestrator {
    /// `batch_size` is the number of chunks buffered before a flush.
    pub fn new(
        repository: Arc<dyn SourceRepository>,
        embedder: Arc<dyn EmbeddingService>,
        batch_size: usize,
    ) -> Self {
        Self {
            repository,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Chunk, embed and store every result.
    ///
    /// Failed chunks are logged and skipped. Fails only when cancelled, when
    /// the source record cannot be written, or when chunks were produced but
    /// none could be stored.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(source_id = %source_id, documents = results.len()))]
    pub async fn process_and_store(
        &self,
        results: &[CrawlResult],
        request: &CrawlRequest,
        crawl_type: CrawlType,
        source_id: &SourceId,
        cancel: &CancellationToken,
        url: &str,
        display_name: &str,
        on_progress: Option<&(dyn Fn(ProcessingProgress) + Send + Sync)>,
    ) -> Result<StorageResult> {
        cancel.check()?;

        let mut outcome = StorageResult {
            source_id: source_id.clone(),
            ..StorageResult::default()
        };

        self.repository
            .upsert_source(&SourceUpsert {
                source_id: source_id.clone(),
                metadata: source_metadata(request, crawl_type, url, display_name),
                ..SourceUpsert::default()
            })
            .await?;
        cancel.check()?;

        let mut pending: Vec<PendingPage> = Vec::new();
        let mut pending_chunks = 0usize;

        for (index, result) in results.iter().enumerate() {
            cancel.check()?;

            let chunks = smart_chunk(&result.content, request.chunk_size);
            if !chunks.is_empty() {
                outcome.chunk_count += chunks.len();
                if let Some(page) = self
                    .embed_page(result, chunks, request, crawl_type, source_id, &mut outcome)
                    .await?
                {
                    pending_chunks += page.chunks.len();
                    pending.push(page);
                }
            } else {
                debug!(url = %result.url, "document produced no chunks");
            }

            if pending_chunks >= self.batch_size {
                cancel.check()?;
                self.flush(std::mem::take(&mut pending), &mut outcome).await;
                pending_chunks = 0;
            }

            if let Some(cb) = on_progress {
                cb(ProcessingProgress {
                    processed: index + 1,
                    total: results.len(),
                    chunks_stored: outcome.chunks_stored,
                    url: result.url.clone(),
                });
            }
        }

        if !pending.is_empty() {
            cancel.check()?;
            self.flush(pending, &mut outcome).await;
        }

        if outcome.chunks_stored == 0 && outcome.chunk_count > 0 {
            return Err(HarvestError::Storage(format!(
                "no chunks stored: all {} chunks failed",
                outcome.chunk_count
            )));
        }

        cancel.check()?;
        self.finalize_source(results, source_id, display_name, &outcome)
            .await?;

        info!(
            chunks = outcome.chunk_count,
            stored = outcome.chunks_stored,
            failed = outcome.chunks_failed,
            pages = outcome.url_to_page_id.len(),
            words = outcome.total_word_count,
            "documents stored"
        );
        Ok(outcome)
    }

    /// Embed one document's chunks. Returns `None` when every chunk failed.
    async fn embed_page(
        &self,
        result: &CrawlResult,
        chunks: Vec<String>,
        request: &CrawlRequest,
        crawl_type: CrawlType,
        source_id: &SourceId,
        outcome: &mut StorageResult,
    ) -> Result<Option<PendingPage>> {
        let embeddings = match self.embedder.create_embeddings_batch(&chunks).await {
            Ok(embeddings) if embeddings.len() == chunks.len() => embeddings,
            Ok(embeddings) => {
                warn!(
                    url = %result.url,
                    expected = chunks.len(),
                    got = embeddings.len(),
                    "embedding count mismatch, skipping document"
                );
                outcome.chunks_failed += chunks.len();
                return Ok(None);
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!(url = %result.url, error = %e, "embedding failed for document");
                outcome.chunks_failed += chunks.len();
                return Ok(None);
            }
        };

        let total_chunks = chunks.len();
        let mut stored = Vec::new();
        for (chunk_number, (content, embedding)) in chunks.into_iter().zip(embeddings).enumerate() {
            match embedding {
                Ok(embedding) => {
                    let metadata = chunk_metadata(result, request, crawl_type, chunk_number, &content);
                    stored.push(DocumentChunk {
                        source_id: source_id.clone(),
                        page_id: String::new(),
                        url: result.url.clone(),
                        chunk_number: chunk_number as u32,
                        content,
                        metadata,
                        embedding,
                    });
                }
                Err(e) => {
                    warn!(url = %result.url, chunk_number, error = %e, "skipping chunk");
                    outcome.chunks_failed += 1;
                }
            }
        }

        if stored.is_empty() {
            return Ok(None);
        }

        let record = PageRecord {
            id: Uuid::now_v7().to_string(),
            source_id: source_id.clone(),
            url: result.url.clone(),
            title: result.title.clone(),
            full_content: result.content.clone(),
            word_count: count_words(&result.content) as u64,
            chunk_count: total_chunks as u32,
        };
        Ok(Some(PendingPage {
            record,
            chunks: stored,
        }))
    }

    /// Persist buffered pages and chunks. A failed flush drops its URLs.
    async fn flush(&self, pages: Vec<PendingPage>, outcome: &mut StorageResult) {
        let mut flushed: Vec<(PageRecord, String, usize)> = Vec::new();
        let mut rows: Vec<DocumentChunk> = Vec::new();
        let mut failed = 0usize;

        for page in pages {
            match self.repository.upsert_page(&page.record).await {
                Ok(page_id) => {
                    let count = page.chunks.len();
                    rows.extend(page.chunks.into_iter().map(|mut c| {
                        c.page_id = page_id.clone();
                        c
                    }));
                    flushed.push((page.record, page_id, count));
                }
                Err(e) => {
                    warn!(url = %page.record.url, error = %e, "failed to store page");
                    failed += page.chunks.len();
                }
            }
        }

        match self.repository.insert_documents_batch(&rows).await {
            Ok(_) => {
                for (record, page_id, count) in flushed {
                    outcome.chunks_stored += count;
                    outcome.total_word_count += record.word_count;
                    outcome.url_to_page_id.insert(record.url.clone(), page_id);
                    outcome.url_to_full_document.insert(record.url, record.full_content);
                }
            }
            Err(e) => {
                warn!(chunks = rows.len(), error = %e, "failed to store chunk batch");
                failed += rows.len();
            }
        }

        outcome.chunks_failed += failed;
        debug!(stored = outcome.chunks_stored, failed, "flushed chunk batch");
    }

    async fn finalize_source(
        &self,
        results: &[CrawlResult],
        source_id: &SourceId,
        display_name: &str,
        outcome: &StorageResult,
    ) -> Result<()> {
        let stored: Vec<&CrawlResult> = results
            .iter()
            .filter(|r| outcome.url_to_page_id.contains_key(&r.url))
            .collect();

        let title = stored
            .iter()
            .find_map(|r| r.title.clone())
            .unwrap_or_else(|| display_name.to_string());
        let summary = stored
            .iter()
            .find_map(|r| r.description.clone().filter(|d| !d.trim().is_empty()))
            .or_else(|| {
                stored
                    .iter()
                    .find_map(|r| first_paragraph(&r.content, SUMMARY_MAX_CHARS))
            });

        let mut metadata = Metadata::new();
        metadata.insert("pages_stored".into(), json!(outcome.url_to_page_id.len()));
        metadata.insert("chunks_stored".into(), json!(outcome.chunks_stored));

        self.repository
            .upsert_source(&SourceUpsert {
                source_id: source_id.clone(),
                title: Some(title),
                summary,
                total_word_count: Some(outcome.total_word_count),
                metadata,
            })
            .await
    }
}

fn source_metadata(
    request: &CrawlRequest,
    crawl_type: CrawlType,
    url: &str,
    display_name: &str,
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("knowledge_type".into(), json!(request.knowledge_type));
    metadata.insert("tags".into(), json!(request.tags));
    metadata.insert("source_url".into(), json!(url));
    metadata.insert("source_display_name".into(), json!(display_name));
    metadata.insert("crawl_type".into(), json!(crawl_type.as_str()));
    metadata.insert(
        CRAWL_STATUS_KEY.into(),
        Value::String(CrawlStatus::Pending.as_str().into()),
    );
    metadata
}

fn chunk_metadata(
    result: &CrawlResult,
    request: &CrawlRequest,
    crawl_type: CrawlType,
    chunk_number: usize,
    content: &str,
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("url".into(), json!(result.url));
    if let Some(title) = &result.title {
        metadata.insert("title".into(), json!(title));
    }
    metadata.insert("chunk_index".into(), json!(chunk_number));
    metadata.insert("char_count".into(), json!(content.chars().count()));
    metadata.insert("word_count".into(), json!(count_words(content)));
    metadata.insert("knowledge_type".into(), json!(request.knowledge_type));
    metadata.insert("crawl_type".into(), json!(crawl_type.as_str()));
    if !request.tags.is_empty() {
        metadata.insert("tags".into(), json!(request.tags));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{FlakyRepository, HashEmbedder, temp_storage};

    fn results(n: usize) -> Vec<CrawlResult> {
        (0..n)
            .map(|i| CrawlResult {
                url: format!("https://a.dev/p{i}"),
                content: format!("# Page {i}\n\nThis is page number {i} with some prose."),
                title: Some(format!("Page {i}")),
                description: None,
            })
            .collect()
    }

    fn orchestrator(
        repository: Arc<dyn SourceRepository>,
        embedder: HashEmbedder,
        batch_size: usize,
    ) -> DocumentProcessingOrchestrator {
        DocumentProcessingOrchestrator::new(repository, Arc::new(embedder), batch_size)
    }

    #[tokio::test]
    async fn stores_three_documents() {
        let repo = Arc::new(temp_storage().await);
        let docs = orchestrator(repo.clone(), HashEmbedder::default(), 2);
        let source_id = SourceId::from("src");
        let cancel = CancellationToken::new();
        let seen = Mutex::new(Vec::new());
        let progress = |p: ProcessingProgress| seen.lock().unwrap().push(p.processed);

        let result = docs
            .process_and_store(
                &results(3),
                &CrawlRequest::new("https://a.dev/"),
                CrawlType::Recursive,
                &source_id,
                &cancel,
                "https://a.dev/",
                "a.dev",
                Some(&progress),
            )
            .await
            .unwrap();

        assert_eq!(result.chunk_count, 3);
        assert_eq!(result.chunks_stored, 3);
        assert_eq!(result.url_to_page_id.len(), 3);
        assert_eq!(result.url_to_full_document.len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        let source = repo.get_source_by_id(&source_id).await.unwrap().unwrap();
        assert_eq!(source.title.as_deref(), Some("Page 0"));
        assert_eq!(source.metadata["crawl_status"], "pending");
        assert_eq!(source.metadata["crawl_type"], "recursive");
        assert_eq!(source.metadata["source_display_name"], "a.dev");
        assert!(source.total_word_count > 0);
        assert!(source.summary.unwrap().contains("page number 0"));
        assert_eq!(repo.get_documents_by_source(&source_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_chunks_are_skipped_and_counted() {
        let repo = Arc::new(temp_storage().await);
        let docs = orchestrator(repo.clone(), HashEmbedder::failing_on("number 1"), 10);
        let cancel = CancellationToken::new();

        let result = docs
            .process_and_store(
                &results(3),
                &CrawlRequest::new("https://a.dev/"),
                CrawlType::Batch,
                &SourceId::from("src"),
                &cancel,
                "https://a.dev/",
                "a.dev",
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.chunks_stored, 2);
        assert_eq!(result.chunks_failed, 1);
        assert!(!result.url_to_page_id.contains_key("https://a.dev/p1"));
    }

    #[tokio::test]
    async fn failed_flush_drops_only_its_urls() {
        let repo = Arc::new(FlakyRepository::new(temp_storage().await).fail_document_batches(1));
        let docs = orchestrator(repo.clone(), HashEmbedder::default(), 1);
        let cancel = CancellationToken::new();

        let result = docs
            .process_and_store(
                &results(3),
                &CrawlRequest::new("https://a.dev/"),
                CrawlType::Batch,
                &SourceId::from("src"),
                &cancel,
                "https://a.dev/",
                "a.dev",
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.chunks_stored, 2);
        assert!(!result.url_to_full_document.contains_key("https://a.dev/p0"));
        assert!(result.url_to_full_document.contains_key("https://a.dev/p2"));
    }

    #[tokio::test]
    async fn all_chunks_failing_is_a_storage_error() {
        let repo = Arc::new(temp_storage().await);
        let docs = orchestrator(repo, HashEmbedder::failing_on("page"), 10);
        let cancel = CancellationToken::new();

        let err = docs
            .process_and_store(
                &results(2),
                &CrawlRequest::new("https://a.dev/"),
                CrawlType::Batch,
                &SourceId::from("src"),
                &cancel,
                "https://a.dev/",
                "a.dev",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Storage(_)));
    }

    #[tokio::test]
    async fn empty_documents_are_not_an_error() {
        let repo = Arc::new(temp_storage().await);
        let docs = orchestrator(repo, HashEmbedder::default(), 10);
        let cancel = CancellationToken::new();
        let blank = vec![CrawlResult {
            url: "https://a.dev/blank".into(),
            content: "   \n".into(),
            title: None,
            description: None,
        }];

        let result = docs
            .process_and_store(
                &blank,
                &CrawlRequest::new("https://a.dev/"),
                CrawlType::SinglePage,
                &SourceId::from("src"),
                &cancel,
                "https://a.dev/",
                "a.dev",
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.chunk_count, 0);
        assert_eq!(result.chunks_stored, 0);
    }

    #[tokio::test]
    async fn cancellation_between_documents() {
        let repo = Arc::new(temp_storage().await);
        let docs = orchestrator(repo, HashEmbedder::default(), 10);
        let cancel = CancellationToken::new();
        let progress = |p: ProcessingProgress| {
            if p.processed == 1 {
                cancel.cancel("stop");
            }
        };

        let err = docs
            .process_and_store(
                &results(3),
                &CrawlRequest::new("https://a.dev/"),
                CrawlType::Batch,
                &SourceId::from("src"),
                &cancel,
                "https://a.dev/",
                "a.dev",
                Some(&progress),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
