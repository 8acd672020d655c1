//! In-memory doubles shared by this crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use docharvest_crawler::{FetchedPage, PageFetcher};
use docharvest_markdown::extract_title_from_markdown;
use docharvest_shared::{
    CodeExample, DocumentChunk, HarvestError, Metadata, PageRecord, Result, Source, SourceId,
    SourceRepository, SourceUpsert,
};
use docharvest_storage::Storage;

use crate::embeddings::{EmbeddingOutcome, EmbeddingService};
use crate::progress::{ProgressEvent, ProgressReporter};

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

type FetchHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Fetcher over fixed pages and text bodies. Unknown URLs are a 404.
#[derive(Default)]
pub struct StubFetcher {
    pages: HashMap<String, (String, Vec<String>)>,
    texts: HashMap<String, String>,
    on_fetch: Option<FetchHook>,
}

impl StubFetcher {
    pub fn page(mut self, url: &str, markdown: &str, links: &[&str]) -> Self {
        let links = links.iter().map(|l| l.to_string()).collect();
        self.pages.insert(url.to_string(), (markdown.to_string(), links));
        self
    }

    pub fn text(mut self, url: &str, body: &str) -> Self {
        self.texts.insert(url.to_string(), body.to_string());
        self
    }

    /// Run `hook` before every fetch.
    pub fn on_fetch(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_fetch = Some(Arc::new(hook));
        self
    }

    fn hook(&self, url: &str) {
        if let Some(hook) = &self.on_fetch {
            hook(url);
        }
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage> {
        self.hook(url);
        let (markdown, links) = self
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| HarvestError::Network(format!("{url}: HTTP 404")))?;
        Ok(FetchedPage {
            url: url.to_string(),
            title: extract_title_from_markdown(&markdown),
            markdown,
            description: None,
            links,
            status_code: 200,
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        self.hook(url);
        self.texts
            .get(url)
            .cloned()
            .ok_or_else(|| HarvestError::Network(format!("{url}: HTTP 404")))
    }
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Deterministic 8-dimension embeddings from a SHA-256 of the text.
#[derive(Default)]
pub struct HashEmbedder {
    /// Texts containing this fail individually.
    fail_on: Option<String>,
    /// Batches containing a text with this fail as a whole.
    error_on: Option<String>,
}

impl HashEmbedder {
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Self::default()
        }
    }

    pub fn error_on(mut self, needle: &str) -> Self {
        self.error_on = Some(needle.to_string());
        self
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    async fn create_embeddings_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingOutcome>> {
        if let Some(needle) = &self.error_on {
            if texts.iter().any(|t| t.contains(needle.as_str())) {
                return Err(HarvestError::Embedding("embedding endpoint unavailable".into()));
            }
        }

        Ok(texts
            .iter()
            .map(|text| match &self.fail_on {
                Some(needle) if text.contains(needle.as_str()) => {
                    Err(format!("rejected input containing {needle:?}"))
                }
                _ => {
                    let digest = Sha256::digest(text.as_bytes());
                    Ok(digest[..8].iter().map(|b| f32::from(*b) / 255.0).collect())
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Fresh database in the temp directory.
pub async fn temp_storage() -> Storage {
    let path = std::env::temp_dir().join(format!("dh_core_test_{}.db", uuid::Uuid::now_v7()));
    Storage::open(&path).await.unwrap()
}

type RepositoryHook = Arc<dyn Fn() + Send + Sync>;

/// Repository that fails chosen calls and forwards the rest to [`Storage`].
pub struct FlakyRepository {
    inner: Storage,
    failing_document_batches: AtomicUsize,
    on_document_batch: Option<RepositoryHook>,
}

impl FlakyRepository {
    pub fn new(inner: Storage) -> Self {
        Self {
            inner,
            failing_document_batches: AtomicUsize::new(0),
            on_document_batch: None,
        }
    }

    /// Run `hook` before every document batch insert.
    pub fn on_document_batch(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_document_batch = Some(Arc::new(hook));
        self
    }

    /// Fail the next `n` document batch inserts.
    pub fn fail_document_batches(self, n: usize) -> Self {
        self.failing_document_batches.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl SourceRepository for FlakyRepository {
    async fn get_source_by_id(&self, source_id: &SourceId) -> Result<Option<Source>> {
        self.inner.get_source_by_id(source_id).await
    }

    async fn upsert_source(&self, source: &SourceUpsert) -> Result<()> {
        self.inner.upsert_source(source).await
    }

    async fn update_source_metadata(&self, source_id: &SourceId, patch: &Metadata) -> Result<bool> {
        self.inner.update_source_metadata(source_id, patch).await
    }

    async fn get_page_count_by_source(&self, source_id: &SourceId) -> Result<u64> {
        self.inner.get_page_count_by_source(source_id).await
    }

    async fn upsert_page(&self, page: &PageRecord) -> Result<String> {
        self.inner.upsert_page(page).await
    }

    async fn insert_documents_batch(&self, chunks: &[DocumentChunk]) -> Result<usize> {
        if let Some(hook) = &self.on_document_batch {
            hook();
        }
        let failing = self
            .failing_document_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HarvestError::Storage("database is locked".into()));
        }
        self.inner.insert_documents_batch(chunks).await
    }

    async fn insert_code_examples_batch(&self, examples: &[CodeExample]) -> Result<usize> {
        self.inner.insert_code_examples_batch(examples).await
    }

    async fn get_documents_by_source(&self, source_id: &SourceId) -> Result<Vec<DocumentChunk>> {
        self.inner.get_documents_by_source(source_id).await
    }

    async fn get_code_examples_by_source(&self, source_id: &SourceId) -> Result<Vec<CodeExample>> {
        self.inner.get_code_examples_by_source(source_id).await
    }
}
