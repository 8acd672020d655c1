//! The storage seam consumed by the crawl pipeline.
//!
//! One repository is shared by every running job. Implementations must make
//! their writes safe to call concurrently and keep upserts atomic per key;
//! callers do no locking of their own.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CodeExample, DocumentChunk, Metadata, PageRecord, Source, SourceId, SourceUpsert,
};

/// Durable storage for sources, pages, chunks and code examples.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Fetch a source record, `None` if it does not exist.
    async fn get_source_by_id(&self, source_id: &SourceId) -> Result<Option<Source>>;

    /// Create the source or update it in place.
    ///
    /// `metadata` is merged into the stored map; keys it does not name are kept.
    async fn upsert_source(&self, source: &SourceUpsert) -> Result<()>;

    /// Merge `patch` into the source's metadata. Returns `false` if no such
    /// source exists.
    async fn update_source_metadata(&self, source_id: &SourceId, patch: &Metadata)
    -> Result<bool>;

    /// Number of pages stored for a source.
    async fn get_page_count_by_source(&self, source_id: &SourceId) -> Result<u64>;

    /// Store a page, keyed by `(source_id, url)`.
    ///
    /// Re-upserting an existing page keeps its id and deletes its previous
    /// chunks and code examples. Returns the stored page id.
    async fn upsert_page(&self, page: &PageRecord) -> Result<String>;

    /// Insert chunks in one transaction. Returns the number inserted.
    async fn insert_documents_batch(&self, chunks: &[DocumentChunk]) -> Result<usize>;

    /// Insert code examples in one transaction. Returns the number inserted.
    async fn insert_code_examples_batch(&self, examples: &[CodeExample]) -> Result<usize>;

    /// All chunks of a source, ordered by URL then chunk number.
    async fn get_documents_by_source(&self, source_id: &SourceId) -> Result<Vec<DocumentChunk>>;

    /// All code examples of a source, ordered by URL then chunk number.
    async fn get_code_examples_by_source(&self, source_id: &SourceId)
    -> Result<Vec<CodeExample>>;
}
