//! Core domain types for DocHarvest crawl jobs and stored sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Default crawl depth (1 = just the start page).
pub const DEFAULT_MAX_DEPTH: u32 = 1;

/// Metadata key holding the source's [`CrawlStatus`].
pub const CRAWL_STATUS_KEY: &str = "crawl_status";

/// Open key/value metadata attached to sources, chunks and code examples.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for crawl job (progress) identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// SourceId
// ---------------------------------------------------------------------------

/// Identifier of a persisted source.
///
/// Derived from the start URL so that re-crawling the same URL lands on the
/// same source record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    /// First 16 hex chars of SHA-256 over the normalized URL.
    pub fn from_url(url: &str) -> Self {
        let normalized = match url::Url::parse(url.trim()) {
            Ok(mut parsed) => {
                parsed.set_fragment(None);
                parsed.to_string().trim_end_matches('/').to_string()
            }
            Err(_) => url.trim().trim_end_matches('/').to_string(),
        };
        let digest = Sha256::digest(normalized.as_bytes());
        let hex = format!("{digest:x}");
        Self(hex[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Crawl request
// ---------------------------------------------------------------------------

/// Options recognized when starting a crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// Start URL.
    pub url: String,
    /// Maximum link depth; values above 1 select the recursive strategy.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Approximate chunk size upper bound in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Knowledge type tag stored in source metadata (e.g. "technical").
    #[serde(default = "default_knowledge_type")]
    pub knowledge_type: String,
    /// Free-form tags stored in source metadata.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Use this source id instead of deriving one from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Use this display name instead of deriving one from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_display_name: Option<String>,
    /// Run the code example extraction stage.
    #[serde(default = "default_true")]
    pub extract_code_examples: bool,
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_knowledge_type() -> String {
    "technical".into()
}
fn default_true() -> bool {
    true
}

impl CrawlRequest {
    /// A request for `url` with every option at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            knowledge_type: default_knowledge_type(),
            tags: Vec::new(),
            source_id: None,
            source_display_name: None,
            extract_code_examples: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Crawl type / status
// ---------------------------------------------------------------------------

/// How a start URL was crawled, resolved during dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlType {
    SinglePage,
    /// An `llms.txt` link index whose pages were fetched as a batch.
    Batch,
    Recursive,
    Sitemap,
    LlmsFull,
    TextFile,
}

impl CrawlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SinglePage => "single_page",
            Self::Batch => "batch",
            Self::Recursive => "recursive",
            Self::Sitemap => "sitemap",
            Self::LlmsFull => "llms_full",
            Self::TextFile => "text_file",
        }
    }

    /// Whether this crawl fetches many pages during the crawling stage.
    pub fn is_multi_page(&self) -> bool {
        matches!(self, Self::Batch | Self::Recursive | Self::Sitemap)
    }
}

impl std::fmt::Display for CrawlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status stored under [`CRAWL_STATUS_KEY`] in source metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Crawl results
// ---------------------------------------------------------------------------

/// One fetched unit of content, as produced by a crawl strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    /// Markdown (or raw text) content.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A persisted source: one crawled origin and its lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub source_id: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub total_word_count: u64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// The crawl status recorded in metadata, if present and recognized.
    pub fn crawl_status(&self) -> Option<CrawlStatus> {
        self.metadata
            .get(CRAWL_STATUS_KEY)
            .and_then(|v| v.as_str())
            .and_then(CrawlStatus::parse)
    }
}

/// Fields written by a source upsert.
///
/// `None` fields keep whatever the stored record already has; `metadata` is
/// merged into the stored map.
#[derive(Debug, Clone, Default)]
pub struct SourceUpsert {
    pub source_id: SourceId,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub total_word_count: Option<u64>,
    pub metadata: Metadata,
}

/// A full stored page, parent of its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Page identifier (UUID v7). Kept from the stored row on re-upsert.
    pub id: String,
    pub source_id: SourceId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub full_content: String,
    pub word_count: u64,
    pub chunk_count: u32,
}

/// One embedded chunk of a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub source_id: SourceId,
    pub page_id: String,
    pub url: String,
    pub chunk_number: u32,
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// One embedded code example extracted from a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExample {
    pub source_id: SourceId,
    pub url: String,
    pub chunk_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
    pub summary: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn source_id_is_stable_per_url() {
        let a = SourceId::from_url("https://docs.example.com/guide/");
        let b = SourceId::from_url("https://docs.example.com/guide");
        let c = SourceId::from_url("https://docs.example.com/guide#install");
        let other = SourceId::from_url("https://other.example.com/guide");

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, other);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn crawl_request_defaults_from_json() {
        let req: CrawlRequest =
            serde_json::from_str(r#"{"url": "https://example.com"}"#).expect("deserialize");
        assert_eq!(req.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(req.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(req.knowledge_type, "technical");
        assert!(req.extract_code_examples);
        assert!(req.source_id.is_none());
    }

    #[test]
    fn crawl_type_serializes_snake_case() {
        let json = serde_json::to_string(&CrawlType::LlmsFull).expect("serialize");
        assert_eq!(json, "\"llms_full\"");
        assert!(CrawlType::Sitemap.is_multi_page());
        assert!(!CrawlType::TextFile.is_multi_page());
    }

    #[test]
    fn source_reads_crawl_status_from_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert(CRAWL_STATUS_KEY.into(), "completed".into());
        metadata.insert("knowledge_type".into(), "technical".into());
        let source = Source {
            source_id: SourceId::from("abc"),
            title: None,
            summary: None,
            total_word_count: 0,
            metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(source.crawl_status(), Some(CrawlStatus::Completed));
    }
}
