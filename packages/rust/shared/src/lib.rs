//! Shared types, error model, and configuration for DocHarvest.
//!
//! This crate is the foundation depended on by all other DocHarvest crates.
//! It provides:
//! - [`HarvestError`], the unified error type
//! - Domain types ([`CrawlRequest`], [`CrawlResult`], [`Source`], [`JobId`], [`SourceId`])
//! - Configuration ([`AppConfig`], [`CrawlSettings`], config loading)
//! - The [`CancellationToken`] threaded through every crawl component
//! - The [`SourceRepository`] storage seam

pub mod cancel;
pub mod config;
pub mod error;
pub mod repository;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use cancel::CancellationToken;
pub use config::{
    AppConfig, CodeExtractionConfig, CrawlPoliciesConfig, CrawlSettings, DefaultsConfig,
    EmbeddingsConfig, StorageConfig, config_dir, config_file_path, embeddings_api_key,
    init_config, load_config, load_config_from,
};
pub use error::{HarvestError, Result};
pub use repository::SourceRepository;
pub use types::{
    CRAWL_STATUS_KEY, CodeExample, CrawlRequest, CrawlResult, CrawlStatus, CrawlType,
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_DEPTH, DocumentChunk, JobId, Metadata, PageRecord, Source,
    SourceId, SourceUpsert,
};
