//! Crawl orchestration for DocHarvest.
//!
//! A job runs as a state machine ([`orchestrator`]) that dispatches the start
//! URL to a crawl strategy ([`url_handler`]), chunks and embeds the results
//! ([`document_storage`]), extracts code examples ([`code_examples`]) and
//! records the source status ([`source_status`]). Progress flows through a
//! per-job [`ProgressTracker`] into the [`JobRegistry`], where callers
//! subscribe to it or cancel the job. [`CrawlService`] is the front door.

pub mod code_examples;
pub mod document_storage;
pub mod embeddings;
pub mod heartbeat;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod service;
pub mod source_status;
pub mod url_handler;

#[cfg(test)]
pub(crate) mod testing;

pub use code_examples::{
    CodeExamplesOrchestrator, CodeExtractionProgress, CodeSummarizer, HeuristicSummarizer,
};
pub use document_storage::{DocumentProcessingOrchestrator, ProcessingProgress, StorageResult};
pub use embeddings::{EmbeddingOutcome, EmbeddingService, OpenAiEmbedder};
pub use heartbeat::{Clock, HeartbeatManager, ManualClock, SystemClock};
pub use orchestrator::{CrawlJob, CrawlOrchestrator, CrawlOutcome, JobStatus};
pub use progress::{
    ProgressCounters, ProgressEvent, ProgressMapper, ProgressReporter, ProgressTracker, Stage,
    map_progress, stage_band,
};
pub use registry::{JobHandle, JobRegistry, RegistrationGuard};
pub use service::{CrawlService, CrawlTask};
pub use source_status::SourceStatusManager;
pub use url_handler::UrlTypeHandler;
