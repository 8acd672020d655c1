//! Top-level crawl state machine.
//!
//! ```text
//! STARTING → ANALYZING → CRAWLING → PROCESSING → [CODE_EXTRACTION] → FINALIZATION → COMPLETED
//! ```
//!
//! `CANCELLED` and `ERROR` are reachable from every non-terminal stage. The
//! orchestrator is the only place that emits terminal events, changes the
//! source status and unregisters the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use url::Url;

use docharvest_crawler::{CrawlProgress, Crawler, PageFetcher, ProgressCallback, StrategyConfig};
use docharvest_shared::{
    CancellationToken, CrawlRequest, CrawlSettings, CrawlType, HarvestError, JobId, Result,
    SourceId, SourceRepository,
};

use crate::code_examples::{CodeExamplesOrchestrator, CodeExtractionProgress, CodeSummarizer};
use crate::document_storage::{DocumentProcessingOrchestrator, ProcessingProgress};
use crate::embeddings::EmbeddingService;
use crate::heartbeat::{Clock, SystemClock};
use crate::progress::{ProgressCounters, ProgressReporter, ProgressTracker, Stage};
use crate::registry::{JobRegistry, RegistrationGuard};
use crate::source_status::SourceStatusManager;
use crate::url_handler::UrlTypeHandler;

// ---------------------------------------------------------------------------
// Job and outcome
// ---------------------------------------------------------------------------

/// State of one orchestration run.
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub job_id: JobId,
    pub url: String,
    pub source_id: SourceId,
    pub display_name: String,
    /// Resolved during dispatch.
    pub crawl_type: Option<CrawlType>,
    pub started_at: DateTime<Utc>,
}

impl CrawlJob {
    fn new(job_id: JobId, request: &CrawlRequest) -> Self {
        let source_id = request
            .source_id
            .as_deref()
            .map(SourceId::from)
            .unwrap_or_else(|| SourceId::from_url(&request.url));
        let display_name = request
            .source_display_name
            .clone()
            .unwrap_or_else(|| display_name_for(&request.url));
        Self {
            job_id,
            url: request.url.clone(),
            source_id,
            display_name,
            crawl_type: None,
            started_at: Utc::now(),
        }
    }
}

/// Host of the URL without a leading `www.`, or the URL itself.
fn display_name_for(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| url.to_string())
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Cancelled,
    Failed,
}

/// Result object returned when a job finishes.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlOutcome {
    pub success: bool,
    pub status: JobStatus,
    pub job_id: JobId,
    pub source_id: Option<SourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawl_type: Option<CrawlType>,
    pub chunks_stored: usize,
    pub code_examples_found: usize,
    pub total_pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct RunStats {
    total_pages: usize,
    chunks_stored: usize,
    code_examples_found: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct CrawlOrchestrator {
    handler: UrlTypeHandler,
    documents: DocumentProcessingOrchestrator,
    code_examples: CodeExamplesOrchestrator,
    status: SourceStatusManager,
    registry: Arc<JobRegistry>,
    settings: CrawlSettings,
    clock: Arc<dyn Clock>,
}

impl CrawlOrchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        repository: Arc<dyn SourceRepository>,
        embedder: Arc<dyn EmbeddingService>,
        registry: Arc<JobRegistry>,
        settings: CrawlSettings,
    ) -> Self {
        let crawler = Crawler::new(fetcher, StrategyConfig::from(&settings));
        Self {
            handler: UrlTypeHandler::new(crawler),
            documents: DocumentProcessingOrchestrator::new(
                Arc::clone(&repository),
                Arc::clone(&embedder),
                settings.storage_batch_size,
            ),
            code_examples: CodeExamplesOrchestrator::new(
                Arc::clone(&repository),
                embedder,
                &settings,
            ),
            status: SourceStatusManager::new(repository),
            registry,
            settings,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the heuristic code summarizer.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn CodeSummarizer>) -> Self {
        self.code_examples = self.code_examples.with_summarizer(summarizer);
        self
    }

    /// Replace the clock driving heartbeats.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Check a request before a job is created for it.
    pub fn validate_request(request: &CrawlRequest) -> Result<()> {
        let url = Url::parse(request.url.trim())
            .map_err(|e| HarvestError::validation(format!("invalid URL {}: {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HarvestError::validation(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        if request.chunk_size == 0 {
            return Err(HarvestError::validation("chunk_size must be positive"));
        }
        if request.max_depth == 0 {
            return Err(HarvestError::validation("max_depth must be at least 1"));
        }
        Ok(())
    }

    /// Validate, register and run a job to completion.
    pub async fn crawl(&self, request: CrawlRequest) -> Result<CrawlOutcome> {
        Self::validate_request(&request)?;
        let guard = self.registry.register(JobId::new(), &request.url);
        Ok(self.run(request, guard).await)
    }

    /// Run a registered job. The job is unregistered when this returns.
    #[instrument(skip_all, fields(job_id = %guard.job_id(), url = %request.url))]
    pub async fn run(&self, request: CrawlRequest, guard: RegistrationGuard) -> CrawlOutcome {
        let handle = Arc::clone(guard.handle());
        let cancel = handle.cancel_token();
        let reporter: Arc<dyn ProgressReporter> = handle;
        let tracker = Arc::new(ProgressTracker::new(
            guard.job_id(),
            reporter,
            self.settings.heartbeat_interval,
            Arc::clone(&self.clock),
        ));

        let mut job = CrawlJob::new(guard.job_id(), &request);
        tracker.set_source_id(job.source_id.clone());
        info!(source_id = %job.source_id, "crawl job started");

        let result = self.execute(&mut job, &request, &tracker, &cancel).await;
        let outcome = match result {
            Ok(stats) => {
                info!(
                    pages = stats.total_pages,
                    chunks = stats.chunks_stored,
                    code_examples = stats.code_examples_found,
                    "crawl job completed"
                );
                job.outcome(JobStatus::Completed, &stats, None)
            }
            Err(e) if e.is_cancellation() => {
                let reason = cancel.reason().unwrap_or("cancellation requested").to_string();
                info!(%reason, "crawl job cancelled");
                tracker.terminal(Stage::Cancelled, "Crawl cancelled", None);
                job.outcome(JobStatus::Cancelled, &self.partial_stats(&tracker), Some(reason))
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "crawl job failed");
                tracker.terminal(
                    Stage::Error,
                    format!("Crawl failed: {message}"),
                    Some(message.clone()),
                );
                match self.status.update_to_failed(Some(&job.source_id)).await {
                    Ok(true) => {}
                    Ok(false) => info!(source_id = %job.source_id, "no source to mark failed"),
                    Err(se) => warn!(error = %se, "failed to mark source failed"),
                }
                job.outcome(JobStatus::Failed, &self.partial_stats(&tracker), Some(message))
            }
        };

        drop(guard);
        outcome
    }

    fn partial_stats(&self, tracker: &ProgressTracker) -> RunStats {
        let counters = tracker.counters();
        RunStats {
            total_pages: counters.total_pages.unwrap_or(0),
            chunks_stored: counters.chunks_stored.unwrap_or(0),
            code_examples_found: counters.code_examples_found.unwrap_or(0),
        }
    }

    async fn execute(
        &self,
        job: &mut CrawlJob,
        request: &CrawlRequest,
        tracker: &Arc<ProgressTracker>,
        cancel: &Arc<CancellationToken>,
    ) -> Result<RunStats> {
        tracker.update(
            Stage::Starting,
            0.0,
            format!("Starting crawl of {}", job.url),
            ProgressCounters::default(),
        )?;
        cancel.check()?;

        tracker.update(Stage::Analyzing, 0.0, "Analyzing URL type", ProgressCounters::default())?;
        let initial_type = self.handler.classify(&job.url, request);
        tracker.set_crawl_type(initial_type);
        tracker.update(
            Stage::Analyzing,
            100.0,
            format!("Detected {initial_type} crawl"),
            ProgressCounters::default(),
        )?;

        // -- CRAWLING --
        tracker.update(Stage::Crawling, 0.0, "Crawling", ProgressCounters::default())?;
        let on_crawl: ProgressCallback = {
            let tracker = Arc::clone(tracker);
            Arc::new(move |p: CrawlProgress| {
                let message = format!("Crawled {}/{} pages", p.processed, p.total);
                if let Err(e) = tracker.update(
                    Stage::Crawling,
                    f64::from(p.percent),
                    message,
                    ProgressCounters::pages(p.processed, p.total),
                ) {
                    warn!(error = %e, "dropped crawl progress update");
                }
            })
        };
        let (results, crawl_type) = self
            .handler
            .crawl_by_type(&job.url, request, cancel, Some(on_crawl))
            .await?;
        cancel.check()?;
        tracker.heartbeat_if_needed();

        job.crawl_type = Some(crawl_type);
        tracker.set_crawl_type(crawl_type);
        if results.is_empty() {
            return Err(HarvestError::content(format!(
                "no content was crawled from {}",
                job.url
            )));
        }
        let total_pages = results.len();
        tracker.update(
            Stage::Crawling,
            100.0,
            format!("Crawled {total_pages} pages"),
            ProgressCounters::pages(total_pages, total_pages),
        )?;

        // -- PROCESSING --
        tracker.update(
            Stage::Processing,
            0.0,
            format!("Processing {total_pages} documents"),
            ProgressCounters::default(),
        )?;
        let on_process = |p: ProcessingProgress| {
            let local = 100.0 * p.processed as f64 / p.total.max(1) as f64;
            if let Err(e) = tracker.update(
                Stage::Processing,
                local,
                format!("Processed {}/{} documents", p.processed, p.total),
                ProgressCounters::chunks(p.chunks_stored),
            ) {
                warn!(error = %e, "dropped processing progress update");
            }
        };
        let storage = self
            .documents
            .process_and_store(
                &results,
                request,
                crawl_type,
                &job.source_id,
                cancel,
                &job.url,
                &job.display_name,
                Some(&on_process),
            )
            .await?;
        cancel.check()?;
        tracker.heartbeat_if_needed();

        let mut stats = RunStats {
            total_pages,
            chunks_stored: storage.chunks_stored,
            code_examples_found: 0,
        };

        // -- CODE_EXTRACTION --
        if stats.chunks_stored > 0
            && request.extract_code_examples
            && self.settings.code_extraction_enabled
        {
            tracker.update(
                Stage::CodeExtraction,
                0.0,
                "Extracting code examples",
                ProgressCounters::default(),
            )?;
            let on_code = |p: CodeExtractionProgress| {
                let local = 100.0 * p.processed as f64 / p.total.max(1) as f64;
                if let Err(e) = tracker.update(
                    Stage::CodeExtraction,
                    local,
                    format!("Scanned {}/{} pages for code", p.processed, p.total),
                    ProgressCounters::code_examples(p.found),
                ) {
                    warn!(error = %e, "dropped code extraction progress update");
                }
            };
            stats.code_examples_found = self
                .code_examples
                .extract_code_examples(
                    request,
                    &results,
                    &storage.url_to_full_document,
                    &job.source_id,
                    cancel,
                    Some(&on_code),
                    storage.url_to_full_document.len(),
                )
                .await?;
            cancel.check()?;
        }

        // -- FINALIZATION --
        let final_counters = ProgressCounters {
            total_pages: Some(stats.total_pages),
            processed_pages: Some(stats.total_pages),
            chunks_stored: Some(stats.chunks_stored),
            code_examples_found: Some(stats.code_examples_found),
        };
        tracker.update(Stage::Finalization, 0.0, "Finalizing", final_counters)?;
        cancel.check()?;

        tracker.update(
            Stage::Completed,
            100.0,
            format!(
                "Crawl completed: {} chunks, {} code examples",
                stats.chunks_stored, stats.code_examples_found
            ),
            final_counters,
        )?;

        match self.status.update_to_completed(&job.source_id).await {
            Ok(true) => {}
            Ok(false) => warn!(source_id = %job.source_id, "completed status did not verify"),
            Err(e) => warn!(error = %e, "failed to mark source completed"),
        }
        Ok(stats)
    }
}

impl CrawlJob {
    fn outcome(&self, status: JobStatus, stats: &RunStats, error: Option<String>) -> CrawlOutcome {
        CrawlOutcome {
            success: status == JobStatus::Completed,
            status,
            job_id: self.job_id,
            source_id: Some(self.source_id.clone()),
            crawl_type: self.crawl_type,
            chunks_stored: stats.chunks_stored,
            code_examples_found: stats.code_examples_found,
            total_pages: stats.total_pages,
            error,
        }
    }
}
