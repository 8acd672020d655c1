//! Job progress: stage bands, the monotonic mapper, and the per-job tracker.
//!
//! Every stage owns a band of the 0–100 global range. Stage-local progress
//! is mapped into that band; multi-page crawls reserve a wider band for the
//! crawling stage. Reporters receive structured [`ProgressEvent`]s.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use docharvest_shared::{CrawlType, HarvestError, JobId, Result, SourceId};

use crate::heartbeat::{Clock, HeartbeatManager};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A state of the crawl job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Analyzing,
    Crawling,
    Processing,
    CodeExtraction,
    Finalization,
    Completed,
    Cancelled,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Analyzing => "analyzing",
            Self::Crawling => "crawling",
            Self::Processing => "processing",
            Self::CodeExtraction => "code_extraction",
            Self::Finalization => "finalization",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Whether no further events follow this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(Self::Starting),
            "analyzing" => Ok(Self::Analyzing),
            "crawling" => Ok(Self::Crawling),
            "processing" => Ok(Self::Processing),
            "code_extraction" => Ok(Self::CodeExtraction),
            "finalization" => Ok(Self::Finalization),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            other => Err(HarvestError::UnknownStage(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Bands
// ---------------------------------------------------------------------------

/// Bands for single page, text file and llms-full crawls.
const DEFAULT_BANDS: [(Stage, u8, u8); 7] = [
    (Stage::Starting, 0, 2),
    (Stage::Analyzing, 2, 5),
    (Stage::Crawling, 5, 20),
    (Stage::Processing, 20, 65),
    (Stage::CodeExtraction, 65, 95),
    (Stage::Finalization, 95, 100),
    (Stage::Completed, 100, 100),
];

/// Bands for batch, recursive and sitemap crawls.
const MULTI_PAGE_BANDS: [(Stage, u8, u8); 7] = [
    (Stage::Starting, 0, 2),
    (Stage::Analyzing, 2, 5),
    (Stage::Crawling, 5, 45),
    (Stage::Processing, 45, 80),
    (Stage::CodeExtraction, 80, 95),
    (Stage::Finalization, 95, 100),
    (Stage::Completed, 100, 100),
];

/// The `(start, end)` band of `stage` for a crawl type.
///
/// Before the crawl type is known the default table applies. Terminal
/// `cancelled` and `error` have no band.
pub fn stage_band(crawl_type: Option<CrawlType>, stage: Stage) -> Result<(u8, u8)> {
    let table = match crawl_type {
        Some(ct) if ct.is_multi_page() => &MULTI_PAGE_BANDS,
        _ => &DEFAULT_BANDS,
    };
    table
        .iter()
        .find(|(s, _, _)| *s == stage)
        .map(|(_, start, end)| (*start, *end))
        .ok_or_else(|| HarvestError::UnknownStage(stage.to_string()))
}

/// Map stage-local progress (clamped to 0..=100) into the global range.
pub fn map_progress(crawl_type: Option<CrawlType>, stage: Stage, local: f64) -> Result<u8> {
    let (start, end) = stage_band(crawl_type, stage)?;
    let local = if local.is_nan() { 0.0 } else { local.clamp(0.0, 100.0) };
    let span = f64::from(end - start);
    Ok((f64::from(start) + span * local / 100.0).floor() as u8)
}

// ---------------------------------------------------------------------------
// ProgressMapper
// ---------------------------------------------------------------------------

/// Stateful mapper that never reports a lower value than it already has.
#[derive(Debug, Clone)]
pub struct ProgressMapper {
    crawl_type: Option<CrawlType>,
    current_stage: Stage,
    current_progress: u8,
}

impl Default for ProgressMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressMapper {
    pub fn new() -> Self {
        Self {
            crawl_type: None,
            current_stage: Stage::Starting,
            current_progress: 0,
        }
    }

    /// Switch the band table. Already reported progress is kept.
    pub fn set_crawl_type(&mut self, crawl_type: CrawlType) {
        self.crawl_type = Some(crawl_type);
    }

    pub fn crawl_type(&self) -> Option<CrawlType> {
        self.crawl_type
    }

    /// Map and record progress for `stage`.
    pub fn map(&mut self, stage: Stage, local: f64) -> Result<u8> {
        let mapped = map_progress(self.crawl_type, stage, local)?;
        self.current_stage = stage;
        self.current_progress = self.current_progress.max(mapped);
        Ok(self.current_progress)
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn current_progress(&self) -> u8 {
        self.current_progress
    }

    /// Percent for a terminal `cancelled`/`error` event: the band start of the
    /// stage that was interrupted.
    pub fn interrupted_progress(&self) -> u8 {
        stage_band(self.crawl_type, self.current_stage)
            .map(|(start, _)| start)
            .unwrap_or(self.current_progress)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Named counters carried by progress events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_stored: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_examples_found: Option<usize>,
}

impl ProgressCounters {
    pub fn pages(processed: usize, total: usize) -> Self {
        Self {
            processed_pages: Some(processed),
            total_pages: Some(total),
            ..Self::default()
        }
    }

    pub fn chunks(chunks_stored: usize) -> Self {
        Self {
            chunks_stored: Some(chunks_stored),
            ..Self::default()
        }
    }

    pub fn code_examples(found: usize) -> Self {
        Self {
            code_examples_found: Some(found),
            ..Self::default()
        }
    }

    /// Overlay the counters `other` sets.
    pub fn merge(&mut self, other: ProgressCounters) {
        self.total_pages = other.total_pages.or(self.total_pages);
        self.processed_pages = other.processed_pages.or(self.processed_pages);
        self.chunks_stored = other.chunks_stored.or(self.chunks_stored);
        self.code_examples_found = other.code_examples_found.or(self.code_examples_found);
    }
}

/// One progress update for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Stage,
    /// Global percent, 0..=100.
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    /// Synthetic liveness event rather than real progress.
    pub heartbeat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawl_type: Option<CrawlType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub counters: ProgressCounters,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            stage,
            progress,
            message: message.into(),
            log: None,
            heartbeat: false,
            crawl_type: None,
            source_id: None,
            error: None,
            counters: ProgressCounters::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reporters
// ---------------------------------------------------------------------------

/// Receives the progress events of a job.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

struct TrackerState {
    mapper: ProgressMapper,
    heartbeat: HeartbeatManager,
    counters: ProgressCounters,
    source_id: Option<SourceId>,
    finished: bool,
}

impl TrackerState {
    /// Event carrying the job context accumulated so far.
    fn event(
        &self,
        job_id: JobId,
        stage: Stage,
        progress: u8,
        message: impl Into<String>,
    ) -> ProgressEvent {
        let mut event = ProgressEvent::new(job_id, stage, progress, message);
        event.crawl_type = self.mapper.crawl_type();
        event.source_id = self.source_id.clone();
        event.counters = self.counters;
        event
    }
}

/// Per-job progress glue: maps, accumulates counters, emits, and keeps the
/// heartbeat in step with genuine events.
///
/// Shared by reference with strategy callbacks, so state sits behind a
/// mutex. Events are emitted while the lock is held, which keeps them in
/// order; reporters must not call back into the tracker.
pub struct ProgressTracker {
    job_id: JobId,
    reporter: Arc<dyn ProgressReporter>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(
        job_id: JobId,
        reporter: Arc<dyn ProgressReporter>,
        heartbeat_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let heartbeat =
            HeartbeatManager::new(job_id, heartbeat_interval, Some(Arc::clone(&reporter)), clock);
        Self {
            job_id,
            reporter,
            state: Mutex::new(TrackerState {
                mapper: ProgressMapper::new(),
                heartbeat,
                counters: ProgressCounters::default(),
                source_id: None,
                finished: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn set_crawl_type(&self, crawl_type: CrawlType) {
        self.lock().mapper.set_crawl_type(crawl_type);
    }

    pub fn set_source_id(&self, source_id: SourceId) {
        self.lock().source_id = Some(source_id);
    }

    pub fn current_stage(&self) -> Stage {
        self.lock().mapper.current_stage()
    }

    pub fn current_progress(&self) -> u8 {
        self.lock().mapper.current_progress()
    }

    /// Counters accumulated so far.
    pub fn counters(&self) -> ProgressCounters {
        self.lock().counters
    }

    /// Emit a genuine progress event for `stage` at stage-local `local`.
    ///
    /// Returns the global percent reported.
    pub fn update(
        &self,
        stage: Stage,
        local: f64,
        message: impl Into<String>,
        counters: ProgressCounters,
    ) -> Result<u8> {
        let mut state = self.lock();
        if state.finished {
            return Ok(state.mapper.current_progress());
        }

        let progress = state.mapper.map(stage, local)?;
        state.counters.merge(counters);

        let event = state.event(self.job_id, stage, progress, message);
        if stage.is_terminal() {
            state.finished = true;
        }

        self.reporter.report(&event);
        state.heartbeat.reset();
        Ok(progress)
    }

    /// Emit a heartbeat when the interval has elapsed since the last event.
    pub fn heartbeat_if_needed(&self) -> bool {
        let mut state = self.lock();
        if state.finished {
            return false;
        }
        let stage = state.mapper.current_stage();
        let progress = state.mapper.current_progress();
        let base = state.event(self.job_id, stage, progress, "");
        state.heartbeat.send_with(|| base)
    }

    /// Emit the single terminal `cancelled` or `error` event.
    ///
    /// Its percent is the band start of the interrupted stage, which may be
    /// lower than the last reported value. Returns `None` if the job already
    /// reached a terminal stage.
    pub fn terminal(
        &self,
        stage: Stage,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Option<ProgressEvent> {
        let mut state = self.lock();
        if state.finished {
            return None;
        }
        state.finished = true;

        let interrupted = state.mapper.interrupted_progress();
        let mut event = state.event(self.job_id, stage, interrupted, message);
        event.error = error;

        debug!(job_id = %self.job_id, stage = %stage, "terminal progress event");
        self.reporter.report(&event);
        Some(event)
    }
}
