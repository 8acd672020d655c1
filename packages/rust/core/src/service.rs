//! In-process front door for crawl jobs.
//!
//! [`CrawlService`] wires the HTTP fetcher, repository and embedder into a
//! [`CrawlOrchestrator`] and runs one tokio task per job.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use docharvest_crawler::{FetcherOptions, HttpFetcher, PageFetcher};
use docharvest_shared::{
    AppConfig, CrawlRequest, CrawlSettings, HarvestError, JobId, Result, SourceRepository,
};

use crate::embeddings::EmbeddingService;
use crate::orchestrator::{CrawlOrchestrator, CrawlOutcome};
use crate::progress::ProgressEvent;
use crate::registry::JobRegistry;

/// A spawned job: its id, its event stream from the first event, and its task.
pub struct CrawlTask {
    pub job_id: JobId,
    pub events: broadcast::Receiver<ProgressEvent>,
    pub handle: JoinHandle<CrawlOutcome>,
}

/// Finished background jobs whose outcome is kept for [`CrawlService::wait`].
const FINISHED_OUTCOMES: usize = 128;

type TaskOutcome = std::result::Result<CrawlOutcome, String>;

pub struct CrawlService {
    orchestrator: Arc<CrawlOrchestrator>,
    registry: Arc<JobRegistry>,
    /// Background jobs still running, each with a flag set once it finished.
    tasks: Arc<DashMap<JobId, watch::Receiver<bool>>>,
    finished: Arc<Mutex<VecDeque<(JobId, TaskOutcome)>>>,
}

impl CrawlService {
    pub fn new(orchestrator: CrawlOrchestrator) -> Self {
        let registry = Arc::clone(orchestrator.registry());
        Self {
            orchestrator: Arc::new(orchestrator),
            registry,
            tasks: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Build the production stack from app config.
    pub fn from_config(
        config: &AppConfig,
        repository: Arc<dyn SourceRepository>,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Result<Self> {
        let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&FetcherOptions::from(config))?);
        let orchestrator = CrawlOrchestrator::new(
            fetcher,
            repository,
            embedder,
            Arc::new(JobRegistry::new()),
            CrawlSettings::from(config),
        );
        Ok(Self::new(orchestrator))
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Start a job on its own task. The returned receiver sees every event.
    #[instrument(skip_all, fields(url = %request.url))]
    pub fn spawn(&self, request: CrawlRequest) -> Result<CrawlTask> {
        CrawlOrchestrator::validate_request(&request)?;

        let job_id = JobId::new();
        let guard = self.registry.register(job_id, &request.url);
        let events = guard.handle().subscribe();

        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.run(request, guard).await });
        info!(%job_id, "crawl job spawned");

        Ok(CrawlTask {
            job_id,
            events,
            handle,
        })
    }

    /// Start a job in the background and return its id.
    ///
    /// The job leaves the task map on its own when it finishes; its outcome
    /// is kept for the most recent finished jobs.
    pub fn start_crawl(&self, request: CrawlRequest) -> Result<JobId> {
        let CrawlTask { job_id, handle, .. } = self.spawn(request)?;
        let (done_tx, done_rx) = watch::channel(false);
        self.tasks.insert(job_id, done_rx);

        let tasks = Arc::clone(&self.tasks);
        let finished = Arc::clone(&self.finished);
        tokio::spawn(async move {
            let outcome = handle
                .await
                .map_err(|e| format!("crawl task for job {job_id} failed: {e}"));
            {
                let mut finished = finished.lock().unwrap_or_else(|e| e.into_inner());
                finished.push_back((job_id, outcome));
                while finished.len() > FINISHED_OUTCOMES {
                    finished.pop_front();
                }
            }
            tasks.remove(&job_id);
            done_tx.send_replace(true);
        });

        Ok(job_id)
    }

    /// Subscribe to a running job's events.
    pub fn subscribe(&self, job_id: &JobId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.registry.subscribe(job_id)
    }

    /// Request cooperative cancellation. `false` if the job is not running.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.registry.cancel(job_id, "cancelled by request")
    }

    /// Latest event of a running or recently finished job.
    pub fn latest(&self, job_id: &JobId) -> Option<ProgressEvent> {
        self.registry.latest(job_id)
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        self.registry.active_jobs()
    }

    /// Wait for a job started with [`start_crawl`](Self::start_crawl).
    ///
    /// Each outcome is handed out once.
    pub async fn wait(&self, job_id: &JobId) -> Result<CrawlOutcome> {
        let running = self.tasks.get(job_id).map(|done| done.value().clone());
        if let Some(mut done) = running {
            // A closed channel means the job already left the task map.
            let _ = done.wait_for(|finished| *finished).await;
        }

        let outcome = {
            let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            finished
                .iter()
                .position(|(id, _)| id == job_id)
                .and_then(|idx| finished.remove(idx))
                .map(|(_, outcome)| outcome)
        };
        match outcome {
            Some(outcome) => outcome.map_err(HarvestError::Task),
            None => Err(HarvestError::validation(format!("unknown job {job_id}"))),
        }
    }

    /// Run a job inline and return its outcome.
    pub async fn crawl_and_store(&self, request: CrawlRequest) -> Result<CrawlOutcome> {
        self.orchestrator.crawl(request).await
    }
}
