//! In-flight job registry.
//!
//! Maps job ids to their cancellation token and progress channel. Jobs are
//! registered when they start and removed by a [`RegistrationGuard`] on every
//! exit path. The last event of recently finished jobs is kept so late
//! callers can still read the outcome.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use docharvest_shared::{CancellationToken, JobId};

use crate::progress::{ProgressEvent, ProgressReporter};

/// Buffered events per subscriber before slow receivers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Finished jobs whose last event stays readable.
const FINISHED_HISTORY: usize = 128;

/// A registered job: its token, progress channel, and latest event.
pub struct JobHandle {
    job_id: JobId,
    url: String,
    started_at: DateTime<Utc>,
    cancel: Arc<CancellationToken>,
    events: broadcast::Sender<ProgressEvent>,
    latest: Mutex<Option<ProgressEvent>>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn latest(&self) -> Option<ProgressEvent> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ProgressReporter for JobHandle {
    fn report(&self, event: &ProgressEvent) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(event.clone());
        // No subscribers is fine; `latest` still has the event.
        let _ = self.events.send(event.clone());
    }
}

/// Process-wide map of running jobs, safe for concurrent use.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobHandle>>,
    finished: Mutex<VecDeque<(JobId, ProgressEvent)>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Dropping the returned guard unregisters it.
    pub fn register(self: &Arc<Self>, job_id: JobId, url: &str) -> RegistrationGuard {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Arc::new(JobHandle {
            job_id,
            url: url.to_string(),
            started_at: Utc::now(),
            cancel: Arc::new(CancellationToken::new()),
            events,
            latest: Mutex::new(None),
        });
        self.jobs.insert(job_id, Arc::clone(&handle));
        debug!(%job_id, url, "job registered");

        RegistrationGuard {
            registry: Arc::clone(self),
            handle,
        }
    }

    pub fn lookup(&self, job_id: &JobId) -> Option<Arc<JobHandle>> {
        self.jobs.get(job_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Subscribe to a running job's events.
    pub fn subscribe(&self, job_id: &JobId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.lookup(job_id).map(|handle| handle.subscribe())
    }

    /// Latest event of a running or recently finished job.
    pub fn latest(&self, job_id: &JobId) -> Option<ProgressEvent> {
        if let Some(handle) = self.lookup(job_id) {
            return handle.latest();
        }
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|(id, _)| id == job_id)
            .map(|(_, event)| event.clone())
    }

    /// Request cooperative cancellation. Returns `false` if the job is not running.
    pub fn cancel(&self, job_id: &JobId, reason: &str) -> bool {
        match self.lookup(job_id) {
            Some(handle) => {
                handle.cancel.cancel(reason);
                info!(%job_id, reason, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    fn unregister(&self, job_id: &JobId) {
        let Some((_, handle)) = self.jobs.remove(job_id) else {
            return;
        };
        if let Some(event) = handle.latest() {
            let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            if finished.len() == FINISHED_HISTORY {
                finished.pop_front();
            }
            finished.push_back((*job_id, event));
        }
        debug!(%job_id, "job unregistered");
    }
}

/// Keeps a job registered for as long as it lives.
pub struct RegistrationGuard {
    registry: Arc<JobRegistry>,
    handle: Arc<JobHandle>,
}

impl RegistrationGuard {
    pub fn job_id(&self) -> JobId {
        self.handle.job_id
    }

    pub fn handle(&self) -> &Arc<JobHandle> {
        &self.handle
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.handle.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Stage;

    #[tokio::test]
    async fn guard_unregisters_and_keeps_last_event() {
        let registry = Arc::new(JobRegistry::new());
        let job_id = JobId::new();

        let guard = registry.register(job_id, "https://a.dev/");
        let mut rx = registry.subscribe(&job_id).unwrap();
        assert!(registry.is_active(&job_id));

        guard
            .handle()
            .report(&ProgressEvent::new(job_id, Stage::Completed, 100, "done"));
        assert_eq!(rx.recv().await.unwrap().stage, Stage::Completed);

        drop(guard);
        assert!(!registry.is_active(&job_id));
        assert!(registry.subscribe(&job_id).is_none());
        assert_eq!(registry.latest(&job_id).unwrap().progress, 100);
    }

    #[test]
    fn cancel_marks_the_token() {
        let registry = Arc::new(JobRegistry::new());
        let job_id = JobId::new();
        let guard = registry.register(job_id, "https://a.dev/");

        assert!(registry.cancel(&job_id, "user request"));
        let token = guard.handle().cancel_token();
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("user request"));

        drop(guard);
        assert!(!registry.cancel(&job_id, "too late"));
    }

    #[test]
    fn unregisters_on_panic() {
        let registry = Arc::new(JobRegistry::new());
        let job_id = JobId::new();

        let registry_in = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = registry_in.register(job_id, "https://a.dev/");
            panic!("job blew up");
        }));

        assert!(result.is_err());
        assert!(registry.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn concurrent_register_and_unregister() {
        let registry = Arc::new(JobRegistry::new());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move {
                let guard = registry.register(JobId::new(), &format!("https://a.dev/{i}"));
                tokio::task::yield_now().await;
                assert!(registry.lookup(&guard.job_id()).is_some());
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
        assert!(registry.active_jobs().is_empty());
    }
}
