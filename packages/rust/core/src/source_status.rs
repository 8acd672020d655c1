//! Source crawl status transitions.
//!
//! Status changes are read-merge-verify: only the `crawl_status` key is
//! patched into the stored metadata and everything else is kept.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use docharvest_shared::{
    CRAWL_STATUS_KEY, CrawlStatus, Metadata, Result, SourceId, SourceRepository,
};

pub struct SourceStatusManager {
    repository: Arc<dyn SourceRepository>,
}

impl SourceStatusManager {
    pub fn new(repository: Arc<dyn SourceRepository>) -> Self {
        Self { repository }
    }

    /// Mark a source completed. `false` if it does not exist or the status
    /// did not stick.
    pub async fn update_to_completed(&self, source_id: &SourceId) -> Result<bool> {
        self.transition(source_id, CrawlStatus::Completed).await
    }

    /// Mark a source failed. A job can fail before it has a source, so a
    /// missing id is `Ok(false)`.
    pub async fn update_to_failed(&self, source_id: Option<&SourceId>) -> Result<bool> {
        match source_id {
            Some(source_id) => self.transition(source_id, CrawlStatus::Failed).await,
            None => Ok(false),
        }
    }

    async fn transition(&self, source_id: &SourceId, status: CrawlStatus) -> Result<bool> {
        if self.repository.get_source_by_id(source_id).await?.is_none() {
            warn!(%source_id, status = status.as_str(), "source not found, status not updated");
            return Ok(false);
        }

        let mut patch = Metadata::new();
        patch.insert(CRAWL_STATUS_KEY.into(), Value::String(status.as_str().into()));
        if !self
            .repository
            .update_source_metadata(source_id, &patch)
            .await?
        {
            return Ok(false);
        }

        let verified = self
            .repository
            .get_source_by_id(source_id)
            .await?
            .is_some_and(|source| source.crawl_status() == Some(status));
        if verified {
            info!(%source_id, status = status.as_str(), "source status updated");
        } else {
            warn!(%source_id, status = status.as_str(), "source status did not verify");
        }
        Ok(verified)
    }
}
