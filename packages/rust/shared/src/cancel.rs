//! Cooperative cancellation token.
//!
//! A running crawl never gets interrupted preemptively. Instead every
//! component receives a [`CancellationToken`] and calls [`CancellationToken::check`]
//! at its checkpoints (before and after fetches, embedding calls and
//! repository writes, once per batch completion, once per document).

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{HarvestError, Result};

/// A shared flag for cooperative cancellation. Only the first reason is kept.
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: OnceLock<String>,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The first cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Checkpoint: `Err(HarvestError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(HarvestError::cancelled(
                self.reason().unwrap_or("cancellation requested"),
            ));
        }
        Ok(())
    }
}
