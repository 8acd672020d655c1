//! Crawl strategies.
//!
//! A [`Strategy`] says what to fetch; [`Crawler::execute`] runs it against a
//! [`PageFetcher`]. Strategies that fan out (batch, recursive) bound their
//! concurrency with a semaphore and poll the job's [`CancellationToken`] at
//! every completion.

mod batch;
mod recursive;
mod single_page;
mod sitemap;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use docharvest_shared::{CancellationToken, CrawlResult, CrawlSettings, Result};

use crate::fetcher::PageFetcher;

pub use batch::crawl_batch;
pub use recursive::{crawl_recursive, is_asset_url};
pub use single_page::{crawl_markdown_file, fetch_with_retry};
pub use sitemap::fetch_sitemap_urls;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// The four ways a crawl fetches content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// One URL. `raw_text` fetches it as a text/markdown file instead of HTML.
    SinglePage { url: String, raw_text: bool },
    /// A fixed list of pages fetched with bounded concurrency.
    Batch { urls: Vec<String> },
    /// Link-following crawl from `start_urls`, `max_depth` levels deep.
    Recursive {
        start_urls: Vec<String>,
        max_depth: u32,
    },
    /// A sitemap whose `<loc>` entries are listed, not fetched.
    Sitemap { url: String },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SinglePage { raw_text: false, .. } => "single_page",
            Self::SinglePage { raw_text: true, .. } => "markdown_file",
            Self::Batch { .. } => "batch",
            Self::Recursive { .. } => "recursive",
            Self::Sitemap { .. } => "sitemap",
        }
    }
}

/// What a strategy produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutput {
    /// Fetched content.
    Pages(Vec<CrawlResult>),
    /// Discovered URLs, still to be fetched.
    Urls(Vec<String>),
}

// ---------------------------------------------------------------------------
// Config and progress
// ---------------------------------------------------------------------------

/// Tuning shared by all strategies.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Concurrent fetches in batch and recursive passes.
    pub max_concurrent: usize,
    /// Attempts per page.
    pub retry_count: u32,
    /// Backoff before the second attempt, doubled after each further failure.
    pub retry_backoff: Duration,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::from(&CrawlSettings::default())
    }
}

impl From<&CrawlSettings> for StrategyConfig {
    fn from(settings: &CrawlSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent.max(1),
            retry_count: settings.retry_count.max(1),
            retry_backoff: settings.retry_backoff,
        }
    }
}

/// Progress of a fan-out pass, reported once per completed URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlProgress {
    /// URLs finished so far (fetched or failed), cumulative across levels.
    pub processed: usize,
    /// URLs known so far.
    pub total: usize,
    /// Stage-local progress, 0..=100.
    pub percent: u8,
    /// The URL that just finished.
    pub url: String,
    /// BFS level for recursive crawls.
    pub depth: Option<u32>,
}

/// Callback invoked with [`CrawlProgress`] updates.
pub type ProgressCallback = Arc<dyn Fn(CrawlProgress) + Send + Sync>;

/// Stage-local percent of `done` out of `total`.
pub(crate) fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Runs strategies against a shared fetcher.
#[derive(Clone)]
pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    config: StrategyConfig,
}

impl Crawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: StrategyConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn fetcher(&self) -> &Arc<dyn PageFetcher> {
        &self.fetcher
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Run one strategy to completion.
    #[instrument(skip_all, fields(strategy = strategy.name()))]
    pub async fn execute(
        &self,
        strategy: Strategy,
        cancel: &Arc<CancellationToken>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<StrategyOutput> {
        cancel.check()?;

        let output = match strategy {
            Strategy::SinglePage {
                url,
                raw_text: false,
            } => {
                let page = fetch_with_retry(self.fetcher.as_ref(), &url, &self.config, cancel)
                    .await?;
                StrategyOutput::Pages(vec![page.into_crawl_result()])
            }
            Strategy::SinglePage {
                url,
                raw_text: true,
            } => StrategyOutput::Pages(
                crawl_markdown_file(self.fetcher.as_ref(), &url, &self.config, cancel).await?,
            ),
            Strategy::Batch { urls } => {
                let pages =
                    crawl_batch(&self.fetcher, &urls, &self.config, cancel, on_progress).await?;
                StrategyOutput::Pages(pages.into_iter().map(|p| p.into_crawl_result()).collect())
            }
            Strategy::Recursive {
                start_urls,
                max_depth,
            } => {
                let pages = crawl_recursive(
                    &self.fetcher,
                    &start_urls,
                    max_depth,
                    &self.config,
                    cancel,
                    on_progress,
                )
                .await?;
                StrategyOutput::Pages(pages.into_iter().map(|p| p.into_crawl_result()).collect())
            }
            Strategy::Sitemap { url } => {
                StrategyOutput::Urls(fetch_sitemap_urls(self.fetcher.as_ref(), &url, cancel).await?)
            }
        };

        cancel.check()?;

        let count = match &output {
            StrategyOutput::Pages(pages) => pages.len(),
            StrategyOutput::Urls(urls) => urls.len(),
        };
        info!(count, "strategy finished");

        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use docharvest_shared::{HarvestError, Result};

    use crate::fetcher::{FetchedPage, PageFetcher};

    /// In-memory fetcher: `url -> (markdown, links)`; unknown URLs fail.
    #[derive(Default)]
    pub struct MapFetcher {
        pub pages: HashMap<String, (String, Vec<String>)>,
        pub texts: HashMap<String, String>,
        /// Remaining failures per URL before it succeeds.
        pub flaky: Mutex<HashMap<String, u32>>,
        pub calls: Mutex<Vec<String>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl MapFetcher {
        pub fn page(mut self, url: &str, markdown: &str, links: &[&str]) -> Self {
            self.pages.insert(
                url.to_string(),
                (
                    markdown.to_string(),
                    links.iter().map(|l| l.to_string()).collect(),
                ),
            );
            self
        }

        pub fn text(mut self, url: &str, body: &str) -> Self {
            self.texts.insert(url.to_string(), body.to_string());
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for MapFetcher {
        async fn fetch_page(&self, url: &str) -> Result<FetchedPage> {
            self.calls.lock().unwrap().push(url.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(url) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(HarvestError::Network(format!("{url}: flaky")));
                    }
                }
            }

            let (markdown, links) = self
                .pages
                .get(url)
                .cloned()
                .ok_or_else(|| HarvestError::Network(format!("{url}: HTTP 404")))?;
            Ok(FetchedPage {
                url: url.to_string(),
                title: docharvest_markdown::extract_title_from_markdown(&markdown),
                markdown,
                description: None,
                links,
                status_code: 200,
            })
        }

        async fn fetch_text(&self, url: &str) -> Result<String> {
            self.calls.lock().unwrap().push(url.to_string());
            self.texts
                .get(url)
                .cloned()
                .ok_or_else(|| HarvestError::Network(format!("{url}: HTTP 404")))
        }
    }
}
