//! Bounded-concurrency batch fetching.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use docharvest_shared::{CancellationToken, HarvestError, Result};

use super::{CrawlProgress, ProgressCallback, StrategyConfig, percent_of, single_page};
use crate::fetcher::{FetchedPage, PageFetcher};

/// Fetch `urls` with at most `config.max_concurrent` requests in flight.
///
/// Results keep the input order. Failed URLs are logged and skipped. The
/// cancellation token is polled at every completion; once it trips, the
/// remaining fetches are aborted and the cancellation error is returned.
pub async fn crawl_batch(
    fetcher: &Arc<dyn PageFetcher>,
    urls: &[String],
    config: &StrategyConfig,
    cancel: &Arc<CancellationToken>,
    on_progress: Option<ProgressCallback>,
) -> Result<Vec<FetchedPage>> {
    let mut fetched = 0usize;
    let pages = run_batch(
        fetcher,
        urls,
        config,
        cancel,
        |url, done, ok| {
            if ok {
                fetched += 1;
            }
            if let Some(cb) = &on_progress {
                cb(CrawlProgress {
                    processed: done,
                    total: urls.len(),
                    percent: percent_of(done, urls.len()),
                    url: url.to_string(),
                    depth: None,
                });
            }
        },
    )
    .await?;

    info!(requested = urls.len(), fetched, "batch crawl finished");
    Ok(pages)
}

/// Shared fan-out loop. `on_done(url, completed_so_far, succeeded)` runs once
/// per finished URL, after the cancellation check for that completion.
pub(crate) async fn run_batch(
    fetcher: &Arc<dyn PageFetcher>,
    urls: &[String],
    config: &StrategyConfig,
    cancel: &Arc<CancellationToken>,
    mut on_done: impl FnMut(&str, usize, bool),
) -> Result<Vec<FetchedPage>> {
    cancel.check()?;
    if urls.is_empty() {
        return Ok(Vec::new());
    }

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let mut tasks: JoinSet<(usize, Result<FetchedPage>)> = JoinSet::new();

    for (index, url) in urls.iter().enumerate() {
        let fetcher = Arc::clone(fetcher);
        let semaphore = Arc::clone(&semaphore);
        let cancel = Arc::clone(cancel);
        let config = config.clone();
        let url = url.clone();

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, Err(HarvestError::cancelled("batch semaphore closed"))),
            };
            let outcome =
                single_page::fetch_with_retry(fetcher.as_ref(), &url, &config, &cancel).await;
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<FetchedPage>> = vec![None; urls.len()];
    let mut completed = 0usize;

    while let Some(joined) = tasks.join_next().await {
        completed += 1;

        if let Err(e) = cancel.check() {
            tasks.abort_all();
            debug!(completed, total = urls.len(), "batch cancelled");
            return Err(e);
        }

        match joined {
            Ok((index, Ok(page))) => {
                on_done(&urls[index], completed, true);
                slots[index] = Some(page);
            }
            Ok((index, Err(e))) => {
                warn!(url = %urls[index], error = %e, "skipping failed URL");
                on_done(&urls[index], completed, false);
            }
            Err(e) => {
                warn!(error = %e, "batch fetch task failed");
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::strategies::test_support::MapFetcher;

    fn config(max_concurrent: usize) -> StrategyConfig {
        StrategyConfig {
            max_concurrent,
            retry_count: 1,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://a.dev/p{i}")).collect()
    }

    fn fetcher_with(n: usize) -> MapFetcher {
        (0..n).fold(MapFetcher::default(), |f, i| {
            f.page(&format!("https://a.dev/p{i}"), &format!("# Page {i}"), &[])
        })
    }

    #[tokio::test]
    async fn fetches_all_in_input_order_with_bounded_concurrency() {
        let fetcher = Arc::new(fetcher_with(8));
        let dyn_fetcher: Arc<dyn PageFetcher> = fetcher.clone();
        let cancel = Arc::new(CancellationToken::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let progress: ProgressCallback = Arc::new(move |p: CrawlProgress| {
            seen_cb.lock().unwrap().push(p.processed);
        });

        let pages = crawl_batch(&dyn_fetcher, &urls(8), &config(3), &cancel, Some(progress))
            .await
            .unwrap();

        let got: Vec<String> = pages.iter().map(|p| p.url.clone()).collect();
        assert_eq!(got, urls(8));
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(*seen.lock().unwrap(), (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_urls_are_skipped() {
        let fetcher: Arc<dyn PageFetcher> = Arc::new(fetcher_with(2));
        let cancel = Arc::new(CancellationToken::new());
        let mut list = urls(2);
        list.insert(1, "https://a.dev/missing".into());

        let pages = crawl_batch(&fetcher, &list, &config(2), &cancel, None)
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_completions() {
        let fetcher: Arc<dyn PageFetcher> = Arc::new(fetcher_with(20));
        let cancel = Arc::new(CancellationToken::new());
        let cancel_cb = Arc::clone(&cancel);
        let progress: ProgressCallback = Arc::new(move |p: CrawlProgress| {
            if p.processed == 3 {
                cancel_cb.cancel("stop after three");
            }
        });

        let err = crawl_batch(&fetcher, &urls(20), &config(1), &cancel, Some(progress))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.to_string().contains("stop after three"));
    }

    #[tokio::test]
    async fn empty_batch() {
        let fetcher: Arc<dyn PageFetcher> = Arc::new(MapFetcher::default());
        let cancel = Arc::new(CancellationToken::new());
        let pages = crawl_batch(&fetcher, &[], &config(2), &cancel, None)
            .await
            .unwrap();
        assert!(pages.is_empty());
    }
}
