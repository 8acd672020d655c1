//! Single page and single file fetching.

use tracing::{debug, info, warn};

use docharvest_discovery::{is_llms_full, section_url, split_llms_full};
use docharvest_markdown::{clean_markdown, extract_title_from_markdown};
use docharvest_shared::{CancellationToken, CrawlResult, HarvestError, Result};

use super::StrategyConfig;
use crate::fetcher::{FetchedPage, PageFetcher};

/// Fetch one page, retrying up to `config.retry_count` attempts in total.
pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    config: &StrategyConfig,
    cancel: &CancellationToken,
) -> Result<FetchedPage> {
    with_retry(url, config, cancel, move || fetcher.fetch_page(url)).await
}

/// Fetch a raw text body with the same retry policy as pages.
async fn fetch_text_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    config: &StrategyConfig,
    cancel: &CancellationToken,
) -> Result<String> {
    with_retry(url, config, cancel, move || fetcher.fetch_text(url)).await
}

/// Run `fetch` up to `config.retry_count` times.
///
/// Backoff doubles after every failed attempt. Cancellation is checked
/// before and after every attempt; cancellations and validation errors are
/// returned at once.
async fn with_retry<T, F, Fut>(
    url: &str,
    config: &StrategyConfig,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.retry_count.max(1);
    let mut backoff = config.retry_backoff;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        cancel.check()?;
        let outcome = fetch().await;
        cancel.check()?;

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e @ HarvestError::Validation { .. }) => return Err(e),
            Err(e) => {
                debug!(url, attempt, error = %e, "fetch attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    warn!(url, attempts, error = %last_error, "fetch failed");
    Err(HarvestError::Network(format!(
        "{url}: failed after {attempts} attempts: {last_error}"
    )))
}

/// Fetch a text or markdown file.
///
/// `llms-full.txt` bundles are split at their H1 headings into one result
/// per section, each with a `#section-<n>-<slug>` sub-URL. Any other file is
/// a single result.
pub async fn crawl_markdown_file(
    fetcher: &dyn PageFetcher,
    url: &str,
    config: &StrategyConfig,
    cancel: &CancellationToken,
) -> Result<Vec<CrawlResult>> {
    let body = fetch_text_with_retry(fetcher, url, config, cancel).await?;
    let content = clean_markdown(&body, Some(url));

    if !is_llms_full(url) {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![CrawlResult {
            url: url.to_string(),
            title: extract_title_from_markdown(&content),
            content,
            description: None,
        }]);
    }

    let results: Vec<CrawlResult> = split_llms_full(&content)
        .into_iter()
        .enumerate()
        .map(|(index, section)| CrawlResult {
            url: section_url(url, index, section.title.as_deref()),
            title: section.title,
            content: section.content,
            description: None,
        })
        .collect();

    info!(url, sections = results.len(), "split llms-full bundle");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::strategies::test_support::MapFetcher;

    fn fast_config(retry_count: u32) -> StrategyConfig {
        StrategyConfig {
            max_concurrent: 2,
            retry_count,
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let fetcher = MapFetcher::default().page("https://a.dev/p", "# P", &[]);
        fetcher.flaky.lock().unwrap().insert("https://a.dev/p".into(), 2);
        let cancel = CancellationToken::new();

        let page = fetch_with_retry(&fetcher, "https://a.dev/p", &fast_config(3), &cancel)
            .await
            .unwrap();
        assert_eq!(page.url, "https://a.dev/p");
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_count() {
        let fetcher = MapFetcher::default();
        let cancel = CancellationToken::new();

        let err = fetch_with_retry(&fetcher, "https://a.dev/missing", &fast_config(2), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Network(ref m) if m.contains("after 2 attempts")));
        assert_eq!(fetcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_fetch() {
        let fetcher = MapFetcher::default().page("https://a.dev/p", "# P", &[]);
        let cancel = CancellationToken::new();
        cancel.cancel("user");

        let err = fetch_with_retry(&fetcher, "https://a.dev/p", &fast_config(3), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn text_files_share_the_retry_policy() {
        let fetcher = MapFetcher::default();
        let cancel = CancellationToken::new();

        let err = crawl_markdown_file(&fetcher, "https://a.dev/gone.md", &fast_config(3), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Network(ref m) if m.contains("after 3 attempts")));
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn plain_markdown_file_is_one_result() {
        let fetcher = MapFetcher::default().text(
            "https://a.dev/guide.md",
            "# Guide\n\nRead [this](/other).\n",
        );
        let cancel = CancellationToken::new();

        let results =
            crawl_markdown_file(&fetcher, "https://a.dev/guide.md", &fast_config(1), &cancel)
                .await
                .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title.as_deref(), Some("Guide"));
        assert!(results[0].content.contains("(https://a.dev/other)"));
    }

    #[tokio::test]
    async fn llms_full_is_split_into_sections() {
        let fetcher = MapFetcher::default().text(
            "https://a.dev/llms-full.txt",
            "# Install\n\nRun the installer.\n\n# Configure\n\nEdit the file.\n",
        );
        let cancel = CancellationToken::new();

        let results = crawl_markdown_file(
            &fetcher,
            "https://a.dev/llms-full.txt",
            &fast_config(1),
            &cancel,
        )
        .await
        .unwrap();

        let urls: Vec<&str> = results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://a.dev/llms-full.txt#section-0-install",
                "https://a.dev/llms-full.txt#section-1-configure",
            ]
        );
        assert_eq!(results[1].content, "# Configure\n\nEdit the file.");
    }
}
