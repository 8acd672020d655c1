//! Start URL dispatch: picks the crawl strategy for a URL and runs it.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use docharvest_crawler::{Crawler, ProgressCallback, Strategy, StrategyOutput};
use docharvest_discovery::{UrlKind, classify_url, parse_llms_txt};
use docharvest_shared::{CancellationToken, CrawlRequest, CrawlResult, CrawlType, Result};

/// Resolves a start URL to a [`Strategy`] and collects its results.
#[derive(Clone)]
pub struct UrlTypeHandler {
    crawler: Crawler,
}

impl UrlTypeHandler {
    pub fn new(crawler: Crawler) -> Self {
        Self { crawler }
    }

    pub fn crawler(&self) -> &Crawler {
        &self.crawler
    }

    /// The crawl type implied by the URL and request alone.
    ///
    /// An `llms.txt` index classifies as `text_file`; it only becomes `batch`
    /// once its links are known.
    pub fn classify(&self, url: &str, request: &CrawlRequest) -> CrawlType {
        match classify_url(url) {
            UrlKind::LlmsFull => CrawlType::LlmsFull,
            UrlKind::LlmsIndex | UrlKind::TextFile => CrawlType::TextFile,
            UrlKind::Sitemap => CrawlType::Sitemap,
            UrlKind::Page if request.max_depth > 1 => CrawlType::Recursive,
            UrlKind::Page => CrawlType::SinglePage,
        }
    }

    /// Crawl `url` with the strategy its type calls for.
    ///
    /// Dispatch order: text or markdown file, then sitemap, then recursive
    /// when `max_depth > 1`, then single page. Returns the results with the
    /// resolved crawl type.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn crawl_by_type(
        &self,
        url: &str,
        request: &CrawlRequest,
        cancel: &Arc<CancellationToken>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(Vec<CrawlResult>, CrawlType)> {
        let kind = classify_url(url);
        let (results, crawl_type) = match kind {
            UrlKind::LlmsFull | UrlKind::LlmsIndex | UrlKind::TextFile => {
                self.crawl_text_file(url, kind, cancel, on_progress).await?
            }
            UrlKind::Sitemap => {
                let listed = self
                    .crawler
                    .execute(Strategy::Sitemap { url: url.to_string() }, cancel, None)
                    .await?;
                let urls = match listed {
                    StrategyOutput::Urls(urls) => urls,
                    StrategyOutput::Pages(_) => Vec::new(),
                };
                info!(urls = urls.len(), "sitemap listed, crawling as batch");
                let results = if urls.is_empty() {
                    Vec::new()
                } else {
                    pages(
                        self.crawler
                            .execute(Strategy::Batch { urls }, cancel, on_progress)
                            .await?,
                    )
                };
                (results, CrawlType::Sitemap)
            }
            UrlKind::Page if request.max_depth > 1 => {
                let output = self
                    .crawler
                    .execute(
                        Strategy::Recursive {
                            start_urls: vec![url.to_string()],
                            max_depth: request.max_depth,
                        },
                        cancel,
                        on_progress,
                    )
                    .await?;
                (pages(output), CrawlType::Recursive)
            }
            UrlKind::Page => {
                let output = self
                    .crawler
                    .execute(
                        Strategy::SinglePage {
                            url: url.to_string(),
                            raw_text: false,
                        },
                        cancel,
                        on_progress,
                    )
                    .await?;
                (pages(output), CrawlType::SinglePage)
            }
        };

        info!(results = results.len(), crawl_type = %crawl_type, "crawl dispatched");
        Ok((results, crawl_type))
    }

    async fn crawl_text_file(
        &self,
        url: &str,
        kind: UrlKind,
        cancel: &Arc<CancellationToken>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(Vec<CrawlResult>, CrawlType)> {
        let output = self
            .crawler
            .execute(
                Strategy::SinglePage {
                    url: url.to_string(),
                    raw_text: true,
                },
                cancel,
                None,
            )
            .await?;
        let mut results = pages(output);

        match kind {
            UrlKind::LlmsFull => Ok((results, CrawlType::LlmsFull)),
            UrlKind::LlmsIndex => {
                let links = match results.first().map(|r| parse_llms_txt(&r.content)) {
                    Some(Ok(index)) => index.same_host_links(url),
                    Some(Err(e)) => {
                        warn!(error = %e, "llms.txt did not parse, keeping it as a text file");
                        Vec::new()
                    }
                    None => Vec::new(),
                };
                let links: Vec<String> = links.into_iter().filter(|l| l != url).collect();
                if links.is_empty() {
                    return Ok((results, CrawlType::TextFile));
                }

                info!(links = links.len(), "following llms.txt links");
                let linked = self
                    .crawler
                    .execute(Strategy::Batch { urls: links }, cancel, on_progress)
                    .await?;
                results.extend(pages(linked));
                Ok((results, CrawlType::Batch))
            }
            _ => Ok((results, CrawlType::TextFile)),
        }
    }
}

fn pages(output: StrategyOutput) -> Vec<CrawlResult> {
    match output {
        StrategyOutput::Pages(pages) => pages,
        StrategyOutput::Urls(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubFetcher;
    use docharvest_crawler::StrategyConfig;

    fn handler(fetcher: StubFetcher) -> UrlTypeHandler {
        UrlTypeHandler::new(Crawler::new(Arc::new(fetcher), StrategyConfig::default()))
    }

    fn request(url: &str, depth: u32) -> CrawlRequest {
        let mut request = CrawlRequest::new(url);
        request.max_depth = depth;
        request
    }

    #[test]
    fn classification_order() {
        let h = handler(StubFetcher::default());
        let deep = |u: &str| request(u, 3);

        assert_eq!(h.classify("https://a.dev/guide.md", &deep("")), CrawlType::TextFile);
        assert_eq!(h.classify("https://a.dev/llms-full.txt", &deep("")), CrawlType::LlmsFull);
        assert_eq!(h.classify("https://a.dev/sitemap.xml", &deep("")), CrawlType::Sitemap);
        assert_eq!(h.classify("https://a.dev/docs", &deep("")), CrawlType::Recursive);
        assert_eq!(h.classify("https://a.dev/docs", &request("", 1)), CrawlType::SinglePage);
    }

    #[tokio::test]
    async fn sitemap_then_batch() {
        let sitemap = "<urlset><url><loc>https://a.dev/a</loc></url>\
                       <url><loc>https://a.dev/b</loc></url></urlset>";
        let fetcher = StubFetcher::default()
            .text("https://a.dev/sitemap.xml", sitemap)
            .page("https://a.dev/a", "# A\n\nAlpha.", &[])
            .page("https://a.dev/b", "# B\n\nBeta.", &[]);
        let cancel = Arc::new(CancellationToken::new());

        let (results, ct) = handler(fetcher)
            .crawl_by_type(
                "https://a.dev/sitemap.xml",
                &request("https://a.dev/sitemap.xml", 1),
                &cancel,
                None,
            )
            .await
            .unwrap();
        assert_eq!(ct, CrawlType::Sitemap);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn llms_index_follows_same_host_links_as_batch() {
        let index = "# Project\n\n> Docs.\n\n## Guides\n\n\
                     - [Install](https://a.dev/install.md): setup\n\
                     - [Elsewhere](https://b.dev/x.md)\n";
        let fetcher = StubFetcher::default()
            .text("https://a.dev/llms.txt", index)
            .page("https://a.dev/install.md", "# Install\n\nRun it.", &[]);
        let cancel = Arc::new(CancellationToken::new());

        let (results, ct) = handler(fetcher)
            .crawl_by_type(
                "https://a.dev/llms.txt",
                &request("https://a.dev/llms.txt", 1),
                &cancel,
                None,
            )
            .await
            .unwrap();
        assert_eq!(ct, CrawlType::Batch);
        let urls: Vec<&str> = results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.dev/llms.txt", "https://a.dev/install.md"]);
    }

    #[tokio::test]
    async fn plain_markdown_is_a_text_file() {
        let fetcher = StubFetcher::default().text("https://a.dev/notes.md", "# Notes\n\nHi.");
        let cancel = Arc::new(CancellationToken::new());

        let (results, ct) = handler(fetcher)
            .crawl_by_type(
                "https://a.dev/notes.md",
                &request("https://a.dev/notes.md", 5),
                &cancel,
                None,
            )
            .await
            .unwrap();
        assert_eq!(ct, CrawlType::TextFile);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn deep_request_crawls_recursively() {
        let fetcher = StubFetcher::default()
            .page("https://a.dev/", "# Home", &["https://a.dev/next"])
            .page("https://a.dev/next", "# Next", &[]);
        let cancel = Arc::new(CancellationToken::new());

        let (results, ct) = handler(fetcher)
            .crawl_by_type("https://a.dev/", &request("https://a.dev/", 2), &cancel, None)
            .await
            .unwrap();
        assert_eq!(ct, CrawlType::Recursive);
        assert_eq!(results.len(), 2);
    }
}
