//! Sitemap listing.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use docharvest_discovery::{Sitemap, parse_sitemap_document};
use docharvest_shared::{CancellationToken, Result};

use crate::fetcher::PageFetcher;

/// Fetch a sitemap and return its page URLs, deduplicated in document order.
///
/// A sitemap index is followed one level: each child sitemap is fetched and
/// its `<loc>` entries collected. Children that fail to fetch are skipped.
pub async fn fetch_sitemap_urls(
    fetcher: &dyn PageFetcher,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    cancel.check()?;
    let body = fetcher.fetch_text(url).await?;
    cancel.check()?;

    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    match parse_sitemap_document(&body) {
        Sitemap::UrlSet(locs) => {
            for loc in locs {
                if seen.insert(loc.clone()) {
                    urls.push(loc);
                }
            }
        }
        Sitemap::Index(children) => {
            debug!(url, children = children.len(), "following sitemap index");
            for child in children {
                cancel.check()?;
                let child_body = match fetcher.fetch_text(&child).await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(sitemap = %child, error = %e, "skipping child sitemap");
                        continue;
                    }
                };
                // Nested indexes are not followed further.
                if let Sitemap::UrlSet(locs) = parse_sitemap_document(&child_body) {
                    for loc in locs {
                        if seen.insert(loc.clone()) {
                            urls.push(loc);
                        }
                    }
                }
            }
        }
    }

    info!(url, found = urls.len(), "sitemap listed");
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::MapFetcher;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://a.dev/one</loc></url>
  <url><loc>https://a.dev/two</loc></url>
  <url><loc>https://a.dev/one</loc></url>
</urlset>"#;

    #[tokio::test]
    async fn lists_urlset_entries() {
        let fetcher = MapFetcher::default().text("https://a.dev/sitemap.xml", URLSET);
        let cancel = CancellationToken::new();

        let urls = fetch_sitemap_urls(&fetcher, "https://a.dev/sitemap.xml", &cancel)
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://a.dev/one", "https://a.dev/two"]);
    }

    #[tokio::test]
    async fn follows_index_one_level() {
        let index = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://a.dev/sitemap-docs.xml</loc></sitemap>
  <sitemap><loc>https://a.dev/sitemap-gone.xml</loc></sitemap>
</sitemapindex>"#;
        let fetcher = MapFetcher::default()
            .text("https://a.dev/sitemap.xml", index)
            .text("https://a.dev/sitemap-docs.xml", URLSET);
        let cancel = CancellationToken::new();

        let urls = fetch_sitemap_urls(&fetcher, "https://a.dev/sitemap.xml", &cancel)
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://a.dev/one", "https://a.dev/two"]);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn missing_sitemap_is_an_error() {
        let fetcher = MapFetcher::default();
        let cancel = CancellationToken::new();
        assert!(
            fetch_sitemap_urls(&fetcher, "https://a.dev/sitemap.xml", &cancel)
                .await
                .is_err()
        );
    }
}
