//! Breadth-first, same-host recursive crawling.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use docharvest_shared::{CancellationToken, Result};

use super::{CrawlProgress, ProgressCallback, StrategyConfig, batch::run_batch};
use crate::fetcher::{FetchedPage, PageFetcher};
use crate::url_validator::{is_self_link, normalize_for_dedup};

/// Extensions of resources that are never worth converting to markdown.
const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".bmp", ".pdf", ".zip", ".gz",
    ".tgz", ".tar", ".rar", ".7z", ".exe", ".dmg", ".msi", ".mp3", ".mp4", ".webm", ".mov",
    ".avi", ".woff", ".woff2", ".ttf", ".eot", ".css", ".js", ".map", ".json", ".xml", ".rss",
];

/// Whether the URL path ends in a binary or asset extension.
pub fn is_asset_url(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Crawl level by level from `start_urls`, up to `max_depth` levels
/// (1 = the start URLs only).
///
/// Each level is one batch pass. Discovered links must share the first start
/// URL's host, must not be self links of the page they came from, must not be
/// assets, and are visited at most once. Progress percent spreads evenly over
/// the levels.
pub async fn crawl_recursive(
    fetcher: &Arc<dyn PageFetcher>,
    start_urls: &[String],
    max_depth: u32,
    config: &StrategyConfig,
    cancel: &Arc<CancellationToken>,
    on_progress: Option<ProgressCallback>,
) -> Result<Vec<FetchedPage>> {
    let max_depth = max_depth.max(1);
    let host = start_urls
        .first()
        .and_then(|u| Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_lowercase));

    let mut visited: HashSet<String> = HashSet::new();
    let mut results: Vec<FetchedPage> = Vec::new();
    let mut level: Vec<String> = start_urls.to_vec();
    let mut processed = 0usize;
    let mut known = 0usize;

    for depth in 0..max_depth {
        cancel.check()?;

        let batch: Vec<String> = level
            .drain(..)
            .filter(|u| visited.insert(normalize_for_dedup(u)))
            .collect();
        if batch.is_empty() {
            break;
        }
        known += batch.len();
        debug!(depth, urls = batch.len(), "crawling level");

        let level_total = batch.len();
        let pages = run_batch(fetcher, &batch, config, cancel, |url, done, _| {
            processed += 1;
            if let Some(cb) = &on_progress {
                let level_share = done as f64 / level_total as f64;
                let overall = (depth as f64 + level_share) / max_depth as f64;
                cb(CrawlProgress {
                    processed,
                    total: known,
                    percent: (overall * 100.0).clamp(0.0, 100.0) as u8,
                    url: url.to_string(),
                    depth: Some(depth + 1),
                });
            }
        })
        .await?;

        if depth + 1 < max_depth {
            level = next_level(&pages, host.as_deref(), &visited);
        }
        results.extend(pages);
    }

    info!(
        pages = results.len(),
        visited = visited.len(),
        max_depth,
        "recursive crawl finished"
    );
    Ok(results)
}

/// Links worth following from one level's pages, deduplicated.
fn next_level(pages: &[FetchedPage], host: Option<&str>, visited: &HashSet<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut next = Vec::new();

    for page in pages {
        for link in &page.links {
            let Ok(url) = Url::parse(link) else {
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") || is_asset_url(&url) {
                continue;
            }
            if url.host_str().map(str::to_lowercase).as_deref() != host {
                continue;
            }
            if is_self_link(link, &page.url) {
                continue;
            }
            let key = normalize_for_dedup(link);
            if visited.contains(&key) || !seen.insert(key) {
                continue;
            }
            next.push(link.clone());
        }
    }

    next
}
