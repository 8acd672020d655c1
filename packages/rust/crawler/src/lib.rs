//! Page fetching and crawl strategies.
//!
//! This crate provides:
//! - [`fetcher`]: the [`PageFetcher`] seam and the reqwest-backed [`HttpFetcher`]
//! - [`strategies`]: single page, batch, recursive and sitemap crawling
//! - [`url_validator`]: self-link detection, dedup keys and SSRF checks

pub mod fetcher;
pub mod strategies;
pub mod url_validator;

pub use fetcher::{FetchedPage, FetcherOptions, HttpFetcher, PageFetcher};
pub use strategies::{
    CrawlProgress, Crawler, ProgressCallback, Strategy, StrategyConfig, StrategyOutput,
    crawl_batch, crawl_markdown_file, crawl_recursive, fetch_sitemap_urls, fetch_with_retry,
    is_asset_url,
};
pub use url_validator::{is_private_target, is_self_link, normalize_for_dedup};
