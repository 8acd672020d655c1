//! XML sitemap parsing.
//!
//! Sitemaps are flat enough that we pull `<loc>` values out with a regex
//! instead of running a full XML parser.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Matches `<loc>...</loc>`, tolerating namespace prefixes and whitespace.
static LOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:\w+:)?loc>\s*(.*?)\s*</(?:\w+:)?loc>").expect("loc regex")
});

/// Matches the root element of a sitemap index.
static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(?:\w+:)?sitemapindex[\s>]").expect("sitemapindex regex"));

/// Parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sitemap {
    /// A `<urlset>`: page URLs.
    UrlSet(Vec<String>),
    /// A `<sitemapindex>`: URLs of nested sitemaps.
    Index(Vec<String>),
}

impl Sitemap {
    pub fn urls(&self) -> &[String] {
        match self {
            Self::UrlSet(urls) | Self::Index(urls) => urls,
        }
    }
}

/// Parse a sitemap or sitemap index.
pub fn parse_sitemap_document(xml: &str) -> Sitemap {
    let urls = parse_sitemap(xml);
    if INDEX_RE.is_match(xml) {
        Sitemap::Index(urls)
    } else {
        Sitemap::UrlSet(urls)
    }
}

/// Extract every `<loc>` URL in document order.
///
/// Entities are decoded, non-http(s) values are dropped, and duplicates are
/// removed keeping the first occurrence.
pub fn parse_sitemap(xml: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    LOC_RE
        .captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .map(|m| decode_entities(strip_cdata(m.as_str())))
        .filter(|loc| loc.starts_with("http://") || loc.starts_with("https://"))
        .filter(|loc| seen.insert(loc.clone()))
        .collect()
}

fn strip_cdata(value: &str) -> &str {
    value
        .strip_prefix("<![CDATA[")
        .and_then(|v| v.strip_suffix("]]>"))
        .unwrap_or(value)
        .trim()
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
