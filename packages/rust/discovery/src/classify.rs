//! URL classification by path shape.
//!
//! Only the URL path is inspected; query strings and fragments never change
//! the classification.

use url::Url;

/// Extensions served as raw text or markdown rather than HTML.
const TEXT_EXTENSIONS: &[&str] = &[".txt", ".md", ".mdx", ".markdown"];

/// What kind of resource a start URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    /// An `llms-full.txt` style bundle of many documents.
    LlmsFull,
    /// An `llms.txt` link index.
    LlmsIndex,
    /// Any other text or markdown file.
    TextFile,
    /// An XML sitemap.
    Sitemap,
    /// Anything else, treated as an HTML page.
    Page,
}

/// Classify a URL, checking the most specific shapes first.
pub fn classify_url(url: &str) -> UrlKind {
    if is_llms_full(url) {
        UrlKind::LlmsFull
    } else if is_llms_index(url) {
        UrlKind::LlmsIndex
    } else if is_text_file(url) {
        UrlKind::TextFile
    } else if is_sitemap(url) {
        UrlKind::Sitemap
    } else {
        UrlKind::Page
    }
}

/// Whether the URL path ends in a recognized text or markdown extension.
pub fn is_text_file(url: &str) -> bool {
    let path = lower_path(url);
    TEXT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Whether the URL names an `llms-full.txt` bundle.
pub fn is_llms_full(url: &str) -> bool {
    let path = lower_path(url);
    let name = file_name(&path);
    is_text_file(url) && name.starts_with("llms-full")
}

/// Whether the URL names an `llms.txt` index (but not `llms-full.txt`).
pub fn is_llms_index(url: &str) -> bool {
    let path = lower_path(url);
    let name = file_name(&path);
    is_text_file(url) && (name == "llms.txt" || name == "llms.md")
}

/// Whether the URL looks like an XML sitemap.
pub fn is_sitemap(url: &str) -> bool {
    let path = lower_path(url);
    path.ends_with("sitemap.xml") || (path.contains("sitemap") && path.ends_with(".xml"))
}

fn lower_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_lowercase(),
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
