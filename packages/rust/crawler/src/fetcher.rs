//! Page fetching: the [`PageFetcher`] seam and its HTTP implementation.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use docharvest_markdown::{ConvertOptions, clean_markdown, convert};
use docharvest_shared::{AppConfig, CrawlResult, HarvestError, Result};

use crate::url_validator::is_private_target;

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("DocHarvest/", env!("CARGO_PKG_VERSION"));

/// Maximum response size we accept (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// FetchedPage
// ---------------------------------------------------------------------------

/// A fetched page, already converted to markdown.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    /// Final URL of the page (after redirects).
    pub url: String,
    pub markdown: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Absolute, fragment-free links found on the page.
    pub links: Vec<String>,
    pub status_code: u16,
}

impl FetchedPage {
    pub fn into_crawl_result(self) -> CrawlResult {
        CrawlResult {
            url: self.url,
            content: self.markdown,
            title: self.title,
            description: self.description,
        }
    }
}

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// Fetches pages and raw text resources.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch an HTML page and convert it to markdown.
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage>;

    /// Fetch a resource as raw text (markdown files, sitemaps).
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Options for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Allow loopback/private hosts (local mirrors, tests against mock servers).
    pub allow_private_hosts: bool,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
            allow_private_hosts: false,
        }
    }
}

impl From<&AppConfig> for FetcherOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.crawl_policies.request_timeout_secs),
            allow_private_hosts: config.crawl_policies.allow_private_hosts,
            ..Self::default()
        }
    }
}

/// reqwest-backed fetcher with SSRF protection.
pub struct HttpFetcher {
    client: Client,
    allow_private_hosts: bool,
}

impl HttpFetcher {
    pub fn new(opts: &FetcherOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(opts.max_redirects))
            .timeout(opts.timeout)
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_private_hosts: opts.allow_private_hosts,
        })
    }

    fn checked_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| HarvestError::validation(format!("invalid URL {raw}: {e}")))?;
        if !self.allow_private_hosts && is_private_target(&url) {
            return Err(HarvestError::validation(format!(
                "{url}: blocked private or non-HTTP target"
            )));
        }
        Ok(url)
    }

    /// GET a URL and return `(final_url, status, content_type, body)`.
    async fn get(&self, url: &Url) -> Result<(Url, u16, String, String)> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| HarvestError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::Network(format!("{url}: HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(HarvestError::validation(format!(
                    "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
                )));
            }
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();

        let body = response
            .text()
            .await
            .map_err(|e| HarvestError::Network(format!("{url}: body read failed: {e}")))?;

        Ok((final_url, status.as_u16(), content_type, body))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage> {
        let url = self.checked_url(url)?;
        let (final_url, status_code, content_type, body) = self.get(&url).await?;
        debug!(%final_url, status_code, %content_type, bytes = body.len(), "page fetched");

        let plain =
            content_type.starts_with("text/plain") || content_type.starts_with("text/markdown");
        if plain && !looks_like_html(&body) {
            let markdown = clean_markdown(&body, Some(final_url.as_str()));
            return Ok(FetchedPage {
                title: docharvest_markdown::extract_title_from_markdown(&markdown),
                url: final_url.to_string(),
                markdown,
                description: None,
                links: Vec::new(),
                status_code,
            });
        }

        parse_html_page(&final_url, status_code, &body)
    }

    #[instrument(skip(self))]
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let url = self.checked_url(url)?;
        let (_, _, _, body) = self.get(&url).await?;
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// HTML parsing
// ---------------------------------------------------------------------------

static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("title selector"));
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("h1 selector"));
static DESCRIPTION_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[name="description"], meta[property="og:description"]"#)
        .expect("description selector")
});
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector"));

/// Turn an HTML body into a [`FetchedPage`]. Synchronous so the parsed
/// document never lives across an await point.
fn parse_html_page(url: &Url, status_code: u16, body: &str) -> Result<FetchedPage> {
    let (title, description, links) = {
        let doc = Html::parse_document(body);
        (
            page_title(&doc),
            page_description(&doc),
            extract_links(&doc, url),
        )
    };

    let converted = convert(
        body,
        &ConvertOptions {
            source_url: url.to_string(),
            title: title.clone(),
        },
    )?;

    Ok(FetchedPage {
        url: url.to_string(),
        markdown: converted.markdown,
        title: converted.title,
        description,
        links,
        status_code,
    })
}

/// Servers often label HTML as `text/plain`; trust the body's opening tag.
fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start().chars().take(16).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn element_text(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn page_title(doc: &Html) -> Option<String> {
    doc.select(&TITLE_SEL)
        .chain(doc.select(&H1_SEL))
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn page_description(doc: &Html) -> Option<String> {
    doc.select(&DESCRIPTION_SEL)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|d| !d.is_empty())
        .map(str::to_string)
}

/// Extract all links from a document, resolved against the page URL.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();

    for href in doc.select(&LINK_SEL).filter_map(|el| el.value().attr("href")) {
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        if let Ok(mut resolved) = base_url.join(href) {
            resolved.set_fragment(None);
            let resolved = resolved.to_string();
            if !links.contains(&resolved) {
                links.push(resolved);
            }
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_fetcher() -> HttpFetcher {
        HttpFetcher::new(&FetcherOptions {
            allow_private_hosts: true,
            ..FetcherOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn extract_links_resolves_and_filters() {
        let html = r##"<html><body><a href="/page2">Page 2</a><a href="https://external.com">External</a><a href="#section">Anchor</a><a href="relative/path#frag">Relative</a><a href="/page2">Dup</a><a href="mailto:a@b.c">Mail</a></body></html>"##;

        let doc = Html::parse_document(html);
        let base = Url::parse("https://docs.example.com/page1").unwrap();
        let links = extract_links(&doc, &base);

        assert_eq!(
            links,
            vec![
                "https://docs.example.com/page2",
                "https://external.com/",
                "https://docs.example.com/relative/path",
            ]
        );
    }

    #[test]
    fn title_and_description_from_head() {
        let html = r#"<html><head><title>  Guide | Docs </title>
            <meta name="description" content="How to use it"></head>
            <body><main><h1>Guide</h1><p>Body text.</p></main></body></html>"#;
        let url = Url::parse("https://docs.example.com/guide").unwrap();
        let page = parse_html_page(&url, 200, html).unwrap();

        assert_eq!(page.title.as_deref(), Some("Guide | Docs"));
        assert_eq!(page.description.as_deref(), Some("How to use it"));
        assert!(page.markdown.contains("Body text."));
    }

    #[tokio::test]
    async fn fetch_page_from_mock_server() {
        let server = MockServer::start().await;
        let html = r#"<html><body><main>
            <h1>Page One</h1>
            <p>Welcome to page one.</p>
            <a href="/page2">Go to page 2</a>
        </main></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(html, "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let page = local_fetcher().fetch_page(&server.uri()).await.unwrap();
        assert_eq!(page.status_code, 200);
        assert_eq!(page.title.as_deref(), Some("Page One"));
        assert!(page.markdown.contains("Welcome to page one."));
        assert_eq!(page.links, vec![format!("{}/page2", server.uri())]);
    }

    #[tokio::test]
    async fn html_served_as_plain_text_is_still_parsed() {
        let server = MockServer::start().await;
        let html = "<!DOCTYPE html><html><body><h1>Mislabelled</h1><p>Body.</p></body></html>";
        Mock::given(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/plain"))
            .mount(&server)
            .await;

        let page = local_fetcher()
            .fetch_page(&format!("{}/page", server.uri()))
            .await
            .unwrap();
        assert_eq!(page.title.as_deref(), Some("Mislabelled"));
        assert!(!page.markdown.contains("<h1>"));
    }

    #[tokio::test]
    async fn markdown_response_takes_title_from_heading() {
        let server = MockServer::start().await;
        Mock::given(path("/guide.md"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("# Guide\n\nText.\n", "text/markdown"))
            .mount(&server)
            .await;

        let page = local_fetcher()
            .fetch_page(&format!("{}/guide.md", server.uri()))
            .await
            .unwrap();
        assert_eq!(page.title.as_deref(), Some("Guide"));
    }

    #[test]
    fn html_sniffing() {
        assert!(looks_like_html("  <!DOCTYPE html><html></html>"));
        assert!(looks_like_html("<HTML lang=\"en\">"));
        assert!(!looks_like_html("# Title\n\n<div>inline html</div>"));
    }

    #[tokio::test]
    async fn fetch_page_http_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = local_fetcher()
            .fetch_page(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Network(_)));
    }

    #[tokio::test]
    async fn fetch_text_returns_raw_body() {
        let server = MockServer::start().await;
        Mock::given(path("/llms.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# Title\n\n- [A](/a)\n"))
            .mount(&server)
            .await;

        let body = local_fetcher()
            .fetch_text(&format!("{}/llms.txt", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "# Title\n\n- [A](/a)\n");
    }

    #[tokio::test]
    async fn private_hosts_blocked_by_default() {
        let fetcher = HttpFetcher::new(&FetcherOptions::default()).unwrap();
        let err = fetcher
            .fetch_page("http://127.0.0.1:9/")
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Validation { .. }));
    }
}
