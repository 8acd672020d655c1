//! HTML-to-Markdown conversion, cleanup, chunking, and code block extraction.
//!
//! Pages come in as HTML (converted with `htmd` and cleaned) or as raw
//! markdown/text (cleaned only). Downstream, the document pipeline splits the
//! result with [`smart_chunk`] and the code example stage scans it with
//! [`extract_code_blocks`].

mod chunking;
mod cleanup;
mod code_blocks;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use docharvest_shared::{HarvestError, Result};

pub use chunking::smart_chunk;
pub use code_blocks::{CodeBlock, extract_code_blocks};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Result of converting an HTML page to Markdown.
#[derive(Debug, Clone)]
pub struct ConvertResult {
    /// The cleaned Markdown content.
    pub markdown: String,
    /// Title override, else the first H1.
    pub title: Option<String>,
    /// Approximate word count, fenced code excluded.
    pub word_count: usize,
}

/// Options for the HTML-to-Markdown conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Page URL, used for resolving relative links.
    pub source_url: String,
    /// Title to use instead of the first H1.
    pub title: Option<String>,
}

impl ConvertOptions {
    pub fn for_url(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            title: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("table selector"));
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("tr selector"));
static CELL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("cell selector"));
static TH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("th selector"));

/// Convert an HTML page to clean Markdown.
///
/// 1. Extracts the main content container (falls back to `<body>`)
/// 2. Rewrites HTML tables as markdown tables
/// 3. Converts HTML to Markdown via `htmd`
/// 4. Runs the cleanup passes
#[instrument(skip(html, opts), fields(url = %opts.source_url))]
pub fn convert(html: &str, opts: &ConvertOptions) -> Result<ConvertResult> {
    let content_html = extract_content_html(html);
    let content_html = preprocess_tables(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg",
            "button", "form",
        ])
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| HarvestError::Conversion(format!("htmd conversion failed: {e}")))?;

    let markdown = clean_markdown(&raw_markdown, Some(&opts.source_url));
    let title = opts
        .title
        .clone()
        .or_else(|| extract_title_from_markdown(&markdown));
    let word_count = count_words(&markdown);

    debug!(
        raw_len = raw_markdown.len(),
        final_len = markdown.len(),
        word_count,
        "conversion complete"
    );

    Ok(ConvertResult {
        markdown,
        title,
        word_count,
    })
}

/// Run the cleanup passes over markdown that did not come from HTML.
///
/// Relative links resolve against `base_url` when it parses.
pub fn clean_markdown(md: &str, base_url: Option<&str>) -> String {
    let base = base_url.and_then(|u| Url::parse(u).ok());
    cleanup::run_pipeline(md, base.as_ref())
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

/// Replace `<table>` elements with markdown tables before htmd runs.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut result = html.to_string();

    for table in doc.select(&TABLE_SEL) {
        let md_table = table_to_markdown(&table);
        result = result.replacen(&table.html(), &md_table, 1);
    }

    result
}

fn table_to_markdown(table: &scraper::ElementRef) -> String {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut has_header = false;

    for tr in table.select(&TR_SEL) {
        let cells: Vec<String> = tr
            .select(&CELL_SEL)
            .map(|cell| {
                cell.text()
                    .collect::<String>()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .replace('|', "\\|")
            })
            .collect();
        if cells.is_empty() {
            continue;
        }
        if rows.is_empty() && tr.select(&TH_SEL).next().is_some() {
            has_header = true;
        }
        rows.push(cells);
    }

    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    if cols == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(cols, String::new());
    }

    let render = |row: &[String]| format!("| {} |\n", row.join(" | "));
    let mut md = String::from("\n\n");
    let (header, body) = if has_header {
        (rows[0].clone(), &rows[1..])
    } else {
        (vec![String::new(); cols], &rows[..])
    };
    md.push_str(&render(&header));
    md.push_str(&render(&vec!["---".to_string(); cols]));
    for row in body {
        md.push_str(&render(row));
    }
    md.push('\n');
    md
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract the main content HTML, skipping site chrome.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    let selectors = [
        "article .markdown",
        ".vp-doc",
        ".markdown-section",
        ".markdown-body",
        "[role=\"main\"]",
        "article",
        "main",
        ".content",
        "body",
    ];

    for sel_str in &selectors {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }

    html.to_string()
}

/// Text of the first H1 in the markdown.
pub fn extract_title_from_markdown(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE
        .captures(md)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Count words in markdown, excluding fenced code blocks and heading markers.
pub fn count_words(md: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

    CODE_BLOCK_RE
        .replace_all(md, "")
        .split_whitespace()
        .filter(|w| !w.chars().all(|c| c == '#'))
        .count()
}

/// First prose paragraph, skipping headings, fences, tables, and link-only lines.
///
/// Truncated to `max_chars` on a char boundary.
pub fn first_paragraph(md: &str, max_chars: usize) -> Option<String> {
    let mut in_fence = false;
    for block in md.split("\n\n") {
        let trimmed = block.trim();
        let fences = trimmed
            .lines()
            .filter(|l| l.trim_start().starts_with("```"))
            .count();
        if in_fence {
            in_fence = fences % 2 == 0;
            continue;
        }
        if fences % 2 == 1 {
            in_fence = true;
            continue;
        }
        let skip = trimmed.is_empty()
            || fences > 0
            || trimmed.starts_with('#')
            || trimmed.starts_with('|')
            || trimmed.starts_with('>')
            || (trimmed.starts_with('[') && trimmed.ends_with(')'))
            || trimmed.starts_with("- [")
            || trimmed.starts_with("* [");
        if skip {
            continue;
        }

        let text = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
        return Some(match text.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
            None => text,
        });
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
