//! `llms.txt` and `llms-full.txt` handling.
//!
//! An `llms.txt` index (per <https://llmstxt.org/>) looks like:
//! - Line 1: `# Title`
//! - Optional: `> Summary blockquote`
//! - Sections: `## Section Name` followed by Markdown link lists
//! - Links: `- [Link Name](url): Optional description`
//!
//! An `llms-full.txt` bundle concatenates whole documents, each starting at
//! an H1 heading.

use std::collections::HashSet;
use std::sync::LazyLock;

use docharvest_shared::{HarvestError, Result};
use regex::Regex;
use url::Url;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parsed representation of an llms.txt file.
#[derive(Debug, Clone)]
pub struct LlmsIndex {
    /// The H1 title.
    pub title: String,
    /// The blockquote summary (if present).
    pub summary: Option<String>,
    /// Named sections containing entries.
    pub sections: Vec<LlmsSection>,
    /// All entries across all sections, including ones before the first `##`.
    pub entries: Vec<LlmsEntry>,
}

/// A named section within the llms.txt (## heading).
#[derive(Debug, Clone)]
pub struct LlmsSection {
    pub title: String,
    pub entries: Vec<LlmsEntry>,
}

/// A single linked entry in the llms.txt.
#[derive(Debug, Clone)]
pub struct LlmsEntry {
    /// Display name of the link.
    pub name: String,
    /// Target URL, exactly as written (may be relative).
    pub url: String,
    /// Optional description after the `:`.
    pub notes: Option<String>,
}

/// One document of an `llms-full.txt` bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmsFullSection {
    /// H1 text, or `None` for a preamble before the first heading.
    pub title: Option<String>,
    /// Section markdown, heading line included.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static H1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+(.+)$").expect("H1 regex"));

static H2_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\s+(.+)$").expect("H2 regex"));

static BLOCKQUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^>\s*(.+)$").expect("blockquote regex"));

/// Matches `- [Name](url)` or `- [Name](url): Notes`.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s+\[([^\]]+)\]\(([^)\s]+)\)(?::\s*(.+))?$").expect("link regex")
});

// ---------------------------------------------------------------------------
// llms.txt index
// ---------------------------------------------------------------------------

/// Parse an llms.txt string into structured data.
///
/// Fails when the first non-blank line is not an H1.
pub fn parse_llms_txt(content: &str) -> Result<LlmsIndex> {
    let mut lines = content.lines().peekable();

    let title = loop {
        let Some(line) = lines.next() else {
            return Err(HarvestError::parse("llms.txt is empty"));
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match H1_RE.captures(trimmed) {
            Some(caps) => break caps[1].trim().to_string(),
            None => {
                return Err(HarvestError::parse(
                    "llms.txt must start with an H1 heading (# Title)",
                ));
            }
        }
    };

    // Blockquote summary may span several lines.
    let mut summary_parts: Vec<String> = Vec::new();
    while let Some(&line) = lines.peek() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            lines.next();
            continue;
        }
        let Some(caps) = BLOCKQUOTE_RE.captures(trimmed) else {
            break;
        };
        summary_parts.push(caps[1].trim().to_string());
        lines.next();
    }
    let summary = (!summary_parts.is_empty()).then(|| summary_parts.join(" "));

    let mut sections: Vec<LlmsSection> = Vec::new();
    let mut entries: Vec<LlmsEntry> = Vec::new();
    let mut current: Option<LlmsSection> = None;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(caps) = H2_RE.captures(trimmed) {
            sections.extend(current.take());
            current = Some(LlmsSection {
                title: caps[1].trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        if let Some(caps) = LINK_RE.captures(trimmed) {
            let entry = LlmsEntry {
                name: caps[1].trim().to_string(),
                url: caps[2].trim().to_string(),
                notes: caps.get(3).map(|m| m.as_str().trim().to_string()),
            };
            if let Some(section) = current.as_mut() {
                section.entries.push(entry.clone());
            }
            entries.push(entry);
        }
    }
    sections.extend(current.take());

    Ok(LlmsIndex {
        title,
        summary,
        sections,
        entries,
    })
}

impl LlmsIndex {
    /// Entry URLs resolved against `base`, restricted to `base`'s host.
    ///
    /// Fragments are dropped and duplicates removed, keeping the first
    /// occurrence. Unparseable entries are skipped.
    pub fn same_host_links(&self, base: &str) -> Vec<String> {
        let Ok(base_url) = Url::parse(base) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter_map(|entry| base_url.join(&entry.url).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .filter(|url| url.host_str() == base_url.host_str())
            .map(|mut url| {
                url.set_fragment(None);
                url.to_string()
            })
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// llms-full.txt bundle
// ---------------------------------------------------------------------------

/// Split an `llms-full.txt` bundle at its H1 headings.
///
/// Headings inside fenced code blocks are ignored. Blank sections are
/// dropped. A document without any H1 yields a single untitled section.
pub fn split_llms_full(content: &str) -> Vec<LlmsFullSection> {
    let mut sections = Vec::new();
    let mut title: Option<String> = None;
    let mut buf = String::new();
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let heading = (!in_fence && !line.starts_with("##"))
            .then(|| H1_RE.captures(line.trim_end()))
            .flatten();

        if let Some(caps) = heading {
            push_section(&mut sections, title.take(), &buf);
            buf.clear();
            title = Some(caps[1].trim().to_string());
        }

        buf.push_str(line);
        buf.push('\n');
    }
    push_section(&mut sections, title, &buf);

    sections
}

fn push_section(out: &mut Vec<LlmsFullSection>, title: Option<String>, content: &str) {
    let content = content.trim();
    if content.is_empty() {
        return;
    }
    out.push(LlmsFullSection {
        title,
        content: content.to_string(),
    });
}

/// Synthesized URL for the `index`-th section of a bundle: `<url>#section-<n>-<slug>`.
pub fn section_url(base: &str, index: usize, title: Option<&str>) -> String {
    let base = base.split('#').next().unwrap_or(base);
    let slug = title.map(slugify).unwrap_or_default();
    if slug.is_empty() {
        format!("{base}#section-{index}")
    } else {
        format!("{base}#section-{index}-{slug}")
    }
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
