//! Cleanup passes applied to every markdown document before chunking.
//!
//! Each pass is a `&str -> String` function; [`run_pipeline`] applies them
//! in order. Passes that rewrite prose leave fenced code untouched.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Lines that are UI residue from docs sites rather than content.
const BOILERPLATE_LINES: &[&str] = &[
    "copy",
    "copy code",
    "copied!",
    "edit this page",
    "on this page",
    "table of contents",
    "skip to main content",
    "was this page helpful?",
];

/// Run every cleanup pass on raw markdown text.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let mut result = normalize_line_endings(md);

    result = strip_invisible_chars(&result);
    result = fix_code_fence_languages(&result);
    result = map_prose_lines(&result, strip_html_tags);
    result = drop_boilerplate_lines(&result);
    result = resolve_links(&result, base_url);
    result = trim_trailing_whitespace(&result);
    result = collapse_blank_lines(&result);

    format!("{}\n", result.trim_matches('\n'))
}

fn normalize_line_endings(md: &str) -> String {
    md.replace("\r\n", "\n").replace('\r', "\n")
}

/// Remove zero-width characters and turn non-breaking spaces into spaces.
fn strip_invisible_chars(md: &str) -> String {
    md.chars()
        .filter(|c| !matches!(c, '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}'))
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .collect()
}

/// Rewrite class-style fence hints (`language-js`, `lang-py`) to bare names.
fn fix_code_fence_languages(md: &str) -> String {
    static LANG_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^(\s*```)(?:language-|lang-|highlight-)([\w+#-]+)").expect("valid regex")
    });

    LANG_PREFIX_RE.replace_all(md, "$1$2").to_string()
}

/// Apply `f` to every line outside fenced code blocks.
fn map_prose_lines(md: &str, f: impl Fn(&str) -> String) -> String {
    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.to_string();
            }
            if in_fence { line.to_string() } else { f(line) }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip layout tags that survived conversion, keeping their text.
fn strip_html_tags(line: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|p|br|sup|sub)(?:\s[^>]*)?/?>",
        )
        .expect("valid regex")
    });

    HTML_TAG_RE.replace_all(line, "").to_string()
}

fn drop_boilerplate_lines(md: &str) -> String {
    let mut in_fence = false;
    md.lines()
        .filter(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return true;
            }
            in_fence || !BOILERPLATE_LINES.contains(&line.trim().to_lowercase().as_str())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve relative link targets against the page URL. Images are left alone.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    map_prose_lines(md, |line| {
        LINK_RE
            .replace_all(line, |caps: &regex::Captures| {
                let href = &caps[3];
                let keep = !caps[1].is_empty()
                    || href.starts_with('#')
                    || href.contains("://")
                    || href.starts_with("mailto:");
                if keep {
                    return caps[0].to_string();
                }
                match base.join(href) {
                    Ok(resolved) => format!("[{}]({resolved})", &caps[2]),
                    Err(_) => caps[0].to_string(),
                }
            })
            .to_string()
    })
}

fn trim_trailing_whitespace(md: &str) -> String {
    md.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

/// Collapse runs of blank lines to a single blank line (one paragraph break).
fn collapse_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invisible_chars_removed() {
        assert_eq!(strip_invisible_chars("a\u{200b}b\u{a0}c\u{feff}"), "ab c");
    }

    #[test]
    fn fence_language_prefix_stripped() {
        let input = "```language-javascript\nconsole.log('hi');\n```";
        assert!(fix_code_fence_languages(input).starts_with("```javascript"));

        let plain = "```rust\nfn main() {}\n```";
        assert_eq!(fix_code_fence_languages(plain), plain);
    }

    #[test]
    fn html_tags_stripped_outside_fences_only() {
        let input = "<div class=\"note\">Important info</div>\n```html\n<div>Preserved</div>\n```";
        let result = map_prose_lines(input, strip_html_tags);
        assert!(result.starts_with("Important info\n"));
        assert!(result.contains("<div>Preserved</div>"));
    }

    #[test]
    fn boilerplate_lines_dropped() {
        let input = "Intro\nCopy\n```\nCopy\n```\nEdit this page";
        assert_eq!(drop_boilerplate_lines(input), "Intro\n```\nCopy\n```");
    }

    #[test]
    fn links_resolved_but_images_and_anchors_kept() {
        let base = Url::parse("https://docs.example.com/guide/intro").unwrap();
        let input = "[Next](/api/reference) ![logo](img.png) [Sec](#s) [Ext](https://other.com/)";
        let result = resolve_links(input, Some(&base));
        assert_eq!(
            result,
            "[Next](https://docs.example.com/api/reference) ![logo](img.png) [Sec](#s) [Ext](https://other.com/)"
        );
    }

    #[test]
    fn blank_lines_collapse_to_paragraph_breaks() {
        assert_eq!(collapse_blank_lines("A\n\n\n\n\nB\n\nC"), "A\n\nB\n\nC");
    }

    #[test]
    fn full_pipeline() {
        let input = "# Title\r\n\r\n\r\n\r\n## Section   \n\n<span>Some content</span>\n\n```lang-python\nprint('hi')\n```\n\n\n";
        let base = Url::parse("https://example.com/page").unwrap();
        let result = run_pipeline(input, Some(&base));

        assert_eq!(
            result,
            "# Title\n\n## Section\n\nSome content\n\n```python\nprint('hi')\n```\n"
        );
    }
}
