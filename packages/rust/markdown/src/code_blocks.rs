//! Fenced code block extraction.

/// One fenced code block and the prose around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Info string language (`rust` in ```` ```rust ````), if any.
    pub language: Option<String>,
    /// Code between the fences, without the fence lines.
    pub code: String,
    /// Up to `context_chars` characters of text before the block.
    pub context_before: String,
    /// Up to `context_chars` characters of text after the block.
    pub context_after: String,
}

struct Fence {
    marker: char,
    len: usize,
    language: Option<String>,
    /// Byte offset of the opening fence line.
    start: usize,
    /// Byte offset of the first code line.
    body_start: usize,
}

/// Find fenced code blocks whose trimmed code is at least `min_len` characters.
///
/// Both backtick and tilde fences are recognized. A fence left open at the
/// end of the document is ignored.
pub fn extract_code_blocks(md: &str, min_len: usize, context_chars: usize) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<Fence> = None;
    let mut offset = 0;

    for line in md.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();

        match open.as_ref() {
            None => {
                if let Some((marker, len, info)) = parse_fence(trimmed) {
                    let language = info
                        .split_whitespace()
                        .next()
                        .map(|l| l.trim_start_matches('{').trim_end_matches('}').to_lowercase())
                        .filter(|l| !l.is_empty());
                    open = Some(Fence {
                        marker,
                        len,
                        language,
                        start: line_start,
                        body_start: offset,
                    });
                }
            }
            Some(fence) => {
                let closes = parse_fence(trimmed).is_some_and(|(marker, len, info)| {
                    marker == fence.marker && len >= fence.len && info.is_empty()
                });
                if !closes {
                    continue;
                }
                let code = md[fence.body_start..line_start].trim_matches('\n');
                if code.trim().chars().count() >= min_len {
                    blocks.push(CodeBlock {
                        language: fence.language.clone(),
                        code: code.to_string(),
                        context_before: tail_chars(&md[..fence.start], context_chars),
                        context_after: head_chars(&md[offset..], context_chars),
                    });
                }
                open = None;
            }
        }
    }

    blocks
}

/// `(marker, run length, info string)` for a fence line.
fn parse_fence(line: &str) -> Option<(char, usize, &str)> {
    let marker = line.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = line.chars().take_while(|c| *c == marker).count();
    if len < 3 {
        return None;
    }
    let info = line[len..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some((marker, len, info))
}

fn tail_chars(s: &str, n: usize) -> String {
    let s = s.trim();
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(n)).collect::<String>().trim().to_string()
}

fn head_chars(s: &str, n: usize) -> String {
    s.trim().chars().take(n).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Setup\n\nInstall the client first.\n\n```rust\nfn main() {\n    println!(\"hello\");\n}\n```\n\nThen run it.\n\n~~~\nshort\n~~~\n";

    #[test]
    fn extracts_blocks_with_language_and_context() {
        let blocks = extract_code_blocks(DOC, 10, 100);
        assert_eq!(blocks.len(), 1);

        let block = &blocks[0];
        assert_eq!(block.language.as_deref(), Some("rust"));
        assert_eq!(block.code, "fn main() {\n    println!(\"hello\");\n}");
        assert_eq!(block.context_before, "# Setup\n\nInstall the client first.");
        assert!(block.context_after.starts_with("Then run it."));
    }

    #[test]
    fn min_len_filters_short_blocks() {
        assert_eq!(extract_code_blocks(DOC, 1, 0).len(), 2);
        assert!(extract_code_blocks(DOC, 1000, 0).is_empty());
    }

    #[test]
    fn context_is_limited() {
        let blocks = extract_code_blocks(DOC, 10, 6);
        assert_eq!(blocks[0].context_before, "first.");
        assert_eq!(blocks[0].context_after, "Then r");
    }

    #[test]
    fn longer_fences_nest_shorter_ones() {
        let md = "````markdown\n```js\nconsole.log(1)\n```\n````\n";
        let blocks = extract_code_blocks(md, 1, 0);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language.as_deref(), Some("markdown"));
        assert!(blocks[0].code.contains("```js"));
    }

    #[test]
    fn unclosed_fence_is_ignored() {
        assert!(extract_code_blocks("```python\nprint(1)\n", 1, 10).is_empty());
    }
}
