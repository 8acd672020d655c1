//! Boundary-aware markdown chunking.
//!
//! `chunk_size` is an upper bound in characters. Each chunk is cut from a
//! window of at most `chunk_size` characters, preferring (in order):
//! 1. the start of a code fence (backtick or tilde) still open at the window end
//! 2. the last paragraph break (`\n\n`)
//! 3. the last line break
//! 4. the last sentence end (`. `)
//!
//! A boundary only counts when it lies past 30% of the window, so chunks
//! never degenerate into slivers. With no usable boundary the window is
//! cut hard at `chunk_size` characters.

/// Minimum share of the window a boundary cut must keep, in percent.
const MIN_CUT_PERCENT: usize = 30;

/// Split `text` into trimmed, non-empty chunks of at most `chunk_size` characters.
pub fn smart_chunk(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let window_end = byte_offset(rest, chunk_size);
        let cut = if window_end == rest.len() {
            window_end
        } else {
            let window = &rest[..window_end];
            let min_cut = byte_offset(window, chunk_size * MIN_CUT_PERCENT / 100);
            find_boundary(window, min_cut).unwrap_or(window_end)
        };

        let chunk = rest[..cut].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = &rest[cut..];
    }

    chunks
}

/// Byte offset of the `n`-th char, or the string length if it is shorter.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(idx, _)| idx)
}

fn find_boundary(window: &str, min_cut: usize) -> Option<usize> {
    let candidates = [
        open_fence_start(window),
        window.rfind("\n\n").map(|i| i + 2),
        window.rfind('\n').map(|i| i + 1),
        window.rfind(". ").map(|i| i + 2),
    ];

    candidates
        .into_iter()
        .flatten()
        .find(|&cut| cut > min_cut)
}

/// Byte offset of the line that opens a fence left unclosed in `window`.
///
/// Backtick and tilde fences are tracked separately: a fence only closes on
/// the marker that opened it.
fn open_fence_start(window: &str) -> Option<usize> {
    let mut open: Option<(usize, &str)> = None;
    let mut offset = 0;

    for line in window.split_inclusive('\n') {
        if let Some(marker) = fence_marker(line) {
            open = match open {
                Some((_, opened)) if opened == marker => None,
                Some(still_open) => Some(still_open),
                None => Some((offset, marker)),
            };
        }
        offset += line.len();
    }

    open.map(|(start, _)| start)
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let line = line.trim_start();
    ["```", "~~~"].into_iter().find(|marker| line.starts_with(marker))
}
