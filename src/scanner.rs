//! Boundary scanner: locates top-level CTEs in a `WITH …` query.
//!
//! The scanner does not parse SQL. It walks the text keeping a parenthesis
//! depth counter and recognises three things:
//!
//! 1. at depth zero, the next `(` opens a CTE body; the CTE name is the first
//!    `<identifier> AS` in the text since the previous CTE ended,
//! 2. the body ends where the depth first returns to zero,
//! 3. a `,` immediately after the closing `)` means another CTE follows;
//!    anything else makes this the final CTE.
//!
//! Parentheses inside `'…'` literals, `"…"` identifiers, `--` line comments
//! and `/* */` block comments are not counted, and comments are ignored when
//! looking for the CTE name.
//! Malformed trailing text ends extraction silently: whatever was collected
//! so far is returned and the rest of the text is the recomposition query.

use std::sync::OnceLock;

use regex_lite::Regex;

/// Byte span of one CTE body, excluding the surrounding parentheses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CteSpan {
    pub name: String,
    /// Offset of the first byte after `(`.
    pub start: usize,
    /// Offset of the closing `)`.
    pub end: usize,
}

impl CteSpan {
    pub fn body<'a>(&self, query: &'a str) -> &'a str {
        &query[self.start..self.end]
    }
}

fn cte_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\w+)\s+as\b").unwrap_or_else(|e| panic!("invalid CTE name pattern: {e}"))
    })
}

/// First `<identifier> AS` in `chunk`, ignoring comments.
fn cte_name(chunk: &str) -> Option<String> {
    cte_name_pattern()
        .captures(&strip_comments(chunk))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Where a comment starting at `i` ends (exclusive), if one starts there.
fn skip_comment(bytes: &[u8], i: usize) -> Option<usize> {
    let end = match bytes.get(i..i + 2)? {
        [b'-', b'-'] => find_from(bytes, i + 2, b"\n").map(|e| e + 1),
        [b'/', b'*'] => find_from(bytes, i + 2, b"*/").map(|e| e + 2),
        _ => return None,
    };
    Some(end.unwrap_or(bytes.len()))
}

/// Where an opaque region starting at `i` ends (exclusive): a comment, a
/// `'…'` literal or a `"…"` identifier. Unterminated regions run to the end.
fn skip_opaque(bytes: &[u8], i: usize) -> Option<usize> {
    match *bytes.get(i)? {
        quote @ (b'\'' | b'"') => Some(
            find_from(bytes, i + 1, &[quote])
                .map(|e| e + 1)
                .unwrap_or(bytes.len()),
        ),
        _ => skip_comment(bytes, i),
    }
}

/// `chunk` with every comment replaced by a single space.
fn strip_comments(chunk: &str) -> String {
    let bytes = chunk.as_bytes();
    let mut out = String::with_capacity(chunk.len());
    let (mut copied, mut i) = (0, 0);
    while i < bytes.len() {
        match skip_comment(bytes, i) {
            Some(end) => {
                out.push_str(&chunk[copied..i]);
                out.push(' ');
                copied = end;
                i = end;
            }
            None => i += 1,
        }
    }
    out.push_str(&chunk[copied..]);
    out
}

/// Find the next `(` at or after `from`, skipping opaque regions.
fn next_open_paren(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        if let Some(end) = skip_opaque(bytes, i) {
            i = end;
            continue;
        }
        if bytes[i] == b'(' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Find the `)` that brings the depth back to zero, starting at the `(`
/// at `open`. Returns `None` when the text ends first.
fn matching_close_paren(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut i = open;
    while i < bytes.len() {
        if let Some(end) = skip_opaque(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Locate every top-level CTE in `query`, in declaration order.
///
/// Returns an empty vector if the text contains no recognisable boundary.
pub fn cte_boundaries(query: &str) -> Vec<CteSpan> {
    let bytes = query.as_bytes();
    let mut spans = Vec::new();
    let mut chunk_start = 0;

    loop {
        let Some(open) = next_open_paren(bytes, chunk_start) else {
            return spans;
        };
        let Some(name) = cte_name(&query[chunk_start..open]) else {
            return spans;
        };
        let Some(close) = matching_close_paren(bytes, open) else {
            return spans;
        };
        spans.push(CteSpan {
            name,
            start: open + 1,
            end: close,
        });

        let next = close + 1;
        if bytes.get(next) != Some(&b',') {
            return spans;
        }
        chunk_start = next;
    }
}

/// Split `query` into its CTE spans and the trailing recomposition text.
///
/// With no CTEs the whole text is the recomposition query.
pub fn split_query(query: &str) -> (Vec<CteSpan>, &str) {
    let spans = cte_boundaries(query);
    let recomposition = match spans.last() {
        Some(last) => &query[last.end + 1..],
        None => query,
    };
    (spans, recomposition)
}
