//! Query-aware snippet selection.
//!
//! Splits a document body into paragraph-sized pieces, picks the piece that
//! mentions the most distinct query terms, and trims it to the configured
//! length around the first match. Cut ends are marked with `…`.

const ELLIPSIS: char = '…';

/// Build a snippet of at most `max_chars` characters from `body`.
pub fn make_snippet(body: &str, query: &str, max_chars: usize) -> String {
    let terms = query_terms(query);
    let pieces = split_pieces(body, max_chars.max(1) * 2);

    let best = pieces
        .iter()
        .enumerate()
        .max_by_key(|(i, piece)| (overlap(piece, &terms), std::cmp::Reverse(*i)))
        .map(|(_, piece)| *piece)
        .unwrap_or("");

    let flat = flatten(best);
    if flat.chars().count() <= max_chars {
        return flat;
    }
    window(&flat, &terms, max_chars)
}

/// Lowercased alphanumeric query tokens of two or more characters, deduplicated.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in query.split(|c: char| !c.is_alphanumeric()) {
        if token.chars().count() < 2 {
            continue;
        }
        let lower = token.to_lowercase();
        if !terms.contains(&lower) {
            terms.push(lower);
        }
    }
    terms
}

/// Paragraphs, with paragraphs longer than `max_piece` hard-split at
/// whitespace.
fn split_pieces(body: &str, max_piece: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    for para in body.split("\n\n") {
        let mut remaining = para.trim();
        while !remaining.is_empty() {
            let split_at = remaining
                .char_indices()
                .nth(max_piece)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
            let actual = if split_at < remaining.len() {
                remaining[..split_at]
                    .rfind(char::is_whitespace)
                    .filter(|&pos| pos > 0)
                    .unwrap_or(split_at)
            } else {
                split_at
            };
            pieces.push(remaining[..actual].trim());
            remaining = remaining[actual..].trim_start();
        }
    }
    pieces
}

fn overlap(piece: &str, terms: &[String]) -> usize {
    let lower = piece.to_lowercase();
    terms.iter().filter(|t| lower.contains(t.as_str())).count()
}

fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn window(flat: &str, terms: &[String], max_chars: usize) -> String {
    let chars: Vec<char> = flat.chars().collect();
    let lower: Vec<char> = chars
        .iter()
        .map(|c| c.to_lowercase().next().unwrap_or(*c))
        .collect();

    let hit = terms
        .iter()
        .filter_map(|t| find(&lower, &t.chars().collect::<Vec<_>>()))
        .min()
        .unwrap_or(0);

    // Room for an ellipsis on both ends.
    let budget = max_chars.saturating_sub(2).max(1);
    let mut start = hit.saturating_sub(budget / 4);
    if start + budget > chars.len() {
        start = chars.len().saturating_sub(budget);
    }
    if start > 0 {
        if let Some(space) = chars[start..hit.max(start)].iter().position(|c| *c == ' ') {
            start += space + 1;
        }
    }
    let mut end = (start + budget).min(chars.len());
    if end < chars.len() {
        if let Some(space) = chars[start..end].iter().rposition(|c| *c == ' ') {
            if space > 0 {
                end = start + space;
            }
        }
    }

    let mut out = String::with_capacity(max_chars * 4);
    if start > 0 {
        out.push(ELLIPSIS);
    }
    out.extend(chars[start..end].iter());
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if end < chars.len() {
        out.push(ELLIPSIS);
    }
    out
}

fn find(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
