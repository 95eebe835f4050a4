//! Raw content → [`Document`].
//!
//! Normalization is a pure function of `(source_kind, source_path, bytes,
//! content_type)`: the same input always yields the same `id`, `title`,
//! `body_text` and `content_hash`.
//!
//! - binary office formats go through [`extract`](crate::extract)
//! - HTML goes through readability extraction, with the text of the
//!   page's main content element as fallback for pages readability rejects
//! - plain text is decoded as UTF-8, falling back to Latin-1
//!
//! Body text is then whitespace-normalized (single spaces within a line,
//! one blank line between paragraphs) and cut to `max_body_chars`.

use scraper::{ElementRef, Html, Node, Selector};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::RetrievalError;
use crate::extract::{self, content_type_for_path, MIME_HTML, MIME_PDF};
use crate::models::{Document, RawContent, SourceKind};

const MAX_TITLE_CHARS: usize = 120;

/// Stable document id: hex SHA-256 over `source_kind` and `source_path`.
pub fn document_id(kind: SourceKind, source_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(source_path.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn content_hash(body_text: &str) -> String {
    hex::encode(Sha256::digest(body_text.as_bytes()))
}

/// Normalize fetched content. `Ok(None)` means the content held no text
/// worth indexing; an error means it could not be parsed at all. Either
/// way the caller skips the path.
pub fn normalize(
    kind: SourceKind,
    source_path: &str,
    raw: &RawContent,
    max_body_chars: usize,
) -> Result<Option<Document>, RetrievalError> {
    let fail = |reason: String| RetrievalError::ContentExtractionFailed {
        source_path: source_path.to_string(),
        reason,
    };

    let (mime, charset) = parse_content_type(&raw.content_type);
    let mime = effective_mime(&mime, source_path, &raw.bytes);

    let (title, text) = if extract::is_binary_document(&mime) {
        let text = extract::extract_text(&raw.bytes, &mime).map_err(|e| fail(e.to_string()))?;
        (None, text)
    } else if mime == MIME_HTML || mime == "application/xhtml+xml" {
        let html = decode_text(&raw.bytes, charset.as_deref());
        html_to_text(&html)
    } else if mime.starts_with("text/") {
        (None, decode_text(&raw.bytes, charset.as_deref()))
    } else {
        return Err(fail(format!("unsupported content-type: {}", mime)));
    };

    let body_text = truncate_chars(&normalize_whitespace(&text), max_body_chars);
    if body_text.is_empty() {
        return Ok(None);
    }

    let title = title
        .map(|t| collapse_inline(&t))
        .filter(|t| !t.is_empty())
        .or_else(|| raw.title_hint.clone())
        .unwrap_or_else(|| fallback_title(&body_text, source_path));

    Ok(Some(Document {
        id: document_id(kind, source_path),
        source_kind: kind,
        source_path: source_path.to_string(),
        uri: raw.uri.clone(),
        title,
        content_hash: content_hash(&body_text),
        body_text,
    }))
}

/// Lowercased MIME essence and optional charset parameter.
fn parse_content_type(content_type: &str) -> (String, Option<String>) {
    let mut parts = content_type.split(';');
    let mime = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let charset = parts.find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| v.trim().trim_matches('"').to_ascii_lowercase())
    });
    (mime, charset)
}

/// Servers label files generically; fall back to the path's extension and
/// the PDF magic number.
fn effective_mime(mime: &str, source_path: &str, bytes: &[u8]) -> String {
    if bytes.starts_with(b"%PDF-") {
        return MIME_PDF.to_string();
    }
    if mime.is_empty() || mime == "application/octet-stream" || mime == "binary/octet-stream" {
        let path = source_path.split(['?', '#']).next().unwrap_or_default();
        return content_type_for_path(Path::new(path)).to_string();
    }
    mime.to_string()
}

/// UTF-8 unless the charset says Latin-1, and Latin-1 whenever the bytes
/// are not valid UTF-8.
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    let latin1 = matches!(
        charset,
        Some("iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252")
    );
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if !latin1 {
        if let Ok(s) = std::str::from_utf8(bytes) {
            return s.to_string();
        }
    }
    bytes.iter().map(|&b| b as char).collect()
}

/// Title and readable text of an HTML page.
fn html_to_text(html: &str) -> (Option<String>, String) {
    let document = Html::parse_document(html);
    let page_title = html_title(&document);

    let readable = dom_smoothie::Readability::new(html, None, None)
        .and_then(|mut r| r.parse())
        .map(|article| {
            let text: String = article.text_content.into();
            (article.title, text)
        });

    match readable {
        Ok((title, text)) if !text.trim().is_empty() => {
            let title = Some(title).filter(|t| !t.trim().is_empty()).or(page_title);
            (title, text)
        }
        Ok(_) => (page_title, markup_text(&document)),
        Err(e) => {
            tracing::debug!(error = %e, "readability failed, falling back to markup text");
            (page_title, markup_text(&document))
        }
    }
}

fn html_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let title: String = document.select(&selector).next()?.text().collect();
    let title = collapse_inline(&title);
    (!title.is_empty()).then_some(title)
}

/// Elements whose content is navigation or code, never document text.
const DROPPED_ELEMENTS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "noscript", "template", "svg", "head",
];
/// Elements that end a paragraph.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "li", "ul", "ol", "table", "tr", "h1", "h2", "h3",
    "h4", "h5", "h6", "blockquote", "pre", "dd", "dt", "figure",
];

/// Text of the page's main content area, or of `<body>` when it has none.
/// Drops [`DROPPED_ELEMENTS`], turns block elements into paragraph breaks
/// and `<br>` into line breaks.
pub fn markup_text(document: &Html) -> String {
    let content = Selector::parse("main, article, [role='main']")
        .ok()
        .and_then(|s| document.select(&s).next())
        .or_else(|| {
            Selector::parse("body")
                .ok()
                .and_then(|s| document.select(&s).next())
        })
        .unwrap_or_else(|| document.root_element());

    let mut out = String::new();
    collect_text(content, &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child.value().name();
                if DROPPED_ELEMENTS.contains(&name) {
                    out.push_str("\n\n");
                } else if name == "br" {
                    out.push('\n');
                } else if BLOCK_ELEMENTS.contains(&name) {
                    out.push_str("\n\n");
                    collect_text(child, out);
                    out.push_str("\n\n");
                } else {
                    collect_text(child, out);
                    if name == "td" || name == "th" {
                        out.push(' ');
                    }
                }
            }
            _ => {}
        }
    }
}

/// Collapse runs of horizontal whitespace to one space, trim every line,
/// and separate paragraphs by exactly one blank line.
pub fn normalize_whitespace(text: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in text.split('\n') {
        let line = collapse_inline(line);
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs.join("\n\n")
}

fn collapse_inline(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut pending_space = false;
    for c in line.chars() {
        if c.is_whitespace() || c.is_control() {
            pending_space = true;
        } else {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        }
    }
    out
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].trim_end().to_string(),
        None => s.to_string(),
    }
}

fn fallback_title(body_text: &str, source_path: &str) -> String {
    let first_line = body_text.lines().next().unwrap_or_default();
    let first_line = first_line.trim_start_matches('#').trim();
    if first_line.is_empty() {
        source_path.to_string()
    } else {
        truncate_chars(first_line, MAX_TITLE_CHARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bytes: &[u8], content_type: &str) -> RawContent {
        RawContent {
            bytes: bytes.to_vec(),
            content_type: content_type.to_string(),
            uri: "file:///mnt/share/x".to_string(),
            title_hint: None,
        }
    }

    #[test]
    fn same_input_same_identity() {
        let r = raw(b"Fertigungsverfahren\n\nDrehen und Fraesen", "text/plain");
        let a = normalize(SourceKind::Share, "a.txt", &r, 1000)
            .unwrap()
            .unwrap();
        let b = normalize(SourceKind::Share, "a.txt", &r, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a, b);
    }

    #[test]
    fn id_depends_on_kind_and_path_only() {
        assert_ne!(
            document_id(SourceKind::Share, "a"),
            document_id(SourceKind::Wiki, "a")
        );
        assert_ne!(
            document_id(SourceKind::Share, "a"),
            document_id(SourceKind::Share, "b")
        );
        assert_eq!(document_id(SourceKind::Share, "a").len(), 64);
    }

    #[test]
    fn whitespace_rules() {
        let text = "  Erste   Zeile\t mit  Tabs \r\nzweite Zeile\n\n\n\n  Absatz zwei  \n";
        assert_eq!(
            normalize_whitespace(text),
            "Erste Zeile mit Tabs\nzweite Zeile\n\nAbsatz zwei"
        );
    }

    #[test]
    fn empty_content_yields_none() {
        let r = raw(b" \n\t \n", "text/plain");
        assert!(normalize(SourceKind::Share, "e.txt", &r, 1000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_pdf_is_extraction_failure() {
        let r = raw(b"%PDF-1.4 garbage", "application/pdf");
        let err = normalize(SourceKind::Share, "broken.pdf", &r, 1000).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::ContentExtractionFailed { .. }
        ));
    }

    #[test]
    fn unsupported_type_is_extraction_failure() {
        let r = raw(&[0, 1, 2, 3], "image/png");
        assert!(normalize(SourceKind::Wiki, "logo.png", &r, 1000).is_err());
    }

    #[test]
    fn latin1_fallback() {
        let r = raw(b"Gr\xfc\xdfe aus M\xfcnchen", "text/plain");
        let doc = normalize(SourceKind::Share, "l.txt", &r, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(doc.body_text, "Grüße aus München");
    }

    #[test]
    fn octet_stream_uses_extension() {
        let r = raw(b"plain notes", "application/octet-stream");
        let doc = normalize(SourceKind::PublicPortal, "files/notes.txt?dl=1", &r, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(doc.body_text, "plain notes");
    }

    #[test]
    fn truncation_is_char_safe() {
        let r = raw("äöü".repeat(10).as_bytes(), "text/plain; charset=utf-8");
        let doc = normalize(SourceKind::Share, "u.txt", &r, 4)
            .unwrap()
            .unwrap();
        assert_eq!(doc.body_text, "äöüä");
    }

    #[test]
    fn markup_text_drops_chrome() {
        let html = r#"<html><head><title>Ignored</title><style>p{}</style></head>
<body><nav><a href="/">Home</a></nav><header>Logo</header>
<p>Laserschneiden &amp; Fr&auml;sen</p><script>alert(1)</script>
<div>Zweiter<br>Absatz</div><footer>Impressum</footer></body></html>"#;
        let text = normalize_whitespace(&markup_text(&Html::parse_document(html)));
        assert!(!text.contains("Ignored"));
        assert!(!text.contains("Home"));
        assert!(!text.contains("Logo"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("Impressum"));
        assert!(text.contains("& Fräsen"));
        assert!(text.contains("Zweiter\nAbsatz"));
    }

    #[test]
    fn markup_text_decodes_named_entities() {
        let html = "<html><body><p>Caf&eacute; &ndash; 5&euro; &copy; FAPS</p></body></html>";
        let text = normalize_whitespace(&markup_text(&Html::parse_document(html)));
        assert_eq!(text, "Café – 5€ © FAPS");

        let doc = normalize(SourceKind::PublicPortal, "cafe", &raw(html.as_bytes(), "text/html"), 1000)
            .unwrap()
            .unwrap();
        assert!(doc.body_text.contains("Café – 5€ © FAPS"));
    }

    #[test]
    fn markup_text_prefers_main_content() {
        let html = "<html><body><div>Seitenleiste</div><main><p>Hauptinhalt</p></main></body></html>";
        let text = normalize_whitespace(&markup_text(&Html::parse_document(html)));
        assert_eq!(text, "Hauptinhalt");
    }

    #[test]
    fn html_title_from_head() {
        let page = b"<html><head><title> Wissen &amp; Fertigung </title></head><body><p>Inhalt der Seite.</p></body></html>";
        let doc = normalize(SourceKind::PublicPortal, "wissen", &raw(page, "text/html; charset=utf-8"), 1000)
            .unwrap()
            .unwrap();
        assert_eq!(doc.title, "Wissen & Fertigung");
        assert!(doc.body_text.contains("Inhalt der Seite."));
    }

    #[test]
    fn title_falls_back_to_hint_then_first_line() {
        let mut r = raw(b"# Heading line\n\nbody", "text/markdown");
        let doc = normalize(SourceKind::Share, "h.md", &r, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(doc.title, "Heading line");

        r.title_hint = Some("h.md".into());
        let doc = normalize(SourceKind::Share, "h.md", &r, 1000)
            .unwrap()
            .unwrap();
        assert_eq!(doc.title, "h.md");
    }
}
