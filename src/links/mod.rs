// src/links/mod.rs
// =============================================================================
// Link extraction from response bodies.
//
// The checker feeds body chunks into a LinkParser as they arrive. Which
// extractor runs depends on the response's media type:
// - text/html, application/xhtml+xml, application/atom+xml: lol_html fed
//   chunk by chunk (html.rs)
// - text/markdown: pulldown-cmark over the buffered text, at finish(); at
//   most `max_buffered` bytes are kept
// - anything else: no links
//
// Extraction never fails the check. Scanner errors are counted; a second
// error at the same byte position, or too many errors overall, stops the
// scan and keeps what was already found.
// =============================================================================

mod html;
mod markdown;

use serde::{Deserialize, Serialize};
use url::Url;

/// A link found in a body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundLink {
    /// Absolute http(s) URI, fragment stripped.
    pub target: String,
    /// The element it came from ("a", "img", "link"...).
    pub tag: String,
    pub title: Option<String>,
}

enum Extractor {
    Html(html::TagScanner),
    Markdown(markdown::MarkdownCollector),
    Ignored,
}

pub struct LinkParser {
    extractor: Extractor,
    found: Vec<FoundLink>,
}

impl LinkParser {
    // `content_type` is the raw Content-Type header value, if any.
    pub fn new(base: &Url, content_type: Option<&str>, max_buffered: usize) -> Self {
        let media_type = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|mt| mt.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let extractor = match media_type.as_str() {
            "text/html" | "application/xhtml+xml" | "application/atom+xml" => {
                Extractor::Html(html::TagScanner::new(base.clone()))
            }
            "text/markdown" => Extractor::Markdown(markdown::MarkdownCollector::new(base.clone(), max_buffered)),
            _ => Extractor::Ignored,
        };

        Self {
            extractor,
            found: Vec::new(),
        }
    }

    /// True while the parser is still looking for links.
    pub fn is_active(&self) -> bool {
        match &self.extractor {
            Extractor::Html(scanner) => scanner.is_active(),
            Extractor::Markdown(_) => true,
            Extractor::Ignored => false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        match &mut self.extractor {
            Extractor::Html(scanner) => scanner.feed(chunk, &mut self.found),
            Extractor::Markdown(collector) => collector.feed(chunk),
            Extractor::Ignored => {}
        }
    }

    /// Signals the end of the body.
    pub fn finish(&mut self) {
        match &mut self.extractor {
            Extractor::Html(scanner) => scanner.finish(&mut self.found),
            Extractor::Markdown(collector) => collector.finish(&mut self.found),
            Extractor::Ignored => {}
        }
    }

    /// Takes the links found so far.
    pub fn drain(&mut self) -> Vec<FoundLink> {
        std::mem::take(&mut self.found)
    }

    /// Number of markup errors seen.
    pub fn error_count(&self) -> usize {
        match &self.extractor {
            Extractor::Html(scanner) => scanner.error_count(),
            _ => 0,
        }
    }

    /// True when extraction stopped early because of markup errors.
    pub fn abandoned(&self) -> bool {
        matches!(&self.extractor, Extractor::Html(scanner) if !scanner.is_active() && scanner.error_count() > 0)
    }
}

// Resolves `href` against `base` and returns it as a checkable URI.
//
// Returns None for empty references, fragment-only references, anything that
// doesn't resolve, and non-http(s) schemes (mailto:, javascript:, data:...).
pub(crate) fn normalize_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    let without_fragment = href.split('#').next().unwrap_or("");
    if without_fragment.is_empty() {
        return None;
    }

    let mut url = base.join(without_fragment).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/dir/page.html").unwrap()
    }

    #[test]
    fn test_normalize_link() {
        assert_eq!(
            normalize_link(&base(), "other.html#top"),
            Some("https://example.com/dir/other.html".to_string())
        );
        assert_eq!(
            normalize_link(&base(), "/a?x=1"),
            Some("https://example.com/a?x=1".to_string())
        );
        assert_eq!(normalize_link(&base(), "#section"), None);
        assert_eq!(normalize_link(&base(), "mailto:someone@example.com"), None);
        assert_eq!(normalize_link(&base(), "  "), None);
    }

    #[test]
    fn test_parser_selected_by_media_type() {
        let mut parser = LinkParser::new(&base(), Some("Text/HTML; charset=utf-8"), 1024);
        assert!(parser.is_active());
        parser.feed(b"<a href=\"/x\">x</a>");
        parser.finish();
        assert_eq!(parser.drain().len(), 1);

        let mut parser = LinkParser::new(&base(), Some("image/png"), 1024);
        assert!(!parser.is_active());
        parser.feed(b"<a href=\"/x\">x</a>");
        parser.finish();
        assert!(parser.drain().is_empty());

        let parser = LinkParser::new(&base(), None, 1024);
        assert!(!parser.is_active());
    }

    #[test]
    fn test_markdown_links() {
        let mut parser = LinkParser::new(&base(), Some("text/markdown"), 1024);
        parser.feed(b"See [the docs](docs/index.md \"Docs\") and ");
        parser.feed(b"![logo](https://cdn.example.com/logo.png).");
        parser.finish();
        let links = parser.drain();
        assert_eq!(
            links,
            vec![
                FoundLink {
                    target: "https://example.com/dir/docs/index.md".to_string(),
                    tag: "a".to_string(),
                    title: Some("Docs".to_string()),
                },
                FoundLink {
                    target: "https://cdn.example.com/logo.png".to_string(),
                    tag: "img".to_string(),
                    title: None,
                },
            ]
        );
    }
}
