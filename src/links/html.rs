// src/links/html.rs
// =============================================================================
// Streaming link extraction for HTML-ish bodies, on top of lol_html.
//
// Body chunks go straight into an HtmlRewriter (its output is thrown away).
// Element handlers pick up the link-carrying attributes:
//
//   <a href>  <img src>  <script src>  <frame src>  <iframe src>
//   <link href rel="stylesheet">      <base href> (changes the base URI)
//
// lol_html deals with tags split across chunks, comments, and the raw text of
// <script>/<style>. What it can't get past is a write() error (for example a
// tag bigger than the memory budget). That poisons the rewriter, so the
// scanner records the error at the byte offset of the chunk, builds a fresh
// rewriter and retries the chunk. A second error at the same offset, or more
// than MAX_ERRORS errors overall, ends extraction for this body.
// =============================================================================

use super::{normalize_link, FoundLink};
use lol_html::html_content::Element;
use lol_html::{element, HtmlRewriter, MemorySettings, OutputSink, Settings};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;
use url::Url;

// Bytes lol_html may hold on to while waiting for the rest of a tag.
const MAX_BUFFERED: usize = 1024 * 1024;
const MAX_ERRORS: usize = 16;

struct Discard;

impl OutputSink for Discard {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}

// Shared with the element handlers.
struct ScanState {
    base: Url,
    found: Vec<FoundLink>,
}

pub(super) struct TagScanner {
    state: Rc<RefCell<ScanState>>,
    rewriter: Option<HtmlRewriter<'static, Discard>>,
    memory_limit: usize,
    // absolute position of the next chunk in the body
    offset: usize,
    errors: usize,
    last_error_at: Option<usize>,
    active: bool,
}

impl TagScanner {
    pub(super) fn new(base: Url) -> Self {
        Self::with_memory_limit(base, MAX_BUFFERED)
    }

    fn with_memory_limit(base: Url, memory_limit: usize) -> Self {
        let state = Rc::new(RefCell::new(ScanState {
            base,
            found: Vec::new(),
        }));
        let rewriter = build_rewriter(&state, memory_limit);
        Self {
            state,
            rewriter: Some(rewriter),
            memory_limit,
            offset: 0,
            errors: 0,
            last_error_at: None,
            active: true,
        }
    }

    pub(super) fn is_active(&self) -> bool {
        self.active
    }

    pub(super) fn error_count(&self) -> usize {
        self.errors
    }

    pub(super) fn feed(&mut self, chunk: &[u8], found: &mut Vec<FoundLink>) {
        if !self.active {
            return;
        }
        let at = self.offset;
        self.offset += chunk.len();

        while let Some(rewriter) = self.rewriter.as_mut() {
            let result = rewriter.write(chunk);
            self.collect(found);
            match result {
                Ok(()) => break,
                Err(e) => {
                    debug!(position = at, error = %e, "link scan error");
                    self.rewriter = None;
                    if self.record_error(at) {
                        self.rewriter = Some(build_rewriter(&self.state, self.memory_limit));
                    }
                }
            }
        }
    }

    pub(super) fn finish(&mut self, found: &mut Vec<FoundLink>) {
        if let Some(rewriter) = self.rewriter.take() {
            if let Err(e) = rewriter.end() {
                debug!(position = self.offset, error = %e, "link scan error at end of body");
                self.record_error(self.offset);
            }
        }
        self.collect(found);
    }

    fn collect(&self, found: &mut Vec<FoundLink>) {
        found.append(&mut self.state.borrow_mut().found);
    }

    // Returns false once the scanner has given up.
    fn record_error(&mut self, position: usize) -> bool {
        self.errors += 1;
        if self.last_error_at == Some(position) || self.errors > MAX_ERRORS {
            debug!(errors = self.errors, "giving up on link extraction");
            self.active = false;
            self.rewriter = None;
            return false;
        }
        self.last_error_at = Some(position);
        true
    }
}

fn build_rewriter(state: &Rc<RefCell<ScanState>>, memory_limit: usize) -> HtmlRewriter<'static, Discard> {
    let link = |tag: &'static str, attr: &'static str| {
        let state = Rc::clone(state);
        element!(format!("{tag}[{attr}]"), move |el| {
            record_link(&state, el, attr);
            Ok(())
        })
    };
    let stylesheet = Rc::clone(state);
    let base = Rc::clone(state);

    HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                link("a", "href"),
                link("img", "src"),
                link("script", "src"),
                link("frame", "src"),
                link("iframe", "src"),
                element!("link[href]", move |el| {
                    let is_stylesheet = el
                        .get_attribute("rel")
                        .is_some_and(|rel| rel.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")));
                    if is_stylesheet {
                        record_link(&stylesheet, el, "href");
                    }
                    Ok(())
                }),
                element!("base[href]", move |el| {
                    if let Some(href) = el.get_attribute("href") {
                        let mut state = base.borrow_mut();
                        if let Ok(url) = state.base.join(html_escape::decode_html_entities(&href).trim()) {
                            state.base = url;
                        }
                    }
                    Ok(())
                }),
            ],
            memory_settings: MemorySettings {
                max_allowed_memory_usage: memory_limit,
                preallocated_parsing_buffer_size: memory_limit.min(1024),
            },
            ..Settings::default()
        },
        Discard,
    )
}

fn record_link(state: &RefCell<ScanState>, el: &Element<'_, '_>, attr: &str) {
    let Some(value) = el.get_attribute(attr) else {
        return;
    };
    let mut state = state.borrow_mut();
    let Some(target) = normalize_link(&state.base, &html_escape::decode_html_entities(&value)) else {
        return;
    };
    let title = el
        .get_attribute("title")
        .map(|t| html_escape::decode_html_entities(t.trim()).into_owned())
        .filter(|t| !t.is_empty());
    state.found.push(FoundLink {
        target,
        tag: el.tag_name(),
        title,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/dir/").unwrap()
    }

    fn scan_with(mut scanner: TagScanner, chunks: &[&[u8]]) -> (Vec<FoundLink>, TagScanner) {
        let mut found = Vec::new();
        for chunk in chunks {
            scanner.feed(chunk, &mut found);
        }
        scanner.finish(&mut found);
        (found, scanner)
    }

    fn scan_all(chunks: &[&[u8]]) -> (Vec<FoundLink>, TagScanner) {
        scan_with(TagScanner::new(base()), chunks)
    }

    fn targets(found: &[FoundLink]) -> Vec<&str> {
        found.iter().map(|l| l.target.as_str()).collect()
    }

    #[test]
    fn test_link_carrying_tags() {
        let html = br#"
            <html><head>
            <link rel="Icon" href="/favicon.ico">
            <link rel="alternate stylesheet" href="/print.css">
            <script src="app.js"></script>
            </head><body>
            <a href="page.html" title=" Next page ">next</a>
            <IMG SRC='/img/logo.png'>
            <iframe src="https://video.example.net/embed"></iframe>
            <frame src="frame.html"/>
            <a name="anchor-only">no link</a>
            <a href="mailto:me@example.com">mail</a>
            </body></html>
        "#;
        let (found, scanner) = scan_all(&[html]);
        assert_eq!(
            targets(&found),
            vec![
                "https://example.com/print.css",
                "https://example.com/dir/app.js",
                "https://example.com/dir/page.html",
                "https://example.com/img/logo.png",
                "https://video.example.net/embed",
                "https://example.com/dir/frame.html",
            ]
        );
        assert_eq!(found[2].tag, "a");
        assert_eq!(found[2].title.as_deref(), Some("Next page"));
        assert_eq!(found[3].tag, "img");
        assert_eq!(scanner.error_count(), 0);
    }

    #[test]
    fn test_tag_split_across_chunks() {
        let (found, _) = scan_all(&[b"<p>hello <a hr", b"ef=\"/spl", b"it\">x</a>"]);
        assert_eq!(targets(&found), vec!["https://example.com/split"]);
    }

    #[test]
    fn test_base_changes_resolution() {
        let (found, _) = scan_all(&[b"<base href=\"https://cdn.example.org/assets/\"><img src=\"a.png\">"]);
        assert_eq!(targets(&found), vec!["https://cdn.example.org/assets/a.png"]);
    }

    #[test]
    fn test_entities_are_decoded() {
        let (found, _) = scan_all(&[b"<a href=\"/search?a=1&amp;b=2\">s</a>"]);
        assert_eq!(targets(&found), vec!["https://example.com/search?a=1&b=2"]);
    }

    #[test]
    fn test_unquoted_value_keeps_trailing_slash() {
        let (found, _) = scan_all(&[b"<a href=/docs/>docs</a> <img src=/img/ />"]);
        assert_eq!(
            targets(&found),
            vec!["https://example.com/docs/", "https://example.com/img/"]
        );
    }

    #[test]
    fn test_comments_and_scripts_are_skipped() {
        let (found, scanner) = scan_all(&[
            b"<!-- <a href=\"/hidden\"> -",
            b"-> <script>if (a<b && c>d) { x = '<a href=\"/js\">'; }</scr",
            b"ipt><a href=\"/shown\">ok</a>",
        ]);
        assert_eq!(targets(&found), vec!["https://example.com/shown"]);
        assert_eq!(scanner.error_count(), 0);
    }

    #[test]
    fn test_long_inline_image_doesnt_hide_later_links() {
        let mut body = b"<img src=\"data:image/png;base64,".to_vec();
        body.extend(std::iter::repeat(b'A').take(40_000));
        body.extend_from_slice(b"\"><a href=\"/after\">after</a>");
        let chunks: Vec<&[u8]> = body.chunks(4096).collect();

        let (found, scanner) = scan_all(&chunks);
        assert_eq!(targets(&found), vec!["https://example.com/after"]);
        assert!(scanner.is_active());
        assert_eq!(scanner.error_count(), 0);
    }

    #[test]
    fn test_repeated_error_at_same_position_abandons() {
        let mut scanner = TagScanner::with_memory_limit(base(), 1024);
        let mut found = Vec::new();
        scanner.feed(b"<a href=\"/before\">ok</a>", &mut found);

        // a tag that can't fit in the budget fails again on the retry
        let mut runaway = b"<a href=\"".to_vec();
        runaway.extend(std::iter::repeat(b'x').take(5000));
        scanner.feed(&runaway, &mut found);
        assert_eq!(scanner.error_count(), 2);
        assert!(!scanner.is_active());

        // fed after giving up: ignored, and links found earlier are kept
        scanner.feed(b"\"><a href=\"/after\">", &mut found);
        scanner.finish(&mut found);
        assert_eq!(targets(&found), vec!["https://example.com/before"]);
    }

    #[test]
    fn test_recovered_errors_are_counted_then_abandon() {
        // each pair starts a tag that fits, then overflows the budget on the
        // next chunk; the retry of that chunk (plain text) succeeds
        let head = {
            let mut h = b"<a href=\"".to_vec();
            h.extend(std::iter::repeat(b'x').take(300));
            h
        };
        let tail = {
            let mut t: Vec<u8> = std::iter::repeat(b'y').take(1000).collect();
            t.extend_from_slice(b"\">");
            t
        };
        let mut chunks: Vec<&[u8]> = Vec::new();
        for _ in 0..MAX_ERRORS + 1 {
            chunks.push(&head);
            chunks.push(&tail);
        }
        let late = b"<a href=\"/late\">late</a>";
        chunks.push(late);

        let (found, scanner) = scan_with(TagScanner::with_memory_limit(base(), 1024), &chunks);
        assert_eq!(scanner.error_count(), MAX_ERRORS + 1);
        assert!(!scanner.is_active());
        assert!(found.is_empty());
    }
}
