// src/links/markdown.rs
// =============================================================================
// Link extraction for text/markdown bodies, using pulldown-cmark.
//
// pulldown-cmark needs the whole document (a link reference definition can
// come after its use), so chunks are buffered and parsed at finish(). The
// buffer stops growing at `limit` bytes; only that prefix is searched.
// Inline links become tag "a", images become tag "img".
// =============================================================================

use super::{normalize_link, FoundLink};
use pulldown_cmark::{Event, Parser, Tag};
use tracing::debug;
use url::Url;

pub(super) struct MarkdownCollector {
    base: Url,
    text: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl MarkdownCollector {
    pub(super) fn new(base: Url, limit: usize) -> Self {
        Self {
            base,
            text: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(super) fn feed(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() > room {
            debug!(limit = self.limit, "markdown body too large, searching only the start for links");
            self.truncated = true;
        }
        self.text.extend_from_slice(&chunk[..room.min(chunk.len())]);
    }

    pub(super) fn finish(&mut self, found: &mut Vec<FoundLink>) {
        let text = String::from_utf8_lossy(&self.text);

        for event in Parser::new(&text) {
            // In pulldown-cmark 0.9, Link and Image are Tag::Link(link_type, dest_url, title)
            let (tag, dest, title) = match event {
                Event::Start(Tag::Link(_, dest, title)) => ("a", dest, title),
                Event::Start(Tag::Image(_, dest, title)) => ("img", dest, title),
                _ => continue,
            };

            if let Some(target) = normalize_link(&self.base, &dest) {
                let title = title.trim();
                found.push(FoundLink {
                    target,
                    tag: tag.to_string(),
                    title: (!title.is_empty()).then(|| title.to_string()),
                });
            }
        }

        self.text.clear();
    }
}
