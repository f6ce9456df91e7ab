// src/analysis/mod.rs
// =============================================================================
// Header analysis: turns a received message into parsed header values and an
// ordered list of diagnostic notes.
//
// The checker only depends on the aggregate HeaderAnalyzer contract. The
// StandardAnalyzer implements it with one HeaderHandler per known header
// (see headers.rs); unknown headers are kept as raw strings.
//
// Note ordering is deterministic: headers are visited in the order their
// name was first seen, each header's notes are kept in emission order, and
// message-level notes (Content-Length, then caching) come last.
// =============================================================================

mod cache;
mod headers;
pub mod notes;

pub use notes::{Category, Level, Note, NoteKind};

use crate::fetch::HeaderField;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// What a handler may need to know about the message besides the header.
pub struct MessageContext<'a> {
    pub status: u16,
    pub base_uri: &'a str,
    pub method: &'a str,
    pub request_headers: &'a [HeaderField],
    /// When the response head arrived; ages and clock skew are measured from here.
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError(pub String);

/// Collects the notes one header emits, tagged with that header as subject.
pub struct NoteSink<'a> {
    subject: &'a str,
    notes: &'a mut Vec<Note>,
}

impl<'a> NoteSink<'a> {
    pub fn new(subject: &'a str, notes: &'a mut Vec<Note>) -> Self {
        Self { subject, notes }
    }

    pub fn push(&mut self, kind: &NoteKind) {
        self.notes.push(kind.note(self.subject));
    }

    pub fn push_with(&mut self, kind: &NoteKind, params: &[(&str, &str)]) {
        let mut note = kind.note(self.subject);
        for (key, value) in params {
            note = note.with(key, *value);
        }
        self.notes.push(note);
    }
}

/// Parses and evaluates one header field.
pub trait HeaderHandler: Send + Sync {
    fn canonical_name(&self) -> &'static str;

    /// List headers may carry several comma-separated values per line.
    fn list_header(&self) -> bool {
        false
    }

    fn deprecated(&self) -> bool {
        false
    }

    fn parse(
        &self,
        value: &str,
        _ctx: &MessageContext<'_>,
        _notes: &mut NoteSink<'_>,
    ) -> Result<Value, SyntaxError> {
        Ok(Value::String(value.to_string()))
    }

    /// Looks at every value of the header across the message.
    fn evaluate(&self, _values: &[Value], _ctx: &MessageContext<'_>, _notes: &mut NoteSink<'_>) {}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub parsed: BTreeMap<String, Vec<Value>>,
    pub notes: Vec<Note>,
}

pub trait HeaderAnalyzer {
    /// `body` is the complete body when it is known, `None` otherwise.
    fn analyze(&self, ctx: &MessageContext<'_>, headers: &[HeaderField], body: Option<&[u8]>) -> Analysis;
}

pub struct StandardAnalyzer {
    handlers: HashMap<String, Box<dyn HeaderHandler>>,
}

impl Default for StandardAnalyzer {
    fn default() -> Self {
        headers::default_handlers()
            .into_iter()
            .fold(Self { handlers: HashMap::new() }, |analyzer, handler| {
                analyzer.with_handler(handler)
            })
    }
}

impl StandardAnalyzer {
    /// Registers (or replaces) the handler for a header.
    pub fn with_handler(mut self, handler: Box<dyn HeaderHandler>) -> Self {
        self.handlers
            .insert(handler.canonical_name().to_ascii_lowercase(), handler);
        self
    }
}

impl HeaderAnalyzer for StandardAnalyzer {
    fn analyze(&self, ctx: &MessageContext<'_>, headers: &[HeaderField], body: Option<&[u8]>) -> Analysis {
        let mut analysis = Analysis::default();

        for (name, raw_values) in group_headers(headers) {
            let subject = format!("header-{name}");
            let mut sink = NoteSink::new(&subject, &mut analysis.notes);

            let values = match self.handlers.get(name.as_str()) {
                Some(handler) => run_handler(handler.as_ref(), &raw_values, ctx, &mut sink),
                None => raw_values
                    .iter()
                    .map(|v| Value::String(v.trim().to_string()))
                    .collect(),
            };
            analysis.parsed.insert(name, values);
        }

        check_content_length(ctx, &analysis.parsed, body, &mut analysis.notes);
        cache::check_caching(ctx, &analysis.parsed, &mut analysis.notes);
        analysis
    }
}

fn run_handler(
    handler: &dyn HeaderHandler,
    raw_values: &[&str],
    ctx: &MessageContext<'_>,
    sink: &mut NoteSink<'_>,
) -> Vec<Value> {
    if !handler.list_header() && raw_values.len() > 1 {
        sink.push(&headers::SINGLE_HEADER_REPEAT);
    }

    let items: Vec<&str> = if handler.list_header() {
        raw_values.iter().flat_map(|v| split_list(*v)).collect()
    } else {
        raw_values.iter().map(|v| v.trim()).collect()
    };

    let mut values = Vec::with_capacity(items.len());
    for item in items {
        match handler.parse(item, ctx, sink) {
            Ok(value) => values.push(value),
            Err(SyntaxError(problem)) => {
                sink.push_with(
                    &headers::BAD_SYNTAX,
                    &[("field_name", handler.canonical_name()), ("problem", &problem)],
                );
                // keep going with the raw text as a best-effort value
                values.push(Value::String(item.to_string()));
            }
        }
    }

    if handler.deprecated() {
        sink.push_with(&headers::HEADER_DEPRECATED, &[("field_name", handler.canonical_name())]);
    }
    handler.evaluate(&values, ctx, sink);
    values
}

// Groups header values by lowercased name, in order of first appearance.
fn group_headers(headers: &[HeaderField]) -> Vec<(String, Vec<&str>)> {
    let mut groups: Vec<(String, Vec<&str>)> = Vec::new();
    for (name, value) in headers {
        let name = name.trim().to_ascii_lowercase();
        match groups.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value.as_str()),
            None => groups.push((name, vec![value.as_str()])),
        }
    }
    groups
}

// Splits a list header value on commas that aren't inside a quoted string.
// Empty list elements are dropped.
pub(crate) fn split_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|item| !item.is_empty());
    items
}

fn check_content_length(
    ctx: &MessageContext<'_>,
    parsed: &BTreeMap<String, Vec<Value>>,
    body: Option<&[u8]>,
    notes: &mut Vec<Note>,
) {
    if matches!(ctx.status, 100..=199 | 204 | 304) {
        return;
    }
    let (Some(body), Some(declared)) = (
        body,
        parsed
            .get("content-length")
            .and_then(|values| values.first())
            .and_then(Value::as_u64),
    ) else {
        return;
    };
    if declared != body.len() as u64 {
        let note = headers::CL_INCORRECT
            .note("header-content-length")
            .with("declared", declared.to_string())
            .with("actual", body.len().to_string());
        notes.push(note);
    }
}
