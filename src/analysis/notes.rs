// src/analysis/notes.rs
// =============================================================================
// Diagnostic notes: one finding attached to a checked resource.
//
// A note kind (NoteKind) is a static description: id, category, severity
// and a summary template like "{response} has unsupported transfer-coding."
// A Note is a kind instantiated for one subject (usually a header) with the
// parameters that fill in the template.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    General,
    Security,
    Connection,
    Caching,
    Validation,
    Links,
}

/// Severity, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Good,
    Info,
    Warn,
    Bad,
}

pub struct NoteKind {
    pub id: &'static str,
    pub category: Category,
    pub level: Level,
    pub summary: &'static str,
}

impl NoteKind {
    /// Instantiates this kind for a subject, e.g. "header-location".
    pub fn note(&self, subject: impl Into<String>) -> Note {
        Note {
            id: self.id.to_string(),
            subject: subject.into(),
            category: self.category,
            level: self.level,
            summary: self.summary.to_string(),
            params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub subject: String,
    pub category: Category,
    pub level: Level,
    pub summary: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Note {
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Fills `{name}` placeholders in the summary from the parameters.
    /// `{response}` defaults to "This response". Unknown placeholders are
    /// left as they are.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.summary.len());
        let mut rest = self.summary.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    match self.params.get(key) {
                        Some(value) => out.push_str(value),
                        None if key == "response" => out.push_str("This response"),
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

// -----------------------------------------------------------------------------
// Note kinds emitted outside of header analysis
// -----------------------------------------------------------------------------

pub const FETCH_FAILED: NoteKind = NoteKind {
    id: "FETCH_FAILED",
    category: Category::General,
    level: Level::Bad,
    summary: "The resource could not be fetched: {error}",
};

pub const CHECK_TIMEOUT: NoteKind = NoteKind {
    id: "CHECK_TIMEOUT",
    category: Category::General,
    level: Level::Bad,
    summary: "The check timed out while waiting for {in_flight}.",
};

pub const CHILD_DENIED: NoteKind = NoteKind {
    id: "CHILD_DENIED",
    category: Category::Links,
    level: Level::Warn,
    summary: "This link wasn't checked: {reason}.",
};

pub const LINK_PARSE_ABANDONED: NoteKind = NoteKind {
    id: "LINK_PARSE_ABANDONED",
    category: Category::Links,
    level: Level::Info,
    summary: "Gave up looking for links after {errors} markup errors.",
};

pub const BODY_TRUNCATED: NoteKind = NoteKind {
    id: "BODY_TRUNCATED",
    category: Category::General,
    level: Level::Info,
    summary: "Only the first {sample_bytes} bytes of the body were kept for analysis.",
};
