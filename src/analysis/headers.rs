// src/analysis/headers.rs
// =============================================================================
// The default header handlers.
//
// Each handler is a small unit struct implementing HeaderHandler:
// - parse() turns one field value into a JSON value, or a SyntaxError
// - evaluate() looks at all parsed values of that header and emits notes
//
// Note kinds live next to the handler that emits them.
// =============================================================================

use super::{Category, HeaderHandler, Level, MessageContext, NoteKind, NoteSink, SyntaxError};
use serde_json::{json, Map, Value};
use url::Url;

pub(super) fn default_handlers() -> Vec<Box<dyn HeaderHandler>> {
    vec![
        Box::new(TransferEncoding),
        Box::new(XContentTypeOptions),
        Box::new(Location),
        Box::new(ContentType),
        Box::new(ContentLength),
        Box::new(CacheControl),
        Box::new(Warning),
    ]
}

// -----------------------------------------------------------------------------
// Generic notes
// -----------------------------------------------------------------------------

pub(super) const BAD_SYNTAX: NoteKind = NoteKind {
    id: "BAD_SYNTAX",
    category: Category::General,
    level: Level::Bad,
    summary: "The {field_name} header's syntax isn't valid: {problem}",
};

pub(super) const SINGLE_HEADER_REPEAT: NoteKind = NoteKind {
    id: "SINGLE_HEADER_REPEAT",
    category: Category::General,
    level: Level::Bad,
    summary: "Only one of these headers is allowed in a message.",
};

pub(super) const HEADER_DEPRECATED: NoteKind = NoteKind {
    id: "HEADER_DEPRECATED",
    category: Category::General,
    level: Level::Warn,
    summary: "The {field_name} header is deprecated.",
};

pub(super) const CL_INCORRECT: NoteKind = NoteKind {
    id: "CL_INCORRECT",
    category: Category::Connection,
    level: Level::Bad,
    summary: "{response}'s Content-Length header is {declared}, but the body was {actual} bytes.",
};

// tchar from RFC 9110
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => s.to_string(),
    }
}

// -----------------------------------------------------------------------------
// Transfer-Encoding
// -----------------------------------------------------------------------------

const TRANSFER_CODING_IDENTITY: NoteKind = NoteKind {
    id: "TRANSFER_CODING_IDENTITY",
    category: Category::Connection,
    level: Level::Info,
    summary: "The identity transfer-coding isn't necessary.",
};

const TRANSFER_CODING_UNWANTED: NoteKind = NoteKind {
    id: "TRANSFER_CODING_UNWANTED",
    category: Category::Connection,
    level: Level::Bad,
    summary: "{response} has unsupported transfer-coding: {unwanted_codings}.",
};

const TRANSFER_CODING_PARAM: NoteKind = NoteKind {
    id: "TRANSFER_CODING_PARAM",
    category: Category::Connection,
    level: Level::Warn,
    summary: "{response} had parameters on its transfer-codings.",
};

struct TransferEncoding;

impl HeaderHandler for TransferEncoding {
    fn canonical_name(&self) -> &'static str {
        "Transfer-Encoding"
    }

    fn list_header(&self) -> bool {
        true
    }

    fn parse(&self, value: &str, _ctx: &MessageContext<'_>, notes: &mut NoteSink<'_>) -> Result<Value, SyntaxError> {
        let (coding, params) = value.split_once(';').unwrap_or((value, ""));
        let coding = coding.trim().to_ascii_lowercase();
        if !is_token(&coding) {
            return Err(SyntaxError(format!("'{coding}' isn't a transfer-coding")));
        }
        if !params.trim().is_empty() {
            notes.push(&TRANSFER_CODING_PARAM);
        }
        Ok(Value::String(coding))
    }

    fn evaluate(&self, values: &[Value], _ctx: &MessageContext<'_>, notes: &mut NoteSink<'_>) {
        let codings: Vec<String> = values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_ascii_lowercase)
            .collect();

        let mut unwanted: Vec<&str> = Vec::new();
        for coding in &codings {
            if coding != "chunked" && coding != "identity" && !unwanted.contains(&coding.as_str()) {
                unwanted.push(coding);
            }
        }
        if !unwanted.is_empty() {
            notes.push_with(&TRANSFER_CODING_UNWANTED, &[("unwanted_codings", &unwanted.join(", "))]);
        }
        if codings.iter().any(|c| c == "identity") {
            notes.push(&TRANSFER_CODING_IDENTITY);
        }
    }
}

// -----------------------------------------------------------------------------
// X-Content-Type-Options
// -----------------------------------------------------------------------------

const CONTENT_TYPE_OPTIONS: NoteKind = NoteKind {
    id: "CONTENT_TYPE_OPTIONS",
    category: Category::Security,
    level: Level::Info,
    summary: "{response} instructs browsers not to 'sniff' its media type.",
};

const CONTENT_TYPE_OPTIONS_UNKNOWN: NoteKind = NoteKind {
    id: "CONTENT_TYPE_OPTIONS_UNKNOWN",
    category: Category::Security,
    level: Level::Warn,
    summary: "{response} contains an X-Content-Type-Options header with an unknown value.",
};

struct XContentTypeOptions;

impl HeaderHandler for XContentTypeOptions {
    fn canonical_name(&self) -> &'static str {
        "X-Content-Type-Options"
    }

    fn list_header(&self) -> bool {
        true
    }

    fn parse(&self, value: &str, _ctx: &MessageContext<'_>, _notes: &mut NoteSink<'_>) -> Result<Value, SyntaxError> {
        Ok(Value::String(value.to_ascii_lowercase()))
    }

    fn evaluate(&self, values: &[Value], _ctx: &MessageContext<'_>, notes: &mut NoteSink<'_>) {
        if values.iter().any(|v| v.as_str() == Some("nosniff")) {
            notes.push(&CONTENT_TYPE_OPTIONS);
        } else {
            notes.push(&CONTENT_TYPE_OPTIONS_UNKNOWN);
        }
    }
}

// -----------------------------------------------------------------------------
// Location
// -----------------------------------------------------------------------------

const LOCATION_UNDEFINED: NoteKind = NoteKind {
    id: "LOCATION_UNDEFINED",
    category: Category::General,
    level: Level::Warn,
    summary: "{response} doesn't define any meaning for the Location header.",
};

const LOCATION_NOT_ABSOLUTE: NoteKind = NoteKind {
    id: "LOCATION_NOT_ABSOLUTE",
    category: Category::General,
    level: Level::Info,
    summary: "The Location header contains a relative URI; the absolute URI is probably {full_uri}",
};

const LOCATION_STATUSES: [u16; 8] = [201, 300, 301, 302, 303, 305, 307, 308];

struct Location;

impl HeaderHandler for Location {
    fn canonical_name(&self) -> &'static str {
        "Location"
    }

    fn parse(&self, value: &str, ctx: &MessageContext<'_>, notes: &mut NoteSink<'_>) -> Result<Value, SyntaxError> {
        if value.is_empty() {
            return Err(SyntaxError("empty URI".to_string()));
        }
        if !LOCATION_STATUSES.contains(&ctx.status) {
            notes.push(&LOCATION_UNDEFINED);
        }
        if Url::parse(value).is_err() {
            let full_uri = Url::parse(ctx.base_uri)
                .and_then(|base| base.join(value))
                .map(|u| u.to_string())
                .map_err(|e| SyntaxError(format!("can't resolve '{value}': {e}")))?;
            notes.push_with(&LOCATION_NOT_ABSOLUTE, &[("full_uri", &full_uri)]);
        }
        Ok(Value::String(value.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Content-Type
// -----------------------------------------------------------------------------

struct ContentType;

impl HeaderHandler for ContentType {
    fn canonical_name(&self) -> &'static str {
        "Content-Type"
    }

    fn parse(&self, value: &str, _ctx: &MessageContext<'_>, _notes: &mut NoteSink<'_>) -> Result<Value, SyntaxError> {
        let mut parts = value.split(';');
        let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let valid = media_type
            .split_once('/')
            .is_some_and(|(kind, sub)| is_token(kind) && is_token(sub));
        if !valid {
            return Err(SyntaxError(format!("'{media_type}' isn't a media type")));
        }

        let mut params = Map::new();
        for param in parts.map(str::trim).filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some((name, val)) => {
                    params.insert(name.trim().to_ascii_lowercase(), Value::String(unquote(val)));
                }
                None => return Err(SyntaxError(format!("parameter '{param}' has no value"))),
            }
        }
        Ok(json!({ "media_type": media_type, "params": params }))
    }
}

// -----------------------------------------------------------------------------
// Content-Length
// -----------------------------------------------------------------------------

struct ContentLength;

impl HeaderHandler for ContentLength {
    fn canonical_name(&self) -> &'static str {
        "Content-Length"
    }

    fn parse(&self, value: &str, _ctx: &MessageContext<'_>, _notes: &mut NoteSink<'_>) -> Result<Value, SyntaxError> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyntaxError(format!("'{value}' isn't a length")));
        }
        value
            .parse::<u64>()
            .map(Value::from)
            .map_err(|e| SyntaxError(e.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Cache-Control
// -----------------------------------------------------------------------------

const CC_MISCAP: NoteKind = NoteKind {
    id: "CC_MISCAP",
    category: Category::Caching,
    level: Level::Warn,
    summary: "The {cc} Cache-Control directive appears to have incorrect capitalisation; it should be {cc_lower}.",
};

const CC_DUP: NoteKind = NoteKind {
    id: "CC_DUP",
    category: Category::Caching,
    level: Level::Warn,
    summary: "The {cc} Cache-Control directive appears more than once.",
};

// directives that make no sense repeated
const KNOWN_CC: [&str; 9] = [
    "max-age",
    "no-store",
    "s-maxage",
    "public",
    "private",
    "pre-check",
    "post-check",
    "stale-while-revalidate",
    "stale-if-error",
];

struct CacheControl;

impl HeaderHandler for CacheControl {
    fn canonical_name(&self) -> &'static str {
        "Cache-Control"
    }

    fn list_header(&self) -> bool {
        true
    }

    fn parse(&self, value: &str, _ctx: &MessageContext<'_>, _notes: &mut NoteSink<'_>) -> Result<Value, SyntaxError> {
        let (name, arg) = match value.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(unquote(arg))),
            None => (value.trim(), None),
        };
        if !is_token(name) {
            return Err(SyntaxError(format!("'{name}' isn't a directive name")));
        }
        Ok(json!([name, arg]))
    }

    fn evaluate(&self, values: &[Value], _ctx: &MessageContext<'_>, notes: &mut NoteSink<'_>) {
        let names: Vec<&str> = values
            .iter()
            .filter_map(|v| v.get(0).and_then(Value::as_str))
            .collect();

        let mut seen: Vec<&str> = Vec::new();
        for &name in &names {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            let lower = name.to_ascii_lowercase();
            if KNOWN_CC.contains(&lower.as_str()) && name != lower {
                notes.push_with(&CC_MISCAP, &[("cc", name), ("cc_lower", &lower)]);
            }
            if KNOWN_CC.contains(&name) && names.iter().filter(|n| **n == name).count() > 1 {
                notes.push_with(&CC_DUP, &[("cc", name)]);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Warning
// -----------------------------------------------------------------------------

struct Warning;

impl HeaderHandler for Warning {
    fn canonical_name(&self) -> &'static str {
        "Warning"
    }

    fn list_header(&self) -> bool {
        true
    }

    fn deprecated(&self) -> bool {
        true
    }
}
