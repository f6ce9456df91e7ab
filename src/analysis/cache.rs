// src/analysis/cache.rs
// =============================================================================
// Caching evaluation, run once per message after the header handlers.
//
// Works from the parsed Cache-Control directives plus the raw Date, Expires,
// Age, Last-Modified, ETag and Vary values, and answers three questions:
// who may store the response, how long it stays fresh, and whether a cache
// may serve it once stale. Every note goes under the "caching" subject.
//
// Directive names are matched case-sensitively; the Cache-Control handler
// already flags miscapitalised ones.
// =============================================================================

use super::notes::{Category, Level, Note, NoteKind};
use super::{split_list, MessageContext};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub(crate) const CACHING_SUBJECT: &str = "caching";

const CACHEABLE_METHODS: &[&str] = &["GET"];
const HEURISTIC_CACHEABLE_STATUS: &[u16] = &[200, 203, 206, 300, 301, 410];
const MAX_CLOCK_SKEW: i64 = 5;

type Directives<'a> = Vec<(&'a str, Option<&'a str>)>;

pub(super) fn check_caching(ctx: &MessageContext<'_>, parsed: &BTreeMap<String, Vec<Value>>, notes: &mut Vec<Note>) {
    let mut out = Notes(notes);
    let now = ctx.received_at;

    let date = http_date(parsed, "date");
    let last_modified = http_date(parsed, "last-modified");
    let has_etag = parsed.contains_key("etag");
    let has_expires = parsed.contains_key("expires");
    let directives = directives(parsed);
    let has = |name: &str| directives.iter().any(|(n, _)| *n == name);

    if let Some(lm) = last_modified {
        let server_now = date.unwrap_or(now);
        if lm > server_now {
            out.push(&LM_FUTURE);
        } else {
            let ago = duration_text((server_now - lm).num_seconds());
            out.push_with(&LM_PRESENT, &[("last_modified", &ago)]);
        }
    }

    // who can store this?
    if !CACHEABLE_METHODS.contains(&ctx.method) {
        out.push_with(&METHOD_UNCACHEABLE, &[("method", ctx.method)]);
        return;
    }
    if has("no-store") {
        out.push(&NO_STORE);
        return;
    }
    let authorized = ctx
        .request_headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("authorization"));
    if has("private") {
        out.push(&PRIVATE_CC);
    } else if authorized && !has("public") {
        out.push(&PRIVATE_AUTH);
    } else {
        out.push(&STOREABLE);
    }

    if has("no-cache") {
        if last_modified.is_none() && !has_etag {
            out.push(&NO_CACHE_NO_VALIDATOR);
        } else {
            out.push(&NO_CACHE);
        }
        return;
    }

    let vary = vary_fields(parsed);
    if vary.contains("*") {
        out.push(&VARY_ASTERISK);
        return;
    }
    if vary.len() > 3 {
        out.push_with(&VARY_COMPLEX, &[("vary_count", &vary.len().to_string())]);
    } else {
        if vary.contains("user-agent") {
            out.push(&VARY_USER_AGENT);
        }
        if vary.contains("host") {
            out.push(&VARY_HOST);
        }
    }

    // age
    let age = first_text(parsed, "age")
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|age| *age >= 0)
        .unwrap_or(0);
    let apparent_age = date.map_or(0, |date| (now - date).num_seconds().max(0));
    let current_age = apparent_age.max(age);
    if age >= 1 {
        out.push_with(&CURRENT_AGE, &[("age", &duration_text(age))]);
    }

    match date {
        None => {
            out.push(&DATE_CLOCKLESS);
            if has_expires || last_modified.is_some() {
                out.push(&DATE_CLOCKLESS_BAD_HDR);
            }
        }
        Some(date) => {
            let skew = (date - now).num_seconds() + age;
            if age > MAX_CLOCK_SKEW && current_age - skew < MAX_CLOCK_SKEW {
                out.push(&AGE_PENALTY);
            } else if skew.abs() > MAX_CLOCK_SKEW {
                let direction = if skew > 0 { "ahead" } else { "behind" };
                let text = format!("{} {direction}", duration_text(skew.abs()));
                out.push_with(&DATE_INCORRECT, &[("clock_skew", &text)]);
            } else {
                out.push(&DATE_CORRECT);
            }
        }
    }

    // freshness
    let mut lifetime = 0;
    let mut explicit = false;
    let mut from_cache_control = false;
    if let Some(seconds) = delta_seconds(&directives, "s-maxage").or_else(|| delta_seconds(&directives, "max-age")) {
        lifetime = seconds;
        explicit = true;
        from_cache_control = true;
    } else if has_expires {
        // an Expires that doesn't parse means already expired
        explicit = true;
        if let Some(expires) = http_date(parsed, "expires") {
            lifetime = (expires - date.unwrap_or(now)).num_seconds();
        }
    }

    let left = lifetime - current_age;
    let fresh = left > 0;
    let lifetime_text = duration_text(lifetime.max(0));
    let left_text = duration_text(left.abs());
    let current_age_text = duration_text(current_age);
    let freshness = [
        ("freshness_lifetime", lifetime_text.as_str()),
        ("freshness_left", left_text.as_str()),
        ("current_age", current_age_text.as_str()),
    ];
    if explicit {
        if fresh {
            out.push_with(&FRESHNESS_FRESH, &freshness);
        } else if from_cache_control && age > lifetime {
            out.push_with(&FRESHNESS_STALE_CACHE, &freshness);
        } else {
            out.push_with(&FRESHNESS_STALE_ALREADY, &freshness);
        }
    } else if HEURISTIC_CACHEABLE_STATUS.contains(&ctx.status) {
        out.push(&FRESHNESS_HEURISTIC);
    } else {
        out.push(&FRESHNESS_NONE);
    }

    // can it be served stale?
    let (when_fresh, when_stale) = if has("must-revalidate") {
        (&FRESH_MUST_REVALIDATE, &STALE_MUST_REVALIDATE)
    } else if has("proxy-revalidate") || has("s-maxage") {
        (&FRESH_PROXY_REVALIDATE, &STALE_PROXY_REVALIDATE)
    } else {
        (&FRESH_SERVABLE, &STALE_SERVABLE)
    };
    if fresh {
        out.push(when_fresh);
    } else if explicit {
        out.push(when_stale);
    }

    if has("public") {
        out.push(&PUBLIC);
    }
}

struct Notes<'a>(&'a mut Vec<Note>);

impl Notes<'_> {
    fn push(&mut self, kind: &NoteKind) {
        self.0.push(kind.note(CACHING_SUBJECT));
    }

    fn push_with(&mut self, kind: &NoteKind, params: &[(&str, &str)]) {
        let note = params
            .iter()
            .fold(kind.note(CACHING_SUBJECT), |note, (key, value)| note.with(key, *value));
        self.0.push(note);
    }
}

fn first_text<'a>(parsed: &'a BTreeMap<String, Vec<Value>>, name: &str) -> Option<&'a str> {
    parsed.get(name)?.first()?.as_str()
}

fn http_date(parsed: &BTreeMap<String, Vec<Value>>, name: &str) -> Option<DateTime<Utc>> {
    let text = first_text(parsed, name)?;
    DateTime::parse_from_rfc2822(text)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

// Cache-Control values are parsed as [name, argument-or-null].
fn directives(parsed: &BTreeMap<String, Vec<Value>>) -> Directives<'_> {
    parsed
        .get("cache-control")
        .into_iter()
        .flatten()
        .filter_map(|value| {
            let name = value.get(0)?.as_str()?;
            Some((name, value.get(1).and_then(Value::as_str)))
        })
        .collect()
}

// First occurrence wins. A directive with a bad argument counts as zero.
fn delta_seconds(directives: &Directives<'_>, name: &str) -> Option<i64> {
    directives
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, arg)| arg.and_then(|a| a.trim().parse::<i64>().ok()).unwrap_or(0))
}

fn vary_fields(parsed: &BTreeMap<String, Vec<Value>>) -> BTreeSet<String> {
    parsed
        .get("vary")
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .flat_map(split_list)
        .map(str::to_ascii_lowercase)
        .collect()
}

// "45 sec", "3 min 20 sec", "2 days 4 hr"
fn duration_text(seconds: i64) -> String {
    const UNITS: [(i64, &str, &str); 5] = [
        (365 * 86400, "year", "years"),
        (86400, "day", "days"),
        (3600, "hr", "hr"),
        (60, "min", "min"),
        (1, "sec", "sec"),
    ];
    let mut rest = seconds.max(0);
    let mut parts = Vec::new();
    for (size, one, many) in UNITS {
        if rest >= size {
            let n = rest / size;
            rest %= size;
            parts.push(format!("{n} {}", if n == 1 { one } else { many }));
        }
        if parts.len() == 2 {
            break;
        }
    }
    if parts.is_empty() {
        "0 sec".to_string()
    } else {
        parts.join(" ")
    }
}

// -----------------------------------------------------------------------------
// Note kinds
// -----------------------------------------------------------------------------

const fn caching(id: &'static str, level: Level, summary: &'static str) -> NoteKind {
    NoteKind {
        id,
        category: Category::Caching,
        level,
        summary,
    }
}

const LM_FUTURE: NoteKind = caching("LM_FUTURE", Level::Bad, "The Last-Modified time is in the future.");
const LM_PRESENT: NoteKind = caching("LM_PRESENT", Level::Info, "The resource last changed {last_modified} ago.");
const METHOD_UNCACHEABLE: NoteKind = caching(
    "METHOD_UNCACHEABLE",
    Level::Info,
    "Responses to the {method} method can't be stored by caches.",
);
const NO_STORE: NoteKind = caching("NO_STORE", Level::Info, "{response} can't be stored by a cache.");
const PRIVATE_CC: NoteKind = caching("PRIVATE_CC", Level::Info, "{response} only allows a private cache to store it.");
const PRIVATE_AUTH: NoteKind = caching(
    "PRIVATE_AUTH",
    Level::Info,
    "{response} was requested with credentials, so only a private cache may store it.",
);
const STOREABLE: NoteKind = caching("STOREABLE", Level::Info, "{response} allows all caches to store it.");
const NO_CACHE: NoteKind = caching(
    "NO_CACHE",
    Level::Info,
    "{response} cannot be served from cache without validation.",
);
const NO_CACHE_NO_VALIDATOR: NoteKind = caching(
    "NO_CACHE_NO_VALIDATOR",
    Level::Info,
    "{response} cannot be served from cache without validation, and has no validator to do it with.",
);
const VARY_ASTERISK: NoteKind = caching(
    "VARY_ASTERISK",
    Level::Warn,
    "Vary: * effectively makes this response uncacheable.",
);
const VARY_USER_AGENT: NoteKind = caching(
    "VARY_USER_AGENT",
    Level::Info,
    "Vary: User-Agent can cause cache inefficiency.",
);
const VARY_HOST: NoteKind = caching("VARY_HOST", Level::Warn, "Vary: Host is not necessary.");
const VARY_COMPLEX: NoteKind = caching("VARY_COMPLEX", Level::Warn, "This resource varies in {vary_count} ways.");
const CURRENT_AGE: NoteKind = caching("CURRENT_AGE", Level::Info, "{response} has been cached for {age}.");
const DATE_CLOCKLESS: NoteKind = caching("DATE_CLOCKLESS", Level::Warn, "{response} doesn't have a Date header.");
const DATE_CLOCKLESS_BAD_HDR: NoteKind = caching(
    "DATE_CLOCKLESS_BAD_HDR",
    Level::Bad,
    "Responses without a Date aren't allowed to have Expires or Last-Modified values.",
);
const AGE_PENALTY: NoteKind = caching(
    "AGE_PENALTY",
    Level::Warn,
    "It appears that the Date header has been changed by an intermediary.",
);
const DATE_INCORRECT: NoteKind = caching("DATE_INCORRECT", Level::Bad, "The server's clock is {clock_skew}.");
const DATE_CORRECT: NoteKind = caching("DATE_CORRECT", Level::Good, "The server's clock is correct.");
const FRESHNESS_FRESH: NoteKind = caching(
    "FRESHNESS_FRESH",
    Level::Good,
    "{response} is fresh until {freshness_left} from now.",
);
const FRESHNESS_STALE_CACHE: NoteKind = caching(
    "FRESHNESS_STALE_CACHE",
    Level::Warn,
    "{response} has been served stale by a cache.",
);
const FRESHNESS_STALE_ALREADY: NoteKind = caching("FRESHNESS_STALE_ALREADY", Level::Info, "{response} is already stale.");
const FRESHNESS_HEURISTIC: NoteKind = caching(
    "FRESHNESS_HEURISTIC",
    Level::Warn,
    "{response} allows a cache to assign its own freshness lifetime.",
);
const FRESHNESS_NONE: NoteKind = caching(
    "FRESHNESS_NONE",
    Level::Info,
    "{response} can only be served by a cache under exceptional circumstances.",
);
const FRESH_SERVABLE: NoteKind = caching(
    "FRESH_SERVABLE",
    Level::Info,
    "{response} may still be served by a cache once it becomes stale.",
);
const STALE_SERVABLE: NoteKind = caching(
    "STALE_SERVABLE",
    Level::Info,
    "{response} might be served by a cache, even though it is stale.",
);
const FRESH_MUST_REVALIDATE: NoteKind = caching(
    "FRESH_MUST_REVALIDATE",
    Level::Info,
    "{response} cannot be served by a cache once it becomes stale.",
);
const STALE_MUST_REVALIDATE: NoteKind = caching(
    "STALE_MUST_REVALIDATE",
    Level::Info,
    "{response} cannot be served by a cache, because it is stale.",
);
const FRESH_PROXY_REVALIDATE: NoteKind = caching(
    "FRESH_PROXY_REVALIDATE",
    Level::Info,
    "{response} cannot be served by a shared cache once it becomes stale.",
);
const STALE_PROXY_REVALIDATE: NoteKind = caching(
    "STALE_PROXY_REVALIDATE",
    Level::Info,
    "{response} cannot be served by a shared cache, because it is stale.",
);
const PUBLIC: NoteKind = caching("PUBLIC", Level::Warn, "Cache-Control: public is rarely necessary.");

#[cfg(test)]
mod tests {
    use super::super::{HeaderAnalyzer, StandardAnalyzer};
    use super::*;
    use crate::fetch::HeaderField;

    // 2026-01-01T00:00:00Z
    const NOW: i64 = 1_767_225_600;
    const NOW_HTTP: &str = "Thu, 01 Jan 2026 00:00:00 GMT";

    fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn caching_notes_for(method: &str, request: &[(&str, &str)], status: u16, response: &[(&str, &str)]) -> Vec<Note> {
        let request_headers = fields(request);
        let ctx = MessageContext {
            status,
            base_uri: "http://example.com/",
            method,
            request_headers: &request_headers,
            received_at: DateTime::from_timestamp(NOW, 0).unwrap(),
        };
        StandardAnalyzer::default()
            .analyze(&ctx, &fields(response), None)
            .notes
            .into_iter()
            .filter(|n| n.subject == CACHING_SUBJECT)
            .collect()
    }

    fn ids(response: &[(&str, &str)]) -> Vec<String> {
        caching_notes_for("GET", &[], 200, response)
            .into_iter()
            .map(|n| n.id)
            .collect()
    }

    #[test]
    fn test_fresh_max_age() {
        let notes = caching_notes_for(
            "GET",
            &[],
            200,
            &[("Date", NOW_HTTP), ("Cache-Control", "max-age=3600")],
        );
        let ids: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["STOREABLE", "DATE_CORRECT", "FRESHNESS_FRESH", "FRESH_SERVABLE"]);
        assert_eq!(notes[2].render(), "This response is fresh until 1 hr from now.");
        assert_eq!(notes[2].params["freshness_lifetime"], "1 hr");
    }

    #[test]
    fn test_no_store_stops_evaluation() {
        assert_eq!(
            ids(&[("Date", NOW_HTTP), ("Cache-Control", "no-store, max-age=60")]),
            vec!["NO_STORE"]
        );
    }

    #[test]
    fn test_private_and_authorized_requests() {
        let private = ids(&[("Date", NOW_HTTP), ("Cache-Control", "private, max-age=60")]);
        assert_eq!(private[0], "PRIVATE_CC");

        let authorized = caching_notes_for(
            "GET",
            &[("Authorization", "Basic Zm9vOmJhcg==")],
            200,
            &[("Date", NOW_HTTP)],
        );
        assert_eq!(authorized[0].id, "PRIVATE_AUTH");

        let public = caching_notes_for(
            "GET",
            &[("authorization", "Basic Zm9vOmJhcg==")],
            200,
            &[("Date", NOW_HTTP), ("Cache-Control", "public, max-age=60")],
        );
        assert_eq!(public[0].id, "STOREABLE");
        assert_eq!(public.last().unwrap().id, "PUBLIC");
    }

    #[test]
    fn test_other_methods_are_not_stored() {
        let notes = caching_notes_for("POST", &[], 200, &[("Cache-Control", "max-age=60")]);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].render(), "Responses to the POST method can't be stored by caches.");
    }

    #[test]
    fn test_no_cache_with_and_without_validator() {
        assert_eq!(ids(&[("Cache-Control", "no-cache")]), vec!["STOREABLE", "NO_CACHE_NO_VALIDATOR"]);
        assert_eq!(
            ids(&[("Cache-Control", "no-cache"), ("ETag", "\"abc\"")]),
            vec!["STOREABLE", "NO_CACHE"]
        );
    }

    #[test]
    fn test_heuristic_and_no_freshness() {
        assert_eq!(
            ids(&[("Date", NOW_HTTP)]),
            vec!["STOREABLE", "DATE_CORRECT", "FRESHNESS_HEURISTIC"]
        );
        let notes: Vec<String> = caching_notes_for("GET", &[], 404, &[("Date", NOW_HTTP)])
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(notes, vec!["STOREABLE", "DATE_CORRECT", "FRESHNESS_NONE"]);
    }

    #[test]
    fn test_expires_in_the_past_is_stale() {
        assert_eq!(
            ids(&[("Date", NOW_HTTP), ("Expires", "Wed, 31 Dec 2025 23:00:00 GMT")]),
            vec!["STOREABLE", "DATE_CORRECT", "FRESHNESS_STALE_ALREADY", "STALE_SERVABLE"]
        );
        // unparseable Expires counts as already expired
        assert_eq!(
            ids(&[("Date", NOW_HTTP), ("Expires", "0")]),
            vec!["STOREABLE", "DATE_CORRECT", "FRESHNESS_STALE_ALREADY", "STALE_SERVABLE"]
        );
    }

    #[test]
    fn test_served_stale_by_cache() {
        assert_eq!(
            ids(&[
                ("Date", "Wed, 31 Dec 2025 23:58:20 GMT"),
                ("Age", "100"),
                ("Cache-Control", "max-age=60, must-revalidate"),
            ]),
            vec![
                "STOREABLE",
                "CURRENT_AGE",
                "DATE_CORRECT",
                "FRESHNESS_STALE_CACHE",
                "STALE_MUST_REVALIDATE"
            ]
        );
    }

    #[test]
    fn test_s_maxage_implies_proxy_revalidate() {
        let ids = ids(&[("Date", NOW_HTTP), ("Cache-Control", "max-age=10, s-maxage=120")]);
        assert_eq!(ids[2..], ["FRESHNESS_FRESH", "FRESH_PROXY_REVALIDATE"]);
    }

    #[test]
    fn test_clock_problems() {
        assert_eq!(
            ids(&[("Last-Modified", "Wed, 31 Dec 2025 00:00:00 GMT")]),
            vec!["LM_PRESENT", "STOREABLE", "DATE_CLOCKLESS", "DATE_CLOCKLESS_BAD_HDR", "FRESHNESS_HEURISTIC"]
        );

        let notes = caching_notes_for("GET", &[], 200, &[("Date", "Thu, 01 Jan 2026 00:10:00 GMT")]);
        assert_eq!(notes[1].id, "DATE_INCORRECT");
        assert_eq!(notes[1].render(), "The server's clock is 10 min ahead.");

        assert_eq!(
            ids(&[("Date", NOW_HTTP), ("Last-Modified", "Fri, 02 Jan 2026 00:00:00 GMT")])[0],
            "LM_FUTURE"
        );
    }

    #[test]
    fn test_vary() {
        assert_eq!(ids(&[("Date", NOW_HTTP), ("Vary", "*")]), vec!["STOREABLE", "VARY_ASTERISK"]);
        let notes = ids(&[("Date", NOW_HTTP), ("Vary", "User-Agent, Host")]);
        assert_eq!(notes[1..3], ["VARY_USER_AGENT", "VARY_HOST"]);
        let notes = caching_notes_for(
            "GET",
            &[],
            200,
            &[("Vary", "Accept, Accept-Encoding"), ("vary", "Accept-Language, Cookie")],
        );
        assert_eq!(notes[1].id, "VARY_COMPLEX");
        assert_eq!(notes[1].params["vary_count"], "4");
    }

    #[test]
    fn test_duration_text() {
        assert_eq!(duration_text(0), "0 sec");
        assert_eq!(duration_text(45), "45 sec");
        assert_eq!(duration_text(200), "3 min 20 sec");
        assert_eq!(duration_text(2 * 86400 + 4 * 3600 + 59), "2 days 4 hr");
        assert_eq!(duration_text(86400), "1 day");
    }
}
