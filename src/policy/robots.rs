// src/policy/robots.rs
// =============================================================================
// robots.txt precheck.
//
// Before checking a URI we ask the origin's robots.txt whether we're welcome.
// The answer errs on the side of checking: an unparseable URI, a failed
// fetch, a non-2xx answer or an empty file all mean "allowed".
//
// Parsed files are cached per origin for 30 minutes. Lookups for an origin
// whose robots.txt is already being fetched wait for that fetch instead of
// starting their own.
//
// Matching follows the usual robots.txt rules:
// - the group for our product token wins over the "*" group
// - the longest matching pattern decides; Allow wins a tie (RFC 9309
//   precedence, so the order of rules in the file doesn't matter)
// - '*' matches any run of characters, a trailing '$' anchors the end
// =============================================================================

use crate::fetch::{BodyEvent, ExchangeRequest, Fetcher};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

pub const FRESHNESS_LIFETIME: Duration = Duration::from_secs(30 * 60);

// robots.txt bigger than this is cut off
const MAX_ROBOTS_BYTES: usize = 512 * 1024;

/// "scheme://host:port" for an http(s) URI, with the default port filled in.
pub fn url_to_origin(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    let port = url.port_or_known_default()?;
    Some(format!("{}://{}:{}", url.scheme(), host, port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    allow: bool,
    pattern: String,
}

#[derive(Debug, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

/// The rules of one robots.txt that apply to one user agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    rules: Vec<Rule>,
}

impl RobotsRules {
    /// Rules that allow everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    // `product` is our product token, e.g. "redcheck".
    pub fn parse(text: &str, product: &str) -> Self {
        let product = product.to_ascii_lowercase();
        let mut groups: Vec<Group> = Vec::new();
        let mut in_agent_lines = false;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !in_agent_lines {
                        groups.push(Group::default());
                        in_agent_lines = true;
                    }
                    if let Some(group) = groups.last_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    in_agent_lines = false;
                    // an empty Disallow means "nothing is disallowed"
                    if value.is_empty() {
                        continue;
                    }
                    if let Some(group) = groups.last_mut() {
                        group.rules.push(Rule {
                            allow: key == "allow",
                            pattern: value.to_string(),
                        });
                    }
                }
                _ => in_agent_lines = false,
            }
        }

        // most specific agent token that names us; "*" as the fallback
        let specificity = |agent: &str| -> Option<usize> {
            if agent == "*" {
                Some(0)
            } else if !agent.is_empty() && product.contains(agent) {
                Some(agent.len())
            } else {
                None
            }
        };
        let best = groups
            .iter()
            .flat_map(|g| g.agents.iter())
            .filter_map(|a| specificity(a))
            .max();

        let rules = match best {
            Some(best) => groups
                .into_iter()
                .filter(|g| g.agents.iter().any(|a| specificity(a) == Some(best)))
                .flat_map(|g| g.rules)
                .collect(),
            None => Vec::new(),
        };
        Self { rules }
    }

    /// `path` is the path plus query of the URI being checked.
    pub fn allows(&self, path: &str) -> bool {
        let mut verdict: Option<(usize, bool)> = None;
        for rule in &self.rules {
            if !pattern_matches(&rule.pattern, path) {
                continue;
            }
            let len = rule.pattern.len();
            verdict = match verdict {
                Some((best, allow)) if best > len || (best == len && allow) => Some((best, allow)),
                _ => Some((len, rule.allow)),
            };
        }
        verdict.map_or(true, |(_, allow)| allow)
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let parts: Vec<&str> = pattern.split('*').collect();
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    if !path.starts_with(first) {
        return false;
    }
    if rest.is_empty() {
        return !anchored || path.len() == first.len();
    }

    let mut pos = first.len();
    for (i, part) in rest.iter().enumerate() {
        let last = i == rest.len() - 1;
        if last && anchored {
            return path.len() >= pos + part.len() && path.ends_with(part);
        }
        match path[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    true
}

struct CachedRules {
    rules: RobotsRules,
    fetched_at: Instant,
}

// One slot per origin; empty while its robots.txt is being fetched.
type Slot = Arc<OnceCell<CachedRules>>;

/// Per-origin cache of parsed robots.txt files.
pub struct RobotsCache {
    user_agent: String,
    product: String,
    entries: Mutex<HashMap<String, Slot>>,
}

impl RobotsCache {
    pub fn new(user_agent: &str) -> Self {
        let product = user_agent
            .split(|c: char| c == '/' || c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        Self {
            user_agent: user_agent.to_string(),
            product,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether robots.txt lets us check `uri`.
    pub async fn allowed<F: Fetcher>(&self, uri: &str, fetcher: &F) -> bool {
        let (Ok(url), Some(origin)) = (Url::parse(uri), url_to_origin(uri)) else {
            return true;
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let slot = self.slot(&origin, Instant::now());
        let cached = slot
            .get_or_init(|| async {
                let rules = self.fetch_rules(&origin, fetcher).await;
                CachedRules {
                    rules,
                    fetched_at: Instant::now(),
                }
            })
            .await;
        cached.rules.allows(&path)
    }

    // The slot to wait on for `origin`: the current one, unless it holds
    // rules that are no longer fresh.
    fn slot(&self, origin: &str, now: Instant) -> Slot {
        let mut entries = self.lock();
        let stale = entries.get(origin).and_then(|slot| slot.get()).is_some_and(|cached| {
            now.saturating_duration_since(cached.fetched_at) >= FRESHNESS_LIFETIME
        });
        if stale {
            entries.remove(origin);
        }
        Arc::clone(entries.entry(origin.to_string()).or_default())
    }

    async fn fetch_rules<F: Fetcher>(&self, origin: &str, fetcher: &F) -> RobotsRules {
        let robots_uri = format!("{origin}/robots.txt");
        let request = ExchangeRequest::get(
            robots_uri.as_str(),
            vec![("User-Agent".to_string(), self.user_agent.clone())],
        );

        let response = match fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(uri = %robots_uri, error = %e, "robots.txt fetch failed, allowing");
                return RobotsRules::allow_all();
            }
        };
        if !(200..300).contains(&response.status) {
            debug!(uri = %robots_uri, status = response.status, "no robots.txt, allowing");
            return RobotsRules::allow_all();
        }

        let mut body = Vec::new();
        let mut events = response.events;
        while let Some(event) = events.next().await {
            match event {
                Ok(BodyEvent::Chunk(chunk)) => {
                    body.extend_from_slice(&chunk);
                    if body.len() >= MAX_ROBOTS_BYTES {
                        warn!(uri = %robots_uri, "robots.txt too large, truncating");
                        body.truncate(MAX_ROBOTS_BYTES);
                        break;
                    }
                }
                Ok(BodyEvent::Trailers(_)) => {}
                Err(e) => {
                    debug!(uri = %robots_uri, error = %e, "robots.txt body failed, allowing");
                    return RobotsRules::allow_all();
                }
            }
        }

        RobotsRules::parse(&String::from_utf8_lossy(&body), &self.product)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
