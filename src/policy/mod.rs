// src/policy/mod.rs
// =============================================================================
// The policy guard: decides whether a check may run at all.
//
// Checks happen in this order, and the first one that says no wins:
// 1. Referer: at most one Referer header, and its host must not be on the
//    deny list
// 2. robots.txt for the target's origin (if enabled)
// 3. Rate limits: the client's budget (if the request names a client), then
//    the origin's budget
//
// Only an admitted request uses up rate budget. When the client has budget
// but the origin doesn't, the client's admission is released again.
// =============================================================================

mod ratelimit;
mod robots;

pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use robots::{url_to_origin, RobotsCache};

use crate::check::CheckRequest;
use crate::config::Config;
use crate::fetch::Fetcher;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Client,
    Origin,
}

/// Why a check was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Referer(String),
    Robots,
    RateLimit(LimitScope),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Referer(problem) => write!(f, "{problem}"),
            DenyReason::Robots => write!(f, "robots.txt doesn't allow checking this URI"),
            DenyReason::RateLimit(LimitScope::Client) => {
                write!(f, "your client is over limit, please try later")
            }
            DenyReason::RateLimit(LimitScope::Origin) => {
                write!(f, "origin is over limit, please try later")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

pub struct PolicyGuard {
    referer_deny_list: Vec<String>,
    robots: Option<RobotsCache>,
    client_limiter: Option<RateLimiter>,
    origin_limiter: Option<RateLimiter>,
}

impl PolicyGuard {
    pub fn from_config(config: &Config) -> Self {
        let now = Instant::now();
        let limiter = |limit: u32, period| (limit > 0).then(|| RateLimiter::new(limit, period, now));

        Self {
            referer_deny_list: config
                .referer_deny_list
                .iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
            robots: config
                .robots_enabled
                .then(|| RobotsCache::new(&config.user_agent)),
            client_limiter: limiter(config.limit_client_tests, config.client_period()),
            origin_limiter: limiter(config.limit_origin_tests, config.origin_period()),
        }
    }

    /// Full admission for a top-level check.
    pub async fn admit<F: Fetcher>(&self, request: &CheckRequest, fetcher: &F) -> Admission {
        if let Err(reason) = self.check_referer(request) {
            return Admission::Deny(reason);
        }
        if !self.robots_allow(&request.uri, fetcher).await {
            return Admission::Deny(DenyReason::Robots);
        }

        let now = Instant::now();
        self.reset_limits_if_due(now);

        let client = match (&self.client_limiter, &request.client_id) {
            (Some(limiter), Some(client_id)) => {
                if let RateLimitDecision::Deny { retry_after } = limiter.try_acquire(client_id, now) {
                    info!(client = %client_id, retry_after_secs = retry_after.as_secs(), "client over limit");
                    return Admission::Deny(DenyReason::RateLimit(LimitScope::Client));
                }
                Some((limiter, client_id))
            }
            _ => None,
        };
        if let (Some(limiter), Some(origin)) = (&self.origin_limiter, url_to_origin(&request.uri)) {
            if let RateLimitDecision::Deny { retry_after } = limiter.try_acquire(&origin, now) {
                info!(origin = %origin, retry_after_secs = retry_after.as_secs(), "origin over limit");
                if let Some((limiter, client_id)) = client {
                    limiter.release(client_id);
                }
                return Admission::Deny(DenyReason::RateLimit(LimitScope::Origin));
            }
        }
        Admission::Allow
    }

    /// Starts a new window on every limiter whose reset time has come.
    pub fn reset_limits_if_due(&self, now: Instant) {
        for limiter in [&self.client_limiter, &self.origin_limiter].into_iter().flatten() {
            limiter.reset_if_due(now);
        }
    }

    /// Admission for a link found while descending. Links are fetched as
    /// part of an already admitted check, so only robots.txt applies.
    pub async fn admit_link<F: Fetcher>(&self, uri: &str, fetcher: &F) -> Admission {
        if self.robots_allow(uri, fetcher).await {
            Admission::Allow
        } else {
            Admission::Deny(DenyReason::Robots)
        }
    }

    fn check_referer(&self, request: &CheckRequest) -> Result<(), DenyReason> {
        let referers: Vec<&str> = request
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("referer"))
            .map(|(_, value)| value.as_str())
            .collect();

        if referers.len() > 1 {
            return Err(DenyReason::Referer("multiple referers not allowed".to_string()));
        }
        let denied = referers
            .first()
            .and_then(|referer| Url::parse(referer).ok())
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| self.referer_deny_list.contains(&host));
        if denied {
            return Err(DenyReason::Referer("referer not allowed".to_string()));
        }
        Ok(())
    }

    async fn robots_allow<F: Fetcher>(&self, uri: &str, fetcher: &F) -> bool {
        match &self.robots {
            Some(robots) => robots.allowed(uri, fetcher).await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::testing::ScriptedFetcher;

    fn config() -> Config {
        Config {
            robots_enabled: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_referer_checks() {
        let guard = PolicyGuard::from_config(&Config {
            referer_deny_list: vec!["Spam.Example".to_string()],
            ..config()
        });
        let fetcher = ScriptedFetcher::new();

        let ok = CheckRequest::new("https://example.com/")
            .header("Referer", "https://friendly.example/page");
        assert_eq!(guard.admit(&ok, &fetcher).await, Admission::Allow);

        let spam = CheckRequest::new("https://example.com/").header("referer", "http://spam.example/");
        assert_eq!(
            guard.admit(&spam, &fetcher).await,
            Admission::Deny(DenyReason::Referer("referer not allowed".to_string()))
        );

        let two = CheckRequest::new("https://example.com/")
            .header("Referer", "https://a.example/")
            .header("Referer", "https://b.example/");
        assert!(matches!(
            guard.admit(&two, &fetcher).await,
            Admission::Deny(DenyReason::Referer(_))
        ));
    }

    #[tokio::test]
    async fn test_origin_limit_and_denials_dont_count() {
        let guard = PolicyGuard::from_config(&Config {
            limit_origin_tests: 2,
            referer_deny_list: vec!["spam.example".to_string()],
            ..config()
        });
        let fetcher = ScriptedFetcher::new();
        let request = CheckRequest::new("https://example.com/a");

        // a referer denial happens before the limiter and costs nothing
        let spam = request.clone().header("Referer", "https://spam.example/");
        assert!(matches!(guard.admit(&spam, &fetcher).await, Admission::Deny(_)));

        assert_eq!(guard.admit(&request, &fetcher).await, Admission::Allow);
        assert_eq!(
            guard.admit(&CheckRequest::new("https://example.com/b"), &fetcher).await,
            Admission::Allow
        );
        assert_eq!(
            guard.admit(&request, &fetcher).await,
            Admission::Deny(DenyReason::RateLimit(LimitScope::Origin))
        );
        // same host, other port: other origin
        assert_eq!(
            guard.admit(&CheckRequest::new("https://example.com:8443/"), &fetcher).await,
            Admission::Allow
        );
    }

    #[tokio::test]
    async fn test_client_limit_checked_first() {
        let guard = PolicyGuard::from_config(&Config {
            limit_client_tests: 1,
            limit_origin_tests: 5,
            ..config()
        });
        let fetcher = ScriptedFetcher::new();

        let first = CheckRequest::new("https://a.example/").client_id("client-1");
        assert_eq!(guard.admit(&first, &fetcher).await, Admission::Allow);
        let second = CheckRequest::new("https://b.example/").client_id("client-1");
        assert_eq!(
            guard.admit(&second, &fetcher).await,
            Admission::Deny(DenyReason::RateLimit(LimitScope::Client))
        );
        // no client id: only the origin limit applies
        assert_eq!(
            guard.admit(&CheckRequest::new("https://b.example/"), &fetcher).await,
            Admission::Allow
        );
    }

    #[tokio::test]
    async fn test_origin_denial_leaves_client_budget() {
        let guard = PolicyGuard::from_config(&Config {
            limit_client_tests: 1,
            limit_origin_tests: 1,
            ..config()
        });
        let fetcher = ScriptedFetcher::new();

        let first = CheckRequest::new("https://a.example/").client_id("c1");
        assert_eq!(guard.admit(&first, &fetcher).await, Admission::Allow);

        let busy_origin = CheckRequest::new("https://a.example/").client_id("c2");
        assert_eq!(
            guard.admit(&busy_origin, &fetcher).await,
            Admission::Deny(DenyReason::RateLimit(LimitScope::Origin))
        );
        let client_limiter = guard.client_limiter.as_ref().unwrap();
        assert_eq!(client_limiter.count("c2"), 0);

        // c2 was never admitted, so its budget is still there
        let elsewhere = CheckRequest::new("https://b.example/").client_id("c2");
        assert_eq!(guard.admit(&elsewhere, &fetcher).await, Admission::Allow);
        assert_eq!(client_limiter.count("c2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limits_reset_on_schedule() {
        let guard = PolicyGuard::from_config(&Config {
            limit_origin_tests: 1,
            limit_origin_period_hours: 1.0,
            ..config()
        });
        let fetcher = ScriptedFetcher::new();
        let request = CheckRequest::new("https://example.com/");

        assert_eq!(guard.admit(&request, &fetcher).await, Admission::Allow);
        assert!(matches!(guard.admit(&request, &fetcher).await, Admission::Deny(_)));

        tokio::time::advance(std::time::Duration::from_secs(3600)).await;
        assert_eq!(guard.admit(&request, &fetcher).await, Admission::Allow);
    }

    #[tokio::test]
    async fn test_robots_denial_and_fail_open() {
        let guard = PolicyGuard::from_config(&Config::default());
        let fetcher = ScriptedFetcher::new()
            .respond(
                "https://example.com:443/robots.txt",
                200,
                &[("content-type", "text/plain")],
                "User-agent: *\nDisallow: /private\n",
            )
            .respond("http://norobots.example:80/robots.txt", 404, &[], "");

        assert_eq!(
            guard.admit(&CheckRequest::new("https://example.com/private/x"), &fetcher).await,
            Admission::Deny(DenyReason::Robots)
        );
        assert_eq!(
            guard.admit_link("https://example.com/public", &fetcher).await,
            Admission::Allow
        );
        // cached: robots.txt was fetched once for two checks
        assert_eq!(fetcher.fetch_count("https://example.com:443/robots.txt"), 1);

        assert_eq!(
            guard.admit(&CheckRequest::new("http://norobots.example/private"), &fetcher).await,
            Admission::Allow
        );
        // no script for this origin: the fetch fails, which also allows
        assert_eq!(
            guard.admit(&CheckRequest::new("https://unknown.example/private"), &fetcher).await,
            Admission::Allow
        );
    }
}
