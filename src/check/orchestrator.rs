// src/check/orchestrator.rs
// =============================================================================
// The entry point for running a check.
//
// Checker::check(request):
// 1. Ask the policy guard. A denied request stops here: no fetch, no id,
//    no further rate budget.
// 2. Reserve a snapshot id if saving is configured (best-effort).
// 3. Run the state machine under one deadline (max_runtime). If the deadline
//    wins, every unfinished resource becomes TimedOut and the root gets a
//    note naming what was still in flight.
// 4. Save Done and Failed checks; timed-out checks aren't saved.
// 5. Log checks that moved a lot of bytes.
//
// The timeout race produces exactly one result, so every check yields
// exactly one CheckOutcome.
//
// Checker::load / Checker::extend serve saved checks back.
// =============================================================================

use super::machine::{run_root, CheckContext};
use super::resource::{CheckState, Resource, ResourceTree};
use crate::analysis::notes::CHECK_TIMEOUT;
use crate::analysis::{HeaderAnalyzer, StandardAnalyzer};
use crate::config::Config;
use crate::fetch::{ExchangeRequest, Fetcher, HeaderField};
use crate::policy::{Admission, DenyReason, PolicyGuard};
use crate::report::OutputFormat;
use crate::store::{SnapshotStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to check and how. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub uri: String,
    /// Request headers to send instead of (or in addition to) the defaults.
    pub headers: Vec<HeaderField>,
    pub descend: bool,
    /// Which resource of the finished tree to show, by URI.
    pub check_name: Option<String>,
    pub format: OutputFormat,
    /// Identifies the client for per-client rate limiting.
    pub client_id: Option<String>,
}

impl CheckRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            headers: Vec::new(),
            descend: false,
            check_name: None,
            format: OutputFormat::Text,
            client_id: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn descend(mut self, descend: bool) -> Self {
        self.descend = descend;
        self
    }

    pub fn check_name(mut self, check_name: impl Into<String>) -> Self {
        self.check_name = Some(check_name.into());
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    // The headers actually sent: the overrides, plus our User-Agent unless
    // the overrides set one.
    fn exchange_headers(&self, user_agent: &str) -> Vec<HeaderField> {
        let mut headers = self.headers.clone();
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("user-agent")) {
            headers.insert(0, ("User-Agent".to_string(), user_agent.to_string()));
        }
        headers
    }
}

/// A finished (or loaded) check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub snapshot_id: Option<String>,
    pub tree: ResourceTree,
    /// How long the check ran; unknown for loaded checks.
    pub elapsed: Option<Duration>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckReport {
    /// The resource to display: the one checked for `check_name` when there
    /// is one, the root otherwise.
    pub fn selected(&self, check_name: Option<&str>) -> &Resource {
        check_name
            .and_then(|name| self.tree.find_by_uri(name))
            .and_then(|id| self.tree.get(id))
            .unwrap_or_else(|| self.tree.root())
    }
}

#[derive(Debug)]
pub enum CheckOutcome {
    Done(CheckReport),
    Failed(CheckReport),
    TimedOut(CheckReport),
    Denied(DenyReason),
}

impl CheckOutcome {
    pub fn report(&self) -> Option<&CheckReport> {
        match self {
            CheckOutcome::Done(report) | CheckOutcome::Failed(report) | CheckOutcome::TimedOut(report) => {
                Some(report)
            }
            CheckOutcome::Denied(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded { report: CheckReport, is_expired: bool },
    StorageNotFound,
    StorageCorrupt(String),
}

pub struct Checker<F> {
    config: Config,
    fetcher: F,
    analyzer: Box<dyn HeaderAnalyzer>,
    guard: PolicyGuard,
    store: Option<SnapshotStore>,
}

impl<F: Fetcher> Checker<F> {
    pub fn new(config: Config, fetcher: F) -> Self {
        let guard = PolicyGuard::from_config(&config);
        let store = config
            .save_dir
            .as_ref()
            .map(|dir| SnapshotStore::new(dir, config.save_lifetime()));
        Self {
            config,
            fetcher,
            analyzer: Box::new(StandardAnalyzer::default()),
            guard,
            store,
        }
    }

    pub async fn check(&self, request: &CheckRequest) -> CheckOutcome {
        if let Admission::Deny(reason) = self.guard.admit(request, &self.fetcher).await {
            info!(uri = %request.uri, reason = %reason, "check denied");
            return CheckOutcome::Denied(reason);
        }

        let snapshot_id = self.store.as_ref().and_then(|store| match store.reserve() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "not saving this check");
                None
            }
        });

        let started = Instant::now();
        let tree = RefCell::new(ResourceTree::new(ExchangeRequest::get(
            request.uri.as_str(),
            request.exchange_headers(&self.config.user_agent),
        )));
        let ctx = CheckContext {
            fetcher: &self.fetcher,
            analyzer: self.analyzer.as_ref(),
            guard: &self.guard,
            config: &self.config,
            tree: &tree,
        };

        let timed_out = tokio::time::timeout(self.config.max_runtime(), run_root(&ctx, request.descend))
            .await
            .is_err();
        let elapsed = started.elapsed();

        let mut tree = tree.into_inner();
        if timed_out {
            let in_flight = tree.force_timeout();
            warn!(uri = %request.uri, in_flight = in_flight.len(), "check timed out");
            let root = tree.root_id();
            tree.push_note(root, CHECK_TIMEOUT.note("check").with("in_flight", in_flight.join(", ")));
        }

        let (bytes_in, bytes_out) = tree.transfer_totals();
        let total = bytes_in + bytes_out;
        if exceeds_traffic_log(total, self.config.log_traffic_kb) {
            warn!(uri = %request.uri, bytes_in, bytes_out, "large check");
        }

        let state = tree.root().state;
        if let (Some(store), Some(id)) = (&self.store, &snapshot_id) {
            if state == CheckState::TimedOut {
                store.discard(id);
            } else {
                store.save(id, &tree);
            }
        }

        debug!(uri = %request.uri, ?state, resources = tree.len(), elapsed_ms = elapsed.as_millis() as u64, "check finished");
        let report = CheckReport {
            snapshot_id: snapshot_id.filter(|_| state != CheckState::TimedOut),
            tree,
            elapsed: Some(elapsed),
            expires_at: None,
        };
        match state {
            CheckState::Done => CheckOutcome::Done(report),
            CheckState::TimedOut => CheckOutcome::TimedOut(report),
            _ => CheckOutcome::Failed(report),
        }
    }

    pub fn load(&self, id: &str) -> LoadOutcome {
        let Some(store) = &self.store else {
            return LoadOutcome::StorageNotFound;
        };
        match store.load(id) {
            Ok(snapshot) => LoadOutcome::Loaded {
                report: CheckReport {
                    snapshot_id: Some(snapshot.id),
                    tree: snapshot.tree,
                    elapsed: None,
                    expires_at: Some(snapshot.expires_at),
                },
                is_expired: snapshot.is_expired,
            },
            Err(StoreError::NotFound(_)) => LoadOutcome::StorageNotFound,
            Err(e) => {
                warn!(id = %id, error = %e, "failed to load saved check");
                LoadOutcome::StorageCorrupt(e.to_string())
            }
        }
    }

    /// Keeps a saved check around for another `save_days`.
    pub fn extend(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let expires_at = store.next_expiry();
        store.touch(id, expires_at)?;
        info!(id = %id, %expires_at, "extended saved check");
        Ok(expires_at)
    }
}

fn exceeds_traffic_log(total_bytes: u64, limit_kb: u64) -> bool {
    total_bytes > limit_kb.saturating_mul(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::testing::ScriptedFetcher;
    use crate::policy::LimitScope;

    fn config() -> Config {
        Config {
            robots_enabled: false,
            ..Config::default()
        }
    }

    fn saving_config(dir: &tempfile::TempDir) -> Config {
        Config {
            save_dir: Some(dir.path().to_path_buf()),
            ..config()
        }
    }

    fn site() -> ScriptedFetcher {
        ScriptedFetcher::new()
            .respond(
                "https://example.com/",
                200,
                &[("Content-Type", "text/html"), ("X-Content-Type-Options", "nosniff")],
                "<a href='/a'>a</a>",
            )
            .respond("https://example.com/a", 200, &[], "a")
    }

    #[tokio::test]
    async fn test_done_check_is_saved_and_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let checker = Checker::new(saving_config(&dir), site());

        let outcome = checker.check(&CheckRequest::new("https://example.com/").descend(true)).await;
        let CheckOutcome::Done(report) = outcome else {
            panic!("expected Done, got {outcome:?}");
        };
        assert_eq!(report.tree.len(), 2);
        let id = report.snapshot_id.clone().unwrap();

        match checker.load(&id) {
            LoadOutcome::Loaded { report: loaded, is_expired } => {
                assert!(!is_expired);
                assert_eq!(loaded.tree, report.tree);
            }
            other => panic!("expected Loaded, got {other:?}"),
        }

        let expires_at = checker.extend(&id).unwrap();
        assert!(expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_user_agent_is_added_unless_overridden() {
        let checker = Checker::new(config(), site());
        let CheckOutcome::Done(report) = checker.check(&CheckRequest::new("https://example.com/")).await else {
            panic!("expected Done");
        };
        let headers = &report.tree.root().request.headers;
        assert_eq!(headers[0].0, "User-Agent");

        let request = CheckRequest::new("https://example.com/").header("user-agent", "custom/1.0");
        let CheckOutcome::Done(report) = checker.check(&request).await else {
            panic!("expected Done");
        };
        assert_eq!(report.tree.root().request.headers, vec![("user-agent".to_string(), "custom/1.0".to_string())]);
    }

    #[test]
    fn test_traffic_log_threshold() {
        assert!(!exceeds_traffic_log(1024, 1));
        assert!(exceeds_traffic_log(1025, 1));
        assert!(!exceeds_traffic_log(u64::MAX, u64::MAX));
    }

    #[tokio::test]
    async fn test_huge_traffic_log_setting_is_accepted() {
        let checker = Checker::new(
            Config {
                log_traffic_kb: u64::MAX,
                ..config()
            },
            site(),
        );
        assert!(matches!(
            checker.check(&CheckRequest::new("https://example.com/")).await,
            CheckOutcome::Done(_)
        ));
    }

    #[tokio::test]
    async fn test_denied_check_reserves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let checker = Checker::new(
            Config {
                limit_origin_tests: 1,
                ..saving_config(&dir)
            },
            site(),
        );

        assert!(matches!(
            checker.check(&CheckRequest::new("https://example.com/")).await,
            CheckOutcome::Done(_)
        ));
        let outcome = checker.check(&CheckRequest::new("https://example.com/")).await;
        assert!(matches!(outcome, CheckOutcome::Denied(DenyReason::RateLimit(LimitScope::Origin))));
        // only the first check left a file behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_failed_check_is_reported_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let checker = Checker::new(saving_config(&dir), ScriptedFetcher::new());
        let outcome = checker.check(&CheckRequest::new("https://nowhere.example/")).await;
        let CheckOutcome::Failed(report) = outcome else {
            panic!("expected Failed, got {outcome:?}");
        };
        let id = report.snapshot_id.unwrap();
        assert!(matches!(checker.load(&id), LoadOutcome::Loaded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_completing_fetch_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            max_runtime_secs: 5,
            ..saving_config(&dir)
        };
        let checker = Checker::new(config, ScriptedFetcher::new().hang("https://example.com/"));

        let started = Instant::now();
        let outcome = checker.check(&CheckRequest::new("https://example.com/")).await;
        let waited = started.elapsed();

        let CheckOutcome::TimedOut(report) = outcome else {
            panic!("expected TimedOut, got {outcome:?}");
        };
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(report.tree.root().state, CheckState::TimedOut);
        let note = report.tree.root().notes.last().unwrap();
        assert_eq!(note.id, "CHECK_TIMEOUT");
        assert_eq!(note.params["in_flight"], "https://example.com/");
        // timed-out checks aren't saved, and the reserved id is released
        assert!(report.snapshot_id.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_descent_keeps_finished_children() {
        let config = Config {
            max_runtime_secs: 5,
            ..config()
        };
        let fetcher = ScriptedFetcher::new()
            .respond(
                "https://example.com/",
                200,
                &[("Content-Type", "text/html")],
                "<a href='/fast'>f</a><a href='/slow'>s</a>",
            )
            .respond_after("https://example.com/fast", Duration::from_secs(1), "fast")
            .hang("https://example.com/slow");
        let checker = Checker::new(config, fetcher);

        let outcome = checker.check(&CheckRequest::new("https://example.com/").descend(true)).await;
        let CheckOutcome::TimedOut(report) = outcome else {
            panic!("expected TimedOut, got {outcome:?}");
        };
        let tree = &report.tree;
        assert!(tree.iter().all(|r| r.state.is_terminal()));
        let fast = tree.find_by_uri("https://example.com/fast").unwrap();
        assert_eq!(tree.get(fast).unwrap().state, CheckState::Done);
        let slow = tree.find_by_uri("https://example.com/slow").unwrap();
        assert_eq!(tree.get(slow).unwrap().state, CheckState::TimedOut);
        let note = tree.root().notes.last().unwrap();
        assert_eq!(note.params["in_flight"], "https://example.com/, https://example.com/slow");
    }

    #[tokio::test]
    async fn test_load_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let checker = Checker::new(saving_config(&dir), site());
        assert!(matches!(
            checker.load("0123456789abcdef0123456789abcdef"),
            LoadOutcome::StorageNotFound
        ));

        std::fs::write(dir.path().join("0123456789abcdef0123456789abcdef"), b"junk").unwrap();
        assert!(matches!(
            checker.load("0123456789abcdef0123456789abcdef"),
            LoadOutcome::StorageCorrupt(_)
        ));

        // no store configured
        let checker = Checker::new(config(), site());
        assert!(matches!(checker.load("0123456789abcdef0123456789abcdef"), LoadOutcome::StorageNotFound));
        assert!(checker.extend("0123456789abcdef0123456789abcdef").is_err());
    }

    #[test]
    fn test_selected_falls_back_to_root() {
        let mut tree = ResourceTree::new(ExchangeRequest::get("https://example.com/", Vec::new()));
        let root = tree.root_id();
        let link = crate::links::FoundLink {
            target: "https://example.com/a".to_string(),
            tag: "a".to_string(),
            title: None,
        };
        tree.set_links(root, vec![link.clone()]);
        tree.add_child(root, &link, ExchangeRequest::get("https://example.com/a", Vec::new()));
        let report = CheckReport {
            snapshot_id: None,
            tree,
            elapsed: None,
            expires_at: None,
        };
        assert_eq!(report.selected(Some("https://example.com/a")).uri(), "https://example.com/a");
        assert_eq!(report.selected(Some("https://example.com/zzz")).uri(), "https://example.com/");
        assert_eq!(report.selected(None).uri(), "https://example.com/");
    }
}
