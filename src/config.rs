// src/config.rs
// =============================================================================
// Runtime configuration.
//
// Every setting has a default, so an empty (or missing) config file is fine.
// The file is TOML, for example:
//
//   max_runtime_secs = 30
//   save_dir = "/var/cache/redcheck"
//   limit_origin_tests = 20
//   referer_deny_list = ["spam.example"]
//
// The CLI can override a few of these (see main.rs).
// =============================================================================

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {problem}")]
    Invalid { key: &'static str, problem: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Deadline for a whole check, descent included.
    pub max_runtime_secs: u64,
    /// Most links checked when descending.
    pub max_links: usize,
    /// Most child fetches in flight at once.
    pub concurrency: usize,
    /// Deadline for one HTTP exchange.
    pub fetch_timeout_secs: u64,
    /// Bytes of each body kept for analysis and storage.
    pub max_body_sample: usize,
    pub user_agent: String,
    /// Referer hosts whose checks are refused.
    pub referer_deny_list: Vec<String>,
    pub robots_enabled: bool,
    /// Checks allowed per origin per period; 0 turns the limit off.
    pub limit_origin_tests: u32,
    pub limit_origin_period_hours: f64,
    /// Checks allowed per client id per period; 0 turns the limit off.
    pub limit_client_tests: u32,
    pub limit_client_period_hours: f64,
    /// Where saved checks live; None disables saving.
    pub save_dir: Option<PathBuf>,
    pub save_days: u32,
    /// Checks moving more than this many KB get logged.
    pub log_traffic_kb: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_runtime_secs: 60,
            max_links: 100,
            concurrency: 10,
            fetch_timeout_secs: 30,
            max_body_sample: 1024 * 1024,
            user_agent: format!(
                "redcheck/{} (+https://github.com/Vswaroop04/redcheck)",
                env!("CARGO_PKG_VERSION")
            ),
            referer_deny_list: Vec::new(),
            robots_enabled: true,
            limit_origin_tests: 0,
            limit_origin_period_hours: 1.0,
            limit_client_tests: 0,
            limit_client_period_hours: 1.0,
            save_dir: None,
            save_days: 30,
            log_traffic_kb: 8192,
        }
    }
}

impl Config {
    // Loads a config file. A missing file is an error here: the caller only
    // asks for a file when the user named one.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "concurrency",
                problem: "must be at least 1".to_string(),
            });
        }
        if self.max_runtime_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "max_runtime_secs",
                problem: "must be at least 1".to_string(),
            });
        }
        for (key, hours) in [
            ("limit_origin_period_hours", self.limit_origin_period_hours),
            ("limit_client_period_hours", self.limit_client_period_hours),
        ] {
            if !(hours.is_finite() && hours > 0.0) {
                return Err(ConfigError::Invalid {
                    key,
                    problem: format!("{hours} is not a positive number of hours"),
                });
            }
        }
        Ok(())
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn origin_period(&self) -> Duration {
        Duration::from_secs_f64(self.limit_origin_period_hours * 3600.0)
    }

    pub fn client_period(&self) -> Duration {
        Duration::from_secs_f64(self.limit_client_period_hours * 3600.0)
    }

    pub fn save_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.save_days))
    }
}
