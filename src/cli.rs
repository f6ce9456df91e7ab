// src/cli.rs
// =============================================================================
// This file defines our command-line interface using the `clap` crate.
//
// Subcommands:
//   redcheck check <uri> [--descend] [-H "Name: value"]... [--format json]
//   redcheck show <id>       print a saved check
//   redcheck extend <id>     keep a saved check around longer
//
// --config (or REDCHECK_CONFIG) points at a TOML config file; see config.rs.
// =============================================================================

use crate::report::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "redcheck",
    version,
    about = "Checks HTTP resources for caching, header syntax and interoperability problems",
    long_about = "redcheck fetches a URI, analyzes the response headers against the HTTP \
                  standards and reports what it finds. With --descend it also checks \
                  every link in the page, one hop deep."
)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "REDCHECK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a URI
    ///
    /// Example: redcheck check https://example.com/ --descend
    Check {
        /// URI to check (http or https)
        uri: String,

        /// Also check every link found in the response body
        #[arg(long)]
        descend: bool,

        /// Extra request header, as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Show the notes for this linked URI instead of the root's
        #[arg(long, value_name = "URI")]
        check_name: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Client identifier for per-client rate limits
        #[arg(long, env = "REDCHECK_CLIENT_ID")]
        client_id: Option<String>,

        /// Override max_runtime_secs from the config
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Print a saved check
    Show {
        /// Snapshot id printed when the check was saved
        id: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Keep a saved check for another save_days
    Extend {
        id: String,
    },
}

// Splits "Name: value" into its parts.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid header name {name:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
