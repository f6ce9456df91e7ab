// src/main.rs
// =============================================================================
// This is the entry point of the redcheck CLI.
//
// What happens here:
// 1. Set up logging (to stderr, so JSON on stdout stays clean)
// 2. Parse command-line arguments using clap and load the config file
// 3. Dispatch to the appropriate subcommand handler
// 4. Exit with the code report.rs picks for the outcome (2 = internal error)
// =============================================================================

// Module declarations - tells Rust about our other source files
mod analysis; // src/analysis/ - header parsing and diagnostic notes
mod check; // src/check/ - the check engine
mod cli; // src/cli.rs - command-line parsing
mod config; // src/config.rs - settings
mod fetch; // src/fetch/ - HTTP exchanges
mod links; // src/links/ - link extraction from bodies
mod policy; // src/policy/ - referer, robots.txt and rate limits
mod report; // src/report.rs - output and exit codes
mod store; // src/store.rs - saved checks

use anyhow::{Context, Result};
use check::{CheckRequest, Checker, LoadOutcome};
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use fetch::HttpFetcher;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // Unexpected errors get exit code 2
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Check {
            uri,
            descend,
            headers,
            check_name,
            format,
            client_id,
            timeout,
        } => {
            if let Some(secs) = timeout {
                config.max_runtime_secs = secs;
            }
            config.validate()?;

            let mut request = CheckRequest::new(uri).descend(descend).format(format);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            if let Some(check_name) = check_name {
                request = request.check_name(check_name);
            }
            if let Some(client_id) = client_id {
                request = request.client_id(client_id);
            }
            handle_check(config, &request).await
        }
        Commands::Show { id, format } => handle_show(config, &id, format),
        Commands::Extend { id } => handle_extend(config, &id),
    }
}

// Handles the 'check' subcommand
async fn handle_check(config: Config, request: &CheckRequest) -> Result<i32> {
    url::Url::parse(&request.uri).with_context(|| format!("invalid URI {:?}", request.uri))?;

    let fetcher = HttpFetcher::new(config.fetch_timeout()).context("failed to set up the HTTP client")?;
    let checker = Checker::new(config, fetcher);

    let outcome = checker.check(request).await;
    report::print_outcome(&outcome, request.format, request.check_name.as_deref())?;
    Ok(report::exit_code(&outcome))
}

// Handles the 'show' subcommand
fn handle_show(config: Config, id: &str, format: report::OutputFormat) -> Result<i32> {
    let checker = saved_checks(config)?;
    match checker.load(id) {
        LoadOutcome::Loaded { report, is_expired } => {
            report::print_loaded(&report, is_expired, format)?;
            Ok(report::EXIT_DONE)
        }
        LoadOutcome::StorageNotFound => {
            eprintln!("No saved check with id {id}");
            Ok(report::EXIT_NOT_FOUND)
        }
        LoadOutcome::StorageCorrupt(problem) => {
            eprintln!("Saved check {id} can't be read: {problem}");
            Ok(report::EXIT_CORRUPT)
        }
    }
}

// Handles the 'extend' subcommand
fn handle_extend(config: Config, id: &str) -> Result<i32> {
    let checker = saved_checks(config)?;
    match checker.extend(id) {
        Ok(expires_at) => {
            println!("Saved check {id} now expires at {expires_at}");
            Ok(report::EXIT_DONE)
        }
        Err(store::StoreError::NotFound(_)) => {
            eprintln!("No saved check with id {id}");
            Ok(report::EXIT_NOT_FOUND)
        }
        Err(e) => Err(e).with_context(|| format!("failed to extend saved check {id}")),
    }
}

// show/extend only read the store, but go through Checker so they share its
// view of the config.
fn saved_checks(config: Config) -> Result<Checker<HttpFetcher>> {
    if config.save_dir.is_none() {
        anyhow::bail!("no save_dir configured; set it in the config file");
    }
    let fetcher = HttpFetcher::new(config.fetch_timeout()).context("failed to set up the HTTP client")?;
    Ok(Checker::new(config, fetcher))
}
