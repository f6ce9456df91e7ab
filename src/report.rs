// src/report.rs
// =============================================================================
// Turning outcomes into output and exit codes.
//
// Two formats:
// - text: a table of every checked resource, then the notes of the selected
//   one, then a summary (printed to stdout)
// - json: the whole result as one JSON document, for scripts and CI
//
// Exit codes:
//   0 = check done            3 = check denied by policy
//   1 = check failed/timed out 4 = saved check not found
//   2 = internal error        5 = saved check unreadable
// =============================================================================

use crate::analysis::Level;
use crate::check::{CheckOutcome, CheckReport, CheckState, Resource};
use crate::policy::DenyReason;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub const EXIT_DONE: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_DENIED: i32 = 3;
pub const EXIT_NOT_FOUND: i32 = 4;
pub const EXIT_CORRUPT: i32 = 5;

pub fn exit_code(outcome: &CheckOutcome) -> i32 {
    match outcome {
        CheckOutcome::Done(_) => EXIT_DONE,
        CheckOutcome::Failed(_) | CheckOutcome::TimedOut(_) => EXIT_FAILED,
        CheckOutcome::Denied(_) => EXIT_DENIED,
    }
}

/// The HTTP status a web front end would answer a denial with.
pub fn deny_status(reason: &DenyReason) -> u16 {
    match reason {
        DenyReason::Referer(_) | DenyReason::Robots => 403,
        DenyReason::RateLimit(_) => 429,
    }
}

fn outcome_name(outcome: &CheckOutcome) -> &'static str {
    match outcome {
        CheckOutcome::Done(_) => "done",
        CheckOutcome::Failed(_) => "failed",
        CheckOutcome::TimedOut(_) => "timed_out",
        CheckOutcome::Denied(_) => "denied",
    }
}

// Prints the outcome of a fresh check in the requested format.
// `check_name` picks the resource whose notes are shown.
pub fn print_outcome(outcome: &CheckOutcome, format: OutputFormat, check_name: Option<&str>) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let document = match outcome {
                CheckOutcome::Denied(reason) => json!({
                    "outcome": outcome_name(outcome),
                    "status": deny_status(reason),
                    "reason": reason,
                    "message": reason.to_string(),
                }),
                _ => match outcome.report() {
                    Some(report) => report_json(outcome_name(outcome), report, check_name, None),
                    None => json!({ "outcome": outcome_name(outcome) }),
                },
            };
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        OutputFormat::Text => match outcome {
            CheckOutcome::Denied(reason) => {
                println!("⛔ Check refused ({}): {}", deny_status(reason), reason);
                if matches!(reason, DenyReason::RateLimit(_)) {
                    println!("   Try again later.");
                }
            }
            _ => {
                if let Some(report) = outcome.report() {
                    print_report(report, check_name);
                }
            }
        },
    }
    Ok(())
}

// Prints a check read back from storage.
pub fn print_loaded(report: &CheckReport, is_expired: bool, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let document = report_json("loaded", report, None, Some(is_expired));
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        OutputFormat::Text => {
            if is_expired {
                println!("⚠️  This saved check has expired and may be removed soon.");
            }
            print_report(report, None);
        }
    }
    Ok(())
}

fn report_json(outcome: &str, report: &CheckReport, check_name: Option<&str>, is_expired: Option<bool>) -> serde_json::Value {
    let (bytes_in, bytes_out) = report.tree.transfer_totals();
    json!({
        "outcome": outcome,
        "snapshot_id": report.snapshot_id,
        "elapsed_ms": report.elapsed.map(|d| d.as_millis() as u64),
        "expires_at": report.expires_at,
        "is_expired": is_expired,
        "selected": report.selected(check_name).uri(),
        "transfer": { "in": bytes_in, "out": bytes_out },
        "resources": report.tree,
    })
}

// Prints the result tree as a human-readable table in the terminal
fn print_report(report: &CheckReport, check_name: Option<&str>) {
    println!("{:<60} {:<15} {:<10}", "URI", "STATUS", "NOTES");
    println!("{}", "=".repeat(85));

    for resource in report.tree.iter() {
        // Truncate URI if too long for display
        let uri = resource.uri();
        let uri_display = if uri.len() > 57 {
            format!("{}...", truncate_at_char_boundary(uri, 57))
        } else {
            uri.to_string()
        };
        let indent = if resource.parent.is_some() { "  " } else { "" };
        println!(
            "{:<60} {:<15} {:<10}",
            format!("{indent}{uri_display}"),
            format_status(resource),
            resource.notes.len()
        );
    }
    println!();

    let selected = report.selected(check_name);
    println!("📝 Notes for {}:", selected.uri());
    if selected.notes.is_empty() {
        println!("   (none)");
    }
    for note in &selected.notes {
        println!("   {} [{}] {}", format_level(note.level), note.subject, note.render());
    }
    println!();

    let done = report.tree.iter().filter(|r| r.state == CheckState::Done).count();
    let (bytes_in, bytes_out) = report.tree.transfer_totals();
    println!("📊 Summary:");
    println!("   ✅ Done: {}", done);
    println!("   ❌ Failed or timed out: {}", report.tree.len() - done);
    println!("   📋 Total: {}", report.tree.len());
    println!("   📦 Transfer: {} bytes in, {} bytes out", bytes_in, bytes_out);
    if let Some(elapsed) = report.elapsed {
        println!("   ⏱️  Elapsed: {:.2}s", elapsed.as_secs_f64());
    }
    if let Some(id) = &report.snapshot_id {
        println!("   💾 Saved as: {}", id);
    }
}

// Formats a resource's state (and status code once there is a response)
fn format_status(resource: &Resource) -> String {
    let status = resource.response.as_ref().map(|r| r.status);
    match (resource.state, status) {
        (CheckState::Done, Some(code)) if code < 400 => format!("✅ {code}"),
        (CheckState::Done, Some(code)) => format!("❌ {code}"),
        (CheckState::Done, None) => "✅ DONE".to_string(),
        (CheckState::Failed, _) => "⚠️  FAILED".to_string(),
        (CheckState::TimedOut, _) => "⏱️  TIMEOUT".to_string(),
        (_, _) => "… PENDING".to_string(),
    }
}

fn format_level(level: Level) -> &'static str {
    match level {
        Level::Good => "✅",
        Level::Info => "ℹ️ ",
        Level::Warn => "⚠️ ",
        Level::Bad => "❌",
    }
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
