//! Event log retention

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use transcript_ledger::cleanup_telemetry;

/// Sweep `telemetry_dir` and print a summary.
///
/// Returns `false` when any log could not be processed.
pub fn run(telemetry_dir: &Path, dry_run: bool, verbose: bool) -> Result<bool> {
    let report = cleanup_telemetry(telemetry_dir, dry_run)
        .with_context(|| format!("Failed to sweep {}", telemetry_dir.display()))?;

    let header = if dry_run {
        "Telemetry cleanup (dry run)"
    } else {
        "Telemetry cleanup"
    };
    println!("{}", header.cyan().bold());
    println!("  Directory:  {}", telemetry_dir.display());
    println!("  Logs found: {}", report.total_logs_found);

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    println!("  {verb}: {}", report.logs_deleted().to_string().green());
    println!("  Kept:       {}", report.logs_kept());

    if verbose || dry_run {
        for deleted in &report.deleted {
            let name = deleted
                .log
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            println!(
                "    {} {} (final output: {})",
                "-".red(),
                name,
                deleted.final_output.display()
            );
        }
    }
    if verbose {
        for (log, reason) in &report.kept {
            let name = log
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            println!("    {} {}: {}", "=".dimmed(), name, reason);
        }
    }

    if report.errors.is_empty() {
        return Ok(true);
    }

    println!();
    println!("{}", format!("{} errors:", report.errors.len()).red().bold());
    for error in &report.errors {
        println!("    {error}");
    }
    Ok(false)
}
