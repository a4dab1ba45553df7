//! Single-job inspection
//!
//! Replays the job's log and prints what a resumed run would see.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Local;
use colored::Colorize;
use transcript_ledger::{
    config::EVENT_LOG_LINK, format_completion_time, format_elapsed, format_eta, monitor,
    read_events, replay, validate_recent_pages, LedgerConfig,
};

use super::page_ranges;

pub fn run(config: &LedgerConfig, job_dir: &Path) -> Result<()> {
    let log = job_dir.join(EVENT_LOG_LINK);
    let events =
        read_events(&log).with_context(|| format!("Failed to read {}", log.display()))?;
    let Some(state) = replay(&events) else {
        bail!(
            "{} has no job_started event; the job cannot be resumed",
            log.display()
        );
    };

    println!("{}", format!("Job: {}", state.job_id).cyan().bold());
    println!("  Source:     {}", state.pdf_source);
    println!("  Output:     {}", state.output_dir);
    println!("  Quality:    {} ({})", state.quality, state.mode);
    println!(
        "  Started:    {}",
        state.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Updated:    {}",
        state.last_updated.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    println!();

    let status = if state.is_complete() {
        "all pages complete".green().bold()
    } else {
        "in progress".yellow().bold()
    };
    println!(
        "  Progress:   {}/{} pages ({:.1}%), {}",
        state.completed_pages.len(),
        state.total_pages,
        state.completion_percentage(),
        status
    );
    println!("  Pending:    {}", page_ranges(&state.pending_pages()));

    let failures = state.outstanding_failures();
    if failures.is_empty() {
        println!("  Failed:     none");
    } else {
        println!("  Failed:     {}", page_ranges(&failures).red());
    }

    let recent = validate_recent_pages(&events, config.validation_count);
    println!("  Recent:     {}", page_ranges(&recent.validated));

    if let Some(metrics) = monitor::metrics_from_events(
        &events,
        config.velocity_window,
        config.min_pages_for_velocity,
        chrono::Utc::now(),
    ) {
        println!();
        println!("{}", "Throughput".cyan().bold());
        println!("  Elapsed:    {}", format_elapsed(metrics.elapsed));
        if metrics.window_size > 0 {
            println!(
                "  Velocity:   {:.1} pages/h over last {} pages",
                metrics.velocity, metrics.window_size
            );
        } else {
            println!("  Velocity:   not enough pages yet");
        }
        if !state.is_complete() {
            println!(
                "  ETA:        {} (around {})",
                format_eta(metrics.eta_hours),
                format_completion_time(metrics.completion_time)
            );
        }
    }

    Ok(())
}
