//! Job listing
//!
//! One row per discovered job with liveness, progress, velocity and ETA.

use std::time::Duration;

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use transcript_ledger::{
    calculate_metrics, discover_jobs, format_completion_time, format_eta, JobInfo, LedgerConfig,
    Liveness,
};

/// Print the job table once.
pub fn list(config: &LedgerConfig) -> Result<()> {
    let jobs = discover_jobs(&config.output_dir, config.stale_threshold).with_context(|| {
        format!("Failed to scan {}", config.output_dir.display())
    })?;

    if jobs.is_empty() {
        println!(
            "{}",
            format!("No jobs found under {}", config.output_dir.display()).dimmed()
        );
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<10} {:<32} {:>11} {:>9} {:>8} {:>6} {:>9}",
            "STATUS", "JOB", "PAGES", "PAGES/H", "ETA", "DONE", "ERR/WARN"
        )
        .bold()
    );
    for job in &jobs {
        print_row(config, job);
    }

    let active = jobs.iter().filter(|j| j.liveness() == Liveness::Active).count();
    let stalled = jobs.iter().filter(|j| j.liveness() == Liveness::Stalled).count();
    println!();
    println!(
        "{} jobs: {} active, {} stalled, {} completed",
        jobs.len(),
        active.to_string().green(),
        stalled.to_string().yellow(),
        jobs.len() - active - stalled
    );
    Ok(())
}

/// Redraw the table every `secs` seconds until Ctrl-C.
pub async fn watch(config: &LedgerConfig, secs: u64) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Clear screen, cursor home
                print!("\x1B[2J\x1B[H");
                list(config)?;
                println!("{}", format!("Refreshing every {secs}s, Ctrl-C to exit").dimmed());
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                println!();
                return Ok(());
            }
        }
    }
}

fn print_row(config: &LedgerConfig, job: &JobInfo) {
    let metrics = match calculate_metrics(
        &job.event_log_path,
        config.velocity_window,
        config.min_pages_for_velocity,
    ) {
        Ok(metrics) => metrics,
        Err(e) => {
            tracing::warn!(job_id = %job.job_id, error = %e, "could not compute metrics");
            None
        }
    };

    let total = job
        .total_pages
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string());
    let pages = format!("{}/{}", job.pages_completed, total);

    let (velocity, eta, done_at) = match (&metrics, job.liveness()) {
        (_, Liveness::Completed) => ("-".to_string(), "-".to_string(), "-".to_string()),
        (Some(m), _) if m.velocity > 0.0 => (
            format!("{:.1}", m.velocity),
            format_eta(m.eta_hours),
            format_completion_time(m.completion_time),
        ),
        _ => ("-".to_string(), "Unknown".to_string(), "-".to_string()),
    };

    let counts = format!("{}/{}", job.error_count, job.warning_count);
    let counts = if job.error_count > 0 {
        counts.red()
    } else if job.warning_count > 0 {
        counts.yellow()
    } else {
        counts.normal()
    };

    println!(
        "{:<10} {:<32} {:>11} {:>9} {:>8} {:>6} {:>9}",
        status_label(job.liveness()),
        truncate(&job.job_id, 32),
        pages,
        velocity,
        eta,
        done_at,
        counts
    );
}

fn status_label(liveness: Liveness) -> ColoredString {
    let label = format!("{liveness:<10}");
    match liveness {
        Liveness::Active => label.green().bold(),
        Liveness::Stalled => label.yellow().bold(),
        Liveness::Completed => label.blue(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}
