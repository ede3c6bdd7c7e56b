//! Terminal rendering for batch summaries and status listings.

use colored::Colorize;
use convoy_core::{BatchState, BatchStatus, BatchSummary, FeatureStatus};

/// Prints the end-of-run batch summary.
pub fn print_summary(summary: &BatchSummary) {
    println!();
    println!("{} {}", "Batch".bold(), summary.batch_id.bold());
    println!("Status: {}", status_label(summary.status));
    println!();

    for (idx, feature) in summary.features.iter().enumerate() {
        let marker = match feature.status {
            FeatureStatus::Completed => "✓".green(),
            FeatureStatus::Failed => "✗".red(),
            FeatureStatus::Skipped => "-".dimmed(),
            FeatureStatus::Pending | FeatureStatus::InProgress => "·".yellow(),
        };
        let attempts = if feature.attempts > 1 {
            format!(" ({} attempts)", feature.attempts).dimmed().to_string()
        } else {
            String::new()
        };
        let issue = feature
            .issue_number
            .map(|n| format!(" #{n}").cyan().to_string())
            .unwrap_or_default();
        println!(
            "  {} [{}] {}{}{}",
            marker,
            idx + 1,
            truncate(&feature.description, 72),
            issue,
            attempts
        );
        if feature.status == FeatureStatus::Failed {
            if let Some(error) = &feature.last_error {
                println!("      {}", truncate(error, 76).red().dimmed());
            }
        }
    }

    println!();
    println!(
        "  {} completed, {} failed, {} skipped, {} pending · {} retries",
        summary.completed.to_string().green(),
        summary.failed.to_string().red(),
        summary.skipped,
        summary.pending,
        summary.total_retries
    );

    if let Some(trip) = &summary.breaker_trip {
        println!();
        println!(
            "  {} feature {} tripped the circuit breaker after {} consecutive failures",
            "paused:".yellow().bold(),
            trip.feature_index + 1,
            trip.consecutive_failures
        );
        println!("  Diagnose the failures, then re-run with --resume {}", summary.batch_id);
    }
}

/// Prints one line of the `convoy status` listing.
pub fn print_batch_line(batch: &BatchState) {
    let (completed, failed, skipped, pending) = batch.counts();
    println!(
        "  {}  {}  {}/{} done ({} failed, {} skipped, {} pending)",
        batch.batch_id.bold(),
        status_label(batch.status),
        completed,
        batch.features.len(),
        failed,
        skipped,
        pending
    );
}

fn status_label(status: BatchStatus) -> colored::ColoredString {
    match status {
        BatchStatus::Pending => "pending".dimmed(),
        BatchStatus::Running => "running".cyan(),
        BatchStatus::Paused => "paused".yellow().bold(),
        BatchStatus::Completed => "completed".green().bold(),
        BatchStatus::Failed => "failed".red().bold(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn test_truncate_long() {
        let result = truncate(&"x".repeat(100), 10);
        assert_eq!(result, format!("{}...", "x".repeat(10)));
    }
}
