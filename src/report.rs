//! Operator-facing summaries. Everything here only formats, nothing touches disk or network.

use std::fmt::Write;

use crate::{
    storage::{CoverageSummary, YearMonth},
    sync::SyncReport,
};

/// Total count followed by the breakdown by year and by day.
pub fn format_revision_counts(document: &str, counts: &CoverageSummary) -> String {
    if counts.total == 0 {
        return format!("No revisions found for '{}'.", document);
    }

    let mut output = format!("Found {} total revisions for '{}'.\n", counts.total, document);

    if !counts.by_year.is_empty() {
        output.push_str("\nBreakdown by year:\n");
        for (year, count) in &counts.by_year {
            let _ = writeln!(output, "  {:04}: {} revisions", year, count);
        }
    }

    if !counts.by_day.is_empty() {
        output.push_str("\nBreakdown by day:\n");
        for (date, count) in &counts.by_day {
            let _ = writeln!(output, "  {}: {} revisions", date, count);
        }
    }

    output.truncate(output.trim_end().len());
    output
}

pub fn format_date_range(
    document: &str,
    total: usize,
    earliest: Option<YearMonth>,
    latest: Option<YearMonth>,
) -> String {
    match (earliest, latest) {
        (Some(earliest), Some(latest)) if total > 0 => format!(
            "Page {} had {} revisions between {} and {}",
            document, total, earliest, latest
        ),
        _ => format!("Page {} has no stored revisions", document),
    }
}

pub fn format_sync_report(report: &SyncReport) -> String {
    let mut output = if report.fetched {
        format!(
            "Synced '{}': {} revisions stored, {} new, {} already present, {} skipped",
            report.document,
            report.after.total,
            report.newly_added(),
            report.already_present,
            report.skipped
        )
    } else {
        format!(
            "'{}' was already downloaded, {} revisions stored (use --full-refresh to fetch again)",
            report.document, report.after.total
        )
    };

    if report.skipped > 0 {
        let _ = write!(
            output,
            "\n  {} revisions could not be parsed or stored, see the log for details",
            report.skipped
        );
    }
    output
}
