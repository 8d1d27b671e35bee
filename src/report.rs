use std::fmt::Write;

use chrono::{DateTime, Duration, Utc};

use crate::evaluator::Verdict;
use crate::models::AlertRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictSummary {
    pub verdict: Verdict,
    pub count: usize,
    pub open: usize,
}

pub fn cutoff(since_days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(since_days.max(1))
}

pub fn summarize_by_verdict(records: &[AlertRecord]) -> Vec<VerdictSummary> {
    let mut summaries: Vec<VerdictSummary> = [Verdict::CriticalHigh, Verdict::CriticalLow]
        .into_iter()
        .map(|verdict| {
            let matching = records.iter().filter(|record| record.alert.verdict == verdict);
            let (count, open) = matching.fold((0, 0), |(count, open), record| {
                (count + 1, open + usize::from(!record.alert.resolved))
            });
            VerdictSummary {
                verdict,
                count,
                open,
            }
        })
        .filter(|summary| summary.count > 0)
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

fn age_label(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - since).num_minutes().max(0);
    match minutes {
        0..=59 => format!("{minutes}m"),
        60..=1439 => format!("{}h{:02}m", minutes / 60, minutes % 60),
        _ => format!("{}d", minutes / 1440),
    }
}

/// Alerts feeding one digest. `window` holds alerts raised since the cutoff,
/// `open` every unresolved alert, `resolved` those resolved in the last day.
pub struct Sections<'a> {
    pub window: &'a [AlertRecord],
    pub open: &'a [AlertRecord],
    pub resolved: &'a [AlertRecord],
}

pub fn build_report(scope: Option<&str>, cutoff: DateTime<Utc>, sections: &Sections<'_>) -> String {
    let now = Utc::now();
    let summaries = summarize_by_verdict(sections.window);

    let mut output = String::new();
    let scope_label = scope.unwrap_or("all places");

    let _ = writeln!(output, "# Critical Heart Rate Alert Digest");
    let _ = writeln!(
        output,
        "Generated for {} (alerts since {})",
        scope_label,
        cutoff.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Verdict Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No alerts raised in this window.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} alerts ({} still open)",
                summary.verdict, summary.count, summary.open
            );
        }
    }

    let mut open: Vec<&AlertRecord> = sections.open.iter().filter(|r| !r.alert.resolved).collect();
    open.sort_by(|a, b| a.alert.created_at.cmp(&b.alert.created_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Alerts");

    if open.is_empty() {
        let _ = writeln!(output, "No open alerts.");
    } else {
        for record in open.iter() {
            let _ = writeln!(
                output,
                "- {} ({}) {} bpm, open {}: {}",
                record.patient_name,
                record.place_name,
                record.bpm,
                age_label(record.alert.created_at, now),
                record.alert.message
            );
        }
    }

    let day_ago = now - Duration::days(1);
    let mut resolved: Vec<&AlertRecord> = sections
        .resolved
        .iter()
        .filter(|r| r.alert.resolved_at.map_or(false, |at| at >= day_ago))
        .collect();
    resolved.sort_by(|a, b| b.alert.resolved_at.cmp(&a.alert.resolved_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recently Resolved");

    if resolved.is_empty() {
        let _ = writeln!(output, "No alerts resolved in the last day.");
    } else {
        for record in resolved.iter().take(10) {
            let handled_in = record
                .alert
                .resolved_at
                .map(|at| age_label(record.alert.created_at, at))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                output,
                "- {} ({}) {} bpm, handled in {}",
                record.patient_name, record.place_name, record.bpm, handled_in
            );
        }
    }

    output
}
