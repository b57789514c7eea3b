use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use crate::models::{AlertLevel, SummaryRecord};
use crate::output::SummaryLine;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertLevelSummary {
    pub alert_level: AlertLevel,
    pub groups: usize,
    pub reports: usize,
    pub avg_severity: f64,
}

pub fn summarize_by_level(summaries: &[SummaryRecord]) -> Vec<AlertLevelSummary> {
    let mut map: HashMap<AlertLevel, (usize, usize, f64)> = HashMap::new();

    for summary in summaries {
        let entry = map.entry(summary.alert_level).or_insert((0, 0, 0.0));
        entry.0 += 1;
        entry.1 += summary.count;
        entry.2 += summary.avg_severity * summary.count as f64;
    }

    let mut levels: Vec<AlertLevelSummary> = map
        .into_iter()
        .map(|(alert_level, (groups, reports, weighted_severity))| AlertLevelSummary {
            alert_level,
            groups,
            reports,
            avg_severity: if reports == 0 {
                0.0
            } else {
                weighted_severity / reports as f64
            },
        })
        .collect();

    levels.sort_by(|a, b| b.alert_level.cmp(&a.alert_level));
    levels
}

/// Highest alert first, then by report volume.
pub fn rank_summaries(summaries: &[SummaryRecord]) -> Vec<SummaryRecord> {
    let mut ranked = summaries.to_vec();
    ranked.sort_by(|a, b| {
        b.alert_level
            .cmp(&a.alert_level)
            .then(b.count.cmp(&a.count))
            .then(
                b.avg_severity
                    .partial_cmp(&a.avg_severity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    ranked
}

pub fn build_report(lines: &[SummaryLine], limit: usize) -> String {
    let summaries: Vec<SummaryRecord> = lines.iter().map(|line| line.summary.clone()).collect();
    let runs: BTreeSet<String> = lines.iter().map(|line| line.run_id.to_string()).collect();
    let levels = summarize_by_level(&summaries);
    let ranked = rank_summaries(&summaries);

    let mut output = String::new();

    let _ = writeln!(output, "# Disaster Alert Report");
    if runs.is_empty() {
        let _ = writeln!(output, "Generated from an empty summary set");
    } else {
        let run_list: Vec<&str> = runs.iter().map(String::as_str).collect();
        let _ = writeln!(
            output,
            "Generated from run {} ({} groups)",
            run_list.join(", "),
            summaries.len()
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Alert Mix");

    if levels.is_empty() {
        let _ = writeln!(output, "No alerts in this run.");
    } else {
        for level in levels.iter() {
            let _ = writeln!(
                output,
                "- {} ({}): {} groups, {} reports (avg severity {:.1})",
                level.alert_level.label(),
                u8::from(level.alert_level),
                level.groups,
                level.reports,
                level.avg_severity
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Alert Groups");

    if ranked.is_empty() {
        let _ = writeln!(output, "No groups in this run.");
    } else {
        for summary in ranked.iter().take(limit) {
            let _ = writeln!(
                output,
                "- {} / {}: level {} across {} reports, {} verified (avg severity {:.2})",
                summary.location,
                summary.disaster_type,
                u8::from(summary.alert_level),
                summary.count,
                summary.verified_reports,
                summary.avg_severity
            );
        }
    }

    let mut recent = summaries;
    recent.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Most Recent Activity");

    if recent.is_empty() {
        let _ = writeln!(output, "No groups in this run.");
    } else {
        for summary in recent.iter().take(limit.min(5)) {
            let _ = writeln!(
                output,
                "- {} / {} last updated {}",
                summary.location, summary.disaster_type, summary.last_updated
            );
        }
    }

    output
}
