//! Post-exam violation summary.
//!
//! Recorded events are grouped by kind. For tab switches and fullscreen
//! exits the locally persisted counters are authoritative, since the
//! server-side list may miss reports that failed in flight.

use crate::detector::{FULLSCREEN_EXIT_DETAILS, TAB_SWITCH_DETAILS};
use chrono::{DateTime, Utc};
use proctor_common::{RecordedViolation, ViolationCounters, ViolationEvent, ViolationKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::warn;

pub const NO_VIOLATIONS: &str = "No violations detected during the exam.";

/// One row of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationSummary {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub count: u32,
    /// Details of the first event seen for this kind.
    pub details: String,
    pub confidence: f64,
    /// Occurrence times, in input order.
    pub timestamps: Vec<DateTime<Utc>>,
}

impl ViolationSummary {
    /// Locally counted kinds show a count only.
    pub fn shows_timestamps(&self) -> bool {
        !self.kind.is_locally_counted()
    }
}

/// Convert service rows into typed events, dropping rows this client
/// cannot interpret.
pub fn events_from_records(records: &[RecordedViolation]) -> Vec<ViolationEvent> {
    records
        .iter()
        .filter_map(|record| {
            let event = record.to_event();
            if event.is_none() {
                warn!(kind = %record.kind, timestamp = %record.timestamp, "Skipping unrecognized violation record");
            }
            event
        })
        .collect()
}

/// Group events by kind, one row per kind, rows ordered by kind.
pub fn aggregate(events: &[ViolationEvent], counters: ViolationCounters) -> Vec<ViolationSummary> {
    let mut rows: BTreeMap<ViolationKind, ViolationSummary> = BTreeMap::new();

    for event in events {
        let row = rows.entry(event.kind).or_insert_with(|| ViolationSummary {
            kind: event.kind,
            count: 0,
            details: event.details.clone(),
            confidence: event.confidence,
            timestamps: Vec::new(),
        });
        row.count = row.count.saturating_add(1);
        row.timestamps.push(event.timestamp);
    }

    for (kind, details) in [
        (ViolationKind::TabSwitch, TAB_SWITCH_DETAILS),
        (ViolationKind::FullscreenExit, FULLSCREEN_EXIT_DETAILS),
    ] {
        let Some(count) = counters.for_kind(kind) else {
            continue;
        };
        match rows.get_mut(&kind) {
            Some(row) => row.count = count,
            None if count > 0 => {
                rows.insert(
                    kind,
                    ViolationSummary {
                        kind,
                        count,
                        details: details.to_string(),
                        confidence: 1.0,
                        timestamps: Vec::new(),
                    },
                );
            }
            None => {}
        }
    }

    rows.into_values().collect()
}

fn type_label(kind: ViolationKind) -> String {
    kind.as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the summary as a plain-text table.
pub fn render_table(rows: &[ViolationSummary]) -> String {
    if rows.is_empty() {
        return format!("{NO_VIOLATIONS}\n");
    }

    let headers = ["Type", "Count", "Details", "Timestamps", "Confidence"];
    let cells: Vec<[String; 5]> = rows
        .iter()
        .map(|row| {
            let timestamps = if row.shows_timestamps() {
                row.timestamps
                    .iter()
                    .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                "-".to_string()
            };
            [
                type_label(row.kind),
                row.count.to_string(),
                row.details.clone(),
                timestamps,
                format!("{}%", (row.confidence * 100.0).round() as u32),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let line = |out: &mut String, values: &[&str]| {
        let padded: Vec<String> = values
            .iter()
            .zip(widths)
            .map(|(v, w)| format!("{v:<w$}"))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    };
    line(&mut out, &headers);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    line(&mut out, &rule.iter().map(String::as_str).collect::<Vec<_>>());
    for row in &cells {
        line(&mut out, &row.iter().map(String::as_str).collect::<Vec<_>>());
    }
    out
}
