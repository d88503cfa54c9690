//! Output formatting for the CLI: plain text and JSON.

use crate::breaker::BreakerState;
use crate::scanner::ScanReport;
use crate::scheduler::{ProjectReport, RunSummary};
use crate::types::{Event, Node, StatusCounts};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "text" | "txt" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

pub fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}

/// Millisecond timestamp in UTC, or `-`.
pub fn timestamp(ms: Option<i64>) -> String {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%SZ").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn duration(ms: f64) -> String {
    let secs = (ms / 1000.0).round() as i64;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

fn counts_line(counts: &StatusCounts) -> String {
    format!(
        "pending {}  claimed {}  running {}  completed {}  failed {}  (total {})",
        counts.pending,
        counts.claimed,
        counts.running,
        counts.completed,
        counts.failed,
        counts.total()
    )
}

pub fn format_status_text(all: &BTreeMap<String, StatusCounts>) -> String {
    if all.is_empty() {
        return "No projects.\n".to_string();
    }
    let width = all.keys().map(|p| p.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (project, counts) in all {
        let _ = writeln!(out, "{:width$}  {}", project, counts_line(counts), width = width);
    }
    out
}

pub fn format_report_text(report: &ProjectReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Project {}", report.project);
    let _ = writeln!(out, "  {}", counts_line(&report.counts));
    if let Some(mean) = report.mean_duration_ms {
        let _ = writeln!(out, "  mean task duration {}", duration(mean));
    }

    let breaker = &report.breaker;
    match breaker.state {
        BreakerState::Closed => {
            let _ = writeln!(out, "  breaker closed (trips {})", breaker.trips);
        }
        BreakerState::Open => {
            let _ = writeln!(
                out,
                "  breaker OPEN until {} (trips {})",
                timestamp(breaker.cooldown_until),
                breaker.trips
            );
        }
        BreakerState::HalfOpen => {
            let _ = writeln!(out, "  breaker half-open (trips {})", breaker.trips);
        }
    }

    if !report.active.is_empty() {
        let _ = writeln!(out, "\nActive:");
        for t in &report.active {
            let _ = writeln!(
                out,
                "  {}  {}  on {}  since {}{}",
                t.id,
                t.status,
                t.node.as_deref().unwrap_or("-"),
                timestamp(t.started_at),
                if t.kill_requested { "  (kill requested)" } else { "" }
            );
        }
    }

    if !report.failed.is_empty() {
        let _ = writeln!(out, "\nFailed:");
        for t in &report.failed {
            let _ = writeln!(
                out,
                "  {}  attempt {}/{}  {}",
                t.id,
                t.attempt,
                t.max_retries,
                t.error.as_deref().unwrap_or("(no error recorded)")
            );
        }
    }

    if !report.blocked.is_empty() {
        let _ = writeln!(out, "\nBlocked by failed dependencies:");
        for id in &report.blocked {
            let _ = writeln!(out, "  {}", id);
        }
    }

    out
}

pub fn format_summary_text(summary: &RunSummary) -> String {
    let mut out = format!(
        "{}: stopped ({:?}) after {} cycles in {}\n  {}\n",
        summary.project,
        summary.halt,
        summary.cycles,
        duration(summary.elapsed_ms as f64),
        counts_line(&summary.counts)
    );
    if !summary.blocked.is_empty() {
        let _ = writeln!(out, "  blocked: {}", summary.blocked.join(", "));
    }
    out
}

pub fn format_scan_text(project: &str, report: &ScanReport) -> String {
    let mut out = format!(
        "{}: {} new, {} unchanged, {} changed since import, {} rejected\n",
        project,
        report.inserted.len(),
        report.unchanged.len(),
        report.drifted.len(),
        report.rejected.len()
    );
    for err in &report.rejected {
        let _ = writeln!(out, "  rejected: {}", err);
    }
    for id in &report.drifted {
        let _ = writeln!(out, "  changed: {}", id);
    }
    out
}

pub fn format_nodes_text(nodes: &[Node]) -> String {
    if nodes.is_empty() {
        return "No nodes registered.\n".to_string();
    }
    let mut out = String::new();
    for n in nodes {
        let _ = writeln!(
            out,
            "{}  {}  {}/{} slots  executor {}  priority {}  {}  last seen {}",
            n.name,
            n.host,
            n.running_count,
            n.slots,
            n.executor,
            n.priority,
            if n.enabled { "enabled" } else { "disabled" },
            timestamp(n.last_seen)
        );
    }
    out
}

pub fn format_events_text(events: &[Event]) -> String {
    let mut out = String::new();
    for e in events {
        let _ = write!(out, "{}  {}", timestamp(Some(e.timestamp)), e.event_type);
        if let Some(task) = &e.task_id {
            let _ = write!(out, "  task={}", task);
        }
        if let Some(node) = &e.node {
            let _ = write!(out, "  node={}", node);
        }
        if e.details.as_object().is_some_and(|m| !m.is_empty()) {
            let _ = write!(out, "  {}", e.details);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!(OutputFormat::from_str("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("text"), Some(OutputFormat::Text));
        assert_eq!(OutputFormat::from_str("markdown"), None);
    }

    #[test]
    fn durations_are_compact() {
        assert_eq!(duration(4_000.0), "4s");
        assert_eq!(duration(125_000.0), "2m05s");
        assert_eq!(duration(3_720_000.0), "1h02m");
    }

    #[test]
    fn timestamps() {
        assert_eq!(timestamp(None), "-");
        assert_eq!(timestamp(Some(0)), "1970-01-01 00:00:00Z");
    }

    #[test]
    fn status_table_aligns_projects() {
        let mut all = BTreeMap::new();
        all.insert("a".to_string(), StatusCounts { pending: 1, ..Default::default() });
        all.insert("long".to_string(), StatusCounts { completed: 2, ..Default::default() });
        let text = format_status_text(&all);
        assert!(text.starts_with("a     pending 1"));
        assert!(text.contains("long  pending 0"));
    }
}
