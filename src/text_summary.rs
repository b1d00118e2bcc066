//! Text summary builder for CLI output.
//!
//! Formats the final run snapshot into human-readable lines for text mode.

use crate::metrics;
use crate::model::{ReplyOutcome, RunSnapshot};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Wall-clock `HH:MM:SS` used to prefix live log lines.
pub(crate) fn format_clock(ts: OffsetDateTime) -> String {
    ts.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| ts.to_string())
}

fn format_duration(millis: u64) -> String {
    // Whole seconds read better than humantime's millisecond tail on long runs.
    let d = if millis >= 60_000 {
        Duration::from_secs(millis / 1000)
    } else {
        Duration::from_millis(millis)
    };
    humantime::format_duration(d).to_string()
}

/// Build a text summary from the final snapshot.
pub(crate) fn build_text_summary(snapshot: &RunSnapshot) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!("State: {}", snapshot.state));
    if let Some(status) = snapshot.status.as_deref() {
        lines.push(format!("Status: {status}"));
    }

    let Some(summary) = snapshot.summary else {
        lines.push("No summary: the run did not finish.".into());
        return TextSummary { lines };
    };

    lines.push(format!("Commands executed: {}", summary.total_executed));
    lines.push(format!(
        "Duration: {}",
        format_duration(summary.duration_millis)
    ));
    lines.push(format!("Uncertain ends: {}", summary.uncertain_ends));
    if summary.stopped {
        lines.push("Stopped early by request".into());
    }

    let listen: Vec<f64> = snapshot
        .records
        .iter()
        .filter(|r| r.outcome == ReplyOutcome::Completed)
        .map(|r| r.listen_millis as f64)
        .collect();
    if let Some((mean, median, p25, p75)) = metrics::compute_metrics(&listen) {
        lines.push(format!(
            "Reply listen time: avg {:.0} med {:.0} p25 {:.0} p75 {:.0} ms ({} replies)",
            mean,
            median,
            p25,
            p75,
            listen.len()
        ));
    }

    for record in &snapshot.records {
        match &record.outcome {
            ReplyOutcome::Completed => {}
            ReplyOutcome::Timeout => {
                lines.push(format!("  #{}: timed out after {} ms", record.index, record.listen_millis))
            }
            ReplyOutcome::Error(reason) => {
                lines.push(format!("  #{}: listening error: {reason}", record.index))
            }
        }
    }

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandRecord, RunState, RunSummary};

    fn finished(records: Vec<CommandRecord>, stopped: bool) -> RunSnapshot {
        let uncertain = records.iter().filter(|r| r.outcome.is_uncertain()).count();
        RunSnapshot {
            state: if stopped {
                RunState::Stopped
            } else {
                RunState::Completed
            },
            summary: Some(RunSummary {
                total_executed: records.len(),
                duration_millis: 4_500,
                uncertain_ends: uncertain,
                stopped,
            }),
            records,
            ..Default::default()
        }
    }

    #[test]
    fn completed_run_lists_counts_and_listen_stats() {
        let snapshot = finished(
            vec![
                CommandRecord {
                    index: 1,
                    outcome: ReplyOutcome::Completed,
                    listen_millis: 2_000,
                },
                CommandRecord {
                    index: 2,
                    outcome: ReplyOutcome::Timeout,
                    listen_millis: 12_000,
                },
                CommandRecord {
                    index: 3,
                    outcome: ReplyOutcome::Completed,
                    listen_millis: 3_000,
                },
            ],
            false,
        );
        let lines = build_text_summary(&snapshot).lines;
        assert!(lines.contains(&"State: completed".to_string()));
        assert!(lines.contains(&"Commands executed: 3".to_string()));
        assert!(lines.contains(&"Duration: 4s 500ms".to_string()));
        assert!(lines.contains(&"Uncertain ends: 1".to_string()));
        assert!(lines.iter().any(|l| l.starts_with("Reply listen time: avg 2500 med 3000")));
        assert!(lines.iter().any(|l| l.contains("#2: timed out after 12000 ms")));
        assert!(!lines.iter().any(|l| l.starts_with("Stopped")));
    }

    #[test]
    fn stopped_run_is_flagged() {
        let lines = build_text_summary(&finished(Vec::new(), true)).lines;
        assert!(lines.contains(&"Stopped early by request".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("Reply listen time")));
    }

    #[test]
    fn failed_run_has_no_summary() {
        let snapshot = RunSnapshot {
            state: RunState::Error,
            status: Some("speech engine unavailable".into()),
            ..Default::default()
        };
        let lines = build_text_summary(&snapshot).lines;
        assert_eq!(lines[0], "State: error");
        assert_eq!(lines[1], "Status: speech engine unavailable");
        assert_eq!(lines[2], "No summary: the run did not finish.");
    }

    #[test]
    fn long_durations_drop_milliseconds() {
        assert_eq!(format_duration(125_250), "2m 5s");
    }
}
