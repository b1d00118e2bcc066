use crate::engine::detector::DetectorConfig;
use crate::range::RangeValidation;
use crate::speech::{SpeechConfig, VoiceGender};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

/// Maximum number of entries kept in the run log.
pub const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub commands_file: PathBuf,
    pub options: RunOptions,
    pub voice: VoiceGender,
    pub speech: SpeechConfig,
    pub capture_command: String,
    pub detector: DetectorConfig,
    pub timing: EngineTiming,
}

/// Delays applied by the run task between its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTiming {
    /// Wait after an utterance so the device's audio path settles before listening.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Upper bound between pause checks while the run is paused.
    #[serde(with = "humantime_serde")]
    pub pause_poll: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(350),
            pause_poll: Duration::from_millis(200),
        }
    }
}

/// A single spoken command, 1-based and contiguous within an imported list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub index: usize,
    pub text: String,
}

impl Command {
    /// Re-index parsed lines as 1-based commands, dropping blank ones.
    pub fn from_lines<I, S>(lines: I) -> Vec<Command>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .filter_map(|line| {
                let text = line.as_ref().trim();
                (!text.is_empty()).then(|| text.to_string())
            })
            .enumerate()
            .map(|(i, text)| Command { index: i + 1, text })
            .collect()
    }
}

/// Which part of the command list a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunOptions {
    pub use_all: bool,
    pub start_index: Option<i64>,
    pub end_index: Option<i64>,
}

impl RunOptions {
    pub fn all() -> Self {
        Self {
            use_all: true,
            ..Default::default()
        }
    }

    pub fn range(start: i64, end: i64) -> Self {
        Self {
            use_all: false,
            start_index: Some(start),
            end_index: Some(end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Speaking,
    Listening,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Completed | RunState::Error)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Speaking => "speaking",
            RunState::Listening => "listening",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
            RunState::Completed => "completed",
            RunState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub message: String,
}

/// Bounded FIFO of the latest log entries; the oldest entry is evicted first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    entries: VecDeque<LogEntry>,
    /// Number of entries ever pushed, including evicted ones.
    pushed: u64,
}

impl RunLog {
    pub fn push(&mut self, message: impl Into<String>) {
        self.entries.push_back(LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            message: message.into(),
        });
        while self.entries.len() > LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.pushed += 1;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Entries pushed after the caller last saw `seen` total pushes.
    pub fn since(&self, seen: u64) -> impl Iterator<Item = &LogEntry> {
        let fresh = self.pushed.saturating_sub(seen).min(self.entries.len() as u64) as usize;
        self.entries.iter().skip(self.entries.len() - fresh)
    }
}

/// How listening for a single reply ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyOutcome {
    Completed,
    Timeout,
    Error(String),
}

impl ReplyOutcome {
    pub fn is_uncertain(&self) -> bool {
        !matches!(self, ReplyOutcome::Completed)
    }
}

/// Per-command timing for a listened command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub index: usize,
    pub outcome: ReplyOutcome,
    pub listen_millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_executed: usize,
    pub duration_millis: u64,
    pub uncertain_ends: usize,
    pub stopped: bool,
}

/// Read-only view of the controller, published on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub state: RunState,
    pub current_command: Option<Command>,
    pub status: Option<String>,
    pub file_name: Option<String>,
    pub command_count: usize,
    pub import_error: Option<String>,
    pub tts_ready: bool,
    pub tts_error: Option<String>,
    pub voice: VoiceGender,
    pub options: RunOptions,
    pub validation: RangeValidation,
    pub logs: RunLog,
    pub records: Vec<CommandRecord>,
    pub summary: Option<RunSummary>,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            current_command: None,
            status: None,
            file_name: None,
            command_count: 0,
            import_error: None,
            tts_ready: false,
            tts_error: None,
            voice: VoiceGender::Female,
            options: RunOptions::all(),
            validation: RangeValidation::invalid("Import a command file first."),
            logs: RunLog::default(),
            records: Vec::new(),
            summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keeps_latest_entries_in_order() {
        let mut log = RunLog::default();
        for i in 0..250 {
            log.push(format!("entry {i}"));
        }
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log.pushed(), 250);
        let messages: Vec<&str> = log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages.first(), Some(&"entry 50"));
        assert_eq!(messages.last(), Some(&"entry 249"));
    }

    #[test]
    fn log_since_returns_only_fresh_entries() {
        let mut log = RunLog::default();
        log.push("a");
        log.push("b");
        let seen = log.pushed();
        log.push("c");
        let fresh: Vec<&str> = log.since(seen).map(|e| e.message.as_str()).collect();
        assert_eq!(fresh, vec!["c"]);
        assert_eq!(log.since(log.pushed()).count(), 0);
    }

    #[test]
    fn log_since_is_capped_by_eviction() {
        let mut log = RunLog::default();
        for i in 0..(LOG_CAPACITY + 10) {
            log.push(i.to_string());
        }
        assert_eq!(log.since(0).count(), LOG_CAPACITY);
    }

    #[test]
    fn commands_are_trimmed_and_reindexed() {
        let commands = Command::from_lines(["  Turn on lights ", "", "   ", "Play music"]);
        assert_eq!(
            commands,
            vec![
                Command {
                    index: 1,
                    text: "Turn on lights".into()
                },
                Command {
                    index: 2,
                    text: "Play music".into()
                },
            ]
        );
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Stopped.is_terminal());
        assert!(RunState::Error.is_terminal());
        assert!(!RunState::Paused.is_terminal());
        assert!(!RunState::Idle.is_terminal());
    }
}
