use crate::audio::{CommandCapture, DEFAULT_CAPTURE_COMMAND};
use crate::engine::detector::{DetectorConfig, ReplyEndDetector};
use crate::engine::RunOutcome;
use crate::model::{EngineTiming, RunConfig, RunOptions, RunSnapshot, RunState};
use crate::orchestrator::{RunController, StartOutcome, UiCommand};
use crate::speech::{CommandSpeech, SpeechConfig, VoiceGender};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "smart-speaker-tester",
    version,
    about = "Speak commands to a voice-controlled device and time its replies"
)]
pub struct Cli {
    /// Command list (.csv, or a spreadsheet for any other suffix)
    pub commands_file: std::path::PathBuf,

    /// Run every command (default when no --start/--end is given)
    #[arg(long)]
    pub all: bool,

    /// First command index to run (1-based)
    #[arg(long, allow_negative_numbers = true)]
    pub start: Option<i64>,

    /// Last command index to run (1-based, inclusive)
    #[arg(long, allow_negative_numbers = true)]
    pub end: Option<i64>,

    /// Preferred synthesizer voice
    #[arg(long, value_enum, default_value_t = VoiceGender::Female)]
    pub voice: VoiceGender,

    /// Speech synthesizer program
    #[arg(long, default_value = "espeak-ng")]
    pub tts_program: String,

    /// Voice name used for --voice female
    #[arg(long, default_value = "en-us+f3")]
    pub female_voice: String,

    /// Voice name used for --voice male
    #[arg(long, default_value = "en-us+m3")]
    pub male_voice: String,

    /// Recorder command writing raw S16LE mono PCM to stdout; {rate} is substituted
    #[arg(long, default_value = DEFAULT_CAPTURE_COMMAND)]
    pub capture_command: String,

    /// Capture sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    pub sample_rate: u32,

    /// Samples per audio frame
    #[arg(long, default_value_t = 800)]
    pub frame_size: usize,

    /// Grace period before silence can end a reply
    #[arg(long, default_value = "800ms")]
    pub min_reply: humantime::Duration,

    /// Give up listening after this long
    #[arg(long, default_value = "12s")]
    pub max_reply: humantime::Duration,

    /// Sustained silence that ends a reply
    #[arg(long, default_value = "1200ms")]
    pub silence_end: humantime::Duration,

    /// Silence threshold as a multiple of ambient RMS
    #[arg(long, default_value_t = 6.0)]
    pub ambient_factor: f64,

    /// Wait after speaking before listening
    #[arg(long, default_value = "350ms")]
    pub settle: humantime::Duration,

    /// Read control lines from stdin: p(ause), r(esume), s(kip), q(uit)
    #[arg(long)]
    pub interactive: bool,

    /// Print the final snapshot as JSON instead of a text summary
    #[arg(long)]
    pub json: bool,
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    let options = match (args.start, args.end) {
        _ if args.all => RunOptions::all(),
        (None, None) => RunOptions::all(),
        (Some(start), Some(end)) => RunOptions::range(start, end),
        // A lone bound is passed through so validation can report it.
        (start_index, end_index) => RunOptions {
            use_all: false,
            start_index,
            end_index,
        },
    };
    RunConfig {
        commands_file: args.commands_file.clone(),
        options,
        voice: args.voice,
        speech: SpeechConfig {
            program: args.tts_program.clone(),
            female_voice: args.female_voice.clone(),
            male_voice: args.male_voice.clone(),
            ..Default::default()
        },
        capture_command: args.capture_command.clone(),
        detector: DetectorConfig {
            sample_rate: args.sample_rate,
            frame_size: args.frame_size,
            min_reply_listen: Duration::from(args.min_reply),
            max_reply_listen: Duration::from(args.max_reply),
            silence_end: Duration::from(args.silence_end),
            ambient_noise_factor: args.ambient_factor,
            ..Default::default()
        },
        timing: EngineTiming {
            settle_delay: Duration::from(args.settle),
            ..Default::default()
        },
    }
}

/// Forward stdin control lines until stdin closes.
fn spawn_stdin_commands() -> mpsc::UnboundedReceiver<UiCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match UiCommand::parse(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None => tracing::warn!(%line, "unknown control command"),
            }
        }
    });
    rx
}

/// Log lines pushed since `seen`, formatted for the terminal; advances `seen`.
fn fresh_log_lines(snapshot: &RunSnapshot, seen: &mut u64) -> Vec<String> {
    let lines = snapshot
        .logs
        .since(*seen)
        .map(|entry| {
            format!(
                "{} {}",
                crate::text_summary::format_clock(entry.timestamp),
                entry.message
            )
        })
        .collect();
    *seen = snapshot.logs.pushed();
    lines
}

fn status_line(snapshot: &RunSnapshot) -> String {
    match (&snapshot.current_command, snapshot.state) {
        (Some(cmd), RunState::Speaking | RunState::Listening | RunState::Paused) => {
            format!("[{}] #{} {}", snapshot.state, cmd.index, cmd.text)
        }
        _ => format!("[{}]", snapshot.state),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    tracing::debug!(?cfg, "configuration");

    let speech = Arc::new(CommandSpeech::new(cfg.speech.clone()));
    let detector = Arc::new(ReplyEndDetector::new(
        CommandCapture::new(cfg.capture_command.clone()),
        cfg.detector.clone(),
    ));
    let mut controller = RunController::new(speech, detector, cfg.timing);

    controller
        .import_file(&cfg.commands_file)
        .await
        .with_context(|| format!("failed to import {}", cfg.commands_file.display()))?;
    controller.set_options(cfg.options);
    controller.set_voice(cfg.voice);
    controller
        .initialize_speech()
        .await
        .with_context(|| format!("cannot start speech engine {}", cfg.speech.program))?;

    let (out_tx, out_handle) = spawn_output_writer();
    let mut state_rx = controller.subscribe();

    let mut handle = match controller.start() {
        StartOutcome::Started(handle) => handle,
        StartOutcome::AlreadyRunning => anyhow::bail!("a run is already active"),
        StartOutcome::Invalid(validation) => anyhow::bail!(
            "{}",
            validation
                .error_message
                .unwrap_or_else(|| "invalid command range".into())
        ),
    };

    let mut cmd_rx = args.interactive.then(spawn_stdin_commands);
    if args.interactive {
        let _ = out_tx.send(OutputLine::Stderr(
            "Controls: p = pause, r = resume, s = skip, q = stop".into(),
        ));
    }

    let mut seen_logs = 0u64;
    let mut last_status = String::new();
    let mut stop_requested = false;

    let outcome = loop {
        tokio::select! {
            res = handle.join() => {
                break res.context("run task failed")?;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let snapshot = state_rx.borrow_and_update().clone();
                let fresh = fresh_log_lines(&snapshot, &mut seen_logs);
                if !args.json {
                    for line in fresh {
                        let _ = out_tx.send(OutputLine::Stderr(line));
                    }
                    let status = status_line(&snapshot);
                    if status != last_status {
                        let _ = out_tx.send(OutputLine::Stderr(status.clone()));
                        last_status = status;
                    }
                }
            }
            cmd = async {
                match cmd_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => futures::future::pending().await,
                }
            } => {
                match cmd {
                    Some(cmd) => controller.apply(cmd),
                    None => cmd_rx = None,
                }
            }
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                let _ = out_tx.send(OutputLine::Stderr("Stopping…".into()));
                handle.cancel();
            }
        }
    };

    let snapshot = controller.snapshot();
    if !args.json {
        // Entries published while the task was finishing.
        for line in fresh_log_lines(&snapshot, &mut seen_logs) {
            let _ = out_tx.send(OutputLine::Stderr(line));
        }
    }
    controller.shutdown();
    let snapshot = controller.snapshot();
    if args.json {
        let out = serde_json::to_string_pretty(&snapshot)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(&snapshot).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    match outcome {
        RunOutcome::Finished(_) => Ok(()),
        RunOutcome::Failed(reason) => Err(anyhow::anyhow!("run aborted: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_every_command() {
        let args = Cli::parse_from(["smart-speaker-tester", "commands.csv"]);
        let cfg = build_config(&args);
        assert_eq!(cfg.options, RunOptions::all());
        assert_eq!(cfg.detector, DetectorConfig::default());
        assert_eq!(cfg.timing, EngineTiming::default());
        assert_eq!(cfg.voice, VoiceGender::Female);
    }

    #[test]
    fn explicit_range_and_durations() {
        let args = Cli::parse_from([
            "smart-speaker-tester",
            "commands.xlsx",
            "--start",
            "2",
            "--end",
            "4",
            "--max-reply",
            "20s",
            "--silence-end",
            "1500ms",
            "--voice",
            "male",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.options, RunOptions::range(2, 4));
        assert_eq!(cfg.detector.max_reply_listen, Duration::from_secs(20));
        assert_eq!(cfg.detector.silence_end, Duration::from_millis(1500));
        assert_eq!(cfg.voice, VoiceGender::Male);
    }

    #[test]
    fn single_bound_is_left_for_validation() {
        let args = Cli::parse_from(["smart-speaker-tester", "c.csv", "--start", "3"]);
        let cfg = build_config(&args);
        assert!(!cfg.options.use_all);
        assert_eq!(cfg.options.end_index, None);
    }

    #[test]
    fn all_flag_overrides_explicit_bounds() {
        let args = Cli::parse_from([
            "smart-speaker-tester",
            "c.csv",
            "--all",
            "--start",
            "2",
            "--end",
            "3",
        ]);
        assert_eq!(build_config(&args).options, RunOptions::all());
    }

    #[test]
    fn fresh_log_lines_include_entries_from_the_end_of_a_run() {
        let mut snapshot = RunSnapshot::default();
        snapshot.logs.push("Speaking command 1");
        let mut seen = 0;
        assert_eq!(fresh_log_lines(&snapshot, &mut seen).len(), 1);

        snapshot.logs.push("Reply end detected for 1");
        snapshot.logs.push("Run completed: 1 executed, 0 uncertain");
        let lines = fresh_log_lines(&snapshot, &mut seen);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("Run completed: 1 executed, 0 uncertain"));
        assert_eq!(seen, 3);
        assert!(fresh_log_lines(&snapshot, &mut seen).is_empty());
    }

    #[test]
    fn config_serializes_durations_readably() {
        let args = Cli::parse_from(["smart-speaker-tester", "c.csv"]);
        let cfg = build_config(&args);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"settle_delay\":\"350ms\""));
    }
}
