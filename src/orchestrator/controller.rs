//! Run lifecycle controller.
//!
//! Owns the command list, range options and the published snapshot, and starts
//! at most one run task at a time. Control calls only flip shared signals; the
//! run task observes them at its poll points.

use crate::engine::detector::ReplyListener;
use crate::engine::{Publisher, RunEngine, RunOutcome, RunSignals};
use crate::model::{Command, EngineTiming, RunOptions, RunSnapshot, RunState};
use crate::parser::{self, ImportError};
use crate::range::{self, RangeValidation};
use crate::speech::{SpeechEngine, SpeechError, VoiceGender};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Commands emitted by presentation layers to control the running test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    Pause,
    Resume,
    Skip,
    Stop,
}

impl UiCommand {
    /// Map a line typed on stdin to a command.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_lowercase().as_str() {
            "p" | "pause" => Some(UiCommand::Pause),
            "r" | "resume" => Some(UiCommand::Resume),
            "s" | "skip" => Some(UiCommand::Skip),
            "q" | "x" | "stop" | "quit" => Some(UiCommand::Stop),
            _ => None,
        }
    }
}

/// Clonable control surface usable from any task.
#[derive(Clone)]
pub struct RunControls {
    signals: Arc<RunSignals>,
    publisher: Publisher,
}

impl RunControls {
    pub fn pause(&self) {
        self.signals.pause();
    }

    pub fn resume(&self) {
        self.signals.resume();
    }

    pub fn skip(&self) {
        self.signals.skip();
    }

    /// Request stop and publish `Stopped` without waiting for the task to unwind.
    pub fn stop(&self) {
        self.signals.stop();
        self.publisher.log("Stop requested");
        self.publisher.update(|s| {
            s.state = RunState::Stopped;
            s.current_command = None;
            s.status = None;
        });
    }
}

/// Owned handle for the active run task.
pub struct RunHandle {
    task: JoinHandle<RunOutcome>,
    controls: RunControls,
}

impl RunHandle {
    /// Wait for the run task; safe to race against other futures in `select!`.
    pub async fn join(&mut self) -> Result<RunOutcome, JoinError> {
        (&mut self.task).await
    }

    pub fn cancel(&self) {
        self.controls.stop();
    }
}

pub enum StartOutcome {
    Started(RunHandle),
    AlreadyRunning,
    Invalid(RangeValidation),
}

/// Clears the running flag when the run task ends, aborted or not.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RunController {
    speech: Arc<dyn SpeechEngine>,
    listener: Arc<dyn ReplyListener>,
    timing: EngineTiming,
    commands: Vec<Command>,
    options: RunOptions,
    state: Arc<watch::Sender<RunSnapshot>>,
    publisher: Publisher,
    signals: Arc<RunSignals>,
    running: Arc<AtomicBool>,
}

impl RunController {
    pub fn new(
        speech: Arc<dyn SpeechEngine>,
        listener: Arc<dyn ReplyListener>,
        timing: EngineTiming,
    ) -> Self {
        let (state_tx, _) = watch::channel(RunSnapshot::default());
        let state = Arc::new(state_tx);
        Self {
            speech,
            listener,
            timing,
            commands: Vec::new(),
            options: RunOptions::all(),
            publisher: Publisher::new(state.clone()),
            state,
            signals: Arc::new(RunSignals::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.borrow().clone()
    }

    pub fn controls(&self) -> RunControls {
        RunControls {
            signals: self.signals.clone(),
            publisher: self.publisher.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn revalidate(&self) -> RangeValidation {
        let validation = range::validate(self.commands.len(), &self.options);
        let count = self.commands.len();
        let options = self.options;
        let published = validation.clone();
        self.publisher.update(move |s| {
            s.command_count = count;
            s.options = options;
            s.validation = published;
        });
        validation
    }

    fn busy(&self, what: &str) -> bool {
        if self.is_running() {
            tracing::warn!("ignoring {what} while a run is active");
            return true;
        }
        false
    }

    pub fn set_commands<I, S>(&mut self, lines: I) -> RangeValidation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.busy("command update") {
            return self.state.borrow().validation.clone();
        }
        self.commands = Command::from_lines(lines);
        self.publisher.update(|s| s.import_error = None);
        self.revalidate()
    }

    pub fn set_options(&mut self, options: RunOptions) -> RangeValidation {
        if self.busy("option update") {
            return self.state.borrow().validation.clone();
        }
        self.options = options;
        self.revalidate()
    }

    pub fn set_voice(&self, voice: VoiceGender) {
        if self.busy("voice change") {
            return;
        }
        self.speech.set_voice(voice);
        self.publisher.update(|s| s.voice = voice);
    }

    /// Import a command file. On failure the previous command set is cleared.
    pub async fn import_file(&mut self, path: &Path) -> Result<usize, ImportError> {
        if self.busy("import") {
            return Err(ImportError::RunActive);
        }
        match parser::load_commands(path).await {
            Ok(lines) => {
                let validation = self.set_commands(lines);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                self.publisher.update(|s| s.file_name = name);
                self.publisher.log(format!(
                    "Imported {} commands from {}",
                    self.commands.len(),
                    path.display()
                ));
                if let Some(message) = validation.error_message {
                    tracing::debug!(%message, "range invalid after import");
                }
                Ok(self.commands.len())
            }
            Err(e) => {
                self.commands.clear();
                let message = e.to_string();
                self.publisher.update(|s| s.import_error = Some(message));
                self.revalidate();
                Err(e)
            }
        }
    }

    /// Validate the range and launch the run task.
    pub fn start(&mut self) -> StartOutcome {
        let validation = self.revalidate();
        let Some(indices) = validation.range() else {
            return StartOutcome::Invalid(validation);
        };
        if self.running.swap(true, Ordering::SeqCst) {
            return StartOutcome::AlreadyRunning;
        }

        let stop = self.signals.reset();
        self.publisher.update(|s| {
            s.state = RunState::Idle;
            s.current_command = None;
            s.status = None;
            s.records.clear();
            s.summary = None;
        });
        let commands: Vec<Command> = self
            .commands
            .iter()
            .filter(|c| indices.contains(&c.index))
            .cloned()
            .collect();
        self.publisher.log(format!(
            "Starting run of commands {} to {}",
            indices.start(),
            indices.end()
        ));

        let engine = RunEngine {
            speech: self.speech.clone(),
            listener: self.listener.clone(),
            commands,
            timing: self.timing,
            signals: self.signals.clone(),
            publisher: self.publisher.for_run(stop.clone()),
            stop,
        };
        let guard = RunningGuard(self.running.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            engine.run().await
        });
        StartOutcome::Started(RunHandle {
            task,
            controls: self.controls(),
        })
    }

    pub fn pause(&self) {
        self.controls().pause();
    }

    pub fn resume(&self) {
        self.controls().resume();
    }

    pub fn skip(&self) {
        self.controls().skip();
    }

    pub fn stop(&self) {
        self.controls().stop();
    }

    pub fn apply(&self, cmd: UiCommand) {
        match cmd {
            UiCommand::Pause => self.pause(),
            UiCommand::Resume => self.resume(),
            UiCommand::Skip => self.skip(),
            UiCommand::Stop => self.stop(),
        }
    }

    /// Bring up the speech engine ahead of a run and publish its readiness.
    pub async fn initialize_speech(&self) -> Result<(), SpeechError> {
        let result = self.speech.init().await;
        if let Err(e) = &result {
            self.publisher.log(format!("TTS init failed: {e}"));
        }
        self.publisher.speech_status(&result);
        result
    }

    pub fn shutdown(&self) {
        self.signals.stop();
        self.speech.shutdown();
        self.publisher.update(|s| s.tts_ready = false);
    }
}
