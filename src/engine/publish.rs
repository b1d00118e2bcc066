use crate::model::{Command, CommandRecord, RunSnapshot, RunState, RunSummary};
use crate::speech::SpeechError;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Writes updates into the shared snapshot, one atomic update at a time.
///
/// When bound to a run's stop token, non-terminal transitions are dropped once
/// stop has been requested so a late tick cannot overwrite `Stopped`.
#[derive(Clone)]
pub(crate) struct Publisher {
    state: Arc<watch::Sender<RunSnapshot>>,
    stop: Option<CancellationToken>,
}

impl Publisher {
    pub fn new(state: Arc<watch::Sender<RunSnapshot>>) -> Self {
        Self { state, stop: None }
    }

    pub fn for_run(&self, stop: CancellationToken) -> Self {
        Self {
            state: self.state.clone(),
            stop: Some(stop),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.is_cancelled())
    }

    pub fn update(&self, f: impl FnOnce(&mut RunSnapshot)) {
        self.state.send_modify(f);
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.update(|s| s.logs.push(message));
    }

    // The stop check runs under the snapshot lock, so a stop published
    // concurrently is either seen here or lands after this write.
    pub fn transition(&self, state: RunState, command: Option<&Command>, status: Option<&str>) {
        self.state.send_if_modified(|s| {
            if self.stopped() && !state.is_terminal() {
                return false;
            }
            s.state = state;
            s.current_command = command.cloned();
            s.status = status.map(str::to_string);
            true
        });
    }

    pub fn fail(&self, reason: &str) {
        self.state.send_if_modified(|s| {
            if self.stopped() {
                return false;
            }
            s.state = RunState::Error;
            s.status = Some(reason.to_string());
            true
        });
    }

    pub fn speech_status(&self, result: &Result<(), SpeechError>) {
        let error = result.as_ref().err().map(ToString::to_string);
        self.update(|s| {
            s.tts_ready = error.is_none();
            s.tts_error = error;
        });
    }

    pub fn record(&self, record: CommandRecord) {
        self.update(|s| s.records.push(record));
    }

    pub fn finish(&self, summary: RunSummary) {
        let state = if summary.stopped {
            RunState::Stopped
        } else {
            RunState::Completed
        };
        self.log(format!(
            "Run {state}: {} executed, {} uncertain",
            summary.total_executed, summary.uncertain_ends
        ));
        self.update(|s| {
            s.state = state;
            s.current_command = None;
            s.status = None;
            s.summary = Some(summary);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> (Publisher, watch::Receiver<RunSnapshot>) {
        let (tx, rx) = watch::channel(RunSnapshot::default());
        (Publisher::new(Arc::new(tx)), rx)
    }

    #[test]
    fn transitions_after_stop_leave_stopped_untouched() {
        let (base, mut rx) = publisher();
        let stop = CancellationToken::new();
        let run = base.for_run(stop.clone());
        let command = Command {
            index: 1,
            text: "Play music".into(),
        };

        run.transition(RunState::Speaking, Some(&command), Some("Speaking"));
        assert_eq!(rx.borrow_and_update().state, RunState::Speaking);

        stop.cancel();
        base.update(|s| s.state = RunState::Stopped);
        let _ = rx.borrow_and_update();

        run.transition(RunState::Listening, Some(&command), Some("Listening for reply"));
        run.fail("late failure");
        assert!(!rx.has_changed().unwrap());
        let snapshot = rx.borrow();
        assert_eq!(snapshot.state, RunState::Stopped);
        assert_eq!(snapshot.status, None);
    }

    #[test]
    fn terminal_transition_is_published_after_stop() {
        let (base, rx) = publisher();
        let stop = CancellationToken::new();
        let run = base.for_run(stop.clone());
        stop.cancel();

        run.transition(RunState::Completed, None, None);
        assert_eq!(rx.borrow().state, RunState::Completed);
    }

    #[test]
    fn speech_status_tracks_readiness() {
        let (base, rx) = publisher();
        base.speech_status(&Err(SpeechError::Unavailable("espeak-ng: not found".into())));
        assert!(!rx.borrow().tts_ready);
        assert_eq!(
            rx.borrow().tts_error.as_deref(),
            Some("Text-to-speech unavailable: espeak-ng: not found")
        );

        base.speech_status(&Ok(()));
        assert!(rx.borrow().tts_ready);
        assert_eq!(rx.borrow().tts_error, None);
    }
}
