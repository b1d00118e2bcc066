pub mod detector;
mod publish;

pub(crate) use publish::Publisher;

use crate::model::{Command, CommandRecord, EngineTiming, ReplyOutcome, RunState, RunSummary};
use crate::speech::SpeechEngine;
use detector::{ReplyEnd, ReplyListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Control signals shared between the run task and its callers.
///
/// Pause is level-triggered, skip is one-shot and consumed by the current
/// command, stop is sticky for the rest of the run.
#[derive(Debug, Default)]
pub struct RunSignals {
    paused: AtomicBool,
    skip: AtomicBool,
    resumed: Notify,
    stop: Mutex<CancellationToken>,
}

impl RunSignals {
    /// Clear all flags ahead of a new run and hand out its stop token.
    pub fn reset(&self) -> CancellationToken {
        self.paused.store(false, Ordering::SeqCst);
        self.skip.store(false, Ordering::SeqCst);
        let token = CancellationToken::new();
        if let Ok(mut stop) = self.stop.lock() {
            *stop = token.clone();
        }
        token
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumed.notify_one();
    }

    pub fn skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        if let Ok(stop) = self.stop.lock() {
            stop.cancel();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn clear_skip(&self) {
        self.skip.store(false, Ordering::SeqCst);
    }

    fn take_skip(&self) -> bool {
        self.skip.swap(false, Ordering::SeqCst)
    }
}

/// How a run task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(RunSummary),
    /// Speech could not be initialized or an utterance failed; no summary.
    Failed(String),
}

pub(crate) struct RunEngine {
    pub speech: Arc<dyn SpeechEngine>,
    pub listener: Arc<dyn ReplyListener>,
    pub commands: Vec<Command>,
    pub timing: EngineTiming,
    pub signals: Arc<RunSignals>,
    pub stop: CancellationToken,
    pub publisher: Publisher,
}

impl RunEngine {
    pub async fn run(self) -> RunOutcome {
        let init = self.speech.init().await;
        self.publisher.speech_status(&init);
        if let Err(e) = init {
            let reason = e.to_string();
            self.publisher.log(format!("TTS init failed: {reason}"));
            self.publisher.fail(&reason);
            return RunOutcome::Failed(reason);
        }

        let started = Instant::now();
        let mut executed = 0usize;
        let mut uncertain = 0usize;

        for command in &self.commands {
            if self.stop.is_cancelled() {
                break;
            }
            self.wait_while_paused(command).await;
            if self.stop.is_cancelled() {
                break;
            }
            self.signals.clear_skip();

            self.publisher
                .transition(RunState::Speaking, Some(command), Some("Speaking"));
            self.publisher
                .log(format!("Speaking command {}", command.index));
            if let Err(e) = self.speech.speak(&command.text).await {
                if self.stop.is_cancelled() {
                    break;
                }
                let reason = e.to_string();
                self.publisher.log(format!("TTS error: {reason}"));
                self.publisher.fail(&reason);
                return RunOutcome::Failed(reason);
            }

            // The remaining delay is not cut short by skip, only by stop.
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(self.timing.settle_delay) => {}
            }
            if self.stop.is_cancelled() {
                break;
            }
            if self.signals.take_skip() {
                self.publisher
                    .log(format!("Skipped command {}", command.index));
                continue;
            }

            self.publisher.transition(
                RunState::Listening,
                Some(command),
                Some("Listening for reply"),
            );
            self.publisher
                .log(format!("Listening for reply for {}", command.index));
            let listen_started = Instant::now();
            let outcome = match self.listener.listen(&self.stop).await {
                ReplyEnd::Cancelled => break,
                ReplyEnd::Completed => {
                    self.publisher
                        .log(format!("Reply end detected for {}", command.index));
                    ReplyOutcome::Completed
                }
                ReplyEnd::Timeout => {
                    self.publisher
                        .log(format!("Uncertain end (timeout) for {}", command.index));
                    ReplyOutcome::Timeout
                }
                ReplyEnd::Error(reason) => {
                    self.publisher.log(format!("Listening error: {reason}"));
                    ReplyOutcome::Error(reason)
                }
            };
            if outcome.is_uncertain() {
                uncertain += 1;
            }
            self.publisher.record(CommandRecord {
                index: command.index,
                outcome,
                listen_millis: listen_started.elapsed().as_millis() as u64,
            });
            executed += 1;
        }

        let stopped = self.stop.is_cancelled();
        let summary = RunSummary {
            total_executed: executed,
            duration_millis: started.elapsed().as_millis() as u64,
            uncertain_ends: uncertain,
            stopped,
        };
        self.publisher.finish(summary);
        RunOutcome::Finished(summary)
    }

    /// Park before a command while paused, waking on resume, stop, or the poll bound.
    async fn wait_while_paused(&self, command: &Command) {
        if !self.signals.is_paused() || self.stop.is_cancelled() {
            return;
        }
        self.publisher
            .transition(RunState::Paused, Some(command), Some("Paused"));
        self.publisher
            .log(format!("Paused before command {}", command.index));
        while self.signals.is_paused() && !self.stop.is_cancelled() {
            tokio::select! {
                _ = self.signals.resumed.notified() => {}
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(self.timing.pause_poll) => {}
            }
        }
        if !self.stop.is_cancelled() {
            self.publisher.log("Resumed");
        }
    }
}
