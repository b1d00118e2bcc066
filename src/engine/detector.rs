//! Reply-end detection over a live audio stream.
//!
//! The detector first listens to the room to estimate ambient RMS, then ticks
//! over incoming frames until sustained silence follows the grace period
//! (`Completed`), the maximum listen time elapses (`Timeout`), or the source fails.

use crate::audio::{AudioError, AudioInput, AudioSource, CaptureFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Ambient RMS assumed when calibration reads no frames.
const DEFAULT_AMBIENT_RMS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEnd {
    Completed,
    Timeout,
    Error(String),
    /// The run was stopped while listening.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    #[serde(with = "humantime_serde")]
    pub min_reply_listen: Duration,
    #[serde(with = "humantime_serde")]
    pub max_reply_listen: Duration,
    #[serde(with = "humantime_serde")]
    pub silence_end: Duration,
    pub ambient_noise_factor: f64,
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    #[serde(with = "humantime_serde")]
    pub calibration_window: Duration,
    #[serde(with = "humantime_serde")]
    pub calibration_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 800,
            min_reply_listen: Duration::from_millis(800),
            max_reply_listen: Duration::from_millis(12_000),
            silence_end: Duration::from_millis(1_200),
            ambient_noise_factor: 6.0,
            tick: Duration::from_millis(50),
            calibration_window: Duration::from_millis(400),
            calibration_interval: Duration::from_millis(20),
        }
    }
}

/// Something that can wait for the device's reply to finish.
#[async_trait]
pub trait ReplyListener: Send + Sync {
    async fn listen(&self, cancel: &CancellationToken) -> ReplyEnd;
}

/// Root-mean-square amplitude of a block of samples.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Silence accumulator driven once per tick.
///
/// Silence never accumulates before `min_reply_listen` has elapsed, so a reply
/// that starts late or quietly is not mistaken for one that already ended.
#[derive(Debug, Clone)]
pub struct SilenceTracker {
    threshold: f64,
    tick: Duration,
    min_reply_listen: Duration,
    max_reply_listen: Duration,
    silence_end: Duration,
    silence: Duration,
}

impl SilenceTracker {
    pub fn new(config: &DetectorConfig, threshold: f64) -> Self {
        Self {
            threshold,
            tick: config.tick,
            min_reply_listen: config.min_reply_listen,
            max_reply_listen: config.max_reply_listen,
            silence_end: config.silence_end,
            silence: Duration::ZERO,
        }
    }

    pub fn silence(&self) -> Duration {
        self.silence
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Feed one tick's level; returns the verdict once one is reached.
    pub fn observe(&mut self, elapsed: Duration, level: f64) -> Option<ReplyEnd> {
        if elapsed < self.min_reply_listen {
            self.silence = Duration::ZERO;
        } else if level < self.threshold {
            self.silence += self.tick;
        } else {
            self.silence = Duration::ZERO;
        }

        if self.silence >= self.silence_end {
            Some(ReplyEnd::Completed)
        } else if elapsed >= self.max_reply_listen {
            Some(ReplyEnd::Timeout)
        } else {
            None
        }
    }
}

pub struct ReplyEndDetector<I> {
    input: I,
    config: DetectorConfig,
}

impl<I: AudioInput> ReplyEndDetector<I> {
    pub fn new(input: I, config: DetectorConfig) -> Self {
        Self { input, config }
    }

    fn format(&self) -> CaptureFormat {
        CaptureFormat {
            sample_rate: self.config.sample_rate,
            frame_size: self.config.frame_size,
        }
    }

    /// Average frame RMS over the calibration window, `None` if cancelled.
    async fn calibrate(
        &self,
        source: &mut dyn AudioSource,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>, AudioError> {
        let start = Instant::now();
        let mut total = 0.0;
        let mut frames = 0u32;
        while start.elapsed() < self.config.calibration_window {
            let Some(frame) = read_or_cancel(source, cancel).await? else {
                return Ok(None);
            };
            total += rms(&frame);
            frames += 1;
            if !sleep_or_cancel(self.config.calibration_interval, cancel).await {
                return Ok(None);
            }
        }
        Ok(Some(if frames == 0 {
            DEFAULT_AMBIENT_RMS
        } else {
            total / f64::from(frames)
        }))
    }

    async fn detect(
        &self,
        source: &mut dyn AudioSource,
        cancel: &CancellationToken,
    ) -> Result<ReplyEnd, AudioError> {
        let Some(ambient) = self.calibrate(source, cancel).await? else {
            return Ok(ReplyEnd::Cancelled);
        };
        let mut tracker = SilenceTracker::new(&self.config, ambient * self.config.ambient_noise_factor);
        tracing::debug!(ambient, threshold = tracker.threshold(), "ambient calibrated");

        let start = Instant::now();
        loop {
            let Some(frame) = read_or_cancel(source, cancel).await? else {
                return Ok(ReplyEnd::Cancelled);
            };
            let elapsed = start.elapsed();
            if let Some(end) = tracker.observe(elapsed, rms(&frame)) {
                tracing::debug!(
                    ?end,
                    elapsed_ms = elapsed.as_millis() as u64,
                    silence_ms = tracker.silence().as_millis() as u64,
                    "reply end decided"
                );
                return Ok(end);
            }
            if !sleep_or_cancel(self.config.tick, cancel).await {
                return Ok(ReplyEnd::Cancelled);
            }
        }
    }
}

#[async_trait]
impl<I: AudioInput> ReplyListener for ReplyEndDetector<I> {
    async fn listen(&self, cancel: &CancellationToken) -> ReplyEnd {
        if cancel.is_cancelled() {
            return ReplyEnd::Cancelled;
        }
        let mut source = match self.input.open(self.format()).await {
            Ok(source) => source,
            Err(e) => return ReplyEnd::Error(e.to_string()),
        };
        let result = self.detect(source.as_mut(), cancel).await;
        drop(source);
        result.unwrap_or_else(|e| ReplyEnd::Error(e.to_string()))
    }
}

/// Read one frame unless `cancel` fires first.
async fn read_or_cancel(
    source: &mut dyn AudioSource,
    cancel: &CancellationToken,
) -> Result<Option<Vec<i16>>, AudioError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        frame = source.read_frame() => {
            let frame = frame?;
            if frame.is_empty() {
                return Err(AudioError::Read("empty frame".into()));
            }
            Ok(Some(frame))
        }
    }
}

/// Sleep for `period`; returns false if cancelled meanwhile.
async fn sleep_or_cancel(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}
