//! Pull-style PCM frame sources used by the reply-end detector.
//!
//! A source is acquired with [`AudioInput::open`] and released when dropped, so
//! every exit path of the detector (including task abort) gives the device back.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Unable to open audio input: {0}")]
    Open(String),

    #[error("Audio read failed: {0}")]
    Read(String),

    #[error("Audio stream closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// PCM layout requested from an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    /// Samples per frame (mono, signed 16-bit).
    pub frame_size: usize,
}

#[async_trait]
pub trait AudioInput: Send + Sync {
    async fn open(&self, format: CaptureFormat) -> Result<Box<dyn AudioSource>, AudioError>;
}

#[async_trait]
pub trait AudioSource: Send {
    /// Next frame of samples. Never returns an empty frame.
    async fn read_frame(&mut self) -> Result<Vec<i16>, AudioError>;
}

/// Captures audio by spawning a recorder that writes raw S16LE mono PCM to stdout.
///
/// `{rate}` in the command line is replaced with the requested sample rate.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    command_line: String,
}

pub const DEFAULT_CAPTURE_COMMAND: &str = "arecord -q -t raw -f S16_LE -c 1 -r {rate}";

impl CommandCapture {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
        }
    }

    fn argv(&self, format: CaptureFormat) -> Vec<String> {
        let rate = format.sample_rate.to_string();
        self.command_line
            .split_whitespace()
            .map(|part| part.replace("{rate}", &rate))
            .collect()
    }
}

#[async_trait]
impl AudioInput for CommandCapture {
    async fn open(&self, format: CaptureFormat) -> Result<Box<dyn AudioSource>, AudioError> {
        if format.frame_size == 0 {
            return Err(AudioError::Open("frame size must be greater than zero".into()));
        }
        let argv = self.argv(format);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AudioError::Open("empty capture command".into()))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AudioError::Open(format!("{program}: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AudioError::Open("recorder stdout unavailable".into()))?;

        tracing::debug!(program = %program, rate = format.sample_rate, "audio capture opened");

        let (frame_tx, frames) = mpsc::channel(64);
        let reader = tokio::spawn(read_frames(stdout, format.frame_size, frame_tx));
        Ok(Box::new(CaptureStream {
            child,
            reader,
            frames,
        }))
    }
}

async fn read_frames(
    mut stdout: ChildStdout,
    frame_size: usize,
    frame_tx: mpsc::Sender<Result<Vec<i16>, AudioError>>,
) {
    let mut buf = vec![0u8; frame_size * 2];
    loop {
        match stdout.read_exact(&mut buf).await {
            Ok(_) => {
                let samples = buf
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                if frame_tx.send(Ok(samples)).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let _ = frame_tx.send(Err(AudioError::Closed)).await;
                break;
            }
            Err(e) => {
                let _ = frame_tx.send(Err(AudioError::Io(e))).await;
                break;
            }
        }
    }
}

struct CaptureStream {
    child: Child,
    reader: JoinHandle<()>,
    frames: mpsc::Receiver<Result<Vec<i16>, AudioError>>,
}

#[async_trait]
impl AudioSource for CaptureStream {
    async fn read_frame(&mut self) -> Result<Vec<i16>, AudioError> {
        let mut latest = self.frames.recv().await.ok_or(AudioError::Closed)??;
        // Skip frames that queued up while the caller was sleeping.
        while let Ok(next) = self.frames.try_recv() {
            latest = next?;
        }
        Ok(latest)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.reader.abort();
        let _ = self.child.start_kill();
        tracing::debug!("audio capture released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_placeholder_is_substituted() {
        let capture = CommandCapture::new(DEFAULT_CAPTURE_COMMAND);
        let argv = capture.argv(CaptureFormat {
            sample_rate: 16000,
            frame_size: 800,
        });
        assert_eq!(argv.first().map(String::as_str), Some("arecord"));
        assert_eq!(argv.last().map(String::as_str), Some("16000"));
        assert!(!argv.iter().any(|a| a.contains("{rate}")));
    }

    #[tokio::test]
    async fn empty_command_fails_to_open() {
        let capture = CommandCapture::new("   ");
        let err = capture
            .open(CaptureFormat {
                sample_rate: 16000,
                frame_size: 800,
            })
            .await
            .err()
            .expect("open should fail");
        assert!(matches!(err, AudioError::Open(_)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_open() {
        let capture = CommandCapture::new("definitely-not-a-recorder-binary-xyz");
        let result = capture
            .open(CaptureFormat {
                sample_rate: 16000,
                frame_size: 800,
            })
            .await;
        assert!(matches!(result, Err(AudioError::Open(_))));
    }
}
