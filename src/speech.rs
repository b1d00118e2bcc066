//! Speech synthesis capability used to speak commands to the device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const INIT_ATTEMPTS: u32 = 3;
const INIT_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, thiserror::Error)]
pub enum SpeechError {
    #[error("Text-to-speech unavailable: {0}")]
    Unavailable(String),

    #[error("Text-to-speech not initialized")]
    NotInitialized,

    #[error("Speech failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    #[default]
    Female,
    Male,
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Prepare the engine. Implementations may retry internally before failing.
    async fn init(&self) -> Result<(), SpeechError>;

    /// Speak `text`, returning once the utterance has finished.
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;

    fn set_voice(&self, voice: VoiceGender);

    fn shutdown(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Synthesizer executable, e.g. `espeak-ng`.
    pub program: String,
    /// Flag that selects a voice.
    pub voice_flag: String,
    pub female_voice: String,
    pub male_voice: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            program: "espeak-ng".to_string(),
            voice_flag: "-v".to_string(),
            female_voice: "en-us+f3".to_string(),
            male_voice: "en-us+m3".to_string(),
        }
    }
}

/// Speaks through an external synthesizer program, one process per utterance.
pub struct CommandSpeech {
    config: SpeechConfig,
    ready: AtomicBool,
    voice: Mutex<VoiceGender>,
}

impl CommandSpeech {
    pub fn new(config: SpeechConfig) -> Self {
        Self {
            config,
            ready: AtomicBool::new(false),
            voice: Mutex::new(VoiceGender::default()),
        }
    }

    fn voice_name(&self) -> &str {
        let voice = self.voice.lock().map(|v| *v).unwrap_or_default();
        match voice {
            VoiceGender::Female => &self.config.female_voice,
            VoiceGender::Male => &self.config.male_voice,
        }
    }

    async fn probe(&self) -> Result<(), SpeechError> {
        let status = tokio::process::Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| SpeechError::Unavailable(format!("{}: {e}", self.config.program)))?;
        if status.success() {
            Ok(())
        } else {
            Err(SpeechError::Unavailable(format!(
                "{} exited with {status}",
                self.config.program
            )))
        }
    }
}

#[async_trait]
impl SpeechEngine for CommandSpeech {
    async fn init(&self) -> Result<(), SpeechError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.probe().await {
                Ok(()) => {
                    self.ready.store(true, Ordering::Release);
                    tracing::info!(program = %self.config.program, "speech engine ready");
                    return Ok(());
                }
                Err(e) if attempt >= INIT_ATTEMPTS => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "speech engine init failed, retrying");
                    tokio::time::sleep(INIT_BACKOFF).await;
                }
            }
        }
    }

    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(SpeechError::NotInitialized);
        }
        let output = tokio::process::Command::new(&self.config.program)
            .arg(&self.config.voice_flag)
            .arg(self.voice_name())
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SpeechError::Failed(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.trim();
        Err(SpeechError::Failed(if reason.is_empty() {
            format!("{} exited with {}", self.config.program, output.status)
        } else {
            reason.to_string()
        }))
    }

    fn set_voice(&self, voice: VoiceGender) {
        if let Ok(mut current) = self.voice.lock() {
            *current = voice;
        }
    }

    fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_program() -> CommandSpeech {
        CommandSpeech::new(SpeechConfig {
            program: "definitely-not-a-synthesizer-xyz".into(),
            ..Default::default()
        })
    }

    #[test]
    fn voice_preference_selects_configured_voice() {
        let speech = CommandSpeech::new(SpeechConfig::default());
        assert_eq!(speech.voice_name(), "en-us+f3");
        speech.set_voice(VoiceGender::Male);
        assert_eq!(speech.voice_name(), "en-us+m3");
    }

    #[tokio::test]
    async fn speak_before_init_is_rejected() {
        let speech = CommandSpeech::new(SpeechConfig::default());
        let err = speech.speak("hello").await.unwrap_err();
        assert!(matches!(err, SpeechError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn init_gives_up_after_retries() {
        let speech = missing_program();
        let err = speech.init().await.unwrap_err();
        assert!(matches!(err, SpeechError::Unavailable(_)));
        assert!(speech.speak("hello").await.is_err());
    }
}
