//! Speech recognition over HTTP
//!
//! Posts captured audio as WAV to an OpenAI-compatible
//! `/audio/transcriptions` endpoint (Whisper, faster-whisper-server, ...).
//! Runs on the capture thread, so it uses the blocking client.

use anyhow::{anyhow, Context};
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::audio::AudioBuffer;
use super::{CaptureError, Transcriber};
use crate::config::VoiceConfig;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Whisper-compatible transcription client
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl WhisperTranscriber {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            timeout,
        }
    }

    pub fn from_config(config: &VoiceConfig, timeout: Duration) -> Self {
        Self::new(&config.stt_url, &config.stt_model, config.api_key.clone(), timeout)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }

    // Built per call: a blocking client must not be dropped inside the
    // async runtime, and this value may be.
    fn client(&self) -> anyhow::Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: &AudioBuffer) -> Result<String, CaptureError> {
        if audio.is_empty() {
            return Err(CaptureError::UnknownValue);
        }

        let wav = audio.to_mono().to_wav_bytes()?;
        let part = multipart::Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")
            .context("Invalid audio MIME type")?;
        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", part);

        let mut request = self.client()?.post(self.endpoint()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .context("Failed to send audio to transcription service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("Transcription API error ({}): {}", status, body).into());
        }

        let result: TranscriptionResponse = response
            .json()
            .context("Failed to parse transcription response")?;

        let text = result.text.trim().to_string();
        debug!(seconds = audio.duration_secs(), chars = text.len(), "Transcribed utterance");

        if text.is_empty() {
            Err(CaptureError::UnknownValue)
        } else {
            Ok(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let stt = WhisperTranscriber::new(
            "http://localhost:8000/v1/",
            "whisper-1",
            None,
            Duration::from_secs(30),
        );
        assert_eq!(stt.endpoint(), "http://localhost:8000/v1/audio/transcriptions");
    }

    #[test]
    fn test_empty_audio_is_unknown_value() {
        let stt = WhisperTranscriber::from_config(&VoiceConfig::default(), Duration::from_secs(1));
        let result = stt.transcribe(&AudioBuffer::new(16000, 1));
        assert!(matches!(result, Err(CaptureError::UnknownValue)));
    }

    #[test]
    fn test_unreachable_service_is_other_error() {
        let stt = WhisperTranscriber::new("http://127.0.0.1:9", "whisper-1", None, Duration::from_secs(2));
        let audio = AudioBuffer::from_samples(vec![0.1; 160], 16000, 1);
        assert!(matches!(stt.transcribe(&audio), Err(CaptureError::Other(_))));
    }

    #[test]
    fn test_response_parsing() {
        let parsed: TranscriptionResponse = serde_json::from_str(r#"{"text":" hello "}"#).unwrap();
        assert_eq!(parsed.text, " hello ");
        let parsed: TranscriptionResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.text.is_empty());
    }
}
