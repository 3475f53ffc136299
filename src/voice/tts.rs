//! Speech synthesis over HTTP
//!
//! Requests spoken audio for a reply from an OpenAI-compatible
//! `/audio/speech` endpoint and writes the returned MP3 to disk.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::SpeechSynthesizer;
use crate::config::VoiceConfig;

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// OpenAI-compatible text-to-speech client
pub struct HttpSynthesizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &VoiceConfig, timeout: Duration) -> Result<Self> {
        Self::new(&config.tts_url, &config.tts_model, config.api_key.clone(), timeout)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.base_url)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize_to_file(&self, text: &str, voice: &str, path: &Path) -> Result<()> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: "mp3",
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send request to speech service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Speech API error ({}): {}", status, body);
        }

        let audio = response.bytes().await.context("Failed to read speech audio")?;
        if audio.is_empty() {
            bail!("Speech service returned no audio");
        }

        tokio::fs::write(path, &audio)
            .await
            .with_context(|| format!("Failed to write speech audio to {}", path.display()))?;

        debug!(bytes = audio.len(), voice, "Synthesized speech");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = SpeechRequest {
            model: "tts-1",
            input: "Good evening, Sir.",
            voice: "en-US-ChristopherNeural",
            response_format: "mp3",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["voice"], "en-US-ChristopherNeural");
        assert_eq!(json["input"], "Good evening, Sir.");
    }

    #[test]
    fn test_endpoint() {
        let tts = HttpSynthesizer::from_config(&VoiceConfig::default(), Duration::from_secs(30)).unwrap();
        assert_eq!(tts.endpoint(), "http://localhost:8000/v1/audio/speech");
        assert_eq!(tts.file_extension(), ".mp3");
    }

    #[tokio::test]
    async fn test_unreachable_service_fails() {
        let tts = HttpSynthesizer::new("http://127.0.0.1:9", "tts-1", None, Duration::from_secs(2)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp3");
        assert!(tts.synthesize_to_file("hi", "v", &path).await.is_err());
        assert!(!path.exists());
    }
}
