//! Text-only speech output, used by `chat` mode
//!
//! Replies go through the same start/synthesize/play/end lifecycle as the
//! real voice path, but are printed instead of spoken.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

use super::{AudioPlayer, SpeechSynthesizer};

/// Prints the reply and writes it to the transient file as plain text
#[derive(Debug, Clone)]
pub struct ConsoleSynthesizer {
    speaker: String,
}

impl ConsoleSynthesizer {
    pub fn new(speaker: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ConsoleSynthesizer {
    async fn synthesize_to_file(&self, text: &str, _voice: &str, path: &Path) -> Result<()> {
        println!("{}: {}", self.speaker, text);
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn file_extension(&self) -> &'static str {
        ".txt"
    }
}

/// Player that returns immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlayer;

impl AudioPlayer for NullPlayer {
    fn play_file(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
