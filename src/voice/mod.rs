//! Voice Module
//!
//! Speech in and speech out for the assistant:
//! - capture: microphone thread that turns utterances into
//!   `VOICE_COMMAND_DETECTED` events
//! - stt: Whisper-compatible recognition
//! - tts: OpenAI-compatible synthesis
//! - device: cpal microphone and rodio playback (`voice` feature)
//! - console: printed replies for text-only sessions
//!
//! ```text
//! SYSTEM_STARTUP ──→ start_listening ──→ capture thread ──send──→ EventQueue
//!
//! RESPONSE_GENERATED ──→ TTS_SPEAKING_START ──→ synthesize ──→ play ──→ TTS_SPEAKING_END
//! ```
//!
//! While a reply is playing `is_speaking` is set and the capture thread
//! does not listen.

pub mod audio;
pub mod capture;
pub mod console;
#[cfg(feature = "voice")]
pub mod device;
pub mod stt;
pub mod tts;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::VoiceConfig;
use crate::events::{Event, EventBus, EventKind, EventSender};

pub use audio::{AudioBuffer, SampleQueue};
pub use capture::{CaptureContext, CaptureTiming};
pub use console::{ConsoleSynthesizer, NullPlayer};
pub use stt::WhisperTranscriber;
pub use tts::HttpSynthesizer;

/// Why a capture attempt produced no audio or no text
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Nobody started speaking before the wait timeout
    #[error("timed out waiting for speech")]
    WaitTimeout,
    /// Audio was captured but could not be understood
    #[error("speech was unintelligible")]
    UnknownValue,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Blocking audio source. Lives entirely on the capture thread.
pub trait Microphone {
    fn adjust_for_ambient_noise(&mut self, duration: Duration) -> Result<()>;

    /// Drop audio buffered since the last read, such as our own playback
    fn discard_pending(&mut self) {}

    /// Wait up to `timeout` for speech, then record until a pause or
    /// `phrase_limit`
    fn listen(&mut self, timeout: Duration, phrase_limit: Duration) -> Result<AudioBuffer, CaptureError>;
}

/// Opens the microphone on the capture thread
pub type MicrophoneFactory = Arc<dyn Fn() -> Result<Box<dyn Microphone>> + Send + Sync>;

/// Blocking speech-to-text
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &AudioBuffer) -> Result<String, CaptureError>;
}

/// Text-to-speech into a file
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize_to_file(&self, text: &str, voice: &str, path: &Path) -> Result<()>;

    /// Suffix for the transient audio file
    fn file_extension(&self) -> &'static str {
        ".mp3"
    }
}

/// Blocking playback that returns once the audio has finished
pub trait AudioPlayer: Send + Sync {
    fn play_file(&self, path: &Path) -> Result<()>;
}

/// Flags shared between the coordination task and the capture thread
#[derive(Debug, Default)]
pub struct PlaybackState {
    is_listening: AtomicBool,
    is_speaking: AtomicBool,
}

impl PlaybackState {
    pub fn is_listening(&self) -> bool {
        self.is_listening.load(Ordering::SeqCst)
    }

    pub fn set_listening(&self, listening: bool) {
        self.is_listening.store(listening, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.is_speaking.store(speaking, Ordering::SeqCst);
    }
}

/// Microphone side, absent in text-only sessions
#[derive(Clone)]
pub struct SpeechInput {
    pub microphone: MicrophoneFactory,
    pub transcriber: Arc<dyn Transcriber>,
}

/// Speaker side
#[derive(Clone)]
pub struct SpeechOutput {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
}

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// Voice every reply is spoken with
    pub narrator_voice: String,
    pub timing: CaptureTiming,
}

impl VoiceSettings {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            narrator_voice: config.narrator_voice.clone(),
            timing: CaptureTiming {
                calibration: Duration::from_secs(config.calibration_secs),
                wait_timeout: Duration::from_secs(config.wait_timeout_secs),
                phrase_limit: Duration::from_secs(config.phrase_limit_secs),
                ..CaptureTiming::default()
            },
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

pub struct VoiceModule {
    bus: Weak<EventBus>,
    sender: EventSender,
    input: Option<SpeechInput>,
    output: SpeechOutput,
    settings: VoiceSettings,
    state: Arc<PlaybackState>,
    capture_thread: Mutex<Option<JoinHandle<usize>>>,
}

impl VoiceModule {
    pub fn new(
        bus: &Arc<EventBus>,
        sender: EventSender,
        input: Option<SpeechInput>,
        output: SpeechOutput,
        settings: VoiceSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::downgrade(bus),
            sender,
            input,
            output,
            settings,
            state: Arc::new(PlaybackState::default()),
            capture_thread: Mutex::new(None),
        })
    }

    /// Subscribe the voice handlers on the bus
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let voice = self.clone();
        bus.subscribe(EventKind::SystemStartup, "voice.start_listening", move |_| {
            let result = voice.start_listening();
            async move { result }
        });

        let voice = self.clone();
        bus.subscribe(EventKind::ResponseGenerated, "voice.handle_response", move |event| {
            let voice = voice.clone();
            async move { voice.handle_response(event.str_or("text", "")).await }
        });

        info!(
            "Voice module initialized ({})",
            if self.input.is_some() { "microphone + speech" } else { "text input" }
        );
    }

    pub fn state(&self) -> &Arc<PlaybackState> {
        &self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    pub fn is_speaking(&self) -> bool {
        self.state.is_speaking()
    }

    /// Start the capture thread. A second call while listening is ignored.
    pub fn start_listening(&self) -> Result<()> {
        let Some(input) = &self.input else {
            debug!("No microphone configured, voice capture disabled");
            return Ok(());
        };

        if self.state.is_listening.swap(true, Ordering::SeqCst) {
            warn!("Voice capture already running, ignoring start");
            return Ok(());
        }

        info!("Starting voice input loop");
        let ctx = CaptureContext {
            microphone: input.microphone.clone(),
            transcriber: input.transcriber.clone(),
            sender: self.sender.clone(),
            state: self.state.clone(),
            timing: self.settings.timing,
        };

        let spawned = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || capture::run_capture_loop(ctx));

        match spawned {
            Ok(handle) => {
                *self
                    .capture_thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.set_listening(false);
                Err(e).context("Failed to spawn capture thread")
            }
        }
    }

    /// Ask the capture thread to exit after its current wait. Returns its
    /// handle so the caller may join it.
    pub fn stop_listening(&self) -> Option<JoinHandle<usize>> {
        self.state.set_listening(false);
        self.capture_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Speak a reply, bracketed by speaking start/end events. The end event
    /// is published even when synthesis or playback fails.
    pub async fn handle_response(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let bus = self.bus.upgrade().context("Event bus no longer available")?;

        self.state.set_speaking(true);
        bus.publish(Event::speaking_start(text)).await;

        if let Err(e) = self.generate_and_play(text).await {
            error!("TTS/playback error: {:#}", e);
        }

        self.state.set_speaking(false);
        bus.publish(Event::speaking_end()).await;
        Ok(())
    }

    async fn generate_and_play(&self, text: &str) -> Result<()> {
        // Removed on drop, so every exit path cleans up
        let path = tempfile::Builder::new()
            .prefix("master-system-tts-")
            .suffix(self.output.synthesizer.file_extension())
            .tempfile()
            .context("Failed to create transient audio file")?
            .into_temp_path();

        self.output
            .synthesizer
            .synthesize_to_file(text, &self.settings.narrator_voice, &path)
            .await?;

        let player = self.output.player.clone();
        let path = tokio::task::spawn_blocking(move || -> Result<tempfile::TempPath> {
            player.play_file(&path)?;
            Ok(path)
        })
        .await
        .context("Playback worker failed")??;

        path.close().context("Failed to remove transient audio file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::path::PathBuf;

    struct RecordingSynthesizer {
        fail: bool,
        paths: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingSynthesizer {
        async fn synthesize_to_file(&self, text: &str, voice: &str, path: &Path) -> Result<()> {
            self.paths.lock().unwrap().push(path.to_path_buf());
            if self.fail {
                bail!("synthesis offline");
            }
            std::fs::write(path, format!("{}|{}", voice, text))?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPlayer {
        played: Mutex<Vec<String>>,
    }

    impl AudioPlayer for RecordingPlayer {
        fn play_file(&self, path: &Path) -> Result<()> {
            self.played.lock().unwrap().push(std::fs::read_to_string(path)?);
            Ok(())
        }
    }

    fn voice_with(
        synth: Arc<RecordingSynthesizer>,
        player: Arc<RecordingPlayer>,
    ) -> (Arc<EventBus>, Arc<VoiceModule>, Arc<Mutex<Vec<EventKind>>>) {
        let bus = Arc::new(EventBus::new());
        let (sender, _queue) = EventBus::channel();
        let voice = VoiceModule::new(
            &bus,
            sender,
            None,
            SpeechOutput {
                synthesizer: synth,
                player,
            },
            VoiceSettings::default(),
        );
        voice.register(&bus);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::TtsSpeakingStart, EventKind::TtsSpeakingEnd] {
            let seen = seen.clone();
            let v = voice.clone();
            bus.subscribe(kind, "recorder", move |event| {
                // Speaking flag is already set when start is announced
                if event.kind() == EventKind::TtsSpeakingStart {
                    assert!(v.is_speaking());
                }
                seen.lock().unwrap().push(event.kind());
                async { Ok(()) }
            });
        }
        (bus, voice, seen)
    }

    #[tokio::test]
    async fn test_response_is_spoken_with_narrator_voice() {
        let synth = Arc::new(RecordingSynthesizer {
            fail: false,
            paths: Mutex::new(Vec::new()),
        });
        let player = Arc::new(RecordingPlayer::default());
        let (bus, voice, seen) = voice_with(synth.clone(), player.clone());

        bus.publish(Event::response_generated("Good evening, Sir.")).await;

        assert_eq!(
            *player.played.lock().unwrap(),
            vec!["en-US-ChristopherNeural|Good evening, Sir.".to_string()]
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::TtsSpeakingStart, EventKind::TtsSpeakingEnd]
        );
        assert!(!voice.is_speaking());

        let paths = synth.paths.lock().unwrap();
        assert!(paths[0].to_string_lossy().ends_with(".mp3"));
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn test_speaking_end_after_failure() {
        let synth = Arc::new(RecordingSynthesizer {
            fail: true,
            paths: Mutex::new(Vec::new()),
        });
        let player = Arc::new(RecordingPlayer::default());
        let (bus, voice, seen) = voice_with(synth.clone(), player.clone());

        let report = bus.publish(Event::response_generated("hello")).await;
        assert_eq!(report.failed, 0);

        assert!(player.played.lock().unwrap().is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::TtsSpeakingStart, EventKind::TtsSpeakingEnd]
        );
        assert!(!voice.is_speaking());
        assert!(!synth.paths.lock().unwrap()[0].exists());
    }

    #[tokio::test]
    async fn test_empty_response_is_ignored() {
        let synth = Arc::new(RecordingSynthesizer {
            fail: false,
            paths: Mutex::new(Vec::new()),
        });
        let player = Arc::new(RecordingPlayer::default());
        let (bus, _voice, seen) = voice_with(synth.clone(), player);

        bus.publish(Event::response_generated("  ")).await;
        bus.publish(Event::new(EventKind::ResponseGenerated)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert!(synth.paths.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_microphone_is_noop() {
        let synth = Arc::new(RecordingSynthesizer {
            fail: false,
            paths: Mutex::new(Vec::new()),
        });
        let (bus, voice, _) = voice_with(synth, Arc::new(RecordingPlayer::default()));

        let report = bus.publish(Event::system_startup()).await;
        assert_eq!(report.delivered, 1);
        assert!(!voice.is_listening());
        assert!(voice.stop_listening().is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = VoiceSettings::default();
        assert_eq!(settings.narrator_voice, "en-US-ChristopherNeural");
        assert_eq!(settings.timing, CaptureTiming::default());
    }
}
