//! Microphone capture loop
//!
//! Runs on its own OS thread: blocking capture and recognition never touch
//! the coordination task. Recognized text goes back through an
//! [`EventSender`], which keeps submission order.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

use super::{CaptureError, MicrophoneFactory, PlaybackState, Transcriber};
use crate::events::{Event, EventSender};

/// Capture timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    /// Ambient noise calibration, done once per thread
    pub calibration: Duration,
    /// How long to wait for speech to begin
    pub wait_timeout: Duration,
    /// Maximum length of one utterance
    pub phrase_limit: Duration,
    /// Sleep between checks while a reply is being spoken
    pub speaking_poll: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            calibration: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(5),
            phrase_limit: Duration::from_secs(10),
            speaking_poll: Duration::from_millis(100),
        }
    }
}

/// Everything the capture thread owns
pub struct CaptureContext {
    pub microphone: MicrophoneFactory,
    pub transcriber: Arc<dyn Transcriber>,
    pub sender: EventSender,
    pub state: Arc<PlaybackState>,
    pub timing: CaptureTiming,
}

/// Capture and recognize speech until `is_listening` is cleared.
/// Returns the number of commands submitted.
pub fn run_capture_loop(ctx: CaptureContext) -> usize {
    let span = info_span!("capture");
    let _enter = span.enter();

    let mut microphone = match (ctx.microphone)() {
        Ok(microphone) => microphone,
        Err(e) => {
            error!("Failed to open microphone: {:#}", e);
            ctx.state.set_listening(false);
            return 0;
        }
    };

    match microphone.adjust_for_ambient_noise(ctx.timing.calibration) {
        Ok(()) => info!("Calibrated for ambient noise"),
        Err(e) => warn!("Ambient noise calibration failed: {:#}", e),
    }

    let mut submitted = 0;
    let mut paused = false;
    while ctx.state.is_listening() {
        // Never listen to our own voice
        if ctx.state.is_speaking() {
            paused = true;
            std::thread::sleep(ctx.timing.speaking_poll);
            continue;
        }
        if paused {
            microphone.discard_pending();
            paused = false;
        }

        debug!("Listening...");
        let audio = match microphone.listen(ctx.timing.wait_timeout, ctx.timing.phrase_limit) {
            Ok(audio) => audio,
            Err(CaptureError::WaitTimeout) | Err(CaptureError::UnknownValue) => continue,
            Err(CaptureError::Other(e)) => {
                error!("Voice input error: {:#}", e);
                std::thread::sleep(ctx.timing.speaking_poll);
                continue;
            }
        };

        // Playback may have started while we were capturing
        if ctx.state.is_speaking() || !ctx.state.is_listening() {
            debug!("Discarding audio captured during playback");
            paused = true;
            continue;
        }

        debug!("Processing audio...");
        let text = match ctx.transcriber.transcribe(&audio) {
            Ok(text) => text,
            Err(CaptureError::WaitTimeout) | Err(CaptureError::UnknownValue) => continue,
            Err(CaptureError::Other(e)) => {
                error!("Voice input error: {:#}", e);
                continue;
            }
        };

        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        info!("Heard: {}", text);
        if let Err(e) = ctx.sender.send(Event::voice_command(text)) {
            warn!("Stopping capture: {:#}", e);
            break;
        }
        submitted += 1;
    }

    info!("Voice capture stopped");
    submitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventKind};
    use crate::voice::audio::AudioBuffer;
    use crate::voice::Microphone;
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Plays back a script of listen results, then stops listening
    struct ScriptedMicrophone {
        script: VecDeque<Result<AudioBuffer, CaptureError>>,
        state: Arc<PlaybackState>,
        listens: Arc<AtomicUsize>,
    }

    impl Microphone for ScriptedMicrophone {
        fn adjust_for_ambient_noise(&mut self, _duration: Duration) -> Result<()> {
            Ok(())
        }

        fn listen(&mut self, _timeout: Duration, _limit: Duration) -> Result<AudioBuffer, CaptureError> {
            self.listens.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(result) => result,
                None => {
                    self.state.set_listening(false);
                    Err(CaptureError::WaitTimeout)
                }
            }
        }
    }

    struct ScriptedTranscriber {
        script: Mutex<VecDeque<Result<String, CaptureError>>>,
    }

    impl Transcriber for ScriptedTranscriber {
        fn transcribe(&self, _audio: &AudioBuffer) -> Result<String, CaptureError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CaptureError::UnknownValue))
        }
    }

    fn utterance() -> Result<AudioBuffer, CaptureError> {
        Ok(AudioBuffer::from_samples(vec![0.2; 160], 16000, 1))
    }

    fn fast_timing() -> CaptureTiming {
        CaptureTiming {
            calibration: Duration::ZERO,
            wait_timeout: Duration::from_millis(1),
            phrase_limit: Duration::from_millis(1),
            speaking_poll: Duration::from_millis(5),
        }
    }

    fn context(
        mic_script: Vec<Result<AudioBuffer, CaptureError>>,
        stt_script: Vec<Result<String, CaptureError>>,
        sender: EventSender,
        state: Arc<PlaybackState>,
        listens: Arc<AtomicUsize>,
    ) -> CaptureContext {
        let mic_state = state.clone();
        let script = Mutex::new(Some(VecDeque::from(mic_script)));
        let microphone: MicrophoneFactory = Arc::new(move || -> Result<Box<dyn Microphone>> {
            let script = script.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedMicrophone {
                script,
                state: mic_state.clone(),
                listens: listens.clone(),
            }) as Box<dyn Microphone>)
        });
        CaptureContext {
            microphone,
            transcriber: Arc::new(ScriptedTranscriber {
                script: Mutex::new(VecDeque::from(stt_script)),
            }),
            sender,
            state,
            timing: fast_timing(),
        }
    }

    #[test]
    fn test_submits_only_recognized_text() {
        let (sender, mut queue) = EventBus::channel();
        let state = Arc::new(PlaybackState::default());
        state.set_listening(true);

        let ctx = context(
            vec![
                utterance(),
                Err(CaptureError::WaitTimeout),
                utterance(),
                Err(CaptureError::Other(anyhow!("device unplugged"))),
                utterance(),
                utterance(),
            ],
            vec![
                Ok("  turn on the lights ".to_string()),
                Err(CaptureError::UnknownValue),
                Ok("   ".to_string()),
                Ok("status".to_string()),
            ],
            sender,
            state.clone(),
            Arc::new(AtomicUsize::new(0)),
        );

        assert_eq!(run_capture_loop(ctx), 2);
        assert!(!state.is_listening());

        let texts: Vec<String> = std::iter::from_fn(|| queue.try_recv())
            .map(|event| {
                assert_eq!(event.kind(), EventKind::VoiceCommandDetected);
                event.str_or("text", "").to_string()
            })
            .collect();
        assert_eq!(texts, vec!["turn on the lights", "status"]);
    }

    #[test]
    fn test_no_capture_while_speaking() {
        let (sender, _queue) = EventBus::channel();
        let state = Arc::new(PlaybackState::default());
        state.set_listening(true);
        state.set_speaking(true);
        let listens = Arc::new(AtomicUsize::new(0));

        let ctx = context(vec![utterance()], vec![], sender, state.clone(), listens.clone());
        let handle = std::thread::spawn(move || run_capture_loop(ctx));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(listens.load(Ordering::SeqCst), 0);

        state.set_listening(false);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_microphone_failure_ends_thread() {
        let (sender, _queue) = EventBus::channel();
        let state = Arc::new(PlaybackState::default());
        state.set_listening(true);

        let ctx = CaptureContext {
            microphone: Arc::new(|| -> Result<Box<dyn Microphone>> { Err(anyhow!("no input device")) }),
            transcriber: Arc::new(ScriptedTranscriber {
                script: Mutex::new(VecDeque::new()),
            }),
            sender,
            state: state.clone(),
            timing: fast_timing(),
        };

        assert_eq!(run_capture_loop(ctx), 0);
        assert!(!state.is_listening());
    }

    #[test]
    fn test_closed_queue_stops_capture() {
        let (sender, queue) = EventBus::channel();
        drop(queue);
        let state = Arc::new(PlaybackState::default());
        state.set_listening(true);

        let ctx = context(
            vec![utterance(), utterance()],
            vec![Ok("one".to_string()), Ok("two".to_string())],
            sender,
            state,
            Arc::new(AtomicUsize::new(0)),
        );
        assert_eq!(run_capture_loop(ctx), 0);
    }

    /// Records which calls the loop makes; the first listen ends the session
    struct CallLog {
        calls: Arc<Mutex<Vec<&'static str>>>,
        state: Arc<PlaybackState>,
    }

    impl Microphone for CallLog {
        fn adjust_for_ambient_noise(&mut self, _duration: Duration) -> Result<()> {
            Ok(())
        }

        fn discard_pending(&mut self) {
            self.calls.lock().unwrap().push("discard");
        }

        fn listen(&mut self, _timeout: Duration, _limit: Duration) -> Result<AudioBuffer, CaptureError> {
            self.calls.lock().unwrap().push("listen");
            self.state.set_listening(false);
            Err(CaptureError::WaitTimeout)
        }
    }

    fn call_log_context(state: Arc<PlaybackState>, calls: Arc<Mutex<Vec<&'static str>>>) -> CaptureContext {
        let (sender, _queue) = EventBus::channel();
        let mic_state = state.clone();
        CaptureContext {
            microphone: Arc::new(move || -> Result<Box<dyn Microphone>> {
                Ok(Box::new(CallLog {
                    calls: calls.clone(),
                    state: mic_state.clone(),
                }) as Box<dyn Microphone>)
            }),
            transcriber: Arc::new(ScriptedTranscriber {
                script: Mutex::new(VecDeque::new()),
            }),
            sender,
            state,
            timing: fast_timing(),
        }
    }

    #[test]
    fn test_playback_audio_is_flushed_before_listening_again() {
        let state = Arc::new(PlaybackState::default());
        state.set_listening(true);
        state.set_speaking(true);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let ctx = call_log_context(state.clone(), calls.clone());
        let handle = std::thread::spawn(move || run_capture_loop(ctx));

        std::thread::sleep(Duration::from_millis(30));
        assert!(calls.lock().unwrap().is_empty());

        state.set_speaking(false);
        assert_eq!(handle.join().unwrap(), 0);
        assert_eq!(*calls.lock().unwrap(), vec!["discard", "listen"]);
    }

    #[test]
    fn test_no_flush_without_playback() {
        let state = Arc::new(PlaybackState::default());
        state.set_listening(true);
        let calls = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(run_capture_loop(call_log_context(state, calls.clone())), 0);
        assert_eq!(*calls.lock().unwrap(), vec!["listen"]);
    }
}
