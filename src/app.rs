//! Application root
//!
//! Builds the bus and the modules, wires their subscriptions and runs the
//! coordination loop that drains the event queue.

use anyhow::Result;
use std::future::Future;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::brain::{BrainModule, BrainSettings, ChatClient, ChatModel};
use crate::config::Config;
use crate::events::{Event, EventBus, EventKind, EventQueue, EventSender};
use crate::voice::{
    ConsoleSynthesizer, HttpSynthesizer, NullPlayer, SpeechInput, SpeechOutput, VoiceModule,
    VoiceSettings,
};

/// Where user input comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Microphone capture and spoken replies
    Voice,
    /// Typed commands and printed replies
    Text,
}

pub struct Assistant {
    bus: Arc<EventBus>,
    sender: EventSender,
    queue: EventQueue,
    brain: Arc<BrainModule>,
    voice: Arc<VoiceModule>,
}

impl Assistant {
    /// Build the assistant with real adapters for `mode`
    pub fn new(config: &Config, mode: InputMode) -> Result<Self> {
        let model = match ChatClient::from_config(&config.llm) {
            Ok(Some(client)) => {
                info!(model = client.model(), "Remote model configured");
                Some(Arc::new(client) as Arc<dyn ChatModel>)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Remote model unavailable: {:#}", e);
                None
            }
        };

        let (input, output) = match mode {
            InputMode::Voice => voice_adapters(config)?,
            InputMode::Text => (None, console_output(config)),
        };

        Ok(Self::with_parts(config, model, input, output))
    }

    /// Build the assistant from explicit adapters
    pub fn with_parts(
        config: &Config,
        model: Option<Arc<dyn ChatModel>>,
        input: Option<SpeechInput>,
        output: SpeechOutput,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let (sender, queue) = EventBus::channel();

        let brain = BrainModule::new(&bus, model, BrainSettings::from_config(config));
        brain.register(&bus);

        let voice = VoiceModule::new(
            &bus,
            sender.clone(),
            input,
            output,
            VoiceSettings::from_config(&config.voice),
        );
        voice.register(&bus);

        Self {
            bus,
            sender,
            queue,
            brain,
            voice,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Handle for submitting events from other threads
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn brain(&self) -> &Arc<BrainModule> {
        &self.brain
    }

    pub fn voice(&self) -> &Arc<VoiceModule> {
        &self.voice
    }

    /// Publish `SYSTEM_STARTUP` and drain the queue until Ctrl-C or
    /// `shutdown` resolves. Queued events are handled before shutdown is
    /// honoured. Returns the number of events dispatched.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<usize> {
        info!("All systems initialized");
        let report = self.bus.publish(Event::system_startup()).await;
        if report.failed > 0 {
            warn!("{} startup handler(s) failed", report.failed);
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        tokio::pin!(shutdown);

        let mut dispatched = 0;
        loop {
            let event = tokio::select! {
                biased;
                event = self.queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = &mut shutdown => break,
                _ = &mut ctrl_c => {
                    info!("Interrupted");
                    break;
                }
            };
            self.bus.publish(event).await;
            dispatched += 1;
        }

        info!("Shutting down");
        // The capture thread notices within one wait timeout
        drop(self.voice.stop_listening());
        Ok(dispatched)
    }
}

fn console_output(config: &Config) -> SpeechOutput {
    SpeechOutput {
        synthesizer: Arc::new(ConsoleSynthesizer::new(config.assistant.name.clone())),
        player: Arc::new(NullPlayer),
    }
}

#[cfg(feature = "voice")]
fn voice_adapters(config: &Config) -> Result<(Option<SpeechInput>, SpeechOutput)> {
    use crate::voice::device::{CpalMicrophone, RodioPlayer};
    use crate::voice::{Microphone, WhisperTranscriber};

    let timeout = config.llm.timeout();
    let sample_rate = config.voice.sample_rate;
    let input = SpeechInput {
        microphone: Arc::new(move || -> Result<Box<dyn Microphone>> {
            Ok(Box::new(CpalMicrophone::open(sample_rate)?) as Box<dyn Microphone>)
        }),
        transcriber: Arc::new(WhisperTranscriber::from_config(&config.voice, timeout)),
    };
    let output = SpeechOutput {
        synthesizer: Arc::new(HttpSynthesizer::from_config(&config.voice, timeout)?),
        player: Arc::new(RodioPlayer),
    };
    Ok((Some(input), output))
}

#[cfg(not(feature = "voice"))]
fn voice_adapters(config: &Config) -> Result<(Option<SpeechInput>, SpeechOutput)> {
    warn!("Built without the voice feature; replies are synthesized but not played");
    let output = SpeechOutput {
        synthesizer: Arc::new(HttpSynthesizer::from_config(&config.voice, config.llm.timeout())?),
        player: Arc::new(NullPlayer),
    };
    Ok((None, output))
}

/// One line typed in a chat session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Command(String),
    Emotion(String),
    Identify(String),
    Quit,
}

impl ChatInput {
    /// Parse a typed line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head {
            "/quit" | "/exit" => Some(ChatInput::Quit),
            "/emotion" if !rest.is_empty() => Some(ChatInput::Emotion(rest.to_string())),
            "/identify" if !rest.is_empty() => Some(ChatInput::Identify(rest.to_string())),
            _ => Some(ChatInput::Command(line.to_string())),
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            ChatInput::Command(text) => Some(Event::voice_command(text)),
            ChatInput::Emotion(emotion) => Some(Event::user_emotion(emotion)),
            ChatInput::Identify(user) => Some(Event::user_identified(user)),
            ChatInput::Quit => None,
        }
    }
}

/// Read chat lines from `reader` on a background thread and submit them.
/// The returned receiver resolves at end of input or `/quit`.
pub fn spawn_chat_reader<R>(reader: R, sender: EventSender) -> Result<oneshot::Receiver<()>>
where
    R: BufRead + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("chat-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read input: {}", e);
                        break;
                    }
                };
                let Some(input) = ChatInput::parse(&line) else {
                    continue;
                };
                let Some(event) = input.into_event() else {
                    break;
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
            let _ = done_tx.send(());
        })?;
    Ok(done_rx)
}

/// Run a text chat on stdin until end of input or Ctrl-C
pub async fn run_chat(config: &Config) -> Result<()> {
    let assistant = Assistant::new(config, InputMode::Text)?;
    println!(
        "{} is listening. Type a message, /identify <name>, /emotion <mood> or /quit.",
        config.assistant.name
    );

    let done = spawn_chat_reader(std::io::BufReader::new(std::io::stdin()), assistant.sender())?;
    assistant
        .run(async move {
            let _ = done.await;
        })
        .await?;
    Ok(())
}

/// Run the voice assistant until Ctrl-C
pub async fn run_voice(config: &Config) -> Result<()> {
    let assistant = Assistant::new(config, InputMode::Voice)?;
    assistant.run(std::future::pending()).await?;
    Ok(())
}

/// Kinds the assistant subscribes to, for diagnostics
pub fn wired_kinds(bus: &EventBus) -> Vec<(EventKind, Vec<String>)> {
    EventKind::all()
        .iter()
        .map(|kind| (*kind, bus.subscriber_names(*kind)))
        .filter(|(_, names)| !names.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::fallback;
    use crate::voice::{AudioPlayer, SpeechSynthesizer};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSynthesizer {
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingSynthesizer {
        async fn synthesize_to_file(&self, text: &str, _voice: &str, _path: &Path) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct SilentPlayer;

    impl AudioPlayer for SilentPlayer {
        fn play_file(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn offline_assistant() -> (Assistant, Arc<RecordingSynthesizer>) {
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let output = SpeechOutput {
            synthesizer: synthesizer.clone(),
            player: Arc::new(SilentPlayer),
        };
        (Assistant::with_parts(&Config::default(), None, None, output), synthesizer)
    }

    #[test]
    fn test_parse_chat_input() {
        assert_eq!(ChatInput::parse("   "), None);
        assert_eq!(ChatInput::parse("/quit"), Some(ChatInput::Quit));
        assert_eq!(
            ChatInput::parse("/emotion  happy "),
            Some(ChatInput::Emotion("happy".to_string()))
        );
        assert_eq!(
            ChatInput::parse("/identify Tony Stark"),
            Some(ChatInput::Identify("Tony Stark".to_string()))
        );
        assert_eq!(
            ChatInput::parse("/emotion"),
            Some(ChatInput::Command("/emotion".to_string()))
        );
        assert_eq!(
            ChatInput::parse(" hello there "),
            Some(ChatInput::Command("hello there".to_string()))
        );
    }

    #[test]
    fn test_modules_are_wired() {
        let (assistant, _) = offline_assistant();
        let kinds: Vec<EventKind> = wired_kinds(assistant.bus()).into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds.len(), EventKind::all().len());
        assert_eq!(
            assistant.bus().subscriber_names(EventKind::ResponseGenerated),
            vec!["voice.handle_response".to_string()]
        );
    }

    #[tokio::test]
    async fn test_queued_commands_are_answered_before_shutdown() {
        let (assistant, synthesizer) = offline_assistant();
        let sender = assistant.sender();
        sender.send(Event::voice_command("hello")).unwrap();
        sender.send(Event::voice_command("status")).unwrap();

        let dispatched = assistant.run(std::future::ready(())).await.unwrap();
        assert_eq!(dispatched, 2);

        let spoken = synthesizer.spoken.lock().unwrap().clone();
        assert_eq!(spoken.len(), 2);
        assert_eq!(spoken, vec![fallback::GREETING_REPLY, fallback::STATUS_REPLY]);
    }

    #[tokio::test]
    async fn test_chat_reader_submits_lines_until_quit() {
        let (assistant, synthesizer) = offline_assistant();
        let input = Cursor::new("/identify Pepper\n\nhello\n/quit\nstatus\n");

        let done = spawn_chat_reader(input, assistant.sender()).unwrap();
        done.await.unwrap();

        let dispatched = assistant.run(std::future::ready(())).await.unwrap();
        assert_eq!(dispatched, 2);
        let spoken = synthesizer.spoken.lock().unwrap().clone();
        assert_eq!(spoken, vec!["Identity confirmed. Welcome back, Pepper.", fallback::GREETING_REPLY]);
    }
}
