//! Brain module
//!
//! Turns recognized speech and identity/emotion signals into reply text.
//! With a remote [`ChatModel`] every command becomes a prompt carrying the
//! current emotion context; without one, [`fallback`] keyword rules answer.
//! Every reply is published as `RESPONSE_GENERATED`.
//!
//! Commands arriving while a reply is being spoken are ignored, so the
//! assistant never answers its own voice.

pub mod fallback;
pub mod llm;

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind};

pub use llm::{ChatClient, ChatMessage, ChatModel};

/// Bounded retry for remote model calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(500),
        }
    }
}

/// Tunables for the brain
#[derive(Debug, Clone)]
pub struct BrainSettings {
    pub retry: RetryPolicy,
    /// Persona instructions prepended to every remote prompt
    pub system_prompt: String,
    /// Name used when an identification arrives without one
    pub user_title: String,
}

impl BrainSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: config.llm.max_retries,
                delay: config.llm.retry_delay(),
            },
            system_prompt: config.assistant.system_prompt.clone(),
            user_title: config.assistant.user_title.clone(),
        }
    }
}

impl Default for BrainSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct BrainModule {
    bus: Weak<EventBus>,
    model: Option<Arc<dyn ChatModel>>,
    settings: BrainSettings,
    emotion_context: Mutex<String>,
    is_speaking: AtomicBool,
}

impl BrainModule {
    /// Create the brain. `model` is `None` when no remote model is
    /// configured, in which case the offline rules answer.
    pub fn new(
        bus: &Arc<EventBus>,
        model: Option<Arc<dyn ChatModel>>,
        settings: BrainSettings,
    ) -> Arc<Self> {
        if model.is_some() {
            info!("Brain module: remote model online");
        } else {
            warn!("Brain module: no remote model configured, falling back to simple logic");
        }

        Arc::new(Self {
            bus: Arc::downgrade(bus),
            model,
            settings,
            emotion_context: Mutex::new(fallback::NEUTRAL_EMOTION.to_string()),
            is_speaking: AtomicBool::new(false),
        })
    }

    /// Subscribe the brain's handlers on the bus
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let brain = self.clone();
        bus.subscribe(EventKind::VoiceCommandDetected, "brain.process_command", move |event| {
            let brain = brain.clone();
            async move { brain.process_command(event.str_or("text", "")).await }
        });

        let brain = self.clone();
        bus.subscribe(EventKind::UserIdentified, "brain.greet_user", move |event| {
            let brain = brain.clone();
            async move {
                let user = event.str_or("user", &brain.settings.user_title).to_string();
                brain.greet_user(&user).await
            }
        });

        let brain = self.clone();
        bus.subscribe(EventKind::UserEmotionDetected, "brain.update_emotion", move |event| {
            let brain = brain.clone();
            async move {
                brain.update_emotion_context(event.str_or("emotion", fallback::NEUTRAL_EMOTION));
                Ok(())
            }
        });

        let brain = self.clone();
        bus.subscribe(EventKind::TtsSpeakingStart, "brain.speaking_start", move |_| {
            brain.set_speaking(true);
            async { Ok(()) }
        });

        let brain = self.clone();
        bus.subscribe(EventKind::TtsSpeakingEnd, "brain.speaking_end", move |_| {
            brain.set_speaking(false);
            async { Ok(()) }
        });

        info!("Brain module initialized");
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.is_speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn emotion_context(&self) -> String {
        self.emotion_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_emotion_context(&self, emotion: &str) {
        debug!(emotion, "Emotion context updated");
        *self
            .emotion_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = emotion.to_string();
    }

    /// Answer a recognized command
    #[instrument(name = "brain", skip(self))]
    pub async fn process_command(&self, text: &str) -> Result<()> {
        if self.is_speaking() {
            debug!("Skipping command, currently speaking");
            return Ok(());
        }

        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        info!("Brain processing: {}", text);

        if self.model.is_none() {
            return self.respond(fallback::offline_reply(text)).await;
        }

        let prompt = fallback::command_prompt(&self.emotion_context(), text);
        match self.query_llm(&prompt).await {
            Ok(reply) => self.respond(&reply).await,
            Err(e) => {
                error!("Remote model error: {:#}", e);
                self.respond(fallback::APOLOGY_REPLY).await
            }
        }
    }

    /// Greet a newly identified user
    #[instrument(name = "brain", skip(self))]
    pub async fn greet_user(&self, user: &str) -> Result<()> {
        if self.model.is_none() {
            return self.respond(&fallback::offline_greeting(user)).await;
        }

        match self.query_llm(&fallback::greeting_prompt(user)).await {
            Ok(reply) => self.respond(&reply).await,
            Err(e) => {
                error!("Greeting error: {:#}", e);
                self.respond(&fallback::failed_greeting(user)).await
            }
        }
    }

    /// Ask the remote model, retrying per the policy. The last failure is
    /// returned to the caller, which picks the reply to use instead.
    pub async fn query_llm(&self, prompt: &str) -> Result<String> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("No remote model configured"))?;

        let full_prompt = format!("{}\n\n{}", self.settings.system_prompt, prompt);
        let max_attempts = self.settings.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match model.send_message(&full_prompt).await {
                Ok(reply) => return Ok(reply.trim().to_string()),
                Err(e) => {
                    warn!(attempt, max_attempts, "Remote model attempt failed: {:#}", e);
                    if attempt >= max_attempts {
                        return Err(e.context(format!(
                            "Remote model failed after {} attempts",
                            max_attempts
                        )));
                    }
                    tokio::time::sleep(self.settings.retry.delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn respond(&self, text: &str) -> Result<()> {
        let text = fallback::strip_markdown(text);
        info!("Brain response: {}", text);

        let bus = self.bus.upgrade().context("Event bus no longer available")?;
        bus.publish(Event::response_generated(text)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::llm::MockChatModel;
    use super::*;

    /// Bus plus a recorder of every RESPONSE_GENERATED text
    fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let replies = Arc::new(Mutex::new(Vec::new()));
        let r = replies.clone();
        bus.subscribe(EventKind::ResponseGenerated, "recorder", move |event| {
            let r = r.clone();
            async move {
                r.lock().unwrap().push(event.str_or("text", "").to_string());
                Ok(())
            }
        });
        (bus, replies)
    }

    fn fast_settings() -> BrainSettings {
        BrainSettings {
            retry: RetryPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(1),
            },
            system_prompt: "SYSTEM".to_string(),
            user_title: fallback::DEFAULT_USER.to_string(),
        }
    }

    #[tokio::test]
    async fn test_offline_rules() {
        let (bus, replies) = recording_bus();
        let brain = BrainModule::new(&bus, None, fast_settings());

        brain.process_command("Hello FRIDAY").await.unwrap();
        brain.process_command("status report").await.unwrap();
        brain.process_command("make coffee").await.unwrap();

        assert_eq!(
            *replies.lock().unwrap(),
            vec![
                fallback::GREETING_REPLY.to_string(),
                fallback::STATUS_REPLY.to_string(),
                fallback::OFFLINE_REPLY.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_or_speaking_is_ignored() {
        let (bus, replies) = recording_bus();
        let brain = BrainModule::new(&bus, None, fast_settings());

        brain.process_command("   ").await.unwrap();
        brain.set_speaking(true);
        brain.process_command("hello").await.unwrap();

        assert!(replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_carries_system_prompt_and_emotion() {
        let (bus, replies) = recording_bus();
        let mut model = MockChatModel::new();
        model
            .expect_send_message()
            .withf(|prompt| {
                prompt.to_string()
                    == "SYSTEM\n\n[User's current emotion: Happy]\nUser says: what time is it"
            })
            .times(1)
            .returning(|_| Ok("  It is *noon*, Sir. ".to_string()));

        let brain = BrainModule::new(&bus, Some(Arc::new(model)), fast_settings());
        brain.update_emotion_context("Happy");
        brain.process_command("  what time is it ").await.unwrap();

        assert_eq!(*replies.lock().unwrap(), vec!["It is noon, Sir.".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (bus, replies) = recording_bus();
        let mut model = MockChatModel::new();
        let mut seq = mockall::Sequence::new();
        model
            .expect_send_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("503")));
        model
            .expect_send_message()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("Recovered.".to_string()));

        let brain = BrainModule::new(&bus, Some(Arc::new(model)), fast_settings());
        brain.process_command("hello").await.unwrap();

        assert_eq!(*replies.lock().unwrap(), vec!["Recovered.".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_apologize() {
        let (bus, replies) = recording_bus();
        let mut model = MockChatModel::new();
        model
            .expect_send_message()
            .times(2)
            .returning(|_| Err(anyhow!("quota exceeded")));

        let brain = BrainModule::new(&bus, Some(Arc::new(model)), fast_settings());
        brain.process_command("hello").await.unwrap();

        assert_eq!(*replies.lock().unwrap(), vec![fallback::APOLOGY_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn test_query_llm_reraises_final_error() {
        let (bus, _) = recording_bus();
        let mut model = MockChatModel::new();
        model
            .expect_send_message()
            .times(2)
            .returning(|_| Err(anyhow!("boom")));

        let brain = BrainModule::new(&bus, Some(Arc::new(model)), fast_settings());
        let err = brain.query_llm("anything").await.unwrap_err();
        assert!(format!("{:#}", err).contains("boom"));
    }

    #[tokio::test]
    async fn test_anonymous_identification_uses_configured_title() {
        let (bus, replies) = recording_bus();
        let settings = BrainSettings {
            user_title: "Boss".to_string(),
            ..fast_settings()
        };
        let brain = BrainModule::new(&bus, None, settings);
        brain.register(&bus);

        bus.publish(Event::new(EventKind::UserIdentified)).await;
        bus.publish(Event::user_identified("Rhodey")).await;

        assert_eq!(
            *replies.lock().unwrap(),
            vec![
                fallback::offline_greeting("Boss"),
                fallback::offline_greeting("Rhodey"),
            ]
        );
    }

    #[tokio::test]
    async fn test_greetings() {
        let (bus, replies) = recording_bus();
        let offline = BrainModule::new(&bus, None, fast_settings());
        offline.greet_user("Tony").await.unwrap();

        let mut model = MockChatModel::new();
        model
            .expect_send_message()
            .returning(|_| Err(anyhow!("offline")));
        let online = BrainModule::new(&bus, Some(Arc::new(model)), fast_settings());
        online.greet_user("Pepper").await.unwrap();

        assert_eq!(
            *replies.lock().unwrap(),
            vec![
                "Identity confirmed. Welcome back, Tony.".to_string(),
                "Welcome back, Pepper.".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_registered_handlers_track_state() {
        let (bus, _) = recording_bus();
        let brain = BrainModule::new(&bus, None, fast_settings());
        brain.register(&bus);

        assert_eq!(brain.emotion_context(), "Neutral");
        bus.publish(Event::user_emotion("Angry")).await;
        assert_eq!(brain.emotion_context(), "Angry");

        bus.publish(Event::new(EventKind::UserEmotionDetected)).await;
        assert_eq!(brain.emotion_context(), "Neutral");

        bus.publish(Event::speaking_start("hi")).await;
        assert!(brain.is_speaking());
        bus.publish(Event::speaking_end()).await;
        assert!(!brain.is_speaking());
    }
}
