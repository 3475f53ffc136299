//! Event system
//!
//! Publish/subscribe plumbing shared by the voice and brain modules:
//! - [`Event`] / [`EventKind`]: immutable messages with a JSON payload
//! - [`EventBus`]: ordered, sequential delivery to async subscribers
//! - [`EventSender`] / [`EventQueue`]: cross-thread submission funneled
//!   back into the single coordination task
//!
//! ```text
//! capture thread ──send──→ EventQueue ──drain──→ EventBus::publish ──→ handlers
//!                                                     ↑                    │
//!                                                     └──── publish ───────┘
//! ```

pub mod bus;
pub mod queue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub use bus::{EventBus, EventHandler, HandlerFuture, PublishReport};
pub use queue::{EventQueue, EventSender};

/// Semantic type of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Process is up; the voice module starts listening
    SystemStartup,
    /// Recognized speech, payload `{text}`
    VoiceCommandDetected,
    /// A known user appeared, payload `{user}`
    UserIdentified,
    /// Latest detected emotion, payload `{emotion}`
    UserEmotionDetected,
    /// Playback of a response is about to begin, payload `{text}`
    TtsSpeakingStart,
    /// Playback finished (successfully or not)
    TtsSpeakingEnd,
    /// Final reply text ready to be spoken, payload `{text}`
    ResponseGenerated,
}

impl EventKind {
    /// All kinds, in declaration order
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::SystemStartup,
            EventKind::VoiceCommandDetected,
            EventKind::UserIdentified,
            EventKind::UserEmotionDetected,
            EventKind::TtsSpeakingStart,
            EventKind::TtsSpeakingEnd,
            EventKind::ResponseGenerated,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::SystemStartup => write!(f, "SYSTEM_STARTUP"),
            EventKind::VoiceCommandDetected => write!(f, "VOICE_COMMAND_DETECTED"),
            EventKind::UserIdentified => write!(f, "USER_IDENTIFIED"),
            EventKind::UserEmotionDetected => write!(f, "USER_EMOTION_DETECTED"),
            EventKind::TtsSpeakingStart => write!(f, "TTS_SPEAKING_START"),
            EventKind::TtsSpeakingEnd => write!(f, "TTS_SPEAKING_END"),
            EventKind::ResponseGenerated => write!(f, "RESPONSE_GENERATED"),
        }
    }
}

/// A single message on the bus.
///
/// Events are built with [`Event::new`] / [`Event::with_data`] and become
/// read-only once published: subscribers only ever see an `Arc<Event>`.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    payload: HashMap<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with an empty payload
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a payload entry
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn system_startup() -> Self {
        Self::new(EventKind::SystemStartup)
    }

    pub fn voice_command(text: impl Into<String>) -> Self {
        Self::new(EventKind::VoiceCommandDetected).with_data("text", text.into())
    }

    pub fn user_identified(user: impl Into<String>) -> Self {
        Self::new(EventKind::UserIdentified).with_data("user", user.into())
    }

    pub fn user_emotion(emotion: impl Into<String>) -> Self {
        Self::new(EventKind::UserEmotionDetected).with_data("emotion", emotion.into())
    }

    pub fn speaking_start(text: impl Into<String>) -> Self {
        Self::new(EventKind::TtsSpeakingStart).with_data("text", text.into())
    }

    pub fn speaking_end() -> Self {
        Self::new(EventKind::TtsSpeakingEnd)
    }

    pub fn response_generated(text: impl Into<String>) -> Self {
        Self::new(EventKind::ResponseGenerated).with_data("text", text.into())
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Get a string payload value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Get a string payload value, or `default` when missing or not a string
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_str(key).unwrap_or(default)
    }
}
