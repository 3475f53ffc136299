//! Remote conversational model
//!
//! [`ChatModel`] is the seam the brain talks to. [`ChatClient`] implements it
//! against any OpenAI-compatible `/chat/completions` endpoint (Gemini's
//! compatibility layer by default) and keeps the running conversation so
//! every call continues the same chat session.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::LlmConfig;

/// A conversational model that answers one message at a time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send a message within the ongoing conversation and return the reply
    async fn send_message(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

/// OpenAI-compatible chat client with session history
pub struct ChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_history_turns: usize,
    history: Mutex<Vec<ChatMessage>>,
}

impl ChatClient {
    pub fn new(config: &LlmConfig, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            max_history_turns: config.max_history_turns.max(1),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Build a client when a usable key is configured
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        match config.usable_api_key() {
            Some(key) => Ok(Some(Self::new(config, key)?)),
            None => Ok(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Number of messages in the session so far
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to chat model")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Chat model API error ({}): {}", status, body);
        }

        let body: Value = response
            .json()
            .await
            .context("Failed to parse chat model response")?;

        extract_content(&body).context("Chat model response had no message content")
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn send_message(&self, prompt: &str) -> Result<String> {
        // Held across the request so concurrent calls cannot interleave turns
        let mut history = self.history.lock().await;
        history.push(ChatMessage::user(prompt));

        match self.complete(&history).await {
            Ok(reply) => {
                debug!(model = %self.model, turns = history.len(), "Chat model replied");
                history.push(ChatMessage::assistant(reply.clone()));
                trim_history(&mut history, self.max_history_turns);
                Ok(reply)
            }
            Err(e) => {
                // A failed turn is not part of the session
                history.pop();
                Err(e)
            }
        }
    }
}

/// Keep only the latest `max_turns` user/assistant exchanges
fn trim_history(history: &mut Vec<ChatMessage>, max_turns: usize) {
    let excess = history.len().saturating_sub(max_turns * 2);
    if excess > 0 {
        history.drain(..excess);
    }
}

/// Pull the first choice's text out of a chat completion body.
/// Content may be a plain string or an array of `{type: "text"}` parts.
fn extract_content(body: &Value) -> Option<String> {
    let content = body
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?;

    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join(""))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_string_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "Good evening, Sir."}}]});
        assert_eq!(extract_content(&body), Some("Good evening, Sir.".to_string()));
    }

    #[test]
    fn test_extract_parts_content() {
        let body = json!({"choices": [{"message": {"content": [
            {"type": "text", "text": "Good "},
            {"type": "image_url", "image_url": {"url": "x"}},
            {"type": "text", "text": "evening"}
        ]}}]});
        assert_eq!(extract_content(&body), Some("Good evening".to_string()));
    }

    #[test]
    fn test_extract_missing_content() {
        assert_eq!(extract_content(&json!({"choices": []})), None);
        assert_eq!(extract_content(&json!({"error": "quota"})), None);
        assert_eq!(extract_content(&json!({"choices": [{"message": {"content": null}}]})), None);
    }

    #[test]
    fn test_from_config_requires_usable_key() {
        let mut config = LlmConfig::default();
        assert!(ChatClient::from_config(&config).unwrap().is_none());

        config.api_key = Some("tiny".to_string());
        assert!(ChatClient::from_config(&config).unwrap().is_none());

        config.api_key = Some("a-long-enough-api-key".to_string());
        let client = ChatClient::from_config(&config).unwrap().unwrap();
        assert_eq!(client.model(), "gemini-2.0-flash");
    }

    #[test]
    fn test_history_keeps_latest_turns() {
        let mut history = Vec::new();
        for turn in 0..5 {
            history.push(ChatMessage::user(format!("question {}", turn)));
            history.push(ChatMessage::assistant(format!("answer {}", turn)));
            trim_history(&mut history, 3);
        }

        assert_eq!(history.len(), 6);
        assert_eq!(history[0], ChatMessage::user("question 2"));
        assert_eq!(history[5], ChatMessage::assistant("answer 4"));
    }

    #[test]
    fn test_short_history_is_untouched() {
        let mut history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        trim_history(&mut history, 20);
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_turn_is_dropped_from_history() {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        let client = ChatClient::new(&config, "a-long-enough-api-key").unwrap();
        assert!(client.send_message("hello").await.is_err());
        assert_eq!(client.history_len().await, 0);
    }
}
