//! Offline replies
//!
//! Fixed strings and keyword rules used when no remote model is configured
//! or when the remote model fails.

/// Reply when the remote model failed on every attempt
pub const APOLOGY_REPLY: &str = "I'm experiencing some processing difficulties, Sir. Please try again.";

/// Reply to a greeting when offline
pub const GREETING_REPLY: &str = "Greetings, Sir.";

/// Reply to a status request when offline
pub const STATUS_REPLY: &str = "All systems operational. However, my AI core is offline.";

/// Reply to anything else when offline
pub const OFFLINE_REPLY: &str = "I heard you, but my higher brain functions are currently offline.";

/// Default emotion context before any detection arrives
pub const NEUTRAL_EMOTION: &str = "Neutral";

/// Default way of addressing an unidentified user
pub const DEFAULT_USER: &str = "Sir";

/// Keyword rules, checked in order against the lowercased command
const RULES: &[(&str, &str)] = &[("hello", GREETING_REPLY), ("status", STATUS_REPLY)];

/// Pick an offline reply for a command
pub fn offline_reply(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    RULES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, reply)| *reply)
        .unwrap_or(OFFLINE_REPLY)
}

/// Greeting used when no remote model is configured
pub fn offline_greeting(user: &str) -> String {
    format!("Identity confirmed. Welcome back, {}.", user)
}

/// Greeting used when the remote model failed
pub fn failed_greeting(user: &str) -> String {
    format!("Welcome back, {}.", user)
}

/// Prompt asking the remote model for a greeting
pub fn greeting_prompt(user: &str) -> String {
    format!("The user {} just appeared. Give a brief, warm greeting.", user)
}

/// Prompt embedding the emotion context and the user's words
pub fn command_prompt(emotion: &str, text: &str) -> String {
    format!("[User's current emotion: {}]\nUser says: {}", emotion, text)
}

/// Remove markdown emphasis so the text reads cleanly when spoken
pub fn strip_markdown(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '*' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_reply_rules() {
        assert_eq!(offline_reply("Hello there"), GREETING_REPLY);
        assert_eq!(offline_reply("SYSTEM STATUS please"), STATUS_REPLY);
        assert_eq!(offline_reply("open the pod bay doors"), OFFLINE_REPLY);
    }

    #[test]
    fn test_first_rule_wins() {
        assert_eq!(offline_reply("hello, what's the status?"), GREETING_REPLY);
    }

    #[test]
    fn test_strip_markdown() {
        assert_eq!(strip_markdown("  **Good** _evening_, Sir. "), "Good evening, Sir.");
        assert_eq!(strip_markdown("snake_case"), "snakecase");
        assert_eq!(strip_markdown(""), "");
    }

    #[test]
    fn test_prompts() {
        assert_eq!(
            command_prompt("Happy", "play music"),
            "[User's current emotion: Happy]\nUser says: play music"
        );
        assert!(greeting_prompt("Tony").contains("Tony"));
        assert_eq!(offline_greeting("Tony"), "Identity confirmed. Welcome back, Tony.");
        assert_eq!(failed_greeting("Tony"), "Welcome back, Tony.");
    }
}
