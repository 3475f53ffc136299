//! Configuration management
//!
//! Loads `config.toml` from the platform config directory (written with
//! defaults on first run), then applies environment overrides. `.env` is
//! loaded by `main` before any of this runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::neural::ModelConfig;

/// Remote model keys shorter than this are treated as missing
pub const MIN_API_KEY_LEN: usize = 10;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Persona settings
    #[serde(default)]
    pub assistant: AssistantConfig,
    /// Remote conversational model
    #[serde(default)]
    pub llm: LlmConfig,
    /// Capture, recognition and synthesis
    #[serde(default)]
    pub voice: VoiceConfig,
    /// Model builder defaults
    #[serde(default)]
    pub model: ModelSection,
    /// Default tracing filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_assistant_name")]
    pub name: String,
    /// How the user is addressed when nobody has been identified
    #[serde(default = "default_user_title")]
    pub user_title: String,
    /// Prepended to every remote prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_assistant_name() -> String {
    "FRIDAY".to_string()
}

fn default_user_title() -> String {
    crate::brain::fallback::DEFAULT_USER.to_string()
}

fn default_system_prompt() -> String {
    "You are FRIDAY, an advanced AI assistant similar to J.A.R.V.I.S. \
     You are efficient, intelligent, and speak naturally. \
     IMPORTANT: Keep ALL responses SHORT and CONVERSATIONAL - \
     suitable for spoken voice output. Maximum 2-3 sentences. \
     Address the user as 'Sir'. Be helpful but concise."
        .to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
            user_title: default_user_title(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Exchanges kept in the chat session; older ones are forgotten
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// Resolved from `api_key_env`, never written to disk
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_llm_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_key_env() -> String {
    "GOOGLE_API_KEY".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_history_turns() -> usize {
    20
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            max_history_turns: default_max_history_turns(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    /// The API key, if one long enough to be real is configured
    pub fn usable_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| key.len() > MIN_API_KEY_LEN)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Voice used for every spoken reply
    #[serde(default = "default_narrator_voice")]
    pub narrator_voice: String,
    /// OpenAI-compatible base URL serving `/audio/speech`
    #[serde(default = "default_speech_url")]
    pub tts_url: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    /// OpenAI-compatible base URL serving `/audio/transcriptions`
    #[serde(default = "default_speech_url")]
    pub stt_url: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// Environment variable holding the speech services key
    #[serde(default = "default_voice_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_phrase_limit")]
    pub phrase_limit_secs: u64,
    #[serde(default = "default_calibration")]
    pub calibration_secs: u64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Resolved from `api_key_env`, never written to disk
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_narrator_voice() -> String {
    "en-US-ChristopherNeural".to_string()
}

fn default_speech_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_voice_api_key_env() -> String {
    "VOICE_API_KEY".to_string()
}

fn default_wait_timeout() -> u64 {
    5
}

fn default_phrase_limit() -> u64 {
    10
}

fn default_calibration() -> u64 {
    1
}

fn default_sample_rate() -> u32 {
    16000
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            narrator_voice: default_narrator_voice(),
            tts_url: default_speech_url(),
            tts_model: default_tts_model(),
            stt_url: default_speech_url(),
            stt_model: default_stt_model(),
            api_key_env: default_voice_api_key_env(),
            wait_timeout_secs: default_wait_timeout(),
            phrase_limit_secs: default_phrase_limit(),
            calibration_secs: default_calibration(),
            sample_rate: default_sample_rate(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Weights file used by `model predict` and `model build --save`
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Configuration used when building a fresh model
    #[serde(default)]
    pub defaults: ModelConfig,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/neural_model.safetensors")
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            defaults: ModelConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assistant: AssistantConfig::default(),
            llm: LlmConfig::default(),
            voice: VoiceConfig::default(),
            model: ModelSection::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            config.save()?;
            config
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production). Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(&self.llm.api_key_env) {
            self.llm.api_key = Some(key);
        }
        if let Some(key) = get(&self.voice.api_key_env) {
            self.voice.api_key = Some(key);
        }
        if let Some(url) = get("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = get("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = get("TTS_URL") {
            self.voice.tts_url = url;
        }
        if let Some(voice) = get("TTS_VOICE") {
            self.voice.narrator_voice = voice;
        }
        if let Some(url) = get("STT_URL") {
            self.voice.stt_url = url;
        }
        if let Some(path) = get("MODEL_PATH") {
            self.model.model_path = PathBuf::from(path);
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = level;
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "master-system", "master-system")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Show current configuration
pub fn show_config() -> Result<()> {
    let config = Config::load()?;

    println!("Configuration ({})", config_path()?.display());
    println!();
    println!("Assistant:");
    println!("  name:            {}", config.assistant.name);
    println!("  user title:      {}", config.assistant.user_title);
    println!();
    println!("Remote model:");
    println!("  base url:        {}", config.llm.base_url);
    println!("  model:           {}", config.llm.model);
    println!(
        "  api key ({}):  {}",
        config.llm.api_key_env,
        if config.llm.usable_api_key().is_some() { "configured" } else { "missing (offline replies)" }
    );
    println!("  retries:         {} x {}ms", config.llm.max_retries, config.llm.retry_delay_ms);
    println!();
    println!("Voice:");
    println!("  narrator voice:  {}", config.voice.narrator_voice);
    println!("  synthesis:       {} ({})", config.voice.tts_url, config.voice.tts_model);
    println!("  recognition:     {} ({})", config.voice.stt_url, config.voice.stt_model);
    println!(
        "  capture:         wait {}s, phrase {}s, calibrate {}s @ {} Hz",
        config.voice.wait_timeout_secs,
        config.voice.phrase_limit_secs,
        config.voice.calibration_secs,
        config.voice.sample_rate
    );
    println!();
    println!("Model builder:");
    println!("  model path:      {}", config.model.model_path.display());
    println!("  architecture:    {}", config.model.defaults.architecture);
    println!("  input shape:     {:?}", config.model.defaults.input_shape);
    println!("  classes:         {}", config.model.defaults.num_classes);
    println!();
    println!("Log level:         {}", config.log_level);

    Ok(())
}

/// Write a fresh default configuration
pub fn reset_config() -> Result<()> {
    let config = Config::default();
    config.save()?;
    println!("Configuration written to {}", config_path()?.display());
    Ok(())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
