//! Master System - event-driven voice assistant
//!
//! - events: bus and cross-thread queue connecting the modules
//! - voice: microphone capture, speech recognition, synthesis and playback
//! - brain: remote conversational model with offline fallback rules
//! - neural: candle model builder (cnn, rnn, transformer, cnn_rnn_hybrid)
//!
//! # Example
//!
//! ```ignore
//! use master_system::app::{Assistant, InputMode};
//! use master_system::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let assistant = Assistant::new(&config, InputMode::Voice)?;
//!     assistant.run(std::future::pending()).await?;
//!     Ok(())
//! }
//! ```

pub mod events; // Must come before brain and voice, which subscribe to it
pub mod brain;
pub mod voice;
pub mod neural;
pub mod config;
pub mod app;
pub mod cli;

pub use app::{Assistant, InputMode};
pub use brain::BrainModule;
pub use config::Config;
pub use events::{Event, EventBus, EventKind};
pub use neural::{Architecture, ModelConfig, ModelError, NeuralNetworkModel};
pub use voice::VoiceModule;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
