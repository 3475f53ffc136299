//! CLI interface for master-system

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::neural::{metrics, tensor_from_json, NeuralNetworkModel};

#[derive(Parser)]
#[command(name = "master-system")]
#[command(about = "Voice assistant with an event-driven brain and a neural model builder", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice assistant (default when no command given)
    Run,
    /// Talk to the assistant by typing instead of speaking
    Chat,
    /// Build, inspect and run neural models
    Model {
        #[command(subcommand)]
        command: ModelCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// Build a model and print its summary
    Build {
        /// cnn, rnn, transformer or cnn_rnn_hybrid (default: configured)
        #[arg(short, long)]
        architecture: Option<String>,
        /// Save the freshly initialized weights
        #[arg(short, long)]
        save: bool,
        /// Weights file (default: configured model path)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Load a saved model and print its summary
    Summary {
        /// Weights file (default: configured model path)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Classify inputs read from a JSON file of nested number arrays
    Predict {
        /// JSON file holding one sample or a batch
        input: PathBuf,
        /// Weights file (default: configured model path)
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Inference batch size (default: configured)
        #[arg(short, long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Print the defaults instead of writing them
        #[arg(long)]
        print: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let config = Config::load()?;
            crate::app::run_voice(&config).await?;
        }
        Some(Commands::Chat) => {
            let config = Config::load()?;
            crate::app::run_chat(&config).await?;
        }
        Some(Commands::Model { command }) => {
            let config = Config::load()?;
            run_model_command(&config, command)?;
        }
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Show => config::show_config()?,
            ConfigCommands::Path => println!("{}", config::config_path()?.display()),
            ConfigCommands::Init { print } => {
                if print {
                    println!("{}", config::default_config_toml());
                } else {
                    config::reset_config()?;
                }
            }
        },
    }

    Ok(())
}

fn run_model_command(config: &Config, command: ModelCommands) -> Result<()> {
    match command {
        ModelCommands::Build {
            architecture,
            save,
            path,
        } => {
            let mut model = NeuralNetworkModel::new(config.model.defaults.clone());
            model.build_model(architecture.as_deref())?;
            model.compile()?;
            println!("{}", model.summary());

            if save {
                let path = path.unwrap_or_else(|| config.model.model_path.clone());
                model.save(&path)?;
                println!("Saved untrained weights to {}", path.display());
            }
        }
        ModelCommands::Summary { path } => {
            let model = load_model(config, path)?;
            println!("{}", model.summary());
        }
        ModelCommands::Predict {
            input,
            path,
            batch_size,
        } => {
            let model = load_model(config, path)?;
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", input.display()))?;
            let tensor = tensor_from_json(&value, model.device())?;

            let expected_rank = model
                .architecture()
                .map(|arch| arch.input_rank())
                .unwrap_or_default();
            if tensor.rank() + 1 == expected_rank {
                let (class, confidence) = model.predict_single(&tensor)?;
                println!("class {} (confidence {:.4})", class, confidence);
            } else {
                let predictions = model.predict(&tensor, batch_size)?;
                for (i, (class, confidence)) in metrics::argmax_rows(&predictions)?.into_iter().enumerate() {
                    println!("[{}] class {} (confidence {:.4})", i, class, confidence);
                }
            }
        }
    }
    Ok(())
}

fn load_model(config: &Config, path: Option<PathBuf>) -> Result<NeuralNetworkModel> {
    let path = path.unwrap_or_else(|| config.model.model_path.clone());
    let mut model = NeuralNetworkModel::new(config.model.defaults.clone());
    model
        .load(&path)
        .with_context(|| format!("Failed to load model from {}", path.display()))?;
    Ok(model)
}
