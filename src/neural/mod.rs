//! Neural model builder
//!
//! Builds one of four classifier topologies on candle, attaches compile
//! settings, persists weights as safetensors with a JSON side config, and
//! runs batched inference.

pub mod architectures;
pub mod config;
pub mod layers;
pub mod metrics;

pub use architectures::{Architecture, LayerSummary};
pub use config::{CompileSettings, LossFunction, Metric, ModelConfig, Optimizer};
pub use metrics::Evaluation;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use architectures::{build_network, count_params, Network};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Path of the JSON side config that accompanies a weights file
pub fn config_path_for(weights: &Path) -> PathBuf {
    let stem = weights
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    weights.with_file_name(format!("{}_config.json", stem))
}

/// Model builder and inference wrapper
pub struct NeuralNetworkModel {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    network: Option<Network>,
    architecture: Option<Architecture>,
    layers: Vec<LayerSummary>,
    compiled: Option<CompileSettings>,
    is_trained: bool,
}

impl Default for NeuralNetworkModel {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl NeuralNetworkModel {
    pub fn new(config: ModelConfig) -> Self {
        info!(
            architecture = %config.architecture,
            input_shape = ?config.input_shape,
            num_classes = config.num_classes,
            "Neural network model initialized"
        );
        Self {
            config,
            device: Device::Cpu,
            varmap: VarMap::new(),
            network: None,
            architecture: None,
            layers: Vec::new(),
            compiled: None,
            is_trained: false,
        }
    }

    /// Construct, build and compile in one step
    pub fn build(architecture: &str, config: ModelConfig) -> ModelResult<Self> {
        let mut model = Self::new(config);
        model.build_model(Some(architecture))?;
        model.compile()?;
        Ok(model)
    }

    /// Build the topology named by `architecture`, or by the configured
    /// architecture when `None`. Replaces any existing model.
    pub fn build_model(&mut self, architecture: Option<&str>) -> ModelResult<()> {
        let tag = architecture.unwrap_or(&self.config.architecture).to_string();
        info!("Building model with architecture: {}", tag);
        let arch: Architecture = tag.parse()?;

        let varmap = VarMap::new();
        let (network, layers) = build_network(arch, &self.config, &varmap, &self.device)?;

        self.config.architecture = tag;
        self.varmap = varmap;
        self.network = Some(network);
        self.architecture = Some(arch);
        self.layers = layers;
        self.compiled = None;
        self.is_trained = false;
        info!(params = self.parameter_count(), "Model built");
        Ok(())
    }

    /// Attach optimizer, loss and metrics from the current configuration
    pub fn compile(&mut self) -> ModelResult<&CompileSettings> {
        if self.network.is_none() {
            return Err(ModelError::InvalidState(
                "No model to compile. Build or load a model first.".to_string(),
            ));
        }
        let settings = CompileSettings::from_config(&self.config);
        info!("Model compiled with {}", settings);
        Ok(self.compiled.insert(settings))
    }

    pub fn summary(&self) -> String {
        let Some(arch) = self.architecture else {
            return "No model available".to_string();
        };

        let mut out = format!("Model: \"{}\"\n", arch);
        out.push_str(&format!("{:<32}{:<26}{:>10}\n", "Layer (type)", "Output Shape", "Param #"));
        out.push_str(&"=".repeat(68));
        out.push('\n');
        for layer in &self.layers {
            let name = format!("{} ({})", layer.name, layer.kind);
            out.push_str(&format!("{:<32}{:<26}{:>10}\n", name, layer.output_shape, layer.params));
        }
        out.push_str(&"=".repeat(68));
        out.push('\n');
        out.push_str(&format!("Total params: {}\n", self.parameter_count()));
        if let Some(settings) = &self.compiled {
            out.push_str(&format!("Compiled: {}\n", settings));
        }
        out
    }

    pub fn parameter_count(&self) -> usize {
        count_params(&self.varmap)
    }

    /// Write weights to `path` and the configuration beside it
    pub fn save(&self, path: impl AsRef<Path>) -> ModelResult<()> {
        let path = path.as_ref();
        if self.network.is_none() {
            return Err(ModelError::InvalidState(
                "No model to save. Train or load a model first.".to_string(),
            ));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        self.varmap.save(path)?;
        let config_path = config_path_for(path);
        std::fs::write(&config_path, serde_json::to_string_pretty(&self.config)?)?;

        info!("Model saved to {}", path.display());
        Ok(())
    }

    /// Load weights from `path`, taking the side config into account when
    /// present. The loaded model counts as trained.
    pub fn load(&mut self, path: impl AsRef<Path>) -> ModelResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::NotFound(path.to_path_buf()));
        }

        let config_path = config_path_for(path);
        if config_path.exists() {
            let saved: Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
            self.config = self.config.merged_with(&saved)?;
            debug!("Loaded model config from {}", config_path.display());
        }

        self.build_model(None)?;
        self.varmap.load(path)?;
        // Batch norm copies its running statistics when built
        self.rebuild_network()?;
        self.compile()?;
        self.is_trained = true;

        info!("Model loaded from {}", path.display());
        Ok(())
    }

    fn rebuild_network(&mut self) -> ModelResult<()> {
        let Some(arch) = self.architecture else {
            return Err(ModelError::InvalidState("No model available".to_string()));
        };
        let (network, _) = build_network(arch, &self.config, &self.varmap, &self.device)?;
        self.network = Some(network);
        Ok(())
    }

    /// Run inference over a batch, returning `(batch, num_classes)`
    /// probabilities. Defaults to the configured batch size.
    pub fn predict(&self, input: &Tensor, batch_size: Option<usize>) -> ModelResult<Tensor> {
        let (Some(network), Some(arch)) = (&self.network, self.architecture) else {
            return Err(ModelError::InvalidState(
                "No model available. Train or load a model first.".to_string(),
            ));
        };
        if !self.is_trained {
            warn!("Model is not trained. Predictions may be unreliable.");
        }

        let input = input.to_dtype(DType::F32)?.to_device(&self.device)?;
        self.check_input(arch, &input)?;

        let total = input.dim(0)?;
        let batch_size = batch_size.unwrap_or(self.config.batch_size).max(1);
        debug!(samples = total, batch_size, "Running prediction");

        let mut outputs = Vec::with_capacity(total.div_ceil(batch_size));
        let mut start = 0;
        while start < total {
            let len = batch_size.min(total - start);
            let chunk = input.narrow(0, start, len)?;
            outputs.push(network.forward(&chunk)?);
            start += len;
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// Classify one sample, adding the batch dimension when it is missing.
    /// Returns the predicted class and its probability.
    pub fn predict_single(&self, sample: &Tensor) -> ModelResult<(usize, f32)> {
        let Some(arch) = self.architecture else {
            return Err(ModelError::InvalidState(
                "No model available. Train or load a model first.".to_string(),
            ));
        };
        let sample = if sample.rank() + 1 == arch.input_rank() {
            sample.unsqueeze(0)?
        } else {
            sample.clone()
        };

        let predictions = self.predict(&sample, None)?;
        metrics::argmax_rows(&predictions)?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidArgument("empty prediction".to_string()))
    }

    /// Score the model on labelled inputs with the compiled loss and metrics
    pub fn evaluate(&self, inputs: &Tensor, labels: &[usize]) -> ModelResult<Evaluation> {
        let Some(settings) = &self.compiled else {
            return Err(ModelError::InvalidState(
                "Model is not compiled. Call compile first.".to_string(),
            ));
        };
        let predictions = self.predict(inputs, None)?;
        metrics::evaluate(&predictions, labels, settings.loss, &settings.metrics)
    }

    fn check_input(&self, arch: Architecture, input: &Tensor) -> ModelResult<()> {
        let dims = input.dims();
        if dims.len() != arch.input_rank() {
            return Err(ModelError::InvalidArgument(format!(
                "{} expects a rank {} input, got shape {:?}",
                arch,
                arch.input_rank(),
                dims
            )));
        }
        if dims[0] == 0 {
            return Err(ModelError::InvalidArgument("cannot predict an empty batch".to_string()));
        }

        let [height, width, channels] = self.config.input_shape;
        let matches = match arch {
            Architecture::Cnn | Architecture::CnnRnnHybrid => dims[1..] == [height, width, channels],
            Architecture::Rnn | Architecture::Transformer => dims[1] > 0 && dims[2] == height,
        };
        if !matches {
            return Err(ModelError::InvalidArgument(format!(
                "input shape {:?} does not match configured input_shape {:?}",
                dims, self.config.input_shape
            )));
        }
        Ok(())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn architecture(&self) -> Option<Architecture> {
        self.architecture
    }

    pub fn layers(&self) -> &[LayerSummary] {
        &self.layers
    }

    pub fn compile_settings(&self) -> Option<&CompileSettings> {
        self.compiled.as_ref()
    }

    pub fn is_built(&self) -> bool {
        self.network.is_some()
    }

    pub fn is_trained(&self) -> bool {
        self.is_trained
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Parse a nested JSON array of numbers into an f32 tensor
pub fn tensor_from_json(value: &Value, device: &Device) -> ModelResult<Tensor> {
    fn walk(value: &Value, depth: usize, shape: &mut Vec<usize>, data: &mut Vec<f32>) -> ModelResult<()> {
        match value {
            Value::Number(n) => {
                if depth != shape.len() && !shape.is_empty() {
                    return Err(ModelError::InvalidArgument("ragged input array".to_string()));
                }
                let n = n
                    .as_f64()
                    .ok_or_else(|| ModelError::InvalidArgument(format!("not a number: {}", n)))?;
                data.push(n as f32);
                Ok(())
            }
            Value::Array(items) => {
                if depth == shape.len() {
                    if !data.is_empty() {
                        return Err(ModelError::InvalidArgument("ragged input array".to_string()));
                    }
                    shape.push(items.len());
                } else if shape.get(depth) != Some(&items.len()) {
                    return Err(ModelError::InvalidArgument("ragged input array".to_string()));
                }
                items.iter().try_for_each(|item| walk(item, depth + 1, shape, data))
            }
            other => Err(ModelError::InvalidArgument(format!("expected a number array, got {}", other))),
        }
    }

    let mut shape = Vec::new();
    let mut data = Vec::new();
    walk(value, 0, &mut shape, &mut data)?;
    if data.is_empty() {
        return Err(ModelError::InvalidArgument("input array is empty".to_string()));
    }
    Ok(Tensor::from_vec(data, shape, device)?)
}
