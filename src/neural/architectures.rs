//! The four model topologies
//!
//! Each architecture is built into a [`Network`] from a [`ModelConfig`] and
//! a `VarBuilder`. While building, every layer is recorded with its output
//! shape and parameter count for the model summary.

use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{batch_norm, BatchNorm, VarBuilder, VarMap};
use std::fmt;
use std::str::FromStr;

use super::config::ModelConfig;
use super::layers::{
    positional_encoding, sequence_batch_norm, BiLstm, Classifier, ConvBlock, DenseBn,
    TransformerBlock, BN_EPS,
};
use super::ModelError;

const ATTENTION_HEADS: usize = 8;
const FEED_FORWARD_DIM: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Cnn,
    Rnn,
    Transformer,
    CnnRnnHybrid,
}

/// Tag table used for parsing and display
const ARCHITECTURES: [(&str, Architecture); 4] = [
    ("cnn", Architecture::Cnn),
    ("rnn", Architecture::Rnn),
    ("transformer", Architecture::Transformer),
    ("cnn_rnn_hybrid", Architecture::CnnRnnHybrid),
];

impl Architecture {
    pub fn all() -> impl Iterator<Item = Architecture> {
        ARCHITECTURES.iter().map(|(_, arch)| *arch)
    }

    pub fn tag(self) -> &'static str {
        ARCHITECTURES
            .iter()
            .find(|(_, arch)| *arch == self)
            .map(|(tag, _)| *tag)
            .unwrap_or("unknown")
    }

    /// Rank of the batched input: NHWC images or `(batch, time, features)`
    pub fn input_rank(self) -> usize {
        match self {
            Architecture::Cnn | Architecture::CnnRnnHybrid => 4,
            Architecture::Rnn | Architecture::Transformer => 3,
        }
    }

    /// Check the configuration can produce this topology
    pub fn validate(self, config: &ModelConfig) -> std::result::Result<(), ModelError> {
        let [height, width, channels] = config.input_shape;
        if config.num_classes == 0 {
            return Err(ModelError::InvalidArgument("num_classes must be at least 1".to_string()));
        }
        match self {
            Architecture::Cnn if height < 8 || width < 8 || channels == 0 => Err(ModelError::InvalidArgument(
                format!("cnn needs an input of at least 8x8x1, got {:?}", config.input_shape),
            )),
            Architecture::CnnRnnHybrid if height < 4 || width < 4 || channels == 0 => {
                Err(ModelError::InvalidArgument(format!(
                    "cnn_rnn_hybrid needs an input of at least 4x4x1, got {:?}",
                    config.input_shape
                )))
            }
            Architecture::Rnn if height == 0 => Err(ModelError::InvalidArgument(
                "rnn needs input_shape[0] features per step".to_string(),
            )),
            Architecture::Transformer if height < ATTENTION_HEADS || height % ATTENTION_HEADS != 0 => {
                Err(ModelError::InvalidArgument(format!(
                    "transformer needs input_shape[0] divisible by {} heads, got {}",
                    ATTENTION_HEADS, height
                )))
            }
            _ => Ok(()),
        }
    }

    /// Build the topology into `vb`, recording layers into `recorder`
    pub fn build(self, config: &ModelConfig, vb: VarBuilder, recorder: &mut LayerRecorder) -> Result<Network> {
        match self {
            Architecture::Cnn => CnnNet::build(config, vb, recorder).map(Network::Cnn),
            Architecture::Rnn => RnnNet::build(config, vb, recorder).map(Network::Rnn),
            Architecture::Transformer => TransformerNet::build(config, vb, recorder).map(Network::Transformer),
            Architecture::CnnRnnHybrid => HybridNet::build(config, vb, recorder).map(Network::Hybrid),
        }
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ARCHITECTURES
            .iter()
            .find(|(tag, _)| *tag == s)
            .map(|(_, arch)| *arch)
            .ok_or_else(|| ModelError::InvalidArgument(format!("Unknown architecture: {}", s)))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// One line of the model summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: &'static str,
    pub output_shape: String,
    pub params: usize,
}

/// Records layers as they are built. Parameter counts are the growth of
/// the variable map since the previous record.
pub struct LayerRecorder {
    varmap: VarMap,
    seen: usize,
    layers: Vec<LayerSummary>,
}

impl LayerRecorder {
    pub fn new(varmap: &VarMap) -> Self {
        Self {
            varmap: varmap.clone(),
            seen: count_params(varmap),
            layers: Vec::new(),
        }
    }

    pub fn record(&mut self, name: &str, kind: &'static str, output_shape: &[Option<usize>]) {
        let total = count_params(&self.varmap);
        self.layers.push(LayerSummary {
            name: name.to_string(),
            kind,
            output_shape: format_shape(output_shape),
            params: total - self.seen,
        });
        self.seen = total;
    }

    pub fn into_layers(self) -> Vec<LayerSummary> {
        self.layers
    }
}

pub fn count_params(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|var| var.elem_count()).sum()
}

/// Keras-style shape, `None` for the batch and any free dimension
fn format_shape(dims: &[Option<usize>]) -> String {
    let parts: Vec<String> = std::iter::once("None".to_string())
        .chain(dims.iter().map(|d| d.map_or("None".to_string(), |d| d.to_string())))
        .collect();
    format!("({})", parts.join(", "))
}

/// A built topology
pub enum Network {
    Cnn(CnnNet),
    Rnn(RnnNet),
    Transformer(TransformerNet),
    Hybrid(HybridNet),
}

impl Module for Network {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Network::Cnn(net) => net.forward(x),
            Network::Rnn(net) => net.forward(x),
            Network::Transformer(net) => net.forward(x),
            Network::Hybrid(net) => net.forward(x),
        }
    }
}

/// NHWC to NCHW
fn to_channels_first(x: &Tensor) -> Result<Tensor> {
    x.permute((0, 3, 1, 2))?.contiguous()
}

pub struct CnnNet {
    blocks: Vec<ConvBlock>,
    dense1: DenseBn,
    dense2: DenseBn,
    head: Classifier,
}

impl CnnNet {
    fn build(config: &ModelConfig, vb: VarBuilder, rec: &mut LayerRecorder) -> Result<Self> {
        let [mut height, mut width, channels] = config.input_shape;
        let mut blocks = Vec::new();
        let mut in_channels = channels;

        for (i, filters) in [32, 64, 128].into_iter().enumerate() {
            blocks.push(ConvBlock::new(in_channels, filters, vb.pp(format!("conv_block_{}", i)))?);
            height /= 2;
            width /= 2;
            rec.record(&format!("conv_block_{}", i), "ConvBlock", &[Some(height), Some(width), Some(filters)]);
            rec.record(&format!("dropout_{}", i), "Dropout", &[Some(height), Some(width), Some(filters)]);
            in_channels = filters;
        }
        rec.record("global_average_pooling", "GlobalAveragePooling2D", &[Some(in_channels)]);

        let dense1 = DenseBn::new(in_channels, 256, vb.pp("dense_0"))?;
        rec.record("dense_0", "Dense+BatchNorm", &[Some(256)]);
        let dense2 = DenseBn::new(256, 128, vb.pp("dense_1"))?;
        rec.record("dense_1", "Dense+BatchNorm", &[Some(128)]);
        let head = Classifier::new(128, config.num_classes, vb.pp("output"))?;
        rec.record("output", "Dense(softmax)", &[Some(config.num_classes)]);

        Ok(Self {
            blocks,
            dense1,
            dense2,
            head,
        })
    }
}

impl Module for CnnNet {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = to_channels_first(x)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = x.mean(D::Minus1)?.mean(D::Minus1)?;
        let x = self.dense1.forward(&x)?;
        let x = self.dense2.forward(&x)?;
        self.head.forward(&x)
    }
}

/// Bidirectional LSTM followed by batch norm over features
struct RecurrentLayer {
    lstm: BiLstm,
    bn: BatchNorm,
    sequences: bool,
}

impl RecurrentLayer {
    fn new(in_dim: usize, hidden: usize, sequences: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lstm: BiLstm::new(in_dim, hidden, sequences, vb.pp("lstm"))?,
            bn: batch_norm(2 * hidden, BN_EPS, vb.pp("bn"))?,
            sequences,
        })
    }
}

impl Module for RecurrentLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.lstm.forward(x)?;
        if self.sequences {
            sequence_batch_norm(&self.bn, &x)
        } else {
            candle_core::ModuleT::forward_t(&self.bn, &x, false)
        }
    }
}

/// Build a stack of bidirectional layers; all but the last return sequences
fn recurrent_stack(
    in_dim: usize,
    hidden_sizes: &[usize],
    vb: VarBuilder,
    rec: &mut LayerRecorder,
) -> Result<Vec<RecurrentLayer>> {
    let mut layers = Vec::with_capacity(hidden_sizes.len());
    let mut in_dim = in_dim;
    for (i, &hidden) in hidden_sizes.iter().enumerate() {
        let sequences = i + 1 < hidden_sizes.len();
        let name = format!("bidirectional_lstm_{}", i);
        layers.push(RecurrentLayer::new(in_dim, hidden, sequences, vb.pp(&name))?);
        let shape = if sequences {
            vec![None, Some(2 * hidden)]
        } else {
            vec![Some(2 * hidden)]
        };
        rec.record(&name, "Bidirectional(LSTM)+BatchNorm", &shape);
        rec.record(&format!("dropout_{}", i), "Dropout", &shape);
        in_dim = 2 * hidden;
    }
    Ok(layers)
}

pub struct RnnNet {
    recurrent: Vec<RecurrentLayer>,
    dense1: DenseBn,
    dense2: DenseBn,
    head: Classifier,
}

impl RnnNet {
    fn build(config: &ModelConfig, vb: VarBuilder, rec: &mut LayerRecorder) -> Result<Self> {
        let recurrent = recurrent_stack(config.sequence_features(), &[128, 64, 32], vb.clone(), rec)?;

        let dense1 = DenseBn::new(64, 128, vb.pp("dense_0"))?;
        rec.record("dense_0", "Dense+BatchNorm", &[Some(128)]);
        let dense2 = DenseBn::new(128, 64, vb.pp("dense_1"))?;
        rec.record("dense_1", "Dense+BatchNorm", &[Some(64)]);
        let head = Classifier::new(64, config.num_classes, vb.pp("output"))?;
        rec.record("output", "Dense(softmax)", &[Some(config.num_classes)]);

        Ok(Self {
            recurrent,
            dense1,
            dense2,
            head,
        })
    }
}

impl Module for RnnNet {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.recurrent {
            x = layer.forward(&x)?;
        }
        let x = self.dense1.forward(&x)?;
        let x = self.dense2.forward(&x)?;
        self.head.forward(&x)
    }
}

pub struct TransformerNet {
    blocks: Vec<TransformerBlock>,
    dense1: DenseBn,
    dense2: DenseBn,
    head: Classifier,
    model_dim: usize,
}

impl TransformerNet {
    fn build(config: &ModelConfig, vb: VarBuilder, rec: &mut LayerRecorder) -> Result<Self> {
        let model_dim = config.sequence_features();
        rec.record("positional_encoding", "PositionalEncoding", &[None, Some(model_dim)]);

        let mut blocks = Vec::with_capacity(2);
        for i in 0..2 {
            let name = format!("transformer_block_{}", i);
            blocks.push(TransformerBlock::new(model_dim, ATTENTION_HEADS, FEED_FORWARD_DIM, vb.pp(&name))?);
            rec.record(&name, "MultiHeadAttention+FeedForward", &[None, Some(model_dim)]);
        }
        rec.record("global_average_pooling", "GlobalAveragePooling1D", &[Some(model_dim)]);

        let dense1 = DenseBn::new(model_dim, 128, vb.pp("dense_0"))?;
        rec.record("dense_0", "Dense+BatchNorm", &[Some(128)]);
        let dense2 = DenseBn::new(128, 64, vb.pp("dense_1"))?;
        rec.record("dense_1", "Dense+BatchNorm", &[Some(64)]);
        let head = Classifier::new(64, config.num_classes, vb.pp("output"))?;
        rec.record("output", "Dense(softmax)", &[Some(config.num_classes)]);

        Ok(Self {
            blocks,
            dense1,
            dense2,
            head,
            model_dim,
        })
    }
}

impl Module for TransformerNet {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let steps = x.dim(1)?;
        let encoding = positional_encoding(steps, self.model_dim, x.device())?;
        let mut x = x.broadcast_add(&encoding)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = x.mean(1)?;
        let x = self.dense1.forward(&x)?;
        let x = self.dense2.forward(&x)?;
        self.head.forward(&x)
    }
}

pub struct HybridNet {
    blocks: Vec<ConvBlock>,
    recurrent: Vec<RecurrentLayer>,
    dense1: DenseBn,
    dense2: DenseBn,
    head: Classifier,
}

impl HybridNet {
    fn build(config: &ModelConfig, vb: VarBuilder, rec: &mut LayerRecorder) -> Result<Self> {
        let [mut height, mut width, channels] = config.input_shape;
        let mut blocks = Vec::new();
        let mut in_channels = channels;

        for (i, filters) in [32, 64].into_iter().enumerate() {
            blocks.push(ConvBlock::new(in_channels, filters, vb.pp(format!("conv_block_{}", i)))?);
            height /= 2;
            width /= 2;
            rec.record(&format!("conv_block_{}", i), "ConvBlock", &[Some(height), Some(width), Some(filters)]);
            in_channels = filters;
        }

        let features = width * in_channels;
        rec.record("reshape", "Reshape", &[Some(height), Some(features)]);

        let recurrent = recurrent_stack(features, &[128, 64], vb.clone(), rec)?;

        let dense1 = DenseBn::new(128, 128, vb.pp("dense_0"))?;
        rec.record("dense_0", "Dense+BatchNorm", &[Some(128)]);
        let dense2 = DenseBn::new(128, 64, vb.pp("dense_1"))?;
        rec.record("dense_1", "Dense+BatchNorm", &[Some(64)]);
        let head = Classifier::new(64, config.num_classes, vb.pp("output"))?;
        rec.record("output", "Dense(softmax)", &[Some(config.num_classes)]);

        Ok(Self {
            blocks,
            recurrent,
            dense1,
            dense2,
            head,
        })
    }
}

impl Module for HybridNet {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = to_channels_first(x)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }

        // (batch, C, H, W) to (batch, H, W * C): rows become time steps
        let (batch, channels, height, width) = x.dims4()?;
        let mut x = x
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .reshape((batch, height, width * channels))?;

        for layer in &self.recurrent {
            x = layer.forward(&x)?;
        }
        let x = self.dense1.forward(&x)?;
        let x = self.dense2.forward(&x)?;
        self.head.forward(&x)
    }
}

/// Build an architecture on a fresh CPU variable map (used by tests and
/// the builder)
pub fn build_network(
    arch: Architecture,
    config: &ModelConfig,
    varmap: &VarMap,
    device: &Device,
) -> std::result::Result<(Network, Vec<LayerSummary>), ModelError> {
    arch.validate(config)?;
    let vb = VarBuilder::from_varmap(varmap, candle_core::DType::F32, device);
    let mut recorder = LayerRecorder::new(varmap);
    let network = arch.build(config, vb, &mut recorder)?;
    Ok((network, recorder.into_layers()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(arch: Architecture) -> ModelConfig {
        ModelConfig {
            input_shape: [16, 16, 1],
            num_classes: 4,
            architecture: arch.tag().to_string(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_parse_tags() {
        for arch in Architecture::all() {
            assert_eq!(arch.tag().parse::<Architecture>().unwrap(), arch);
        }
        assert!(matches!(
            "lstm".parse::<Architecture>(),
            Err(ModelError::InvalidArgument(msg)) if msg.contains("lstm")
        ));
    }

    #[test]
    fn test_every_architecture_outputs_class_probabilities() {
        let device = Device::Cpu;
        for arch in Architecture::all() {
            let config = small_config(arch);
            let varmap = VarMap::new();
            let (network, layers) = build_network(arch, &config, &varmap, &device).unwrap();

            let input = if arch.input_rank() == 4 {
                Tensor::randn(0f32, 1., (2, 16, 16, 1), &device).unwrap()
            } else {
                Tensor::randn(0f32, 1., (2, 5, 16), &device).unwrap()
            };
            let output = network.forward(&input).unwrap();
            assert_eq!(output.dims(), &[2, 4], "{}", arch);

            let total: usize = layers.iter().map(|l| l.params).sum();
            assert_eq!(total, count_params(&varmap), "{}", arch);
            assert_eq!(layers.last().unwrap().output_shape, "(None, 4)");
        }
    }

    #[test]
    fn test_validate_rejects_impossible_shapes() {
        let mut config = small_config(Architecture::Transformer);
        config.input_shape = [12, 1, 1];
        assert!(Architecture::Transformer.validate(&config).is_err());

        config.input_shape = [4, 4, 1];
        assert!(Architecture::Cnn.validate(&config).is_err());
        assert!(Architecture::CnnRnnHybrid.validate(&config).is_ok());

        config.num_classes = 0;
        assert!(Architecture::Rnn.validate(&config).is_err());
    }

    #[test]
    fn test_cnn_summary_shapes() {
        let config = small_config(Architecture::Cnn);
        let varmap = VarMap::new();
        let (_, layers) = build_network(Architecture::Cnn, &config, &varmap, &Device::Cpu).unwrap();
        assert_eq!(layers[0].name, "conv_block_0");
        assert_eq!(layers[0].output_shape, "(None, 8, 8, 32)");
        // conv 3x3x1x32 + 32, bn 4x32, conv 3x3x32x32 + 32, bn 4x32
        assert_eq!(layers[0].params, (9 * 32 + 32) + 128 + (9 * 32 * 32 + 32) + 128);
        assert_eq!(layers[1].params, 0);
    }
}
