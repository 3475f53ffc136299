//! Building blocks shared by the architectures
//!
//! All blocks run in inference mode: batch normalization uses its running
//! statistics and dropout is the identity.

use candle_core::{Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::{
    batch_norm, conv2d, layer_norm, linear, ops, BatchNorm, Conv2d, Conv2dConfig, LayerNorm, Linear,
    VarBuilder,
};

/// Batch-norm epsilon, matching Keras
pub const BN_EPS: f64 = 1e-3;

/// Layer-norm epsilon, matching Keras
const LN_EPS: f64 = 1e-3;

fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, 3, config, vb)
}

/// Two same-padded 3x3 convolutions with ReLU and batch norm, then a 2x2
/// max pool. Input and output are NCHW.
pub struct ConvBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl ConvBlock {
    pub fn new(in_channels: usize, filters: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv3x3(in_channels, filters, vb.pp("conv1"))?,
            bn1: batch_norm(filters, BN_EPS, vb.pp("bn1"))?,
            conv2: conv3x3(filters, filters, vb.pp("conv2"))?,
            bn2: batch_norm(filters, BN_EPS, vb.pp("bn2"))?,
        })
    }
}

impl Module for ConvBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?.relu()?;
        let x = self.bn1.forward_t(&x, false)?;
        let x = self.conv2.forward(&x)?.relu()?;
        let x = self.bn2.forward_t(&x, false)?;
        x.max_pool2d(2)
    }
}

/// Dense layer with ReLU followed by batch norm
pub struct DenseBn {
    dense: Linear,
    bn: BatchNorm,
}

impl DenseBn {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, out_dim, vb.pp("dense"))?,
            bn: batch_norm(out_dim, BN_EPS, vb.pp("bn"))?,
        })
    }
}

impl Module for DenseBn {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.dense.forward(x)?.relu()?;
        self.bn.forward_t(&x, false)
    }
}

/// Softmax classification head
pub struct Classifier {
    dense: Linear,
}

impl Classifier {
    pub fn new(in_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, num_classes, vb.pp("dense"))?,
        })
    }
}

impl Module for Classifier {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        ops::softmax(&self.dense.forward(x)?, D::Minus1)
    }
}

/// Batch norm over the feature axis of a `(batch, time, features)` tensor
pub fn sequence_batch_norm(bn: &BatchNorm, x: &Tensor) -> Result<Tensor> {
    let x = x.transpose(1, 2)?.contiguous()?;
    bn.forward_t(&x, false)?.transpose(1, 2)?.contiguous()
}

/// Reverse the time axis of a `(batch, time, features)` tensor
pub fn reverse_time(x: &Tensor) -> Result<Tensor> {
    let steps = x.dim(1)?;
    let indices: Vec<u32> = (0..steps as u32).rev().collect();
    let indices = Tensor::new(indices.as_slice(), x.device())?;
    x.index_select(&indices, 1)
}

/// Bidirectional LSTM. With `return_sequences` the output is
/// `(batch, time, 2 * hidden)`, otherwise the final states
/// `(batch, 2 * hidden)`.
pub struct BiLstm {
    forward: LSTM,
    backward: LSTM,
    return_sequences: bool,
}

impl BiLstm {
    pub fn new(in_dim: usize, hidden: usize, return_sequences: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            forward: lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("forward"))?,
            backward: lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("backward"))?,
            return_sequences,
        })
    }

    fn last_hidden(states: &[LSTMState]) -> Result<Tensor> {
        states
            .last()
            .map(|state| state.h().clone())
            .ok_or_else(|| candle_core::Error::Msg("LSTM input has no time steps".to_string()))
    }
}

impl Module for BiLstm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.contiguous()?;
        let forward_states = self.forward.seq(&x)?;
        let backward_states = self.backward.seq(&reverse_time(&x)?)?;

        if self.return_sequences {
            let forward = self.forward.states_to_tensor(&forward_states)?;
            let backward = reverse_time(&self.backward.states_to_tensor(&backward_states)?)?;
            Tensor::cat(&[&forward, &backward], 2)
        } else {
            let forward = Self::last_hidden(&forward_states)?;
            let backward = Self::last_hidden(&backward_states)?;
            Tensor::cat(&[&forward, &backward], 1)
        }
    }
}

/// Multi-head self-attention with `heads * key_dim` projections
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    heads: usize,
    key_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(model_dim: usize, heads: usize, key_dim: usize, vb: VarBuilder) -> Result<Self> {
        let inner = heads * key_dim;
        Ok(Self {
            query: linear(model_dim, inner, vb.pp("query"))?,
            key: linear(model_dim, inner, vb.pp("key"))?,
            value: linear(model_dim, inner, vb.pp("value"))?,
            output: linear(inner, model_dim, vb.pp("output"))?,
            heads,
            key_dim,
        })
    }

    /// `(batch, time, heads * key_dim)` to `(batch, heads, time, key_dim)`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, time, _) = x.dims3()?;
        x.reshape((batch, time, self.heads, self.key_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, time, _) = x.dims3()?;
        let q = self.split_heads(&self.query.forward(x)?)?;
        let k = self.split_heads(&self.key.forward(x)?)?;
        let v = self.split_heads(&self.value.forward(x)?)?;

        let scale = 1.0 / (self.key_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let weights = ops::softmax(&scores, D::Minus1)?;

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, time, self.heads * self.key_dim))?;
        self.output.forward(&context)
    }
}

/// Attention and feed-forward sublayers, each with a residual connection
/// and layer norm
pub struct TransformerBlock {
    attention: MultiHeadAttention,
    norm1: LayerNorm,
    ff_in: Linear,
    ff_out: Linear,
    norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new(model_dim: usize, heads: usize, ff_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(model_dim, heads, model_dim / heads, vb.pp("attention"))?,
            norm1: layer_norm(model_dim, LN_EPS, vb.pp("norm1"))?,
            ff_in: linear(model_dim, ff_dim, vb.pp("ff_in"))?,
            ff_out: linear(ff_dim, model_dim, vb.pp("ff_out"))?,
            norm2: layer_norm(model_dim, LN_EPS, vb.pp("norm2"))?,
        })
    }
}

impl Module for TransformerBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let attended = self.attention.forward(x)?;
        let x = self.norm1.forward(&(x + attended)?)?;
        let ff = self.ff_out.forward(&self.ff_in.forward(&x)?.relu()?)?;
        self.norm2.forward(&(x + ff)?)
    }
}

/// Sinusoidal positional encoding of shape `(1, steps, model_dim)`: sines
/// of the even-index angles followed by cosines of the odd-index angles.
pub fn positional_encoding(steps: usize, model_dim: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(steps * model_dim);
    for pos in 0..steps {
        let angle = |i: usize| {
            let rate = 1.0 / 10000f64.powf((2 * (i / 2)) as f64 / model_dim as f64);
            pos as f64 * rate
        };
        data.extend((0..model_dim).step_by(2).map(|i| angle(i).sin() as f32));
        data.extend((1..model_dim).step_by(2).map(|i| angle(i).cos() as f32));
    }
    Tensor::from_vec(data, (1, steps, model_dim), device)
}
