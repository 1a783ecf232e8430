//! Pre-norm transformer encoder layer shared by both CLIP towers.
//!
//! Matmuls run on `[batch * seq, hidden]` and are reshaped back, the same
//! flatten/reshape pattern for both attention and MLP.

use candle_core::{Tensor, D};

use crate::error::{tensor_err, ModelResult};
use crate::layers::{Activation, LayerNorm, Linear};
use crate::params::ParamBuilder;

#[derive(Debug, Clone)]
pub(super) struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
}

impl SelfAttention {
    fn new(hidden: usize, num_heads: usize, vb: &ParamBuilder) -> ModelResult<Self> {
        Ok(Self {
            q_proj: Linear::new(hidden, hidden, true, &vb.pp("q_proj"))?,
            k_proj: Linear::new(hidden, hidden, true, &vb.pp("k_proj"))?,
            v_proj: Linear::new(hidden, hidden, true, &vb.pp("v_proj"))?,
            out_proj: Linear::new(hidden, hidden, true, &vb.pp("out_proj"))?,
            num_heads,
        })
    }

    /// `mask` is added to the `[B, heads, seq, seq]` scores before softmax.
    fn forward(&self, hidden_states: &Tensor, mask: Option<&Tensor>) -> ModelResult<Tensor> {
        let (batch, seq_len, hidden) = hidden_states.dims3()?;
        let head_dim = hidden / self.num_heads;
        let flat = hidden_states
            .reshape((batch * seq_len, hidden))
            .map_err(tensor_err("Flatten hidden failed"))?;

        let split = |proj: &Linear| -> ModelResult<Tensor> {
            proj.forward(&flat)?
                .reshape((batch, seq_len, self.num_heads, head_dim))
                .map_err(tensor_err("Head reshape failed"))?
                .transpose(1, 2)
                .map_err(tensor_err("Head transpose failed"))?
                .contiguous()
                .map_err(tensor_err("Head contiguous failed"))
        };
        let q = split(&self.q_proj)?;
        let k = split(&self.k_proj)?;
        let v = split(&self.v_proj)?;

        let k_t = k
            .transpose(2, 3)
            .map_err(tensor_err("K transpose failed"))?
            .contiguous()
            .map_err(tensor_err("K^T contiguous failed"))?;
        let scores = (q.matmul(&k_t).map_err(tensor_err("QK matmul failed"))?
            / (head_dim as f64).sqrt())
        .map_err(tensor_err("Scale divide failed"))?;
        let scores = match mask {
            Some(m) => scores
                .broadcast_add(m)
                .map_err(tensor_err("Mask addition failed"))?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax(&scores, D::Minus1).map_err(tensor_err("Softmax failed"))?;

        let context = weights
            .matmul(&v)
            .map_err(tensor_err("Attention V matmul failed"))?
            .transpose(1, 2)
            .map_err(tensor_err("Output transpose failed"))?
            .contiguous()
            .map_err(tensor_err("Output contiguous failed"))?
            .reshape((batch * seq_len, hidden))
            .map_err(tensor_err("Output flatten failed"))?;

        self.out_proj
            .forward(&context)?
            .reshape((batch, seq_len, hidden))
            .map_err(tensor_err("Output reshape failed"))
    }
}

/// FC1 -> QuickGELU -> FC2.
#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn forward(&self, hidden_states: &Tensor) -> ModelResult<Tensor> {
        let (batch, seq_len, hidden) = hidden_states.dims3()?;
        let flat = hidden_states
            .reshape((batch * seq_len, hidden))
            .map_err(tensor_err("MLP flatten failed"))?;
        let h = Activation::QuickGelu.forward(&self.fc1.forward(&flat)?)?;
        self.fc2
            .forward(&h)?
            .reshape((batch, seq_len, hidden))
            .map_err(tensor_err("MLP reshape failed"))
    }
}

/// One encoder layer: `x + attn(ln1(x))`, then `x + mlp(ln2(x))`.
#[derive(Debug, Clone)]
pub(super) struct EncoderLayer {
    self_attn: SelfAttention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl EncoderLayer {
    pub(super) fn new(
        hidden: usize,
        intermediate: usize,
        num_heads: usize,
        vb: &ParamBuilder,
    ) -> ModelResult<Self> {
        Ok(Self {
            self_attn: SelfAttention::new(hidden, num_heads, &vb.pp("self_attn"))?,
            layer_norm1: LayerNorm::new(hidden, &vb.pp("layer_norm1"))?,
            mlp: Mlp {
                fc1: Linear::new(hidden, intermediate, true, &vb.pp("mlp").pp("fc1"))?,
                fc2: Linear::new(intermediate, hidden, true, &vb.pp("mlp").pp("fc2"))?,
            },
            layer_norm2: LayerNorm::new(hidden, &vb.pp("layer_norm2"))?,
        })
    }

    pub(super) fn forward(&self, hidden_states: &Tensor, mask: Option<&Tensor>) -> ModelResult<Tensor> {
        let attn = self
            .self_attn
            .forward(&self.layer_norm1.forward(hidden_states)?, mask)?;
        let hidden_states = (hidden_states + attn).map_err(tensor_err("Attention residual failed"))?;
        let mlp = self.mlp.forward(&self.layer_norm2.forward(&hidden_states)?)?;
        (hidden_states + mlp).map_err(tensor_err("MLP residual failed"))
    }
}

/// Stack of encoder layers under `{vb}.layers.{i}`.
pub(super) fn encoder(
    num_layers: usize,
    hidden: usize,
    intermediate: usize,
    num_heads: usize,
    vb: &ParamBuilder,
) -> ModelResult<Vec<EncoderLayer>> {
    let vb = vb.pp("layers");
    (0..num_layers)
        .map(|i| EncoderLayer::new(hidden, intermediate, num_heads, &vb.pp(i)))
        .collect()
}
