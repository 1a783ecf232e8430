//! Batched CLIP text tower.
//!
//! Token + position embeddings, causal transformer layers, final LayerNorm,
//! then pooling at each sequence's end-of-text token. The end-of-text id is
//! the largest in the vocabulary, so its position is the row-wise argmax.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{tensor_err, ModelResult};
use crate::layers::LayerNorm;
use crate::params::{Init, ParamBuilder};

use super::block::{encoder, EncoderLayer};
use super::config::ClipConfig;

#[derive(Debug, Clone)]
pub(super) struct TextTower {
    token_embedding: Tensor,
    position_embedding: Tensor,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
    hidden_size: usize,
}

impl TextTower {
    /// Parameters under `text_model.*`.
    pub(super) fn new(config: &ClipConfig, vb: &ParamBuilder) -> ModelResult<Self> {
        let t = &config.text;
        let h = t.hidden_size;
        let emb = vb.pp("embeddings");

        Ok(Self {
            token_embedding: emb
                .pp("token_embedding")
                .get(&[t.vocab_size, h], "weight", Init::Uniform(0.02))?,
            position_embedding: emb.pp("position_embedding").get(
                &[t.max_position_embeddings, h],
                "weight",
                Init::Uniform(0.01),
            )?,
            layers: encoder(
                t.num_hidden_layers,
                h,
                t.intermediate_size,
                t.num_attention_heads,
                &vb.pp("encoder"),
            )?,
            final_layer_norm: LayerNorm::new(h, &vb.pp("final_layer_norm"))?,
            hidden_size: h,
        })
    }

    /// `[N, T]` token ids -> pooled `[N, hidden]`.
    pub(super) fn forward(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        let tokens = tokens
            .to_dtype(DType::U32)
            .map_err(tensor_err("Token dtype conversion failed"))?;
        let (n, seq_len) = tokens.dims2()?;
        let h = self.hidden_size;

        let token_emb = self
            .token_embedding
            .index_select(
                &tokens.flatten_all().map_err(tensor_err("Flatten failed"))?,
                0,
            )
            .map_err(tensor_err("Token embedding lookup failed"))?
            .reshape((n, seq_len, h))
            .map_err(tensor_err("Reshape failed"))?;
        let position_emb = self
            .position_embedding
            .narrow(0, 0, seq_len)
            .map_err(tensor_err("Position embedding slice failed"))?;
        let mut hidden_states = token_emb
            .broadcast_add(&position_emb)
            .map_err(tensor_err("Embedding addition failed"))?;

        let causal_mask = create_causal_mask(seq_len, tokens.device())?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, Some(&causal_mask))?;
        }
        let hidden_states = self.final_layer_norm.forward(&hidden_states)?;

        // Row-wise EOS position -> flat index into [N * T, hidden]
        let eos: Vec<u32> = tokens
            .argmax(D::Minus1)
            .map_err(tensor_err("EOS argmax failed"))?
            .to_vec1()
            .map_err(tensor_err("EOS positions to vec failed"))?;
        let flat_index: Vec<u32> = eos
            .iter()
            .enumerate()
            .map(|(row, &pos)| (row * seq_len) as u32 + pos)
            .collect();
        let flat_index = Tensor::from_vec(flat_index, n, tokens.device())?;

        hidden_states
            .reshape((n * seq_len, h))
            .map_err(tensor_err("Hidden flatten failed"))?
            .index_select(&flat_index, 0)
            .map_err(tensor_err("EOS extraction failed"))
    }
}

/// Lower-triangular additive mask `[1, 1, T, T]`: 0 to attend, -inf to block.
pub(super) fn create_causal_mask(seq_len: usize, device: &Device) -> ModelResult<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_slice(&mask, (1, 1, seq_len, seq_len), device)
        .map_err(tensor_err("Causal mask creation failed"))
}
