//! Batched CLIP vision tower.
//!
//! 1. Patch embedding (conv2d, stride = patch size)
//! 2. Prepend [CLS], add position embeddings
//! 3. Pre-LayerNorm
//! 4. Transformer layers (bidirectional)
//! 5. Post-LayerNorm on [CLS]

use candle_core::Tensor;

use crate::error::{tensor_err, ModelResult};
use crate::layers::LayerNorm;
use crate::params::{Init, ParamBuilder};

use super::block::{encoder, EncoderLayer};
use super::config::ClipConfig;

#[derive(Debug, Clone)]
pub(super) struct VisionTower {
    patch_embedding: Tensor,
    class_embedding: Tensor,
    position_embedding: Tensor,
    pre_layrnorm: LayerNorm,
    layers: Vec<EncoderLayer>,
    post_layernorm: LayerNorm,
    hidden_size: usize,
    patch_size: usize,
}

impl VisionTower {
    /// Parameters under `vision_model.*` (HuggingFace names, including the
    /// `pre_layrnorm` spelling).
    pub(super) fn new(config: &ClipConfig, vb: &ParamBuilder) -> ModelResult<Self> {
        let v = &config.vision;
        let h = v.hidden_size;
        let p = v.patch_size;
        let emb = vb.pp("embeddings");

        let patch_embedding = emb.pp("patch_embedding").get(
            &[h, v.num_channels, p, p],
            "weight",
            Init::linear(v.num_channels * p * p),
        )?;
        let class_embedding = emb.get(&[h], "class_embedding", Init::Uniform(0.02))?;
        let position_embedding = emb.pp("position_embedding").get(
            &[config.num_patches() + 1, h],
            "weight",
            Init::Uniform(0.02),
        )?;

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            pre_layrnorm: LayerNorm::new(h, &vb.pp("pre_layrnorm"))?,
            layers: encoder(
                v.num_hidden_layers,
                h,
                v.intermediate_size,
                v.num_attention_heads,
                &vb.pp("encoder"),
            )?,
            post_layernorm: LayerNorm::new(h, &vb.pp("post_layernorm"))?,
            hidden_size: h,
            patch_size: p,
        })
    }

    /// `[B, C, S, S]` -> pooled `[B, hidden]`.
    pub(super) fn forward(&self, images: &Tensor) -> ModelResult<Tensor> {
        let batch = images.dim(0)?;
        let h = self.hidden_size;

        // [B, hidden, g, g] -> [B, g*g, hidden]
        let patches = images
            .conv2d(&self.patch_embedding, 0, self.patch_size, 1, 1)
            .map_err(tensor_err("Conv2D patch embedding failed"))?
            .flatten(2, 3)
            .map_err(tensor_err("Patch flatten failed"))?
            .transpose(1, 2)
            .map_err(tensor_err("Patch transpose failed"))?
            .contiguous()
            .map_err(tensor_err("Patch contiguous failed"))?;

        let class_token = self
            .class_embedding
            .reshape((1, 1, h))
            .map_err(tensor_err("Class token reshape failed"))?
            .broadcast_as((batch, 1, h))
            .map_err(tensor_err("Class token broadcast failed"))?
            .contiguous()
            .map_err(tensor_err("Class token contiguous failed"))?;

        let hidden_states = Tensor::cat(&[&class_token, &patches], 1)
            .map_err(tensor_err("Class token concat failed"))?
            .broadcast_add(&self.position_embedding)
            .map_err(tensor_err("Position embedding addition failed"))?;

        let mut hidden_states = self.pre_layrnorm.forward(&hidden_states)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, None)?;
        }

        let cls = hidden_states
            .narrow(1, 0, 1)
            .map_err(tensor_err("CLS extraction failed"))?
            .squeeze(1)
            .map_err(tensor_err("CLS squeeze failed"))?;
        self.post_layernorm.forward(&cls)
    }
}
