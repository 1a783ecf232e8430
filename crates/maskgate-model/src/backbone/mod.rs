//! Pretrained feature extractors.
//!
//! The classifiers only rely on the [`Backbone`] capability: images in,
//! fixed-width feature rows out, plus the same for token sequences when the
//! backbone has a text tower. [`BackboneAdapter`] is the boundary that checks
//! input layout before anything reaches the backbone.

mod adapter;
pub mod clip;
mod tokenizer;

pub use adapter::BackboneAdapter;
pub use clip::{ClipBackbone, ClipBackboneLoader, ClipConfig, ClipTextConfig, ClipVisionConfig};
pub use tokenizer::{CaptionTokenizer, ClipTokenizer};

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::ModelResult;
use crate::params::{FreezePolicy, ParamBuilder};

/// Parameter prefix every backbone is built under.
pub const BACKBONE_PREFIX: &str = "backbone";

/// Text-side geometry of a contrastive backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextInterface {
    /// Tokens per sequence.
    pub context_length: usize,
    /// Width of `encode_text` output rows.
    pub embed_dim: usize,
    /// Parameter prefix of the output projection applied by `project_text`,
    /// if the backbone has one.
    pub projection: Option<String>,
}

/// Static description of a backbone's input and output layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneDescriptor {
    pub name: String,
    pub image_channels: usize,
    /// Square input resolution.
    pub image_size: usize,
    /// Width of `encode_image` output rows.
    pub feature_dim: usize,
    /// `None` for image-only backbones.
    pub text: Option<TextInterface>,
}

impl BackboneDescriptor {
    /// Expected image batch layout, with `batch` in front.
    pub fn image_shape(&self, batch: usize) -> Vec<usize> {
        vec![batch, self.image_channels, self.image_size, self.image_size]
    }
}

/// Pretrained encoder.
///
/// Implementations may assume inputs already match the descriptor; the
/// adapter rejects anything else.
pub trait Backbone: Send + Sync + std::fmt::Debug {
    fn descriptor(&self) -> &BackboneDescriptor;

    /// `[B, C, S, S]` -> `[B, feature_dim]`.
    fn encode_image(&self, images: &Tensor) -> ModelResult<Tensor>;

    /// `[N, context_length]` token ids -> `[N, embed_dim]`.
    fn encode_text(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        self.project_text(&self.encode_text_features(tokens)?)
    }

    /// Pooled text features before the output projection.
    fn encode_text_features(&self, tokens: &Tensor) -> ModelResult<Tensor>;

    /// Output projection applied to `encode_text_features` rows.
    fn project_text(&self, features: &Tensor) -> ModelResult<Tensor> {
        Ok(features.clone())
    }
}

/// Builds a backbone from a parameter builder scoped at [`BACKBONE_PREFIX`].
///
/// Parameters the backbone requests go through the builder, so the freeze
/// policy and any checkpoint overlay apply to them like to any head.
pub trait BackboneLoader {
    fn load(&self, vb: &ParamBuilder) -> ModelResult<Arc<dyn Backbone>>;

    /// Parameter prefixes that stay trainable when the backbone is frozen.
    fn default_trainable(&self) -> Vec<String> {
        Vec::new()
    }

    /// Freeze the whole backbone except `default_trainable()`.
    fn freeze_policy(&self) -> FreezePolicy {
        self.default_trainable()
            .into_iter()
            .fold(FreezePolicy::trainable_all().freeze(BACKBONE_PREFIX), |p, e| {
                p.with_exception(e)
            })
    }
}
