//! CLIP contrastive backbone.
//!
//! Weights follow HuggingFace `CLIPModel` naming, rooted at `backbone.`:
//!
//! ```text
//! backbone.vision_model.embeddings.{patch_embedding.weight, class_embedding, position_embedding.weight}
//! backbone.vision_model.{pre_layrnorm, post_layernorm}.{weight, bias}
//! backbone.vision_model.encoder.layers.{i}.{self_attn, mlp, layer_norm1, layer_norm2}.*
//! backbone.text_model.embeddings.{token_embedding, position_embedding}.weight
//! backbone.text_model.encoder.layers.{i}.*
//! backbone.text_model.final_layer_norm.{weight, bias}
//! backbone.visual_projection.weight   [projection_dim, vision hidden]
//! backbone.text_projection.weight     [projection_dim, text hidden]
//! ```

mod block;
mod config;
mod text;
mod vision;

pub use config::{ClipConfig, ClipTextConfig, ClipVisionConfig};

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{ModelError, ModelResult};
use crate::layers::Linear;
use crate::params::ParamBuilder;

use super::{Backbone, BackboneDescriptor, BackboneLoader, TextInterface, BACKBONE_PREFIX};
use text::TextTower;
use vision::VisionTower;

/// Both CLIP towers plus their projections into the shared space.
#[derive(Debug)]
pub struct ClipBackbone {
    descriptor: BackboneDescriptor,
    vision: VisionTower,
    text: TextTower,
    visual_projection: Linear,
    text_projection: Linear,
}

impl ClipBackbone {
    /// Build under `vb` (normally scoped at `backbone`).
    pub fn new(config: &ClipConfig, vb: &ParamBuilder) -> ModelResult<Self> {
        config.validate().map_err(|message| ModelError::ConfigError {
            message: format!("CLIP config: {}", message),
        })?;

        let vision = VisionTower::new(config, &vb.pp("vision_model"))?;
        let text = TextTower::new(config, &vb.pp("text_model"))?;
        let visual_projection = Linear::new(
            config.vision.hidden_size,
            config.projection_dim,
            false,
            &vb.pp("visual_projection"),
        )?;
        let text_projection = Linear::new(
            config.text.hidden_size,
            config.projection_dim,
            false,
            &vb.pp("text_projection"),
        )?;

        tracing::info!(
            image_size = config.vision.image_size,
            patch_size = config.vision.patch_size,
            vision_layers = config.vision.num_hidden_layers,
            text_layers = config.text.num_hidden_layers,
            projection_dim = config.projection_dim,
            "CLIP backbone built"
        );

        Ok(Self {
            descriptor: BackboneDescriptor {
                name: "clip".to_string(),
                image_channels: config.vision.num_channels,
                image_size: config.vision.image_size,
                feature_dim: config.projection_dim,
                text: Some(TextInterface {
                    context_length: config.text.max_position_embeddings,
                    embed_dim: config.projection_dim,
                    projection: Some(format!("{}.text_projection", BACKBONE_PREFIX)),
                }),
            },
            vision,
            text,
            visual_projection,
            text_projection,
        })
    }
}

impl Backbone for ClipBackbone {
    fn descriptor(&self) -> &BackboneDescriptor {
        &self.descriptor
    }

    fn encode_image(&self, images: &Tensor) -> ModelResult<Tensor> {
        let pooled = self.vision.forward(images)?;
        self.visual_projection.forward(&pooled)
    }

    fn encode_text_features(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        self.text.forward(tokens)
    }

    fn project_text(&self, features: &Tensor) -> ModelResult<Tensor> {
        self.text_projection.forward(features)
    }
}

/// Builds a [`ClipBackbone`]; keeps both projections trainable by default.
#[derive(Debug, Clone, Default)]
pub struct ClipBackboneLoader {
    pub config: ClipConfig,
}

impl ClipBackboneLoader {
    pub fn new(config: ClipConfig) -> Self {
        Self { config }
    }
}

impl BackboneLoader for ClipBackboneLoader {
    fn load(&self, vb: &ParamBuilder) -> ModelResult<Arc<dyn Backbone>> {
        Ok(Arc::new(ClipBackbone::new(&self.config, vb)?))
    }

    fn default_trainable(&self) -> Vec<String> {
        vec![
            format!("{}.visual_projection", BACKBONE_PREFIX),
            format!("{}.text_projection", BACKBONE_PREFIX),
        ]
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::backbone::BackboneAdapter;

    fn tiny() -> ClipConfig {
        ClipConfig {
            text: ClipTextConfig {
                vocab_size: 16,
                hidden_size: 8,
                num_hidden_layers: 1,
                num_attention_heads: 2,
                intermediate_size: 16,
                max_position_embeddings: 5,
            },
            vision: ClipVisionConfig {
                hidden_size: 8,
                num_hidden_layers: 1,
                num_attention_heads: 2,
                intermediate_size: 16,
                image_size: 8,
                patch_size: 4,
                num_channels: 3,
            },
            projection_dim: 6,
            layer_norm_eps: 1e-5,
        }
    }

    fn build() -> (BackboneAdapter, crate::params::ParameterPartition) {
        let loader = ClipBackboneLoader::new(tiny());
        let vb = ParamBuilder::fresh(loader.freeze_policy(), &Device::Cpu);
        let backbone = loader.load(&vb.pp(BACKBONE_PREFIX)).unwrap();
        (BackboneAdapter::new(backbone), vb.finish().unwrap())
    }

    #[test]
    fn test_image_and_text_shapes() {
        let (adapter, _) = build();
        let images = Tensor::ones((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(adapter.encode_image(&images).unwrap().dims(), &[2, 6]);

        let tokens = Tensor::new(&[[1u32, 3, 15, 0, 0], [1, 15, 0, 0, 0], [1, 2, 3, 4, 15]], &Device::Cpu).unwrap();
        assert_eq!(adapter.encode_text(&tokens).unwrap().dims(), &[3, 6]);
    }

    #[test]
    fn test_padding_after_eos_is_ignored() {
        let (adapter, _) = build();
        let a = Tensor::new(&[[1u32, 3, 15, 0, 0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 3, 15, 2, 7]], &Device::Cpu).unwrap();
        let ea: Vec<f32> = adapter.encode_text(&a).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let eb: Vec<f32> = adapter.encode_text(&b).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in ea.iter().zip(eb.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_default_freeze_keeps_projections_trainable() {
        let (_, partition) = build();
        assert!(partition.is_trainable("backbone.visual_projection.weight"));
        assert!(partition.is_trainable("backbone.text_projection.weight"));
        assert!(partition.is_frozen("backbone.vision_model.pre_layrnorm.weight"));
        assert!(partition.is_frozen("backbone.vision_model.embeddings.class_embedding"));
        assert!(partition.is_frozen("backbone.text_model.encoder.layers.0.self_attn.q_proj.weight"));
        assert!(partition.is_frozen("backbone.text_model.final_layer_norm.bias"));
    }

    #[test]
    fn test_rejects_wrong_resolution() {
        let (adapter, _) = build();
        let images = Tensor::ones((1, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            adapter.encode_image(&images),
            Err(ModelError::InputShape { .. })
        ));
    }
}
