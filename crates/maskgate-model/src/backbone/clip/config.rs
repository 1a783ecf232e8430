//! CLIP tower geometry.

use serde::{Deserialize, Serialize};

/// CLIP text encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipTextConfig {
    /// Vocabulary size (49408 for CLIP).
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    /// Maximum sequence length (77 tokens).
    pub max_position_embeddings: usize,
}

/// CLIP vision encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    /// Square input resolution (224).
    pub image_size: usize,
    pub patch_size: usize,
    /// Input channels (3).
    #[serde(default = "default_channels")]
    pub num_channels: usize,
}

fn default_channels() -> usize {
    3
}

fn default_eps() -> f64 {
    1e-5
}

/// Full CLIP configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipConfig {
    pub text: ClipTextConfig,
    pub vision: ClipVisionConfig,
    /// Shared image/text embedding width.
    pub projection_dim: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
}

impl ClipConfig {
    /// openai/clip-vit-base-patch32.
    pub fn vit_b32() -> Self {
        Self {
            text: ClipTextConfig {
                vocab_size: 49408,
                hidden_size: 512,
                num_hidden_layers: 12,
                num_attention_heads: 8,
                intermediate_size: 2048,
                max_position_embeddings: 77,
            },
            vision: ClipVisionConfig {
                hidden_size: 768,
                num_hidden_layers: 12,
                num_attention_heads: 12,
                intermediate_size: 3072,
                image_size: 224,
                patch_size: 32,
                num_channels: 3,
            },
            projection_dim: 512,
            layer_norm_eps: 1e-5,
        }
    }

    /// openai/clip-vit-large-patch14.
    pub fn vit_l14() -> Self {
        Self {
            text: ClipTextConfig {
                vocab_size: 49408,
                hidden_size: 768,
                num_hidden_layers: 12,
                num_attention_heads: 12,
                intermediate_size: 3072,
                max_position_embeddings: 77,
            },
            vision: ClipVisionConfig {
                hidden_size: 1024,
                num_hidden_layers: 24,
                num_attention_heads: 16,
                intermediate_size: 4096,
                image_size: 224,
                patch_size: 14,
                num_channels: 3,
            },
            projection_dim: 768,
            layer_norm_eps: 1e-5,
        }
    }

    /// Patches per image side.
    pub fn grid_size(&self) -> usize {
        self.vision.image_size / self.vision.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    pub fn validate(&self) -> Result<(), String> {
        let v = &self.vision;
        let t = &self.text;
        if v.patch_size == 0 || v.image_size % v.patch_size != 0 {
            return Err(format!(
                "image_size {} is not a multiple of patch_size {}",
                v.image_size, v.patch_size
            ));
        }
        if v.num_attention_heads == 0 || v.hidden_size % v.num_attention_heads != 0 {
            return Err(format!(
                "vision hidden_size {} not divisible by {} heads",
                v.hidden_size, v.num_attention_heads
            ));
        }
        if t.num_attention_heads == 0 || t.hidden_size % t.num_attention_heads != 0 {
            return Err(format!(
                "text hidden_size {} not divisible by {} heads",
                t.hidden_size, t.num_attention_heads
            ));
        }
        if self.projection_dim == 0 || t.max_position_embeddings == 0 {
            return Err("projection_dim and max_position_embeddings must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self::vit_b32()
    }
}
