//! Backbone selection, pretrained weights and freeze policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::backbone::{BackboneLoader, ClipBackboneLoader, ClipConfig, BACKBONE_PREFIX};
use crate::checkpoint;
use crate::error::ModelResult;
use crate::params::{FreezePolicy, ParamSource};

/// CLIP geometry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum ClipVariant {
    #[default]
    VitB32,
    VitL14,
    Custom(ClipConfig),
}

impl ClipVariant {
    pub fn config(&self) -> ClipConfig {
        match self {
            ClipVariant::VitB32 => ClipConfig::vit_b32(),
            ClipVariant::VitL14 => ClipConfig::vit_l14(),
            ClipVariant::Custom(c) => c.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    #[serde(default)]
    pub clip: ClipVariant,

    /// HuggingFace `CLIPModel` safetensors. Without it the backbone is
    /// randomly initialized.
    #[serde(default)]
    pub weights: Option<PathBuf>,

    /// `tokenizer.json` for caption encoding.
    #[serde(default)]
    pub tokenizer: Option<PathBuf>,

    /// Prefixes under `backbone.` that stay trainable. `None` keeps the
    /// loader's defaults (both CLIP projections); `[]` freezes everything.
    #[serde(default)]
    pub trainable: Option<Vec<String>>,
}

impl BackboneConfig {
    pub fn loader(&self) -> ClipBackboneLoader {
        ClipBackboneLoader::new(self.clip.config())
    }

    pub fn freeze_policy(&self, loader: &dyn BackboneLoader) -> FreezePolicy {
        match &self.trainable {
            None => loader.freeze_policy(),
            Some(prefixes) => prefixes
                .iter()
                .fold(FreezePolicy::trainable_all().freeze(BACKBONE_PREFIX), |p, e| {
                    p.with_exception(qualify(e))
                }),
        }
    }

    /// Pretrained tensors under `backbone.`, every backbone parameter required.
    pub fn pretrained_source(&self, device: &Device) -> ModelResult<ParamSource> {
        let mut source = ParamSource::empty();
        match &self.weights {
            Some(path) => {
                let tensors = pretrained_tensors(path, device)?;
                source.add_tensors(path, tensors, Some(BACKBONE_PREFIX))?;
                source.require_prefix(BACKBONE_PREFIX, path);
            }
            None => tracing::warn!("No backbone weights configured; backbone is randomly initialized"),
        }
        Ok(source)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.clip.config().validate()?;
        if let Some(prefixes) = &self.trainable {
            if prefixes.iter().any(|p| p.trim().is_empty()) {
                return Err("trainable prefixes must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Accept `text_projection` as shorthand for `backbone.text_projection`.
fn qualify(prefix: &str) -> String {
    if prefix == BACKBONE_PREFIX || prefix.starts_with(&format!("{}.", BACKBONE_PREFIX)) {
        prefix.to_string()
    } else {
        format!("{}.{}", BACKBONE_PREFIX, prefix)
    }
}

/// Checkpoint tensors minus entries `CLIPModel` stores but never uses as
/// parameters (`logit_scale`, `position_ids`).
fn pretrained_tensors(path: &Path, device: &Device) -> ModelResult<HashMap<String, Tensor>> {
    let mut tensors = checkpoint::load_tensors(path, device)?;
    tensors.retain(|name, _| name != "logit_scale" && !name.ends_with("position_ids"));
    Ok(tensors)
}
