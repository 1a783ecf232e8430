//! Trainable neck shared by three linear heads.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, AttributeLogits};
use crate::backbone::{BackboneAdapter, BackboneLoader};
use crate::error::ModelResult;
use crate::heads::{HeadConfig, ProjectionHead};
use crate::layers::Activation;
use crate::params::{ParamBuilder, ParameterPartition};

use super::{load_backbone, AttributeClassifier, PerAttribute};

/// Module name of the shared neck.
const NECK: &str = "neck";

fn default_neck_dim() -> usize {
    1000
}

fn default_neck_activation() -> Activation {
    Activation::Gelu
}

/// `features -> neck -> activation -> {mask, gender, age}` heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedNeckConfig {
    /// Layer stack of the neck (default: a single linear).
    #[serde(default = "HeadConfig::linear")]
    pub neck: HeadConfig,

    /// Neck output width (default: 1000).
    #[serde(default = "default_neck_dim")]
    pub neck_dim: usize,

    /// Applied to the neck output before every head (default: gelu).
    #[serde(default = "default_neck_activation")]
    pub activation: Activation,

    /// Layer stack of each attribute head (default: a single linear).
    #[serde(default = "HeadConfig::linear")]
    pub head: HeadConfig,
}

impl Default for SharedNeckConfig {
    fn default() -> Self {
        Self::focalnet()
    }
}

impl SharedNeckConfig {
    /// Linear neck to 1000 and GELU.
    pub fn focalnet() -> Self {
        Self {
            neck: HeadConfig::linear(),
            neck_dim: default_neck_dim(),
            activation: Activation::Gelu,
            head: HeadConfig::linear(),
        }
    }

    /// Bias-free LayerNorm neck through 2560 to 1000, Hardswish.
    pub fn efficientvit() -> Self {
        Self {
            neck: HeadConfig::layer_norm_neck(2560),
            neck_dim: default_neck_dim(),
            activation: Activation::Hardswish,
            head: HeadConfig::linear(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.neck_dim == 0 {
            return Err("neck_dim must be positive".to_string());
        }
        self.neck.validate().map_err(|e| format!("neck: {}", e))?;
        self.head.validate().map_err(|e| format!("head: {}", e))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SharedNeckModules {
    adapter: BackboneAdapter,
    neck: ProjectionHead,
    activation: Activation,
    heads: PerAttribute<ProjectionHead>,
}

impl SharedNeckModules {
    pub(crate) fn build(
        loader: &dyn BackboneLoader,
        config: &SharedNeckConfig,
        vb: &ParamBuilder,
    ) -> ModelResult<Self> {
        let adapter = load_backbone(loader, vb)?;
        let neck = ProjectionHead::new(adapter.feature_dim(), config.neck_dim, &config.neck, &vb.pp(NECK))?;
        let heads = PerAttribute::try_new(|attr| {
            ProjectionHead::new(neck.out_dim(), attr.num_classes(), &config.head, &vb.pp(attr.as_str()))
        })?;
        Ok(Self {
            adapter,
            neck,
            activation: config.activation,
            heads,
        })
    }

    pub(crate) fn head_names(&self) -> Vec<String> {
        std::iter::once(self.neck.name().to_string())
            .chain(Attribute::ALL.iter().map(|a| self.heads.get(*a).name().to_string()))
            .collect()
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits> {
        let features = self.adapter.encode_image(images)?;
        let shared = self.activation.forward(&self.neck.forward_t(&features, train)?)?;
        Ok(AttributeLogits {
            mask: self.heads.mask.forward_t(&shared, train)?,
            gender: self.heads.gender.forward_t(&shared, train)?,
            age: self.heads.age.forward_t(&shared, train)?,
        })
    }
}

/// Frozen backbone, trainable neck, three linear heads.
pub struct SharedNeckClassifier {
    modules: SharedNeckModules,
    partition: ParameterPartition,
}

impl SharedNeckClassifier {
    pub fn new(loader: &dyn BackboneLoader, config: &SharedNeckConfig, vb: ParamBuilder) -> ModelResult<Self> {
        let modules = SharedNeckModules::build(loader, config, &vb)?;
        let partition = vb.finish()?;
        tracing::info!(
            backbone = %modules.adapter.descriptor().name,
            neck_dim = modules.neck.out_dim(),
            trainable = partition.num_trainable_params(),
            frozen = partition.num_frozen_params(),
            "Shared-neck classifier built"
        );
        Ok(Self { modules, partition })
    }

    pub fn neck(&self) -> &ProjectionHead {
        &self.modules.neck
    }
}

impl AttributeClassifier for SharedNeckClassifier {
    fn kind(&self) -> &'static str {
        "shared_neck"
    }

    fn backbone(&self) -> &BackboneAdapter {
        &self.modules.adapter
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits> {
        self.modules.forward_t(images, train)
    }

    fn partition(&self) -> &ParameterPartition {
        &self.partition
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::test_support::{images, StubLoader};

    fn build(config: &SharedNeckConfig) -> SharedNeckClassifier {
        let loader = StubLoader::new(16, 8);
        let vb = ParamBuilder::fresh(loader.freeze_policy(), &Device::Cpu);
        SharedNeckClassifier::new(&loader, config, vb).unwrap()
    }

    #[test]
    fn test_focalnet_layout() {
        let model = build(&SharedNeckConfig::focalnet());
        let partition = model.partition();
        assert!(partition.is_trainable("neck.0.weight"));
        assert!(partition.is_trainable("mask.0.weight"));
        assert!(partition.is_trainable("gender.0.bias"));
        assert_eq!(model.neck().out_dim(), 1000);

        let logits = model.forward(&images(3)).unwrap();
        assert_eq!(logits.mask.dims(), &[3, 3]);
        assert_eq!(logits.gender.dims(), &[3, 2]);
        assert_eq!(logits.age.dims(), &[3, 3]);
    }

    #[test]
    fn test_efficientvit_neck_has_no_bias() {
        let config = SharedNeckConfig {
            neck: HeadConfig::layer_norm_neck(24),
            neck_dim: 10,
            ..SharedNeckConfig::efficientvit()
        };
        let model = build(&config);
        let partition = model.partition();
        assert!(partition.is_trainable("neck.0.weight"));
        assert!(!partition.is_trainable("neck.0.bias"));
        assert!(partition.is_trainable("neck.1.weight"));
        assert!(partition.is_trainable("neck.4.weight"));
        assert!(partition.is_trainable("neck.5.bias"));
        assert_eq!(model.forward(&images(2)).unwrap().age.dims(), &[2, 3]);
    }

    #[test]
    fn test_zero_neck_dim_invalid() {
        let config = SharedNeckConfig {
            neck_dim: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
