//! One MLP head per attribute on top of backbone features.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, AttributeLogits};
use crate::backbone::{BackboneAdapter, BackboneLoader};
use crate::error::ModelResult;
use crate::heads::{HeadConfig, ProjectionHead};
use crate::params::{ParamBuilder, ParameterPartition};

use super::{load_backbone, AttributeClassifier, PerAttribute};

/// Layer stack shared by the `mask`, `gender` and `age` heads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndependentHeadsConfig {
    #[serde(default)]
    pub head: HeadConfig,
}

#[derive(Debug, Clone)]
pub(crate) struct IndependentModules {
    adapter: BackboneAdapter,
    heads: PerAttribute<ProjectionHead>,
}

impl IndependentModules {
    pub(crate) fn build(
        loader: &dyn BackboneLoader,
        config: &IndependentHeadsConfig,
        vb: &ParamBuilder,
    ) -> ModelResult<Self> {
        let adapter = load_backbone(loader, vb)?;
        let in_dim = adapter.feature_dim();
        let heads = PerAttribute::try_new(|attr| {
            ProjectionHead::new(in_dim, attr.num_classes(), &config.head, &vb.pp(attr.as_str()))
        })?;
        Ok(Self { adapter, heads })
    }

    pub(crate) fn head_names(&self) -> Vec<String> {
        Attribute::ALL
            .iter()
            .map(|a| self.heads.get(*a).name().to_string())
            .collect()
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits> {
        let features = self.adapter.encode_image(images)?;
        Ok(AttributeLogits {
            mask: self.heads.mask.forward_t(&features, train)?,
            gender: self.heads.gender.forward_t(&features, train)?,
            age: self.heads.age.forward_t(&features, train)?,
        })
    }
}

/// Backbone features fed to three independent heads.
pub struct IndependentHeadsClassifier {
    modules: IndependentModules,
    partition: ParameterPartition,
}

impl IndependentHeadsClassifier {
    /// # Errors
    /// - `ModelError::DimensionMismatch` if a head's declared input width is not the feature width
    /// - `ModelError::CheckpointLoad` if a stored tensor does not fit
    pub fn new(
        loader: &dyn BackboneLoader,
        config: &IndependentHeadsConfig,
        vb: ParamBuilder,
    ) -> ModelResult<Self> {
        let modules = IndependentModules::build(loader, config, &vb)?;
        let partition = vb.finish()?;
        tracing::info!(
            backbone = %modules.adapter.descriptor().name,
            feature_dim = modules.adapter.feature_dim(),
            trainable = partition.num_trainable_params(),
            frozen = partition.num_frozen_params(),
            "Independent-heads classifier built"
        );
        Ok(Self { modules, partition })
    }

    pub fn head(&self, attribute: Attribute) -> &ProjectionHead {
        self.modules.heads.get(attribute)
    }
}

impl AttributeClassifier for IndependentHeadsClassifier {
    fn kind(&self) -> &'static str {
        "independent_heads"
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
