//! Similarity classifier whose age comparison is gated by mask and gender.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, AttributeLogits};
use crate::backbone::{BackboneAdapter, BackboneLoader};
use crate::captions::CaptionBank;
use crate::error::ModelResult;
use crate::params::{ParamBuilder, ParameterPartition};
use crate::resolver::ConditionalAgeResolver;

use super::similarity::SimilarityCore;
use super::{AttributeClassifier, CaptionSource, SimilarityHeadsConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionalAgeConfig {
    #[serde(default)]
    pub heads: SimilarityHeadsConfig,
}

/// Mask and gender first; their argmax picks the age captions per sample.
///
/// The selection is discrete, so age loss never reaches the mask or gender
/// heads through it.
pub struct ConditionalAgeClassifier {
    core: SimilarityCore,
    resolver: ConditionalAgeResolver,
    partition: ParameterPartition,
}

impl ConditionalAgeClassifier {
    /// # Errors
    /// - `ModelError::ConfigError` if a precomputed bank lacks the age grid
    /// - as [`SimilarityClassifier::new`](super::SimilarityClassifier::new)
    pub fn new(
        loader: &dyn BackboneLoader,
        config: &ConditionalAgeConfig,
        captions: CaptionSource,
        vb: ParamBuilder,
    ) -> ModelResult<Self> {
        let core = SimilarityCore::build(loader, &config.heads, captions, true, &vb)?;
        let partition = vb.finish()?;
        tracing::info!(
            backbone = %core.modules.adapter().descriptor().name,
            captions = %core.bank.version(),
            trainable = partition.num_trainable_params(),
            frozen = partition.num_frozen_params(),
            "Conditional-age classifier built"
        );
        Ok(Self {
            core,
            resolver: ConditionalAgeResolver::new(),
            partition,
        })
    }

    pub fn caption_bank(&self) -> &CaptionBank {
        &self.core.bank
    }

    /// Age-caption subset chosen for every sample, `[B]`.
    pub fn selection_indices(&self, images: &Tensor) -> ModelResult<Tensor> {
        let features = self.core.modules.adapter().encode_image(images)?;
        let mask = self.core.logits(Attribute::Mask, &features, false)?;
        let gender = self.core.logits(Attribute::Gender, &features, false)?;
        self.resolver.selection_indices(&mask, &gender)
    }
}

impl AttributeClassifier for ConditionalAgeClassifier {
    fn kind(&self) -> &'static str {
        "conditional_age"
    }

    fn backbone(&self) -> &BackboneAdapter {
        self.core.modules.adapter()
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits> {
        self.core.forward_t(images, Some(&self.resolver), train)
    }

    fn partition(&self) -> &ParameterPartition {
        &self.partition
    }
}
