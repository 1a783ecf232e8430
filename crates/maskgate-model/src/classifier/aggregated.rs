//! Composite of re-projection heads transplanted from donor checkpoints.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeLogits;
use crate::backbone::{BackboneAdapter, BackboneLoader};
use crate::captions::CaptionBank;
use crate::error::{ModelError, ModelResult};
use crate::params::{FreezePolicy, ParamBuilder, ParamSource, ParameterPartition};
use crate::resolver::ConditionalAgeResolver;
use crate::transplant::{TransplantConfig, TransplantLoader};

use super::similarity::SimilarityCore;
use super::{AttributeClassifier, CaptionSource, ReprojectionConfig, SimilarityHeadsConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedConfig {
    /// Slot layout; transplanted heads must match it exactly.
    #[serde(default)]
    pub reprojection: ReprojectionConfig,

    /// Route age through the (gender, mask) caption subsets.
    #[serde(default)]
    pub conditional_age: bool,
}

/// `{attr}_i` / `{attr}_t` pairs sourced from up to three donors.
///
/// Attributes without a donor get freshly initialized heads.
pub struct AggregatedClassifier {
    core: SimilarityCore,
    resolver: Option<ConditionalAgeResolver>,
    partition: ParameterPartition,
    transplanted: Vec<String>,
}

impl AggregatedClassifier {
    /// Extract every donor's sub-modules in turn, then build the composite.
    ///
    /// # Errors
    /// - `ModelError::ConfigError` for an invalid donor list
    /// - `ModelError::CheckpointLoad` if a donor checkpoint does not match its
    ///   architecture, or a transplanted tensor does not fit its slot
    pub fn new(
        loader: &dyn BackboneLoader,
        config: &AggregatedConfig,
        transplant: &TransplantConfig,
        captions: CaptionSource,
        mut source: ParamSource,
        mut policy: FreezePolicy,
        device: &Device,
    ) -> ModelResult<Self> {
        transplant
            .validate()
            .map_err(|message| ModelError::ConfigError { message })?;

        let extractor = TransplantLoader::new(loader, device);
        let mut transplanted = Vec::new();
        for donor in &transplant.donors {
            let names = donor.module_names();
            let tensors = extractor.extract(&donor.checkpoint, &donor.architecture, &names)?;
            source.add_tensors(&donor.checkpoint, tensors, None)?;
            for name in names {
                source.require_prefix(name.clone(), &donor.checkpoint);
                if transplant.freeze_transplanted {
                    policy = policy.freeze(name.clone());
                }
                transplanted.push(name);
            }
        }

        let vb = ParamBuilder::new(source, policy, device);
        let heads = SimilarityHeadsConfig::Reprojection(config.reprojection.clone());
        let core = SimilarityCore::build(loader, &heads, captions, config.conditional_age, &vb)?;
        let partition = vb.finish()?;

        tracing::info!(
            donors = transplant.donors.len(),
            transplanted = ?transplanted,
            conditional_age = config.conditional_age,
            trainable = partition.num_trainable_params(),
            frozen = partition.num_frozen_params(),
            "Aggregated classifier built"
        );
        Ok(Self {
            core,
            resolver: config.conditional_age.then(ConditionalAgeResolver::new),
            partition,
            transplanted,
        })
    }

    /// Sub-modules that came from donors.
    pub fn transplanted(&self) -> &[String] {
        &self.transplanted
    }

    pub fn caption_bank(&self) -> &CaptionBank {
        &self.core.bank
    }
}

impl AttributeClassifier for AggregatedClassifier {
    fn kind(&self) -> &'static str {
        "aggregated"
    }

    fn backbone(&self) -> &BackboneAdapter {
        self.core.modules.adapter()
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits> {
        self.core.forward_t(images, self.resolver.as_ref(), train)
    }

    fn partition(&self) -> &ParameterPartition {
        &self.partition
    }
}
