//! Multi-head attribute classifiers.
//!
//! Every variant shares one backbone and fans its features out to three
//! attribute predictions:
//!
//! | Variant | Heads | Logits |
//! |---------|-------|--------|
//! | [`IndependentHeadsClassifier`] | `mask`, `gender`, `age` MLPs on backbone features | head outputs |
//! | [`SharedNeckClassifier`] | trainable `neck`, then three linear heads | head outputs |
//! | [`SimilarityClassifier`] | none (zero-shot) or `{attr}_i` / `{attr}_t` re-projections | `100 * cos(image, caption)` |
//! | [`ConditionalAgeClassifier`] | as similarity | age compared only with the (gender, mask) caption subset |
//! | [`AggregatedClassifier`] | `{attr}_i` / `{attr}_t` transplanted from donor checkpoints | as similarity or conditional |
//!
//! Construction either wires every head or fails; a classifier value always
//! owns its complete [`ParameterPartition`].

mod aggregated;
mod conditional;
mod independent;
mod shared_neck;
mod similarity;

pub use aggregated::{AggregatedClassifier, AggregatedConfig};
pub use conditional::{ConditionalAgeClassifier, ConditionalAgeConfig};
pub use independent::{IndependentHeadsClassifier, IndependentHeadsConfig};
pub use shared_neck::{SharedNeckClassifier, SharedNeckConfig};
pub use similarity::{
    ReprojectionConfig, SimilarityClassifier, SimilarityConfig, SimilarityHeadsConfig,
};

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, AttributeLogits, AttributePrediction};
use crate::backbone::{BackboneAdapter, BackboneLoader, CaptionTokenizer, BACKBONE_PREFIX};
use crate::captions::{BankOptions, CaptionBank, CaptionSet};
use crate::checkpoint;
use crate::error::{ModelError, ModelResult};
use crate::params::{FreezePolicy, ParamBuilder, ParamSource, ParameterPartition};
use crate::transplant::TransplantConfig;

use independent::IndependentModules;
use shared_neck::SharedNeckModules;
use similarity::SimilarityModules;

/// Common interface of every classifier variant.
pub trait AttributeClassifier: Send + Sync {
    /// Variant name, as used in configuration.
    fn kind(&self) -> &'static str;

    fn backbone(&self) -> &BackboneAdapter;

    /// Per-attribute logits for an image batch `[B, C, S, S]`.
    ///
    /// `train` switches batch-norm and dropout layers into training mode.
    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits>;

    /// Evaluation-mode forward.
    fn forward(&self, images: &Tensor) -> ModelResult<AttributeLogits> {
        self.forward_t(images, false)
    }

    fn predict(&self, images: &Tensor) -> ModelResult<Vec<AttributePrediction>> {
        self.forward(images)?.predict()
    }

    /// Frozen / trainable / buffer handles fixed at construction.
    fn partition(&self) -> &ParameterPartition;

    /// Full state, sorted by name.
    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        self.partition().named_tensors()
    }

    fn save_checkpoint(&self, path: &Path) -> ModelResult<()> {
        checkpoint::save(self.named_tensors(), path)
    }
}

/// One value per attribute.
#[derive(Debug, Clone)]
pub(crate) struct PerAttribute<T> {
    pub mask: T,
    pub gender: T,
    pub age: T,
}

impl<T> PerAttribute<T> {
    /// Build in head order: mask, gender, age.
    pub(crate) fn try_new(mut f: impl FnMut(Attribute) -> ModelResult<T>) -> ModelResult<Self> {
        Ok(Self {
            mask: f(Attribute::Mask)?,
            gender: f(Attribute::Gender)?,
            age: f(Attribute::Age)?,
        })
    }

    pub(crate) fn get(&self, attribute: Attribute) -> &T {
        match attribute {
            Attribute::Mask => &self.mask,
            Attribute::Gender => &self.gender,
            Attribute::Age => &self.age,
        }
    }
}

/// Where a similarity variant gets its caption embeddings.
#[derive(Clone)]
pub enum CaptionSource {
    /// Tokenize and encode with the classifier's own backbone.
    Encode {
        captions: CaptionSet,
        tokenizer: Arc<dyn CaptionTokenizer>,
    },
    /// Use an already-built bank.
    Precomputed(CaptionBank),
}

impl CaptionSource {
    pub fn encode(captions: CaptionSet, tokenizer: Arc<dyn CaptionTokenizer>) -> Self {
        CaptionSource::Encode { captions, tokenizer }
    }

    /// Resolve into a bank for `adapter`.
    ///
    /// Encoded banks cache pre-projection features when the backbone's text
    /// projection is trainable under `vb`'s policy.
    pub(crate) fn into_bank(
        self,
        adapter: &BackboneAdapter,
        conditional_age: bool,
        vb: &ParamBuilder,
    ) -> ModelResult<CaptionBank> {
        match self {
            CaptionSource::Encode { captions, tokenizer } => {
                let reproject = adapter
                    .text()
                    .and_then(|t| t.projection.as_deref())
                    .map_or(false, |prefix| vb.is_trainable(prefix));
                CaptionBank::encode(
                    captions,
                    adapter,
                    tokenizer.as_ref(),
                    BankOptions {
                        conditional_age,
                        reproject,
                    },
                    vb.device(),
                )
            }
            CaptionSource::Precomputed(bank) => {
                if conditional_age && !bank.has_conditional_age() {
                    return Err(ModelError::ConfigError {
                        message: "conditional age routing needs a caption bank with the age grid"
                            .to_string(),
                    });
                }
                Ok(bank)
            }
        }
    }
}

/// Backbone under the `backbone.` prefix, wrapped in its adapter.
pub(crate) fn load_backbone(loader: &dyn BackboneLoader, vb: &ParamBuilder) -> ModelResult<BackboneAdapter> {
    Ok(BackboneAdapter::new(loader.load(&vb.pp(BACKBONE_PREFIX))?))
}

/// Classifier topology, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierConfig {
    IndependentHeads(IndependentHeadsConfig),
    SharedNeck(SharedNeckConfig),
    Similarity(SimilarityConfig),
    ConditionalAge(ConditionalAgeConfig),
    Aggregated(AggregatedConfig),
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig::Similarity(SimilarityConfig::default())
    }
}

impl ClassifierConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifierConfig::IndependentHeads(_) => "independent_heads",
            ClassifierConfig::SharedNeck(_) => "shared_neck",
            ClassifierConfig::Similarity(_) => "similarity",
            ClassifierConfig::ConditionalAge(_) => "conditional_age",
            ClassifierConfig::Aggregated(_) => "aggregated",
        }
    }

    /// Whether the variant compares against caption embeddings.
    pub fn needs_captions(&self) -> bool {
        !matches!(
            self,
            ClassifierConfig::IndependentHeads(_) | ClassifierConfig::SharedNeck(_)
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ClassifierConfig::IndependentHeads(c) => c.head.validate(),
            ClassifierConfig::SharedNeck(c) => c.validate(),
            ClassifierConfig::Similarity(c) => c.heads.validate(),
            ClassifierConfig::ConditionalAge(c) => c.heads.validate(),
            ClassifierConfig::Aggregated(c) => c.reprojection.validate(),
        }
    }

    /// Build only the module graph (backbone and heads) under `vb`.
    ///
    /// Used for donor architectures, which never need a caption bank.
    pub(crate) fn instantiate(
        &self,
        loader: &dyn BackboneLoader,
        vb: &ParamBuilder,
    ) -> ModelResult<ModuleGraph> {
        Ok(match self {
            ClassifierConfig::IndependentHeads(c) => {
                ModuleGraph::Independent(IndependentModules::build(loader, c, vb)?)
            }
            ClassifierConfig::SharedNeck(c) => {
                ModuleGraph::SharedNeck(SharedNeckModules::build(loader, c, vb)?)
            }
            ClassifierConfig::Similarity(SimilarityConfig { heads })
            | ClassifierConfig::ConditionalAge(ConditionalAgeConfig { heads }) => {
                let adapter = load_backbone(loader, vb)?;
                let text_dim = adapter
                    .text()
                    .map(|t| t.embed_dim)
                    .ok_or_else(|| ModelError::Unsupported {
                        message: format!(
                            "similarity donor needs a text tower; backbone '{}' has none",
                            adapter.descriptor().name
                        ),
                    })?;
                ModuleGraph::Similarity(SimilarityModules::build(adapter, text_dim, heads, vb)?)
            }
            ClassifierConfig::Aggregated(_) => {
                return Err(ModelError::Unsupported {
                    message: "an aggregated classifier cannot serve as a transplant donor".to_string(),
                })
            }
        })
    }
}

/// A donor instance held only while its sub-modules are copied out.
#[derive(Debug)]
pub(crate) enum ModuleGraph {
    Independent(IndependentModules),
    SharedNeck(SharedNeckModules),
    Similarity(SimilarityModules),
}

impl ModuleGraph {
    pub(crate) fn head_names(&self) -> Vec<String> {
        match self {
            ModuleGraph::Independent(m) => m.head_names(),
            ModuleGraph::SharedNeck(m) => m.head_names(),
            ModuleGraph::Similarity(m) => m.head_names(),
        }
    }
}

/// Everything a classifier is assembled from besides its topology.
pub struct ClassifierParts<'a> {
    pub loader: &'a dyn BackboneLoader,
    /// Required by the similarity-based variants.
    pub captions: Option<CaptionSource>,
    /// Stored tensors (pretrained backbone, resumed checkpoint).
    pub source: ParamSource,
    pub policy: FreezePolicy,
    pub device: Device,
}

/// Build any variant from its configuration.
pub fn build_classifier(
    config: &ClassifierConfig,
    transplant: &TransplantConfig,
    parts: ClassifierParts<'_>,
) -> ModelResult<Box<dyn AttributeClassifier>> {
    config
        .validate()
        .map_err(|message| ModelError::ConfigError { message })?;

    let ClassifierParts {
        loader,
        captions,
        source,
        policy,
        device,
    } = parts;
    Ok(match config {
        ClassifierConfig::IndependentHeads(c) => {
            let vb = ParamBuilder::new(source, policy, &device);
            Box::new(IndependentHeadsClassifier::new(loader, c, vb)?)
        }
        ClassifierConfig::SharedNeck(c) => {
            let vb = ParamBuilder::new(source, policy, &device);
            Box::new(SharedNeckClassifier::new(loader, c, vb)?)
        }
        ClassifierConfig::Similarity(c) => {
            let captions = captions.ok_or_else(|| missing_captions(config))?;
            let vb = ParamBuilder::new(source, policy, &device);
            Box::new(SimilarityClassifier::new(loader, c, captions, vb)?)
        }
        ClassifierConfig::ConditionalAge(c) => {
            let captions = captions.ok_or_else(|| missing_captions(config))?;
            let vb = ParamBuilder::new(source, policy, &device);
            Box::new(ConditionalAgeClassifier::new(loader, c, captions, vb)?)
        }
        ClassifierConfig::Aggregated(c) => {
            let captions = captions.ok_or_else(|| missing_captions(config))?;
            Box::new(AggregatedClassifier::new(
                loader, c, transplant, captions, source, policy, &device,
            )?)
        }
    })
}

fn missing_captions(config: &ClassifierConfig) -> ModelError {
    ModelError::ConfigError {
        message: format!("classifier '{}' needs a caption source", config.kind()),
    }
}
