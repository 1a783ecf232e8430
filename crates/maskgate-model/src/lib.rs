//! Frozen-backbone classifiers for mask state, gender and age.
//!
//! One pretrained backbone produces a feature vector per face image; three
//! heads turn it into per-attribute logits (mask: 3, gender: 2, age: 3).
//!
//! # Architecture
//!
//! - **BackboneAdapter**: shape-checked wrapper around any [`Backbone`]
//! - **ProjectionHead**: sequential `Linear -> norm -> activation` stacks
//! - **CaptionBank**: caption embeddings encoded once, read-only afterwards
//! - **AttributeClassifier**: independent, shared-neck, similarity,
//!   conditional-age and aggregated variants
//! - **TransplantLoader**: copies sub-modules out of donor checkpoints
//! - **ConditionalAgeResolver**: mask/gender argmax selects the age caption subset
//!
//! Every parameter is requested through a [`ParamBuilder`] during
//! construction, which fixes it as trainable or frozen for the model's
//! lifetime.
//!
//! # Example
//!
//! ```rust,ignore
//! use maskgate_model::ModelConfig;
//!
//! let model = ModelConfig::from_file("maskgate.toml")?.with_env_overrides().build()?;
//! let logits = model.forward(&images)?;
//! let predictions = logits.predict()?;
//! ```

pub mod attributes;
pub mod backbone;
pub mod captions;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod error;
pub mod heads;
pub mod layers;
pub mod ops;
pub mod params;
pub mod preprocess;
pub mod resolver;
pub mod transplant;

#[cfg(test)]
mod test_support;

pub use attributes::{AgeBand, Attribute, AttributeLogits, AttributePrediction, Gender, MaskState};
pub use backbone::{
    Backbone, BackboneAdapter, BackboneDescriptor, BackboneLoader, CaptionTokenizer, ClipBackbone,
    ClipBackboneLoader, ClipConfig, ClipTokenizer, TextInterface, BACKBONE_PREFIX,
};
pub use captions::{BankOptions, CaptionBank, CaptionEmbeddings, CaptionSet, CAPTION_BANK_VERSION};
pub use classifier::{
    build_classifier, AggregatedClassifier, AggregatedConfig, AttributeClassifier, CaptionSource,
    ClassifierConfig, ClassifierParts, ConditionalAgeClassifier, ConditionalAgeConfig,
    IndependentHeadsClassifier, IndependentHeadsConfig, ReprojectionConfig, SharedNeckClassifier,
    SharedNeckConfig, SimilarityClassifier, SimilarityConfig, SimilarityHeadsConfig,
};
pub use config::{BackboneConfig, ClipVariant, DeviceConfig, DeviceKind, ModelConfig};
pub use error::{ModelError, ModelResult};
pub use heads::{HeadConfig, NormKind, ProjectionHead};
pub use ops::{l2_normalize, scaled_similarity, LOGIT_SCALE};
pub use params::{Buffer, FreezePolicy, Init, ParamBuilder, ParamSource, ParameterPartition};
pub use preprocess::{ImageProcessor, CLIP_MEAN, CLIP_STD};
pub use resolver::ConditionalAgeResolver;
pub use transplant::{DonorSpec, TransplantConfig, TransplantLoader};
