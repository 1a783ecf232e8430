//! Caption-similarity heads.
//!
//! Image features (optionally re-projected by `{attr}_i`) and caption
//! embeddings (optionally re-projected by `{attr}_t`) are L2-normalized and
//! compared with a dot product scaled by [`LOGIT_SCALE`](crate::ops::LOGIT_SCALE).

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, AttributeLogits};
use crate::backbone::{BackboneAdapter, BackboneLoader};
use crate::captions::CaptionBank;
use crate::error::{tensor_err, ModelError, ModelResult};
use crate::heads::{HeadConfig, ProjectionHead};
use crate::ops::{l2_normalize, scaled_similarity};
use crate::params::{ParamBuilder, ParameterPartition};
use crate::resolver::ConditionalAgeResolver;

use super::{load_backbone, AttributeClassifier, CaptionSource, PerAttribute};

fn default_embed_dim() -> usize {
    32
}

/// Learned image/text re-projection into a shared space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionConfig {
    /// Shared embedding width (default: 32).
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    #[serde(default = "HeadConfig::reprojection")]
    pub image_head: HeadConfig,

    #[serde(default = "HeadConfig::reprojection")]
    pub text_head: HeadConfig,
}

impl Default for ReprojectionConfig {
    fn default() -> Self {
        Self {
            embed_dim: default_embed_dim(),
            image_head: HeadConfig::reprojection(),
            text_head: HeadConfig::reprojection(),
        }
    }
}

impl ReprojectionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.embed_dim == 0 {
            return Err("embed_dim must be positive".to_string());
        }
        self.image_head.validate().map_err(|e| format!("image_head: {}", e))?;
        self.text_head.validate().map_err(|e| format!("text_head: {}", e))
    }
}

/// What sits between the backbone and the comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimilarityHeadsConfig {
    /// Compare backbone outputs directly. No classification weights.
    ZeroShot,
    /// Per-attribute `{attr}_i` / `{attr}_t` heads.
    Reprojection(ReprojectionConfig),
}

impl Default for SimilarityHeadsConfig {
    fn default() -> Self {
        SimilarityHeadsConfig::Reprojection(ReprojectionConfig::default())
    }
}

impl SimilarityHeadsConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            SimilarityHeadsConfig::ZeroShot => Ok(()),
            SimilarityHeadsConfig::Reprojection(c) => c.validate(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default)]
    pub heads: SimilarityHeadsConfig,
}

/// Image/text head pair of one attribute.
#[derive(Debug, Clone)]
pub(crate) struct HeadPair {
    image: ProjectionHead,
    text: ProjectionHead,
}

#[derive(Debug, Clone)]
pub(crate) struct SimilarityModules {
    adapter: BackboneAdapter,
    /// `None` in zero-shot mode.
    heads: Option<PerAttribute<HeadPair>>,
}

impl SimilarityModules {
    /// Wire the heads for captions of width `text_dim`.
    ///
    /// # Errors
    /// - `ModelError::DimensionMismatch` if zero-shot widths differ, or a head's
    ///   declared input width disagrees with its upstream source
    pub(crate) fn build(
        adapter: BackboneAdapter,
        text_dim: usize,
        config: &SimilarityHeadsConfig,
        vb: &ParamBuilder,
    ) -> ModelResult<Self> {
        let feature_dim = adapter.feature_dim();
        let heads = match config {
            SimilarityHeadsConfig::ZeroShot => {
                if feature_dim != text_dim {
                    return Err(ModelError::dimension(
                        "zero-shot caption embedding",
                        feature_dim,
                        text_dim,
                    ));
                }
                None
            }
            SimilarityHeadsConfig::Reprojection(c) => Some(PerAttribute::try_new(|attr| {
                Ok(HeadPair {
                    image: ProjectionHead::new(feature_dim, c.embed_dim, &c.image_head, &vb.pp(attr.image_head()))?,
                    text: ProjectionHead::new(text_dim, c.embed_dim, &c.text_head, &vb.pp(attr.text_head()))?,
                })
            })?),
        };
        Ok(Self { adapter, heads })
    }

    pub(crate) fn adapter(&self) -> &BackboneAdapter {
        &self.adapter
    }

    pub(crate) fn head_names(&self) -> Vec<String> {
        match &self.heads {
            Some(heads) => Attribute::ALL
                .iter()
                .flat_map(|a| {
                    let pair = heads.get(*a);
                    [pair.image.name().to_string(), pair.text.name().to_string()]
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Image side of `attribute`, before normalization.
    pub(crate) fn embed_image(&self, attribute: Attribute, features: &Tensor, train: bool) -> ModelResult<Tensor> {
        match &self.heads {
            Some(heads) => heads.get(attribute).image.forward_t(features, train),
            None => Ok(features.clone()),
        }
    }

    /// Text side of `attribute` for `[K, text_dim]` caption rows.
    pub(crate) fn embed_text(&self, attribute: Attribute, captions: &Tensor, train: bool) -> ModelResult<Tensor> {
        match &self.heads {
            Some(heads) => heads.get(attribute).text.forward_t(captions, train),
            None => Ok(captions.clone()),
        }
    }
}

/// Modules plus caption bank; the part every similarity-based variant shares.
pub(crate) struct SimilarityCore {
    pub(crate) modules: SimilarityModules,
    pub(crate) bank: CaptionBank,
}

impl SimilarityCore {
    /// Backbone, bank, then heads sized to the bank.
    pub(crate) fn build(
        loader: &dyn BackboneLoader,
        heads: &SimilarityHeadsConfig,
        captions: CaptionSource,
        conditional_age: bool,
        vb: &ParamBuilder,
    ) -> ModelResult<Self> {
        let adapter = load_backbone(loader, vb)?;
        let bank = captions.into_bank(&adapter, conditional_age, vb)?;
        let modules = SimilarityModules::build(adapter, bank.embed_dim(), heads, vb)?;
        Ok(Self { modules, bank })
    }

    pub(crate) fn logits(&self, attribute: Attribute, features: &Tensor, train: bool) -> ModelResult<Tensor> {
        let image = self.modules.embed_image(attribute, features, train)?;
        let text = self.modules.embed_text(attribute, &self.bank.embeddings(attribute)?, train)?;
        scaled_similarity(&image, &text)
    }

    /// Unit-norm image and caption embeddings for one attribute.
    pub(crate) fn normalized_embeddings(
        &self,
        attribute: Attribute,
        images: &Tensor,
        train: bool,
    ) -> ModelResult<(Tensor, Tensor)> {
        let features = self.modules.adapter.encode_image(images)?;
        let image = self.modules.embed_image(attribute, &features, train)?;
        let text = self.modules.embed_text(attribute, &self.bank.embeddings(attribute)?, train)?;
        Ok((l2_normalize(&image)?, l2_normalize(&text)?))
    }

    /// Age logits against each sample's (gender, mask) caption subset.
    pub(crate) fn conditional_age_logits(
        &self,
        resolver: &ConditionalAgeResolver,
        features: &Tensor,
        mask_logits: &Tensor,
        gender_logits: &Tensor,
        train: bool,
    ) -> ModelResult<Tensor> {
        let image = self.modules.embed_image(Attribute::Age, features, train)?;
        let grid = self.bank.conditional_age()?;
        let (subsets, per, width) = grid.dims3()?;
        let flat = grid
            .reshape((subsets * per, width))
            .map_err(tensor_err("Age grid flatten failed"))?;
        let projected = self.modules.embed_text(Attribute::Age, &flat, train)?;
        let dim = projected.dim(1)?;
        let grid = projected
            .reshape((subsets, per, dim))
            .map_err(tensor_err("Age grid reshape failed"))?;
        resolver.resolve(&image, &grid, mask_logits, gender_logits)
    }

    pub(crate) fn forward_t(
        &self,
        images: &Tensor,
        resolver: Option<&ConditionalAgeResolver>,
        train: bool,
    ) -> ModelResult<AttributeLogits> {
        let features = self.modules.adapter.encode_image(images)?;
        let mask = self.logits(Attribute::Mask, &features, train)?;
        let gender = self.logits(Attribute::Gender, &features, train)?;
        let age = match resolver {
            Some(r) => self.conditional_age_logits(r, &features, &mask, &gender, train)?,
            None => self.logits(Attribute::Age, &features, train)?,
        };
        Ok(AttributeLogits { mask, gender, age })
    }
}

/// Per-attribute comparison against the caption bank.
pub struct SimilarityClassifier {
    core: SimilarityCore,
    partition: ParameterPartition,
}

impl SimilarityClassifier {
    /// # Errors
    /// - `ModelError::DimensionMismatch` in zero-shot mode when image and caption widths differ
    /// - `ModelError::Unsupported` when captions must be encoded by a backbone without a text tower
    pub fn new(
        loader: &dyn BackboneLoader,
        config: &SimilarityConfig,
        captions: CaptionSource,
        vb: ParamBuilder,
    ) -> ModelResult<Self> {
        let core = SimilarityCore::build(loader, &config.heads, captions, false, &vb)?;
        let partition = vb.finish()?;
        tracing::info!(
            backbone = %core.modules.adapter.descriptor().name,
            zero_shot = core.modules.heads.is_none(),
            captions = %core.bank.version(),
            trainable = partition.num_trainable_params(),
            frozen = partition.num_frozen_params(),
            "Similarity classifier built"
        );
        Ok(Self { core, partition })
    }

    pub fn caption_bank(&self) -> &CaptionBank {
        &self.core.bank
    }

    /// The two sides of one attribute's comparison, each row unit-norm.
    pub fn normalized_embeddings(
        &self,
        attribute: Attribute,
        images: &Tensor,
        train: bool,
    ) -> ModelResult<(Tensor, Tensor)> {
        self.core.normalized_embeddings(attribute, images, train)
    }
}

impl AttributeClassifier for SimilarityClassifier {
    fn kind(&self) -> &'static str {
        "similarity"
    }

    fn backbone(&self) -> &BackboneAdapter {
        self.core.modules.adapter()
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> ModelResult<AttributeLogits> {
        self.core.forward_t(images, None, train)
    }

    fn partition(&self) -> &ParameterPartition {
        &self.partition
    }
}
