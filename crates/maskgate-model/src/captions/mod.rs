//! Caption bank: attribute descriptions encoded once into text embeddings.
//!
//! Encoding happens at construction. The bank then holds detached, read-only
//! rows; nothing mutates them afterwards. When the backbone's text output
//! projection is trainable the bank caches the pooled features instead and
//! applies the projection on every read, so gradient reaches it.

mod defaults;

pub use defaults::{CaptionSet, CAPTION_BANK_VERSION};

use candle_core::{Device, Tensor, D};

use crate::attributes::{AgeBand, Attribute, Gender, MaskState};
use crate::backbone::{BackboneAdapter, CaptionTokenizer};
use crate::error::{tensor_err, ModelError, ModelResult};

/// Number of (gender, mask) age subsets.
pub const NUM_AGE_SUBSETS: usize = Gender::NUM_CLASSES * MaskState::NUM_CLASSES;

/// What to encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BankOptions {
    /// Also encode the per-(gender, mask) age grid.
    pub conditional_age: bool,
    /// Cache pre-projection features and re-project on every read.
    pub reproject: bool,
}

/// Precomputed embeddings, for backbones without a text tower.
#[derive(Debug, Clone)]
pub struct CaptionEmbeddings {
    /// `[3, D]`
    pub mask: Tensor,
    /// `[2, D]`
    pub gender: Tensor,
    /// `[3, D]`
    pub age: Tensor,
    /// `[6, 3, D]`, subset `gender * 3 + mask`.
    pub conditional_age: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct CaptionBank {
    captions: CaptionSet,
    cached: CaptionEmbeddings,
    /// Set when `cached` holds pre-projection features.
    reprojection: Option<BackboneAdapter>,
    embed_dim: usize,
}

impl CaptionBank {
    /// Tokenize and encode every caption in one backbone call.
    ///
    /// # Errors
    /// - `ModelError::DimensionMismatch` if a caption list has the wrong length
    /// - `ModelError::Unsupported` if the backbone has no text tower
    /// - `ModelError::InputShape` if the tokenizer's context length disagrees with the backbone
    pub fn encode(
        captions: CaptionSet,
        adapter: &BackboneAdapter,
        tokenizer: &dyn CaptionTokenizer,
        options: BankOptions,
        device: &Device,
    ) -> ModelResult<Self> {
        captions.validate()?;
        let text = adapter.text().cloned().ok_or_else(|| ModelError::Unsupported {
            message: format!("backbone '{}' cannot encode captions", adapter.descriptor().name),
        })?;

        let mut all: Vec<String> = captions
            .mask
            .iter()
            .chain(&captions.gender)
            .chain(&captions.age)
            .cloned()
            .collect();
        if options.conditional_age {
            all.extend(captions.conditional_flat());
        }

        let tokens = tokenizer.tokenize(&all, device)?;
        let rows = if options.reproject {
            adapter.encode_text_features(&tokens)?
        } else {
            adapter.encode_text(&tokens)?
        }
        .detach();

        let take = |start: usize, len: usize| -> ModelResult<Tensor> {
            rows.narrow(0, start, len)
                .map_err(tensor_err("Caption slice failed"))?
                .contiguous()
                .map_err(tensor_err("Caption contiguous failed"))
        };
        let (m, g, a) = (MaskState::NUM_CLASSES, Gender::NUM_CLASSES, AgeBand::NUM_CLASSES);
        let conditional_age = if options.conditional_age {
            let width = rows.dim(D::Minus1)?;
            Some(
                take(m + g + a, NUM_AGE_SUBSETS * a)?
                    .reshape((NUM_AGE_SUBSETS, a, width))
                    .map_err(tensor_err("Conditional caption reshape failed"))?,
            )
        } else {
            None
        };
        let cached = CaptionEmbeddings {
            mask: take(0, m)?,
            gender: take(m, g)?,
            age: take(m + g, a)?,
            conditional_age,
        };

        tracing::info!(
            version = %captions.version,
            captions = all.len(),
            embed_dim = text.embed_dim,
            reproject = options.reproject,
            "Caption bank encoded"
        );

        Ok(Self {
            captions,
            cached,
            reprojection: options.reproject.then(|| adapter.clone()),
            embed_dim: text.embed_dim,
        })
    }

    /// Wrap embeddings computed elsewhere.
    ///
    /// # Errors
    /// - `ModelError::DimensionMismatch` if row counts or widths disagree
    pub fn from_embeddings(captions: CaptionSet, embeddings: CaptionEmbeddings) -> ModelResult<Self> {
        captions.validate()?;
        let embed_dim = embeddings.mask.dim(D::Minus1)?;
        let check = |name: &str, t: &Tensor, rows: usize| -> ModelResult<()> {
            let (r, w) = t.dims2()?;
            if r != rows {
                return Err(ModelError::dimension(format!("caption embeddings.{} rows", name), rows, r));
            }
            if w != embed_dim {
                return Err(ModelError::dimension(format!("caption embeddings.{} width", name), embed_dim, w));
            }
            Ok(())
        };
        check("mask", &embeddings.mask, MaskState::NUM_CLASSES)?;
        check("gender", &embeddings.gender, Gender::NUM_CLASSES)?;
        check("age", &embeddings.age, AgeBand::NUM_CLASSES)?;
        if let Some(grid) = &embeddings.conditional_age {
            let expected = [NUM_AGE_SUBSETS, AgeBand::NUM_CLASSES, embed_dim];
            if grid.dims() != expected.as_slice() {
                return Err(ModelError::dimension(
                    "caption embeddings.conditional_age elements",
                    expected.iter().product(),
                    grid.elem_count(),
                ));
            }
        }

        Ok(Self {
            captions,
            cached: CaptionEmbeddings {
                mask: embeddings.mask.detach(),
                gender: embeddings.gender.detach(),
                age: embeddings.age.detach(),
                conditional_age: embeddings.conditional_age.map(|t| t.detach()),
            },
            reprojection: None,
            embed_dim,
        })
    }

    pub fn captions(&self) -> &CaptionSet {
        &self.captions
    }

    pub fn version(&self) -> &str {
        &self.captions.version
    }

    /// Width of the rows returned by `embeddings`.
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn has_conditional_age(&self) -> bool {
        self.cached.conditional_age.is_some()
    }

    /// Caption literal for one category.
    pub fn caption(&self, attribute: Attribute, index: usize) -> Option<&str> {
        let list = match attribute {
            Attribute::Mask => &self.captions.mask,
            Attribute::Gender => &self.captions.gender,
            Attribute::Age => &self.captions.age,
        };
        list.get(index).map(String::as_str)
    }

    /// `[K, embed_dim]` rows for one attribute, row `i` = category `i`.
    pub fn embeddings(&self, attribute: Attribute) -> ModelResult<Tensor> {
        let cached = match attribute {
            Attribute::Mask => &self.cached.mask,
            Attribute::Gender => &self.cached.gender,
            Attribute::Age => &self.cached.age,
        };
        self.project(cached)
    }

    /// `[6, 3, embed_dim]` age grid, subset `gender * 3 + mask`.
    pub fn conditional_age(&self) -> ModelResult<Tensor> {
        let grid = self.cached.conditional_age.as_ref().ok_or_else(|| ModelError::ConfigError {
            message: "caption bank was encoded without the conditional age grid".to_string(),
        })?;
        let (subsets, per, width) = grid.dims3()?;
        let flat = grid
            .reshape((subsets * per, width))
            .map_err(tensor_err("Conditional caption flatten failed"))?;
        self.project(&flat)?
            .reshape((subsets, per, self.embed_dim))
            .map_err(tensor_err("Conditional caption reshape failed"))
    }

    fn project(&self, rows: &Tensor) -> ModelResult<Tensor> {
        match &self.reprojection {
            Some(adapter) => adapter.project_text(rows),
            None => Ok(rows.clone()),
        }
    }
}
