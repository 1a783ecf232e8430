//! Conditional age routing.
//!
//! Coarse mask and gender predictions pick, per sample, which three age
//! captions the age embedding is compared against:
//!
//! ```text
//! mask_logits ──argmax──┐
//!                       ├─> table[gender][mask] ─> subset s_b ─> grid[s_b] : [3, D]
//! gender_logits ─argmax─┘
//! age_embedding[b] · grid[s_b]ᵀ * 100 ─> age_logits[b]
//! ```
//!
//! The argmax runs on detached logits, so age loss never reaches the mask
//! or gender heads through the selection. The gather is one `index_select`
//! over the whole batch.

use candle_core::{Tensor, D};

use crate::attributes::{AgeBand, Gender, MaskState};
use crate::captions::NUM_AGE_SUBSETS;
use crate::error::{tensor_err, ModelError, ModelResult};
use crate::ops::batched_scaled_similarity;

/// Lookup table from (gender, mask) to an age-caption subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalAgeResolver {
    table: [[u32; MaskState::NUM_CLASSES]; Gender::NUM_CLASSES],
}

impl Default for ConditionalAgeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionalAgeResolver {
    /// Subsets laid out gender-major: `gender * 3 + mask`.
    pub fn new() -> Self {
        let mut table = [[0u32; MaskState::NUM_CLASSES]; Gender::NUM_CLASSES];
        for gender in Gender::ALL {
            for mask in MaskState::ALL {
                table[gender.index()][mask.index()] = Self::subset_index(gender, mask) as u32;
            }
        }
        Self { table }
    }

    pub fn subset_index(gender: Gender, mask: MaskState) -> usize {
        gender.index() * MaskState::NUM_CLASSES + mask.index()
    }

    /// Subset chosen for every sample, as a `[B]` u32 tensor.
    pub fn selection_indices(&self, mask_logits: &Tensor, gender_logits: &Tensor) -> ModelResult<Tensor> {
        let (batch, mask_classes) = mask_logits.dims2()?;
        let (gender_batch, gender_classes) = gender_logits.dims2()?;
        if mask_classes != MaskState::NUM_CLASSES {
            return Err(ModelError::dimension("resolver mask logits", MaskState::NUM_CLASSES, mask_classes));
        }
        if gender_classes != Gender::NUM_CLASSES {
            return Err(ModelError::dimension("resolver gender logits", Gender::NUM_CLASSES, gender_classes));
        }
        if gender_batch != batch {
            return Err(ModelError::dimension("resolver gender batch", batch, gender_batch));
        }

        let mask = discretize(mask_logits)?;
        let gender = discretize(gender_logits)?;
        let selected: Vec<u32> = gender
            .iter()
            .zip(mask.iter())
            .map(|(&g, &m)| self.table[g as usize][m as usize])
            .collect();
        Ok(Tensor::from_vec(selected, batch, mask_logits.device())?)
    }

    /// Gather `[B, 3, D]` comparison sets from the `[6, 3, D]` grid.
    pub fn gather(&self, grid: &Tensor, indices: &Tensor) -> ModelResult<Tensor> {
        let (subsets, per, _) = grid.dims3()?;
        if subsets != NUM_AGE_SUBSETS {
            return Err(ModelError::dimension("conditional age grid subsets", NUM_AGE_SUBSETS, subsets));
        }
        if per != AgeBand::NUM_CLASSES {
            return Err(ModelError::dimension("conditional age grid captions", AgeBand::NUM_CLASSES, per));
        }
        grid.index_select(indices, 0)
            .map_err(tensor_err("Age caption gather failed"))
    }

    /// Age logits `[B, 3]` against each sample's own caption subset.
    pub fn resolve(
        &self,
        age_embedding: &Tensor,
        grid: &Tensor,
        mask_logits: &Tensor,
        gender_logits: &Tensor,
    ) -> ModelResult<Tensor> {
        let indices = self.selection_indices(mask_logits, gender_logits)?;
        let captions = self.gather(grid, &indices)?;
        batched_scaled_similarity(age_embedding, &captions)
    }
}

/// Non-differentiable argmax per row.
fn discretize(logits: &Tensor) -> ModelResult<Vec<u32>> {
    logits
        .detach()
        .argmax(D::Minus1)
        .map_err(tensor_err("Selection argmax failed"))?
        .to_vec1::<u32>()
        .map_err(tensor_err("Selection to vec failed"))
}
