//! Synthetic captions with one-hot embeddings.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use maskgate_model::{
    AgeBand, CaptionSet, CaptionTokenizer, ConditionalAgeResolver, Gender, MaskState, ModelError,
    ModelResult, CAPTION_BANK_VERSION,
};

pub const MASK_OFFSET: usize = 0;
pub const GENDER_OFFSET: usize = MASK_OFFSET + MaskState::NUM_CLASSES;
pub const AGE_OFFSET: usize = GENDER_OFFSET + Gender::NUM_CLASSES;
pub const GRID_OFFSET: usize = AGE_OFFSET + AgeBand::NUM_CLASSES;
/// 3 mask + 2 gender + 3 age + 18 conditional age captions.
pub const NUM_CAPTIONS: usize = GRID_OFFSET + 6 * AgeBand::NUM_CLASSES;

/// Unique, human-readable captions in bank order.
pub fn synthetic_captions() -> CaptionSet {
    CaptionSet {
        version: CAPTION_BANK_VERSION.to_string(),
        mask: (0..MaskState::NUM_CLASSES).map(|m| format!("mask {}", m)).collect(),
        gender: (0..Gender::NUM_CLASSES).map(|g| format!("gender {}", g)).collect(),
        age: (0..AgeBand::NUM_CLASSES).map(|a| format!("age {}", a)).collect(),
        conditional_age: (0..Gender::NUM_CLASSES)
            .map(|g| {
                (0..MaskState::NUM_CLASSES)
                    .map(|m| {
                        (0..AgeBand::NUM_CLASSES)
                            .map(|a| format!("age {} for gender {} mask {}", a, g, m))
                            .collect()
                    })
                    .collect()
            })
            .collect(),
    }
}

/// Embedding row (and token id minus one) of a caption in bank order.
pub fn caption_row(offset: usize, index: usize) -> usize {
    offset + index
}

/// `[rows + 1, dim]` table: row 0 is padding, row `k + 1` is `e_k`.
pub fn one_hot_table(rows: usize, dim: usize, device: &Device) -> Tensor {
    assert!(rows <= dim, "one-hot rows need rows <= dim");
    let mut data = vec![0f32; (rows + 1) * dim];
    for k in 0..rows {
        data[(k + 1) * dim + k] = 1.0;
    }
    Tensor::from_vec(data, (rows + 1, dim), device).expect("one-hot table")
}

/// Image feature pointing at the mask, gender, age and conditional-age
/// captions of one combination.
pub fn attribute_feature(mask: MaskState, gender: Gender, age: AgeBand, dim: usize) -> Vec<f32> {
    let subset = ConditionalAgeResolver::subset_index(gender, mask);
    let mut feature = vec![0f32; dim];
    for row in [
        caption_row(MASK_OFFSET, mask.index()),
        caption_row(GENDER_OFFSET, gender.index()),
        caption_row(AGE_OFFSET, age.index()),
        caption_row(GRID_OFFSET, subset * AgeBand::NUM_CLASSES + age.index()),
    ] {
        feature[row] = 1.0;
    }
    feature
}

/// Maps each known caption to a single token id, zero-padded.
pub struct LookupTokenizer {
    ids: HashMap<String, u32>,
    context_length: usize,
}

impl LookupTokenizer {
    /// Ids follow bank order starting at 1.
    pub fn for_captions(captions: &CaptionSet, context_length: usize) -> Self {
        let ids = captions
            .mask
            .iter()
            .chain(&captions.gender)
            .chain(&captions.age)
            .cloned()
            .chain(captions.conditional_flat())
            .enumerate()
            .map(|(i, c)| (c, i as u32 + 1))
            .collect();
        Self { ids, context_length }
    }
}

impl CaptionTokenizer for LookupTokenizer {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn tokenize(&self, captions: &[String], device: &Device) -> ModelResult<Tensor> {
        let mut data = vec![0u32; captions.len() * self.context_length];
        for (row, caption) in captions.iter().enumerate() {
            let id = self.ids.get(caption).ok_or_else(|| ModelError::TokenizationError {
                message: format!("unknown caption '{}'", caption),
            })?;
            data[row * self.context_length] = *id;
        }
        Ok(Tensor::from_vec(data, (captions.len(), self.context_length), device)?)
    }
}
