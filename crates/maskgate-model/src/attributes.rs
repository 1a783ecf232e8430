//! Attribute domain: mask state, gender and age band.
//!
//! Category indices are significant. Logit column `i` of an attribute is the
//! model's confidence for the category whose `index()` is `i`, and caption
//! bank entries are stored in the same order.

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// The three predicted attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Mask,
    Gender,
    Age,
}

impl Attribute {
    /// All attributes in head order.
    pub const ALL: [Attribute; 3] = [Attribute::Mask, Attribute::Gender, Attribute::Age];

    /// Number of categories for this attribute.
    pub const fn num_classes(self) -> usize {
        match self {
            Attribute::Mask => MaskState::NUM_CLASSES,
            Attribute::Gender => Gender::NUM_CLASSES,
            Attribute::Age => AgeBand::NUM_CLASSES,
        }
    }

    /// Module name used for this attribute's classification head.
    pub const fn as_str(self) -> &'static str {
        match self {
            Attribute::Mask => "mask",
            Attribute::Gender => "gender",
            Attribute::Age => "age",
        }
    }

    /// Name of the image-side re-projection head (`mask_i`, ...).
    pub fn image_head(self) -> String {
        format!("{}_i", self.as_str())
    }

    /// Name of the text-side re-projection head (`mask_t`, ...).
    pub fn text_head(self) -> String {
        format!("{}_t", self.as_str())
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mask-wearing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskState {
    /// Mask worn correctly.
    Wear = 0,
    /// Mask worn improperly (nose or chin exposed).
    Incorrect = 1,
    /// No mask.
    NotWear = 2,
}

impl MaskState {
    pub const NUM_CLASSES: usize = 3;
    pub const ALL: [MaskState; 3] = [MaskState::Wear, MaskState::Incorrect, MaskState::NotWear];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Gender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Male = 0,
    Female = 1,
}

impl Gender {
    pub const NUM_CLASSES: usize = 2;
    pub const ALL: [Gender; 2] = [Gender::Male, Gender::Female];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Age bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgeBand {
    /// Under 30.
    Young = 0,
    /// 30 up to (not including) 60.
    Middle = 1,
    /// 60 and over.
    Old = 2,
}

impl AgeBand {
    pub const NUM_CLASSES: usize = 3;
    pub const ALL: [AgeBand; 3] = [AgeBand::Young, AgeBand::Middle, AgeBand::Old];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Bucket an age in years.
    pub fn from_years(years: u32) -> Self {
        match years {
            0..=29 => AgeBand::Young,
            30..=59 => AgeBand::Middle,
            _ => AgeBand::Old,
        }
    }
}

/// Number of combined (mask, gender, age) classes.
pub const NUM_COMBINED_CLASSES: usize =
    MaskState::NUM_CLASSES * Gender::NUM_CLASSES * AgeBand::NUM_CLASSES;

/// Decoded prediction for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributePrediction {
    pub mask: MaskState,
    pub gender: Gender,
    pub age: AgeBand,
}

impl AttributePrediction {
    /// Combined class index: `mask * 6 + gender * 3 + age`.
    pub fn class_index(&self) -> usize {
        self.mask.index() * Gender::NUM_CLASSES * AgeBand::NUM_CLASSES
            + self.gender.index() * AgeBand::NUM_CLASSES
            + self.age.index()
    }

    /// Inverse of [`class_index`](Self::class_index).
    pub fn from_class_index(class: usize) -> Option<Self> {
        if class >= NUM_COMBINED_CLASSES {
            return None;
        }
        let per_mask = Gender::NUM_CLASSES * AgeBand::NUM_CLASSES;
        Some(Self {
            mask: MaskState::from_index(class / per_mask)?,
            gender: Gender::from_index((class % per_mask) / AgeBand::NUM_CLASSES)?,
            age: AgeBand::from_index(class % AgeBand::NUM_CLASSES)?,
        })
    }
}

/// Per-attribute logits produced by one forward pass.
///
/// Shapes: mask `[batch, 3]`, gender `[batch, 2]`, age `[batch, 3]`.
#[derive(Debug, Clone)]
pub struct AttributeLogits {
    pub mask: Tensor,
    pub gender: Tensor,
    pub age: Tensor,
}

impl AttributeLogits {
    /// Logits for one attribute.
    pub fn get(&self, attribute: Attribute) -> &Tensor {
        match attribute {
            Attribute::Mask => &self.mask,
            Attribute::Gender => &self.gender,
            Attribute::Age => &self.age,
        }
    }

    /// Batch size shared by all three tensors.
    pub fn batch_size(&self) -> ModelResult<usize> {
        Ok(self.mask.dim(0)?)
    }

    /// Softmax probabilities per attribute.
    pub fn probabilities(&self) -> ModelResult<AttributeLogits> {
        Ok(AttributeLogits {
            mask: candle_nn::ops::softmax(&self.mask, D::Minus1)?,
            gender: candle_nn::ops::softmax(&self.gender, D::Minus1)?,
            age: candle_nn::ops::softmax(&self.age, D::Minus1)?,
        })
    }

    /// Argmax decode of every sample.
    pub fn predict(&self) -> ModelResult<Vec<AttributePrediction>> {
        let mask = argmax_rows(&self.mask)?;
        let gender = argmax_rows(&self.gender)?;
        let age = argmax_rows(&self.age)?;

        mask.iter()
            .zip(gender.iter())
            .zip(age.iter())
            .map(|((&m, &g), &a)| {
                let decoded = MaskState::from_index(m as usize).and_then(|mask| {
                    Some(AttributePrediction {
                        mask,
                        gender: Gender::from_index(g as usize)?,
                        age: AgeBand::from_index(a as usize)?,
                    })
                });
                decoded.ok_or_else(|| ModelError::TensorError {
                    message: format!("argmax out of range: mask={} gender={} age={}", m, g, a),
                })
            })
            .collect()
    }
}

/// Row-wise argmax of a `[batch, k]` tensor.
pub(crate) fn argmax_rows(logits: &Tensor) -> ModelResult<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
}
