//! Built-in caption wording.
//!
//! Captions act as classifier weights: rewording one moves the decision
//! boundary, so any change here bumps [`CAPTION_BANK_VERSION`].

use serde::{Deserialize, Serialize};

use crate::attributes::{AgeBand, Gender, MaskState};
use crate::error::{ModelError, ModelResult};

/// Version of the built-in wording below.
pub const CAPTION_BANK_VERSION: &str = "2";

const MASK_PHRASES: [&str; MaskState::NUM_CLASSES] = [
    "wearing a face mask properly",
    "wearing a face mask improperly, with the nose or mouth uncovered",
    "not wearing a face mask",
];

const PEOPLE: [&str; Gender::NUM_CLASSES] = ["man", "woman"];

const AGE_WORDS: [&str; AgeBand::NUM_CLASSES] = ["young", "middle-aged", "old"];

/// Literal caption strings, category order matching attribute indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionSet {
    /// Identifies the wording; logged with every encoded bank.
    pub version: String,
    pub mask: Vec<String>,
    pub gender: Vec<String>,
    pub age: Vec<String>,
    /// `conditional_age[gender][mask]` holds the three age captions for that
    /// (gender, mask) pair.
    pub conditional_age: Vec<Vec<Vec<String>>>,
}

impl Default for CaptionSet {
    fn default() -> Self {
        Self {
            version: CAPTION_BANK_VERSION.to_string(),
            mask: MASK_PHRASES
                .iter()
                .map(|m| format!("a photo of a person {}", m))
                .collect(),
            gender: PEOPLE.iter().map(|p| format!("a photo of a {}", p)).collect(),
            age: vec![
                "a photo of a person younger than 30 years old".to_string(),
                "a photo of a person between 30 and 60 years old".to_string(),
                "a photo of a person 60 years old or older".to_string(),
            ],
            conditional_age: PEOPLE
                .iter()
                .map(|person| {
                    MASK_PHRASES
                        .iter()
                        .map(|mask| {
                            AGE_WORDS
                                .iter()
                                .map(|age| format!("a photo of a {} {} {}", age, person, mask))
                                .collect()
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

impl CaptionSet {
    /// Every list must have one caption per category.
    ///
    /// # Errors
    /// - `ModelError::DimensionMismatch` naming the offending list
    pub fn validate(&self) -> ModelResult<()> {
        check_len("captions.mask", MaskState::NUM_CLASSES, self.mask.len())?;
        check_len("captions.gender", Gender::NUM_CLASSES, self.gender.len())?;
        check_len("captions.age", AgeBand::NUM_CLASSES, self.age.len())?;
        check_len("captions.conditional_age", Gender::NUM_CLASSES, self.conditional_age.len())?;
        for (g, by_mask) in self.conditional_age.iter().enumerate() {
            check_len(
                &format!("captions.conditional_age[{}]", g),
                MaskState::NUM_CLASSES,
                by_mask.len(),
            )?;
            for (m, ages) in by_mask.iter().enumerate() {
                check_len(
                    &format!("captions.conditional_age[{}][{}]", g, m),
                    AgeBand::NUM_CLASSES,
                    ages.len(),
                )?;
            }
        }
        Ok(())
    }

    /// Conditional captions flattened in `gender * 3 + mask` subset order.
    pub fn conditional_flat(&self) -> Vec<String> {
        self.conditional_age.iter().flatten().flatten().cloned().collect()
    }

    /// The three age captions used when `gender` and `mask` are predicted.
    pub fn conditional_subset(&self, gender: Gender, mask: MaskState) -> Option<&[String]> {
        self.conditional_age
            .get(gender.index())?
            .get(mask.index())
            .map(Vec::as_slice)
    }
}

fn check_len(component: &str, expected: usize, actual: usize) -> ModelResult<()> {
    if expected != actual {
        return Err(ModelError::dimension(component, expected, actual));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_is_valid() {
        let set = CaptionSet::default();
        assert!(set.validate().is_ok());
        assert_eq!(set.conditional_flat().len(), 18);
        assert_eq!(set.version, CAPTION_BANK_VERSION);
    }

    #[test]
    fn test_conditional_subset_is_gender_major() {
        let set = CaptionSet::default();
        let subset = set.conditional_subset(Gender::Male, MaskState::Incorrect).unwrap();
        assert!(subset.iter().all(|c| c.contains(" man ") && c.contains("improperly")));
        let flat = set.conditional_flat();
        assert_eq!(&flat[3..6], subset);
    }

    #[test]
    fn test_wrong_count_is_dimension_mismatch() {
        let mut set = CaptionSet::default();
        set.gender.push("a photo of a child".to_string());
        match set.validate() {
            Err(ModelError::DimensionMismatch { component, expected, actual }) => {
                assert_eq!(component, "captions.gender");
                assert_eq!((expected, actual), (2, 3));
            }
            other => panic!("expected DimensionMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_conditional_subset_must_hold_three() {
        let mut set = CaptionSet::default();
        set.conditional_age[1][2].pop();
        assert!(matches!(
            set.validate(),
            Err(ModelError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
    }
}
