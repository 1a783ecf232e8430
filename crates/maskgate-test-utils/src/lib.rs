//! Deterministic backbones, tokenizers and caption sets for tests.
//!
//! Caption rows are one-hot, so an image whose channel means are a sum of
//! caption rows has a known argmax for every attribute.

mod backbone;
mod captions;

pub use backbone::{images_from_features, LookupBackbone, LookupBackboneLoader, IMAGE_SIZE};
pub use captions::{
    attribute_feature, caption_row, one_hot_table, synthetic_captions, LookupTokenizer, AGE_OFFSET,
    GENDER_OFFSET, GRID_OFFSET, MASK_OFFSET, NUM_CAPTIONS,
};
