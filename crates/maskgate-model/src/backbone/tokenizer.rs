//! Caption tokenization for text towers.

use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::error::{ModelError, ModelResult};

/// Turns captions into a `[N, context_length]` id tensor.
pub trait CaptionTokenizer: Send + Sync {
    fn context_length(&self) -> usize;

    fn tokenize(&self, captions: &[String], device: &Device) -> ModelResult<Tensor>;
}

/// CLIP BPE tokenizer loaded from a HuggingFace `tokenizer.json`.
///
/// Sequences are truncated or zero-padded to the context length. Truncation
/// keeps the end-of-text token in the last slot, since the text tower pools
/// at the position of the largest id.
pub struct ClipTokenizer {
    tokenizer: Tokenizer,
    context_length: usize,
}

impl ClipTokenizer {
    pub fn new(tokenizer: Tokenizer, context_length: usize) -> Self {
        Self {
            tokenizer,
            context_length,
        }
    }

    pub fn from_file(path: impl AsRef<Path>, context_length: usize) -> ModelResult<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| ModelError::TokenizationError {
            message: format!("Failed to load tokenizer from {}: {}", path.display(), e),
        })?;
        tracing::info!(path = %path.display(), context_length, "Loaded caption tokenizer");
        Ok(Self::new(tokenizer, context_length))
    }
}

impl CaptionTokenizer for ClipTokenizer {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn tokenize(&self, captions: &[String], device: &Device) -> ModelResult<Tensor> {
        let mut ids = Vec::with_capacity(captions.len() * self.context_length);
        for caption in captions {
            let encoding =
                self.tokenizer
                    .encode(caption.as_str(), true)
                    .map_err(|e| ModelError::TokenizationError {
                        message: format!("CLIP tokenization failed for '{}': {}", caption, e),
                    })?;
            ids.extend(fit_to_context(encoding.get_ids(), self.context_length));
        }
        Ok(Tensor::from_vec(ids, (captions.len(), self.context_length), device)?)
    }
}

/// Truncate or zero-pad `ids` to `len`, keeping the final token last.
pub(crate) fn fit_to_context(ids: &[u32], len: usize) -> Vec<u32> {
    let mut out: Vec<u32> = ids.iter().copied().take(len).collect();
    if ids.len() > len && len > 0 {
        if let (Some(slot), Some(&last)) = (out.last_mut(), ids.last()) {
            *slot = last;
        }
    }
    out.resize(len, 0);
    out
}
