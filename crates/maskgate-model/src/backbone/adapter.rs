//! Input validation in front of a backbone.

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{ModelError, ModelResult};

use super::{Backbone, BackboneDescriptor, TextInterface};

/// Shape-checking wrapper shared by every classifier variant.
///
/// A mismatch is caller misuse and surfaces as `ModelError::InputShape`;
/// resizing is the caller's job.
#[derive(Debug, Clone)]
pub struct BackboneAdapter {
    inner: Arc<dyn Backbone>,
}

impl BackboneAdapter {
    pub fn new(backbone: Arc<dyn Backbone>) -> Self {
        Self { inner: backbone }
    }

    pub fn descriptor(&self) -> &BackboneDescriptor {
        self.inner.descriptor()
    }

    pub fn feature_dim(&self) -> usize {
        self.descriptor().feature_dim
    }

    pub fn text(&self) -> Option<&TextInterface> {
        self.descriptor().text.as_ref()
    }

    /// Encode an image batch `[B, C, S, S]` into `[B, feature_dim]`.
    pub fn encode_image(&self, images: &Tensor) -> ModelResult<Tensor> {
        let desc = self.descriptor();
        let dims = images.dims();
        let batch = dims.first().copied().unwrap_or(0);
        let expected = desc.image_shape(batch);
        if dims != expected.as_slice() || batch == 0 {
            return Err(ModelError::InputShape {
                input: format!("{} images", desc.name),
                expected,
                actual: dims.to_vec(),
            });
        }

        let features = self.inner.encode_image(images)?;
        check_output(&desc.name, "image features", &features, batch, Some(desc.feature_dim))?;
        Ok(features)
    }

    /// Encode token ids `[N, context_length]` into `[N, embed_dim]`.
    pub fn encode_text(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        let (count, text) = self.check_tokens(tokens)?;
        let embeddings = self.inner.encode_text(tokens)?;
        check_output(&self.descriptor().name, "text embeddings", &embeddings, count, Some(text.embed_dim))?;
        Ok(embeddings)
    }

    /// Pooled text features `[N, F]` before the output projection.
    pub fn encode_text_features(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        let (count, _) = self.check_tokens(tokens)?;
        let features = self.inner.encode_text_features(tokens)?;
        check_output(&self.descriptor().name, "text features", &features, count, None)?;
        Ok(features)
    }

    /// Project `encode_text_features` rows into `[N, embed_dim]`.
    pub fn project_text(&self, features: &Tensor) -> ModelResult<Tensor> {
        let text = self.require_text()?;
        let rows = features.dim(0)?;
        let projected = self.inner.project_text(features)?;
        check_output(&self.descriptor().name, "projected text", &projected, rows, Some(text.embed_dim))?;
        Ok(projected)
    }

    fn require_text(&self) -> ModelResult<&TextInterface> {
        let desc = self.descriptor();
        desc.text.as_ref().ok_or_else(|| ModelError::Unsupported {
            message: format!("backbone '{}' has no text encoder", desc.name),
        })
    }

    fn check_tokens(&self, tokens: &Tensor) -> ModelResult<(usize, &TextInterface)> {
        let text = self.require_text()?;
        let dims = tokens.dims();
        let count = dims.first().copied().unwrap_or(0);
        let expected = vec![count, text.context_length];
        if dims != expected.as_slice() || count == 0 {
            return Err(ModelError::InputShape {
                input: format!("{} tokens", self.descriptor().name),
                expected,
                actual: dims.to_vec(),
            });
        }
        Ok((count, text))
    }
}

/// Backbone output must be `[rows, width]`; `width: None` accepts any width.
fn check_output(
    backbone: &str,
    what: &str,
    t: &Tensor,
    rows: usize,
    width: Option<usize>,
) -> ModelResult<()> {
    let dims = t.dims();
    let ok = dims.len() == 2 && dims[0] == rows && width.map_or(true, |w| dims[1] == w);
    if !ok {
        return Err(ModelError::InputShape {
            input: format!("{} {}", backbone, what),
            expected: vec![rows, width.unwrap_or(0)],
            actual: dims.to_vec(),
        });
    }
    Ok(())
}
