//! Small backbones and tokenizers for unit tests.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::backbone::{
    Backbone, BackboneDescriptor, BackboneLoader, CaptionTokenizer, TextInterface, BACKBONE_PREFIX,
};
use crate::error::ModelResult;
use crate::layers::Linear;
use crate::params::{Init, ParamBuilder};

pub(crate) const CHANNELS: usize = 3;
pub(crate) const IMAGE_SIZE: usize = 4;
pub(crate) const VOCAB: usize = 64;
pub(crate) const CONTEXT: usize = 6;

/// Spatial mean then a frozen linear map; text is mean-pooled embeddings.
#[derive(Debug)]
pub(crate) struct StubBackbone {
    descriptor: BackboneDescriptor,
    image_proj: Tensor,
    token_embedding: Tensor,
    text_projection: Linear,
}

impl Backbone for StubBackbone {
    fn descriptor(&self) -> &BackboneDescriptor {
        &self.descriptor
    }

    fn encode_image(&self, images: &Tensor) -> ModelResult<Tensor> {
        let pooled = images.mean((2, 3))?;
        Ok(pooled.matmul(&self.image_proj.t()?)?)
    }

    fn encode_text_features(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        let (n, len) = tokens.dims2()?;
        let width = self.token_embedding.dim(1)?;
        let flat = tokens.flatten_all()?;
        let rows = self.token_embedding.index_select(&flat, 0)?;
        Ok(rows.reshape((n, len, width))?.mean(1)?)
    }

    fn project_text(&self, features: &Tensor) -> ModelResult<Tensor> {
        self.text_projection.forward(features)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StubLoader {
    pub feature_dim: usize,
    pub text_width: usize,
    pub embed_dim: usize,
}

impl StubLoader {
    pub(crate) fn new(feature_dim: usize, embed_dim: usize) -> Self {
        Self {
            feature_dim,
            text_width: 8,
            embed_dim,
        }
    }
}

impl BackboneLoader for StubLoader {
    fn load(&self, vb: &ParamBuilder) -> ModelResult<Arc<dyn Backbone>> {
        let image_proj = vb.get(&[self.feature_dim, CHANNELS], "image_proj.weight", Init::linear(CHANNELS))?;
        let token_embedding = vb.get(&[VOCAB, self.text_width], "token_embedding.weight", Init::Uniform(1.0))?;
        let text_projection = Linear::new(self.text_width, self.embed_dim, false, &vb.pp("text_projection"))?;
        Ok(Arc::new(StubBackbone {
            descriptor: BackboneDescriptor {
                name: "stub".to_string(),
                image_channels: CHANNELS,
                image_size: IMAGE_SIZE,
                feature_dim: self.feature_dim,
                text: Some(TextInterface {
                    context_length: CONTEXT,
                    embed_dim: self.embed_dim,
                    projection: Some(format!("{}.text_projection", BACKBONE_PREFIX)),
                }),
            },
            image_proj,
            token_embedding,
            text_projection,
        }))
    }

    fn default_trainable(&self) -> Vec<String> {
        vec![format!("{}.text_projection", BACKBONE_PREFIX)]
    }
}

/// Folds every byte of a caption into `CONTEXT` ids.
pub(crate) struct ByteTokenizer;

impl CaptionTokenizer for ByteTokenizer {
    fn context_length(&self) -> usize {
        CONTEXT
    }

    fn tokenize(&self, captions: &[String], device: &Device) -> ModelResult<Tensor> {
        let mut ids = Vec::with_capacity(captions.len() * CONTEXT);
        for caption in captions {
            let mut row = [0u32; CONTEXT];
            for (j, b) in caption.bytes().enumerate() {
                row[j % CONTEXT] = row[j % CONTEXT].wrapping_mul(31).wrapping_add(b as u32 * (j as u32 + 1));
            }
            ids.extend(row.iter().map(|v| 1 + v % (VOCAB as u32 - 1)));
        }
        Ok(Tensor::from_vec(ids, (captions.len(), CONTEXT), device)?)
    }
}

pub(crate) fn images(batch: usize) -> Tensor {
    let n = batch * CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
    Tensor::arange(0f32, n as f32, &Device::Cpu)
        .and_then(|t| t.affine(1.0 / n as f64, -0.5))
        .and_then(|t| t.reshape((batch, CHANNELS, IMAGE_SIZE, IMAGE_SIZE)))
        .and_then(|t| t.to_dtype(DType::F32))
        .unwrap()
}
