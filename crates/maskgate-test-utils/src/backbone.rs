//! Parameter-light backbone with exactly controllable outputs.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use maskgate_model::{
    Backbone, BackboneDescriptor, BackboneLoader, Init, ModelResult, ParamBuilder, TextInterface,
};

/// Side of the square input images.
pub const IMAGE_SIZE: usize = 2;

/// Image features are per-channel spatial means times a frozen `scale`
/// (all ones); text features are rows of a fixed table indexed by the first
/// token id.
#[derive(Debug)]
pub struct LookupBackbone {
    descriptor: BackboneDescriptor,
    scale: Tensor,
    table: Tensor,
}

impl Backbone for LookupBackbone {
    fn descriptor(&self) -> &BackboneDescriptor {
        &self.descriptor
    }

    fn encode_image(&self, images: &Tensor) -> ModelResult<Tensor> {
        Ok(images.mean((2, 3))?.broadcast_mul(&self.scale)?)
    }

    fn encode_text_features(&self, tokens: &Tensor) -> ModelResult<Tensor> {
        let first = tokens.narrow(1, 0, 1)?.flatten_all()?;
        Ok(self.table.index_select(&first, 0)?)
    }
}

/// Builds [`LookupBackbone`] with `dim` channels and the given text table.
///
/// Row `i` of `table` answers token id `i`; row 0 is the pad token.
#[derive(Debug, Clone)]
pub struct LookupBackboneLoader {
    pub table: Tensor,
    pub context_length: usize,
}

impl LookupBackboneLoader {
    pub fn new(table: Tensor) -> Self {
        Self {
            table,
            context_length: 4,
        }
    }

    pub fn dim(&self) -> usize {
        self.table.dims()[1]
    }
}

impl BackboneLoader for LookupBackboneLoader {
    fn load(&self, vb: &ParamBuilder) -> ModelResult<Arc<dyn Backbone>> {
        let dim = self.dim();
        let scale = vb.get(&[dim], "scale", Init::Ones)?;
        Ok(Arc::new(LookupBackbone {
            descriptor: BackboneDescriptor {
                name: "lookup".to_string(),
                image_channels: dim,
                image_size: IMAGE_SIZE,
                feature_dim: dim,
                text: Some(TextInterface {
                    context_length: self.context_length,
                    embed_dim: dim,
                    projection: None,
                }),
            },
            scale,
            table: self.table.to_device(vb.device())?,
        }))
    }
}

/// `[B, dim, IMAGE_SIZE, IMAGE_SIZE]` images whose channel means are `features`.
pub fn images_from_features(features: &[Vec<f32>], device: &Device) -> Tensor {
    let dim = features[0].len();
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    let data: Vec<f32> = features
        .iter()
        .flat_map(|f| f.iter().flat_map(move |&v| std::iter::repeat(v).take(plane)))
        .collect();
    Tensor::from_vec(data, (features.len(), dim, IMAGE_SIZE, IMAGE_SIZE), device)
        .expect("feature images")
}
