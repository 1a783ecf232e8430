//! Embedding comparison operations.
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `l2_normalize` | Unit vector normalization along the last dimension |
//! | `scaled_similarity` | `LOGIT_SCALE * a · bᵀ` over unit rows |
//! | `batched_scaled_similarity` | Per-sample comparison set `[B, D] x [B, K, D] -> [B, K]` |

use candle_core::{Tensor, D};

use crate::error::{tensor_err, ModelError, ModelResult};

/// Contrastive temperature of the pretrained backbone, applied to every
/// similarity before it is used as a logit.
pub const LOGIT_SCALE: f64 = 100.0;

/// Normalize each row to unit length.
///
/// `normalized = tensor / (||tensor||_2 + 1e-12)`
pub fn l2_normalize(tensor: &Tensor) -> ModelResult<Tensor> {
    let norm = tensor
        .sqr()
        .map_err(tensor_err("L2 sqr failed"))?
        .sum_keepdim(D::Minus1)
        .map_err(tensor_err("L2 sum failed"))?
        .sqrt()
        .map_err(tensor_err("L2 sqrt failed"))?;
    let norm = (norm + 1e-12).map_err(tensor_err("L2 eps failed"))?;
    tensor
        .broadcast_div(&norm)
        .map_err(tensor_err("L2 normalization failed"))
}

/// Similarity logits between image rows `[B, D]` and caption rows `[K, D]`.
///
/// Both sides are normalized here; callers pass raw embeddings.
pub fn scaled_similarity(image: &Tensor, text: &Tensor) -> ModelResult<Tensor> {
    let (_, image_dim) = image.dims2()?;
    let (_, text_dim) = text.dims2()?;
    if image_dim != text_dim {
        return Err(ModelError::dimension("similarity text embedding", image_dim, text_dim));
    }

    let image = l2_normalize(image)?;
    let text = l2_normalize(text)?;
    let logits = image
        .matmul(&text.t().map_err(tensor_err("Caption transpose failed"))?)
        .map_err(tensor_err("Similarity matmul failed"))?;
    (logits * LOGIT_SCALE).map_err(tensor_err("Logit scale failed"))
}

/// Similarity logits against a per-sample comparison set.
///
/// `image` is `[B, D]`, `text` is `[B, K, D]`; row `b` of the result compares
/// sample `b` only with its own `K` captions.
pub fn batched_scaled_similarity(image: &Tensor, text: &Tensor) -> ModelResult<Tensor> {
    let (batch, image_dim) = image.dims2()?;
    let (text_batch, _, text_dim) = text.dims3()?;
    if image_dim != text_dim {
        return Err(ModelError::dimension("similarity text embedding", image_dim, text_dim));
    }
    if batch != text_batch {
        return Err(ModelError::dimension("similarity comparison sets", batch, text_batch));
    }

    let image = l2_normalize(image)?
        .unsqueeze(1)
        .map_err(tensor_err("Image unsqueeze failed"))?;
    let text = l2_normalize(text)?
        .transpose(1, 2)
        .map_err(tensor_err("Caption transpose failed"))?
        .contiguous()
        .map_err(tensor_err("Caption contiguous failed"))?;

    // [B, 1, D] x [B, D, K] -> [B, 1, K]
    let logits = image
        .matmul(&text)
        .map_err(tensor_err("Batched similarity matmul failed"))?
        .squeeze(1)
        .map_err(tensor_err("Similarity squeeze failed"))?;
    (logits * LOGIT_SCALE).map_err(tensor_err("Logit scale failed"))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_l2_normalize_rows() {
        let t = Tensor::new(&[[3.0f32, 4.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let n = l2_normalize(&t).unwrap().to_vec2::<f32>().unwrap();
        assert!((n[0][0] - 0.6).abs() < 1e-6);
        assert!((n[0][1] - 0.8).abs() < 1e-6);
        assert!((n[1][1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_similarity_uses_temperature() {
        let image = Tensor::new(&[[2.0f32, 0.0]], &Device::Cpu).unwrap();
        let text = Tensor::new(&[[1.0f32, 0.0], [0.0, 5.0]], &Device::Cpu).unwrap();
        let logits = scaled_similarity(&image, &text).unwrap().to_vec2::<f32>().unwrap();
        assert!((logits[0][0] - 100.0).abs() < 1e-3);
        assert!(logits[0][1].abs() < 1e-3);
    }

    #[test]
    fn test_scaled_similarity_rejects_width_mismatch() {
        let image = Tensor::zeros((1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let text = Tensor::zeros((3, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            scaled_similarity(&image, &text),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_batched_similarity_is_per_sample() {
        let image = Tensor::new(&[[1.0f32, 0.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        // sample 0 sees its match first, sample 1 sees it last
        let text = Tensor::new(
            &[
                [[1.0f32, 0.0], [0.0, 1.0]],
                [[0.0f32, 1.0], [1.0, 0.0]],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let logits = batched_scaled_similarity(&image, &text).unwrap().to_vec2::<f32>().unwrap();
        assert!((logits[0][0] - 100.0).abs() < 1e-3);
        assert!((logits[1][1] - 100.0).abs() < 1e-3);
        assert!(logits[1][0].abs() < 1e-3);
    }
}
