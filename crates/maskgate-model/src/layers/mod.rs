//! Building blocks for projection heads.
//!
//! All layers keep PyTorch's parameter layout (`Linear` weight is `[out, in]`)
//! so checkpoints written by one variant load into another slot-for-slot.

mod activation;
mod batch_norm;
mod layer_norm;
mod linear;

pub use activation::Activation;
pub use batch_norm::{BatchNorm1d, BN_EPS, BN_MOMENTUM};
pub use layer_norm::{layer_norm, LayerNorm, LN_EPS};
pub use linear::Linear;

use candle_core::Tensor;

use crate::error::ModelResult;

/// Inverted dropout, active only when `train` is set.
pub fn dropout(x: &Tensor, p: f32, train: bool) -> ModelResult<Tensor> {
    if !train || p <= 0.0 {
        return Ok(x.clone());
    }
    Ok(candle_nn::ops::dropout(x, p)?)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn test_dropout_identity_in_eval() {
        let x = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
        let y = dropout(&x, 0.5, false).unwrap();
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0; 32]
        );
    }

    #[test]
    fn test_dropout_scales_survivors_in_train() {
        let x = Tensor::ones((16, 16), DType::F32, &Device::Cpu).unwrap();
        let y = dropout(&x, 0.5, true).unwrap();
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
    }
}
