//! Element-wise nonlinearities used between head layers.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::ModelResult;

/// Activation function types for head hidden layers.
///
/// # Variants
///
/// - `Relu`: max(0, x)
/// - `Gelu`: exact (erf) Gaussian Error Linear Unit
/// - `Hardswish`: x * relu6(x + 3) / 6
/// - `QuickGelu`: x * sigmoid(1.702 * x), the CLIP transformer MLP activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
    Hardswish,
    QuickGelu,
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> ModelResult<Tensor> {
        let y = match self {
            Activation::Relu => x.relu()?,
            Activation::Gelu => x.gelu_erf()?,
            Activation::Hardswish => {
                // relu6(x + 3) == relu(x + 3) - relu(x - 3)
                let upper = x.affine(1.0, 3.0)?.relu()?;
                let lower = x.affine(1.0, -3.0)?.relu()?;
                let relu6 = (upper - lower)?;
                (x * relu6)?.affine(1.0 / 6.0, 0.0)?
            }
            Activation::QuickGelu => {
                let gate = candle_nn::ops::sigmoid(&x.affine(1.702, 0.0)?)?;
                (x * gate)?
            }
        };
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn apply(act: Activation, values: &[f32]) -> Vec<f32> {
        let x = Tensor::new(values, &Device::Cpu).unwrap();
        act.forward(&x).unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_relu() {
        assert_eq!(apply(Activation::Relu, &[-1.0, 0.0, 2.0]), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_hardswish_regions() {
        let out = apply(Activation::Hardswish, &[-4.0, 0.0, 1.0, 4.0]);
        assert!(out[0].abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
        assert!((out[2] - 4.0 / 6.0).abs() < 1e-6);
        assert!((out[3] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_gelu_at_one() {
        let out = apply(Activation::Gelu, &[1.0]);
        assert!(out[0] > 0.84 && out[0] < 0.842);
    }

    #[test]
    fn test_quick_gelu_close_to_gelu() {
        let quick = apply(Activation::QuickGelu, &[1.0])[0];
        assert!((quick - 0.8413).abs() < 0.02);
    }
}
