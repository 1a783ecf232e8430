//! Layer normalization over the last dimension.

use candle_core::{Tensor, D};

use crate::error::{tensor_err, ModelResult};
use crate::params::{Init, ParamBuilder};

/// Default epsilon, matching PyTorch and CLIP.
pub const LN_EPS: f64 = 1e-5;

/// Layer normalization for tensors of any rank, normalizing the last dimension.
pub fn layer_norm(hidden_states: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> ModelResult<Tensor> {
    let mean = hidden_states
        .mean_keepdim(D::Minus1)
        .map_err(tensor_err("LayerNorm mean failed"))?;
    let centered = hidden_states
        .broadcast_sub(&mean)
        .map_err(tensor_err("LayerNorm center failed"))?;
    let var = centered
        .sqr()
        .map_err(tensor_err("LayerNorm sqr failed"))?
        .mean_keepdim(D::Minus1)
        .map_err(tensor_err("LayerNorm var mean failed"))?;

    let std = (var + eps)
        .map_err(tensor_err("LayerNorm eps add failed"))?
        .sqrt()
        .map_err(tensor_err("LayerNorm sqrt failed"))?;
    let normalized = centered
        .broadcast_div(&std)
        .map_err(tensor_err("LayerNorm div failed"))?;

    normalized
        .broadcast_mul(weight)
        .map_err(tensor_err("LayerNorm scale failed"))?
        .broadcast_add(bias)
        .map_err(tensor_err("LayerNorm shift failed"))
}

/// Affine layer normalization module.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, vb: &ParamBuilder) -> ModelResult<Self> {
        Ok(Self {
            weight: vb.get(&[dim], "weight", Init::Ones)?,
            bias: vb.get(&[dim], "bias", Init::Zeros)?,
            eps: LN_EPS,
        })
    }

    pub fn forward(&self, x: &Tensor) -> ModelResult<Tensor> {
        layer_norm(x, &self.weight, &self.bias, self.eps)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::params::FreezePolicy;

    #[test]
    fn test_layer_norm_zero_mean_unit_variance() {
        let vb = ParamBuilder::fresh(FreezePolicy::trainable_all(), &Device::Cpu);
        let ln = LayerNorm::new(4, &vb).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let y: Vec<f32> = ln.forward(&x).unwrap().get(0).unwrap().to_vec1().unwrap();

        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        let var: f32 = y.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }
}
