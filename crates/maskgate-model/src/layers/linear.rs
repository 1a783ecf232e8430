//! Fully connected layer.

use candle_core::Tensor;

use crate::error::ModelResult;
use crate::params::{Init, ParamBuilder};

/// `y = x W^T + b` with `W: [out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, vb: &ParamBuilder) -> ModelResult<Self> {
        let init = Init::linear(in_dim);
        let weight = vb.get(&[out_dim, in_dim], "weight", init)?;
        let bias = if bias {
            Some(vb.get(&[out_dim], "bias", init)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Forward over `[batch, in]`.
    pub fn forward(&self, x: &Tensor) -> ModelResult<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(b) => Ok(y.broadcast_add(b)?),
            None => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::params::FreezePolicy;

    #[test]
    fn test_linear_shape_and_names() {
        let vb = ParamBuilder::fresh(FreezePolicy::trainable_all(), &Device::Cpu);
        let layer = Linear::new(16, 3, true, &vb.pp("mask").pp(0)).unwrap();
        let x = Tensor::ones((5, 16), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[5, 3]);

        let partition = vb.finish().unwrap();
        assert!(partition.is_trainable("mask.0.weight"));
        assert!(partition.is_trainable("mask.0.bias"));
    }

    #[test]
    fn test_linear_without_bias() {
        let vb = ParamBuilder::fresh(FreezePolicy::trainable_all(), &Device::Cpu);
        Linear::new(4, 2, false, &vb.pp("neck")).unwrap();
        let partition = vb.finish().unwrap();
        assert_eq!(partition.trainable().len(), 1);
    }
}
