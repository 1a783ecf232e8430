//! Deterministic parameter initializers.
//!
//! Values are a low-discrepancy sequence offset by a hash of the parameter
//! name, so two builds of the same architecture produce bit-identical fresh
//! heads while distinct parameters still differ.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use candle_core::{DType, Device, Tensor};

use crate::error::ModelResult;

/// Golden-ratio conjugate stride.
const STRIDE: f64 = 0.618_033_988_749_894_9;

/// Initializer used when a parameter is not present in the source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Const(f64),
    /// Uniform-like values in `[-bound, bound]`.
    Uniform(f64),
}

impl Init {
    /// PyTorch-style linear init bound: `1 / sqrt(fan_in)`.
    pub fn linear(fan_in: usize) -> Self {
        Init::Uniform(1.0 / (fan_in.max(1) as f64).sqrt())
    }

    /// Xavier/Glorot bound for `[fan_out, fan_in]` projections.
    pub fn xavier(fan_in: usize, fan_out: usize) -> Self {
        Init::Uniform((6.0 / (fan_in + fan_out).max(1) as f64).sqrt())
    }

    pub(crate) fn tensor(
        self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> ModelResult<Tensor> {
        let tensor = match self {
            Init::Zeros => Tensor::zeros(shape, dtype, device)?,
            Init::Ones => Tensor::ones(shape, dtype, device)?,
            Init::Const(v) => (Tensor::ones(shape, dtype, device)? * v)?,
            Init::Uniform(bound) => {
                let count: usize = shape.iter().product();
                let offset = name_offset(name);
                let data: Vec<f32> = (0..count)
                    .map(|i| {
                        let u = (i as f64 * STRIDE + offset).fract();
                        ((u * 2.0 - 1.0) * bound) as f32
                    })
                    .collect();
                Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?
            }
        };
        Ok(tensor)
    }
}

fn name_offset(name: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as f64 / u64::MAX as f64).fract()
}
