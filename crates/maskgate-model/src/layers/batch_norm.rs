//! 1-D batch normalization with running statistics.
//!
//! Train mode normalizes with batch statistics and folds them into the
//! running estimates; eval mode normalizes with the running estimates and
//! leaves them untouched.

use candle_core::Tensor;

use crate::error::{ModelError, ModelResult};
use crate::params::{Buffer, Init, ParamBuilder};

pub const BN_EPS: f64 = 1e-5;
pub const BN_MOMENTUM: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Buffer,
    running_var: Buffer,
    num_features: usize,
    eps: f64,
    momentum: f64,
}

impl BatchNorm1d {
    pub fn new(num_features: usize, vb: &ParamBuilder) -> ModelResult<Self> {
        Ok(Self {
            weight: vb.get(&[num_features], "weight", Init::Ones)?,
            bias: vb.get(&[num_features], "bias", Init::Zeros)?,
            running_mean: vb.buffer(&[num_features], "running_mean", Init::Zeros)?,
            running_var: vb.buffer(&[num_features], "running_var", Init::Ones)?,
            num_features,
            eps: BN_EPS,
            momentum: BN_MOMENTUM,
        })
    }

    pub fn running_mean(&self) -> Tensor {
        self.running_mean.get()
    }

    pub fn running_var(&self) -> Tensor {
        self.running_var.get()
    }

    /// Forward over `[batch, num_features]`.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> ModelResult<Tensor> {
        let (batch, features) = x.dims2()?;
        if features != self.num_features {
            return Err(ModelError::dimension("BatchNorm1d input", self.num_features, features));
        }

        let (mean, var) = if train {
            let mean = x.mean_keepdim(0)?;
            let var = x.broadcast_sub(&mean)?.sqr()?.mean_keepdim(0)?;
            self.update_running(&mean, &var, batch)?;
            (mean, var)
        } else {
            (
                self.running_mean.get().unsqueeze(0)?,
                self.running_var.get().unsqueeze(0)?,
            )
        };

        let normalized = x
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normalized
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, batch: usize) -> ModelResult<()> {
        // running_var tracks the unbiased estimate
        let correction = if batch > 1 {
            batch as f64 / (batch as f64 - 1.0)
        } else {
            1.0
        };
        let m = self.momentum;
        let mean = mean.squeeze(0)?.detach();
        let var = (var.squeeze(0)?.detach() * correction)?;

        let new_mean = ((self.running_mean.get() * (1.0 - m))? + (mean * m)?)?;
        let new_var = ((self.running_var.get() * (1.0 - m))? + (var * m)?)?;
        self.running_mean.set(new_mean);
        self.running_var.set(new_var);
        Ok(())
    }
}
