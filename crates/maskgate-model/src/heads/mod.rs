//! Projection heads: feed-forward stacks from a feature vector to logits or
//! a shared embedding.
//!
//! Input and output widths are fixed at construction. The only state that
//! changes across calls is batch-norm running statistics, which move during
//! `forward_t(.., train = true)` and stay put otherwise.

mod config;

pub use config::{HeadConfig, NormKind};

use candle_core::Tensor;

use crate::error::{ModelError, ModelResult};
use crate::layers::{dropout, Activation, BatchNorm1d, LayerNorm, Linear};
use crate::params::ParamBuilder;

#[derive(Debug, Clone)]
enum Stage {
    Linear(Linear),
    BatchNorm(BatchNorm1d),
    LayerNorm(LayerNorm),
    Activation(Activation),
    Dropout(f32),
}

impl Stage {
    fn forward_t(&self, x: &Tensor, train: bool) -> ModelResult<Tensor> {
        match self {
            Stage::Linear(l) => l.forward(x),
            Stage::BatchNorm(bn) => bn.forward_t(x, train),
            Stage::LayerNorm(ln) => ln.forward(x),
            Stage::Activation(act) => act.forward(x),
            Stage::Dropout(p) => dropout(x, *p, train),
        }
    }
}

/// Sequential projection head.
#[derive(Debug, Clone)]
pub struct ProjectionHead {
    name: String,
    stages: Vec<Stage>,
    in_dim: usize,
    out_dim: usize,
}

impl ProjectionHead {
    /// Build the head under `vb`'s current path.
    ///
    /// # Errors
    /// - `ModelError::DimensionMismatch` if `config.input_dim` disagrees with `in_dim`
    /// - `ModelError::ConfigError` for an invalid layer stack
    /// - `ModelError::CheckpointLoad` if a stored tensor has the wrong shape
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        config: &HeadConfig,
        vb: &ParamBuilder,
    ) -> ModelResult<Self> {
        let name = vb.prefix();
        if let Some(declared) = config.input_dim {
            if declared != in_dim {
                return Err(ModelError::dimension(
                    format!("head '{}' input", name),
                    in_dim,
                    declared,
                ));
            }
        }
        config.validate().map_err(|message| ModelError::ConfigError {
            message: format!("head '{}': {}", name, message),
        })?;

        let mut stages = Vec::new();
        let mut width = in_dim;
        for &hidden in &config.hidden_dims {
            let idx = stages.len();
            stages.push(Stage::Linear(Linear::new(width, hidden, config.hidden_bias, &vb.pp(idx))?));
            if let Some(norm) = norm_stage(config.norm, hidden, &vb.pp(stages.len()))? {
                stages.push(norm);
            }
            stages.push(Stage::Activation(config.activation));
            if let Some(p) = config.dropout {
                stages.push(Stage::Dropout(p));
            }
            width = hidden;
        }
        let idx = stages.len();
        stages.push(Stage::Linear(Linear::new(width, out_dim, config.output_bias, &vb.pp(idx))?));
        if let Some(norm) = norm_stage(config.output_norm, out_dim, &vb.pp(stages.len()))? {
            stages.push(norm);
        }

        tracing::debug!(head = %name, in_dim, out_dim, stages = stages.len(), "Projection head built");

        Ok(Self {
            name,
            stages,
            in_dim,
            out_dim,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Forward over `[batch, in_dim]`, producing `[batch, out_dim]`.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> ModelResult<Tensor> {
        let (_, width) = x.dims2()?;
        if width != self.in_dim {
            return Err(ModelError::dimension(
                format!("head '{}' input", self.name),
                self.in_dim,
                width,
            ));
        }
        let mut h = x.clone();
        for stage in &self.stages {
            h = stage.forward_t(&h, train)?;
        }
        Ok(h)
    }
}

fn norm_stage(kind: NormKind, width: usize, vb: &ParamBuilder) -> ModelResult<Option<Stage>> {
    Ok(match kind {
        NormKind::None => None,
        NormKind::Batch => Some(Stage::BatchNorm(BatchNorm1d::new(width, vb)?)),
        NormKind::Layer => Some(Stage::LayerNorm(LayerNorm::new(width, vb)?)),
    })
}
