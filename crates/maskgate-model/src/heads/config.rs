//! Projection head configuration and presets.

use serde::{Deserialize, Serialize};

use crate::layers::Activation;

/// Normalization applied after each hidden linear layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    None,
    #[default]
    Batch,
    Layer,
}

fn default_hidden_dims() -> Vec<usize> {
    vec![512, 128]
}

fn default_true() -> bool {
    true
}

/// Layer stack of one projection head.
///
/// Each hidden width contributes `Linear -> norm -> activation [-> Dropout]`;
/// the stack ends in a `Linear` to the output width, optionally followed by a
/// normalization layer. Indices in parameter names count every stage, so
/// `[512, 128]` with batch norm yields `0` (linear), `1` (bn), `3` (linear),
/// `4` (bn) and `6` (output linear).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Hidden layer widths, in order (default: [512, 128]).
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,

    /// Normalization after each hidden linear (default: batch).
    #[serde(default)]
    pub norm: NormKind,

    /// Hidden nonlinearity (default: relu).
    #[serde(default)]
    pub activation: Activation,

    /// Dropout probability after each hidden activation. `None` adds no stage.
    #[serde(default)]
    pub dropout: Option<f32>,

    /// Bias on hidden linears (default: true).
    #[serde(default = "default_true")]
    pub hidden_bias: bool,

    /// Bias on the output linear (default: true).
    #[serde(default = "default_true")]
    pub output_bias: bool,

    /// Normalization after the output linear (default: none).
    #[serde(default = "default_output_norm")]
    pub output_norm: NormKind,

    /// Declared input width. Checked against the upstream width at construction.
    #[serde(default)]
    pub input_dim: Option<usize>,
}

fn default_output_norm() -> NormKind {
    NormKind::None
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self::batch_norm_mlp()
    }
}

impl HeadConfig {
    /// `Linear -> BN -> ReLU` twice (512, 128), then the output linear.
    pub fn batch_norm_mlp() -> Self {
        Self {
            hidden_dims: default_hidden_dims(),
            norm: NormKind::Batch,
            activation: Activation::Relu,
            dropout: None,
            hidden_bias: true,
            output_bias: true,
            output_norm: NormKind::None,
            input_dim: None,
        }
    }

    /// A single linear layer.
    pub fn linear() -> Self {
        Self {
            hidden_dims: Vec::new(),
            norm: NormKind::None,
            ..Self::batch_norm_mlp()
        }
    }

    /// Bias-free `Linear -> LayerNorm -> Hardswish -> Linear -> LayerNorm` neck.
    pub fn layer_norm_neck(hidden: usize) -> Self {
        Self {
            hidden_dims: vec![hidden],
            norm: NormKind::Layer,
            activation: Activation::Hardswish,
            dropout: Some(0.0),
            hidden_bias: false,
            output_bias: false,
            output_norm: NormKind::Layer,
            input_dim: None,
        }
    }

    /// Re-projection into a shared image/text space.
    pub fn reprojection() -> Self {
        Self {
            hidden_dims: vec![128],
            norm: NormKind::Layer,
            activation: Activation::Gelu,
            ..Self::batch_norm_mlp()
        }
    }

    #[must_use]
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout = Some(p);
        self
    }

    #[must_use]
    pub fn without_hidden_bias(mut self) -> Self {
        self.hidden_bias = false;
        self
    }

    #[must_use]
    pub fn with_input_dim(mut self, dim: usize) -> Self {
        self.input_dim = Some(dim);
        self
    }

    /// Check values that would otherwise fail at first forward.
    pub fn validate(&self) -> Result<(), String> {
        if self.hidden_dims.iter().any(|&d| d == 0) {
            return Err("hidden_dims must be positive".to_string());
        }
        if let Some(p) = self.dropout {
            if !(0.0..1.0).contains(&p) {
                return Err(format!("dropout must be in [0, 1), got {}", p));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_batch_norm_mlp() {
        let config = HeadConfig::default();
        assert_eq!(config.hidden_dims, vec![512, 128]);
        assert_eq!(config.norm, NormKind::Batch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HeadConfig = toml::from_str("dropout = 0.5\nhidden_bias = false").unwrap();
        assert_eq!(config.hidden_dims, vec![512, 128]);
        assert_eq!(config.dropout, Some(0.5));
        assert!(!config.hidden_bias);
        assert!(config.output_bias);
    }

    #[test]
    fn test_validate_rejects_bad_dropout() {
        assert!(HeadConfig::default().with_dropout(1.0).validate().is_err());
    }
}
