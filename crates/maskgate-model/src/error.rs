//! Error types for classifier construction and inference.
//!
//! Three variants carry the construction contract of the crate:
//!
//! - `InputShape`: an image or token batch does not match what the backbone expects
//! - `CheckpointLoad`: parameter names/shapes in a checkpoint disagree with the architecture
//! - `DimensionMismatch`: a head's declared width disagrees with its upstream source
//!
//! None of them are retried. Callers decide whether to abort or rebuild with a
//! corrected configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Classifier errors.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Input tensor does not match the backbone's expected layout.
    #[error("Input shape mismatch for {input}: expected {expected:?}, got {actual:?}")]
    InputShape {
        input: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Checkpoint parameters do not match the target architecture.
    #[error("Failed to load checkpoint '{}': {reason}", path.display())]
    CheckpointLoad { path: PathBuf, reason: String },

    /// A module's declared width disagrees with its upstream source.
    #[error("Dimension mismatch in {component}: expected {expected}, got {actual}")]
    DimensionMismatch {
        component: String,
        expected: usize,
        actual: usize,
    },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Tensor operation failed.
    #[error("Tensor operation failed: {message}")]
    TensorError { message: String },

    /// Caption tokenization failed.
    #[error("Tokenization failed: {message}")]
    TokenizationError { message: String },

    /// Image bytes could not be decoded.
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    /// Operation not supported by this component.
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<candle_core::Error> for ModelError {
    fn from(e: candle_core::Error) -> Self {
        ModelError::TensorError {
            message: e.to_string(),
        }
    }
}

impl ModelError {
    /// Build a `CheckpointLoad` error, logging it first.
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        let path = path.into();
        let reason = reason.into();
        tracing::error!(path = %path.display(), %reason, "Checkpoint load failed");
        ModelError::CheckpointLoad { path, reason }
    }

    /// Build a `DimensionMismatch` error.
    pub(crate) fn dimension(component: impl Into<String>, expected: usize, actual: usize) -> Self {
        ModelError::DimensionMismatch {
            component: component.into(),
            expected,
            actual,
        }
    }
}

/// Map a candle error into `ModelError::TensorError` with context.
pub(crate) fn tensor_err(context: &'static str) -> impl Fn(candle_core::Error) -> ModelError {
    move |e| ModelError::TensorError {
        message: format!("{}: {}", context, e),
    }
}

/// Result type for classifier operations.
pub type ModelResult<T> = Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_shape_display() {
        let err = ModelError::InputShape {
            input: "images".to_string(),
            expected: vec![3, 224, 224],
            actual: vec![3, 112, 112],
        };
        let msg = err.to_string();
        assert!(msg.contains("images"));
        assert!(msg.contains("[3, 224, 224]"));
        assert!(msg.contains("[3, 112, 112]"));
    }

    #[test]
    fn test_checkpoint_display_includes_path() {
        let err = ModelError::checkpoint("/tmp/donor.safetensors", "missing tensor 'age_i.0.weight'");
        let msg = err.to_string();
        assert!(msg.contains("/tmp/donor.safetensors"));
        assert!(msg.contains("age_i.0.weight"));
    }

    #[test]
    fn test_candle_error_converts() {
        let candle = candle_core::Error::Msg("boom".to_string());
        let err: ModelError = candle.into();
        assert!(matches!(err, ModelError::TensorError { .. }));
    }

    #[test]
    fn test_tensor_err_adds_context() {
        let err = tensor_err("head forward")(candle_core::Error::Msg("bad".to_string()));
        assert_eq!(err.to_string(), "Tensor operation failed: head forward: bad");
    }
}
