//! Stored tensors a [`ParamBuilder`](super::ParamBuilder) draws from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;

use crate::error::{ModelError, ModelResult};

use super::covers;

#[derive(Debug, Clone)]
struct SourcedTensor {
    origin: PathBuf,
    tensor: Tensor,
}

/// Named tensors from checkpoints, pretrained weights or transplanted modules.
///
/// Lookup rules:
/// - a stored tensor must match the requested shape exactly
/// - a name under a required prefix must be stored, and every stored tensor
///   under it must be used
/// - in strict mode every name is required and every stored tensor must be used
#[derive(Debug, Clone, Default)]
pub struct ParamSource {
    tensors: HashMap<String, SourcedTensor>,
    required: Vec<(String, PathBuf)>,
    strict: Option<PathBuf>,
}

impl ParamSource {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add tensors loaded from `origin`, optionally re-rooted under `prefix`.
    ///
    /// # Errors
    /// - `ModelError::CheckpointLoad` if a name is already present
    pub fn add_tensors(
        &mut self,
        origin: &Path,
        tensors: HashMap<String, Tensor>,
        prefix: Option<&str>,
    ) -> ModelResult<()> {
        for (name, tensor) in tensors {
            let full = match prefix {
                Some(p) if !p.is_empty() => format!("{}.{}", p, name),
                _ => name,
            };
            if self.tensors.contains_key(&full) {
                return Err(ModelError::checkpoint(
                    origin,
                    format!("tensor '{}' provided by more than one source", full),
                ));
            }
            self.tensors.insert(
                full,
                SourcedTensor {
                    origin: origin.to_path_buf(),
                    tensor,
                },
            );
        }
        Ok(())
    }

    /// Every parameter under `prefix` must come from stored tensors.
    pub fn require_prefix(&mut self, prefix: impl Into<String>, origin: &Path) {
        self.required.push((prefix.into(), origin.to_path_buf()));
    }

    /// Require every name and forbid unused tensors.
    #[must_use]
    pub fn strict_for(mut self, origin: &Path) -> Self {
        self.strict = Some(origin.to_path_buf());
        self
    }

    /// Strict mode without a specific origin file.
    #[must_use]
    pub fn strict(self) -> Self {
        let origin = self
            .tensors
            .values()
            .next()
            .map(|s| s.origin.clone())
            .unwrap_or_default();
        self.strict_for(&origin)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Origin that requires `name` to be consumed, if any.
    pub(crate) fn must_consume(&self, name: &str) -> Option<&Path> {
        self.strict.as_deref().or_else(|| {
            self.required
                .iter()
                .find(|(p, _)| covers(p, name))
                .map(|(_, origin)| origin.as_path())
        })
    }

    /// Find `name`, validating shape. `Ok(None)` means "initialize it".
    pub(crate) fn lookup(&self, name: &str, shape: &[usize]) -> ModelResult<Option<Tensor>> {
        match self.tensors.get(name) {
            Some(stored) => {
                let actual = stored.tensor.dims();
                if actual != shape {
                    return Err(ModelError::checkpoint(
                        &stored.origin,
                        format!(
                            "shape mismatch for '{}': expected {:?}, found {:?}",
                            name, shape, actual
                        ),
                    ));
                }
                Ok(Some(stored.tensor.clone()))
            }
            None => {
                if let Some(origin) = &self.strict {
                    return Err(ModelError::checkpoint(
                        origin,
                        format!("missing tensor '{}'", name),
                    ));
                }
                if let Some((_, origin)) = self.required.iter().find(|(p, _)| covers(p, name)) {
                    return Err(ModelError::checkpoint(
                        origin,
                        format!("missing tensor '{}'", name),
                    ));
                }
                Ok(None)
            }
        }
    }
}
