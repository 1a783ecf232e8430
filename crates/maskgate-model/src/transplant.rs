//! Sub-module transplant from independently trained checkpoints.
//!
//! ```text
//! donor checkpoint ──strict load──> throwaway donor instance
//!                                        │ deep copy of named sub-modules
//!                                        v
//!                               HashMap<name, Tensor> ──> composite ParamSource
//! donor instance dropped before the next donor is read
//! ```
//!
//! Only one donor is ever materialized at a time, so peak memory is one
//! backbone regardless of how many donors a composite draws from.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::attributes::Attribute;
use crate::backbone::BackboneLoader;
use crate::checkpoint;
use crate::classifier::ClassifierConfig;
use crate::error::{ModelError, ModelResult};
use crate::params::{covers, FreezePolicy, ParamBuilder};

/// One donor: which attribute it contributes, where its weights live and
/// which architecture wrote them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorSpec {
    pub attribute: Attribute,
    pub checkpoint: PathBuf,
    pub architecture: ClassifierConfig,
    /// Sub-modules to copy. Defaults to the attribute's `{attr}_i` and `{attr}_t` heads.
    #[serde(default)]
    pub modules: Option<Vec<String>>,
}

impl DonorSpec {
    pub fn new(attribute: Attribute, checkpoint: impl Into<PathBuf>, architecture: ClassifierConfig) -> Self {
        Self {
            attribute,
            checkpoint: checkpoint.into(),
            architecture,
            modules: None,
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules
            .clone()
            .unwrap_or_else(|| vec![self.attribute.image_head(), self.attribute.text_head()])
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransplantConfig {
    #[serde(default)]
    pub donors: Vec<DonorSpec>,

    /// Keep transplanted sub-modules frozen in the composite (default: true).
    #[serde(default = "default_true")]
    pub freeze_transplanted: bool,
}

impl Default for TransplantConfig {
    fn default() -> Self {
        Self {
            donors: Vec::new(),
            freeze_transplanted: true,
        }
    }
}

impl TransplantConfig {
    /// At most one donor per attribute; donors are never composites themselves.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for donor in &self.donors {
            if !seen.insert(donor.attribute) {
                return Err(format!("attribute '{}' has more than one donor", donor.attribute));
            }
            if matches!(donor.architecture, ClassifierConfig::Aggregated(_)) {
                return Err(format!(
                    "donor for '{}' is itself an aggregated classifier",
                    donor.attribute
                ));
            }
            donor
                .architecture
                .validate()
                .map_err(|e| format!("donor for '{}': {}", donor.attribute, e))?;
        }
        let mut modules = HashSet::new();
        for name in self.donors.iter().flat_map(|d| d.module_names()) {
            if !modules.insert(name.clone()) {
                return Err(format!("sub-module '{}' requested from more than one donor", name));
            }
        }
        Ok(())
    }
}

/// Loads donors one at a time and copies sub-modules out of them.
pub struct TransplantLoader<'a> {
    loader: &'a dyn BackboneLoader,
    device: Device,
}

impl<'a> TransplantLoader<'a> {
    pub fn new(loader: &'a dyn BackboneLoader, device: &Device) -> Self {
        Self {
            loader,
            device: device.clone(),
        }
    }

    /// Copy every tensor under `names` out of a donor checkpoint.
    ///
    /// The checkpoint must describe `architecture` exactly. Returned tensors
    /// own fresh storage; nothing aliases the discarded donor.
    ///
    /// # Errors
    /// - `ModelError::CheckpointLoad` on a name or shape mismatch with the donor
    ///   architecture, or if a requested sub-module does not exist in it
    pub fn extract(
        &self,
        checkpoint: &Path,
        architecture: &ClassifierConfig,
        names: &[String],
    ) -> ModelResult<HashMap<String, Tensor>> {
        let source = checkpoint::load_source(checkpoint, &self.device, None)?.strict_for(checkpoint);
        let vb = ParamBuilder::new(source, FreezePolicy::trainable_all().freeze(""), &self.device);
        let donor = architecture.instantiate(self.loader, &vb)?;
        let partition = vb.finish()?;

        let state = partition.named_tensors();
        let extracted = copy_modules(&state, names, |missing| {
            ModelError::checkpoint(
                checkpoint,
                format!(
                    "donor architecture '{}' has no sub-module '{}' (heads: {:?})",
                    architecture.kind(),
                    missing,
                    donor.head_names()
                ),
            )
        })?;

        tracing::info!(
            checkpoint = %checkpoint.display(),
            donor = architecture.kind(),
            modules = ?names,
            tensors = extracted.len(),
            "Sub-modules extracted, releasing donor"
        );
        drop(state);
        drop(partition);
        drop(donor);
        Ok(extracted)
    }
}

/// Deep-copy every tensor under `names` into fresh storage.
///
/// A name with no tensors under it is reported through `missing`.
fn copy_modules(
    state: &[(String, Tensor)],
    names: &[String],
    missing: impl Fn(&str) -> ModelError,
) -> ModelResult<HashMap<String, Tensor>> {
    let mut copied = HashMap::new();
    for name in names {
        let before = copied.len();
        for (full, tensor) in state.iter().filter(|(full, _)| covers(name, full)) {
            copied.insert(full.clone(), tensor.copy()?);
        }
        if copied.len() == before {
            return Err(missing(name));
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Var};
    use tempfile::TempDir;

    use super::*;
    use crate::classifier::{IndependentHeadsConfig, SimilarityConfig};
    use crate::test_support::StubLoader;

    fn donor_checkpoint(dir: &TempDir, loader: &StubLoader) -> PathBuf {
        let config = ClassifierConfig::Similarity(SimilarityConfig::default());
        let vb = ParamBuilder::fresh(loader.freeze_policy(), &Device::Cpu);
        let _modules = config.instantiate(loader, &vb).unwrap();
        let path = dir.path().join("donor.safetensors");
        checkpoint::save(vb.finish().unwrap().named_tensors(), &path).unwrap();
        path
    }

    #[test]
    fn test_extract_copies_requested_heads_only() {
        let dir = TempDir::new().unwrap();
        let loader = StubLoader::new(16, 8);
        let path = donor_checkpoint(&dir, &loader);

        let extractor = TransplantLoader::new(&loader, &Device::Cpu);
        let names = vec![Attribute::Age.image_head(), Attribute::Age.text_head()];
        let tensors = extractor
            .extract(&path, &ClassifierConfig::Similarity(SimilarityConfig::default()), &names)
            .unwrap();

        assert!(tensors.contains_key("age_i.0.weight"));
        assert!(tensors.contains_key("age_t.3.bias"));
        assert!(tensors.keys().all(|k| k.starts_with("age_i.") || k.starts_with("age_t.")));

        let stored = checkpoint::load_tensors(&path, &Device::Cpu).unwrap();
        let a: Vec<f32> = tensors["age_i.0.weight"].flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = stored["age_i.0.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_copied_modules_do_not_alias_donor_storage() {
        let weight = Var::from_slice(&[1f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        let state = vec![
            ("age_i.0.weight".to_string(), weight.as_tensor().clone()),
            ("mask_i.0.weight".to_string(), weight.as_tensor().clone()),
        ];
        let copied = copy_modules(&state, &["age_i".to_string()], |name| ModelError::ConfigError {
            message: name.to_string(),
        })
        .unwrap();
        assert_eq!(copied.len(), 1);

        weight.set(&Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let donor: Vec<f32> = state[0].1.flatten_all().unwrap().to_vec1().unwrap();
        let transplanted: Vec<f32> = copied["age_i.0.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(donor, vec![0.0; 4]);
        assert_eq!(transplanted, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_architecture_mismatch_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let loader = StubLoader::new(16, 8);
        let path = donor_checkpoint(&dir, &loader);

        let extractor = TransplantLoader::new(&loader, &Device::Cpu);
        let wrong = ClassifierConfig::IndependentHeads(IndependentHeadsConfig::default());
        let err = extractor.extract(&path, &wrong, &["age".to_string()]).unwrap_err();
        assert!(matches!(err, ModelError::CheckpointLoad { .. }));
    }

    #[test]
    fn test_unknown_sub_module() {
        let dir = TempDir::new().unwrap();
        let loader = StubLoader::new(16, 8);
        let path = donor_checkpoint(&dir, &loader);

        let extractor = TransplantLoader::new(&loader, &Device::Cpu);
        let config = ClassifierConfig::Similarity(SimilarityConfig::default());
        let err = extractor.extract(&path, &config, &["neck".to_string()]).unwrap_err();
        assert!(err.to_string().contains("neck"));
    }

    #[test]
    fn test_missing_file() {
        let loader = StubLoader::new(16, 8);
        let extractor = TransplantLoader::new(&loader, &Device::Cpu);
        let config = ClassifierConfig::Similarity(SimilarityConfig::default());
        let err = extractor
            .extract(Path::new("/nonexistent/donor.safetensors"), &config, &["age_i".to_string()])
            .unwrap_err();
        assert!(matches!(err, ModelError::CheckpointLoad { .. }));
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let arch = ClassifierConfig::Similarity(SimilarityConfig::default());
        let config = TransplantConfig {
            donors: vec![
                DonorSpec::new(Attribute::Age, "a.safetensors", arch.clone()),
                DonorSpec::new(Attribute::Age, "b.safetensors", arch),
            ],
            freeze_transplanted: true,
        };
        assert!(config.validate().is_err());
    }
}
