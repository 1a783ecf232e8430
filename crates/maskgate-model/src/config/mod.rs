//! Root configuration for building a classifier.
//!
//! # TOML Structure
//!
//! ```toml
//! checkpoint = "runs/conditional/best.safetensors"   # optional, resumes a full model
//!
//! [device]
//! kind = "cuda"
//! ordinal = 0
//!
//! [backbone]
//! weights = "models/clip-vit-base-patch32/model.safetensors"
//! tokenizer = "models/clip-vit-base-patch32/tokenizer.json"
//! trainable = ["text_projection"]
//! [backbone.clip]
//! variant = "vit_b32"
//!
//! [classifier]
//! kind = "aggregated"
//! conditional_age = true
//!
//! [[transplant.donors]]
//! attribute = "age"
//! checkpoint = "runs/age/best.safetensors"
//! architecture = { kind = "similarity" }
//! ```
//!
//! Invalid configuration is an error; nothing silently falls back.

mod backbone;
mod device;

pub use backbone::{BackboneConfig, ClipVariant};
pub use device::{DeviceConfig, DeviceKind};

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backbone::ClipTokenizer;
use crate::captions::CaptionSet;
use crate::checkpoint;
use crate::classifier::{build_classifier, AttributeClassifier, CaptionSource, ClassifierConfig, ClassifierParts};
use crate::error::{ModelError, ModelResult};
use crate::transplant::TransplantConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Full classifier checkpoint to resume from. Must match the
    /// architecture exactly, backbone included.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub backbone: BackboneConfig,

    /// Caption overrides; the built-in set is used when absent.
    #[serde(default)]
    pub captions: Option<CaptionSet>,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub transplant: TransplantConfig,
}

impl ModelConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `ModelError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> ModelResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ModelError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        toml::from_str(&contents).map_err(|e| ModelError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    pub fn from_toml_str(toml: &str) -> ModelResult<Self> {
        toml::from_str(toml).map_err(|e| ModelError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    pub fn to_toml_string(&self) -> ModelResult<String> {
        toml::to_string_pretty(self).map_err(|e| ModelError::ConfigError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Validate every section, returning the first error found.
    pub fn validate(&self) -> ModelResult<()> {
        self.backbone.validate().map_err(section("backbone"))?;
        self.classifier.validate().map_err(section("classifier"))?;
        self.transplant.validate().map_err(section("transplant"))?;
        if let Some(captions) = &self.captions {
            captions.validate()?;
        }

        if self.classifier.needs_captions() && self.backbone.tokenizer.is_none() {
            return Err(section("backbone")(format!(
                "classifier '{}' encodes captions and needs a tokenizer path",
                self.classifier.kind()
            )));
        }
        let aggregated = matches!(self.classifier, ClassifierConfig::Aggregated(_));
        if !aggregated && !self.transplant.donors.is_empty() {
            return Err(section("transplant")(format!(
                "donors are only used by the aggregated classifier, not '{}'",
                self.classifier.kind()
            )));
        }
        if aggregated && self.checkpoint.is_some() && !self.transplant.donors.is_empty() {
            return Err(section("transplant")(
                "a resumed checkpoint already contains every head; remove the donors".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `MASKGATE_*` environment overrides.
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `MASKGATE_DEVICE` | `device` | `cpu`, `cuda`, `cuda:N` |
    /// | `MASKGATE_CHECKPOINT` | `checkpoint` | path |
    /// | `MASKGATE_BACKBONE_WEIGHTS` | `backbone.weights` | path |
    /// | `MASKGATE_TOKENIZER` | `backbone.tokenizer` | path |
    /// | `MASKGATE_FREEZE_TRANSPLANTED` | `transplant.freeze_transplanted` | bool |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("MASKGATE_DEVICE") {
            match DeviceConfig::parse(&val) {
                Some(device) => self.device = device,
                None => tracing::warn!(value = %val, "Ignoring unrecognized MASKGATE_DEVICE"),
            }
        }
        if let Ok(val) = env::var("MASKGATE_CHECKPOINT") {
            self.checkpoint = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("MASKGATE_BACKBONE_WEIGHTS") {
            self.backbone.weights = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("MASKGATE_TOKENIZER") {
            self.backbone.tokenizer = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("MASKGATE_FREEZE_TRANSPLANTED") {
            match val.parse::<bool>() {
                Ok(b) => self.transplant.freeze_transplanted = b,
                Err(_) => {
                    tracing::warn!(value = %val, "Ignoring unrecognized MASKGATE_FREEZE_TRANSPLANTED")
                }
            }
        }
        self
    }

    /// Validate, load weights and tokenizer, and build the classifier.
    pub fn build(&self) -> ModelResult<Box<dyn AttributeClassifier>> {
        self.validate()?;
        let device = self.device.to_device()?;
        let loader = self.backbone.loader();
        let policy = self.backbone.freeze_policy(&loader);

        let source = match &self.checkpoint {
            Some(path) => checkpoint::load_source(path, &device, None)?.strict_for(path),
            None => self.backbone.pretrained_source(&device)?,
        };

        let captions = match &self.backbone.tokenizer {
            Some(path) if self.classifier.needs_captions() => {
                let context = loader.config.text.max_position_embeddings;
                let tokenizer = ClipTokenizer::from_file(path, context)?;
                Some(CaptionSource::encode(
                    self.captions.clone().unwrap_or_default(),
                    Arc::new(tokenizer),
                ))
            }
            _ => None,
        };

        tracing::info!(
            classifier = self.classifier.kind(),
            device = ?self.device,
            resumed = self.checkpoint.is_some(),
            donors = self.transplant.donors.len(),
            "Building classifier from configuration"
        );
        build_classifier(
            &self.classifier,
            &self.transplant,
            ClassifierParts {
                loader: &loader,
                captions,
                source,
                policy,
                device,
            },
        )
    }
}

fn section(name: &'static str) -> impl Fn(String) -> ModelError {
    move |e| ModelError::ConfigError {
        message: format!("[{}] {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::attributes::Attribute;
    use crate::classifier::{AggregatedConfig, SharedNeckConfig};

    const AGGREGATED: &str = r#"
        [device]
        kind = "cpu"

        [backbone]
        tokenizer = "tokenizer.json"
        trainable = []

        [classifier]
        kind = "aggregated"
        conditional_age = true

        [[transplant.donors]]
        attribute = "age"
        checkpoint = "runs/age.safetensors"
        architecture = { kind = "similarity" }

        [[transplant.donors]]
        attribute = "mask"
        checkpoint = "runs/mask.safetensors"
        architecture = { kind = "similarity", heads = { type = "reprojection", embed_dim = 32 } }
    "#;

    #[test]
    fn test_parse_aggregated() {
        let config = ModelConfig::from_toml_str(AGGREGATED).unwrap();
        config.validate().unwrap();
        assert_eq!(config.transplant.donors.len(), 2);
        assert_eq!(config.transplant.donors[0].attribute, Attribute::Age);
        assert!(config.transplant.freeze_transplanted);
        match &config.classifier {
            ClassifierConfig::Aggregated(AggregatedConfig { conditional_age, .. }) => assert!(*conditional_age),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ModelConfig::from_toml_str(AGGREGATED).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ModelConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(&path, AGGREGATED).unwrap();
        assert!(ModelConfig::from_file(&path).is_ok());
        assert!(ModelConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_similarity_needs_tokenizer() {
        let err = ModelConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("tokenizer"));
    }

    #[test]
    fn test_donors_need_aggregated() {
        let mut config = ModelConfig::from_toml_str(AGGREGATED).unwrap();
        config.classifier = ClassifierConfig::SharedNeck(SharedNeckConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(ModelConfig::from_toml_str("[classifier]\nkind = \"ensemble\"\n").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("MASKGATE_DEVICE", "cuda:1");
        env::set_var("MASKGATE_BACKBONE_WEIGHTS", "/models/clip.safetensors");
        env::set_var("MASKGATE_FREEZE_TRANSPLANTED", "false");
        let config = ModelConfig::default().with_env_overrides();
        env::remove_var("MASKGATE_DEVICE");
        env::remove_var("MASKGATE_BACKBONE_WEIGHTS");
        env::remove_var("MASKGATE_FREEZE_TRANSPLANTED");

        assert_eq!(config.device, DeviceConfig::cuda(1));
        assert_eq!(config.backbone.weights, Some(PathBuf::from("/models/clip.safetensors")));
        assert!(!config.transplant.freeze_transplanted);
    }

    #[test]
    #[serial]
    fn test_bad_device_env_ignored() {
        env::set_var("MASKGATE_DEVICE", "tpu");
        let config = ModelConfig::default().with_env_overrides();
        env::remove_var("MASKGATE_DEVICE");
        assert_eq!(config.device, DeviceConfig::cpu());
    }

    #[test]
    #[serial]
    fn test_bad_freeze_env_keeps_configured_value() {
        env::set_var("MASKGATE_FREEZE_TRANSPLANTED", "maybe");
        let config = ModelConfig::default().with_env_overrides();
        env::remove_var("MASKGATE_FREEZE_TRANSPLANTED");
        assert!(config.transplant.freeze_transplanted);
    }
}
