//! Safetensors checkpoints: parameter name -> tensor maps on disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::safetensors::Load;
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use sha2::{Digest, Sha256};

use crate::error::{ModelError, ModelResult};
use crate::params::ParamSource;

/// Read every tensor of a safetensors file onto `device`.
///
/// # Errors
/// - `ModelError::CheckpointLoad` if the file is missing or not valid safetensors
pub fn load_tensors(path: &Path, device: &Device) -> ModelResult<HashMap<String, Tensor>> {
    let bytes = fs::read(path)
        .map_err(|e| ModelError::checkpoint(path, format!("cannot read file: {}", e)))?;

    let checksum: [u8; 32] = Sha256::digest(&bytes).into();
    tracing::info!(
        path = %path.display(),
        bytes = bytes.len(),
        sha256 = %hex_prefix(&checksum),
        "Reading checkpoint"
    );

    let parsed = SafeTensors::deserialize(&bytes)
        .map_err(|e| ModelError::checkpoint(path, format!("safetensors parse failed: {}", e)))?;

    let mut tensors = HashMap::with_capacity(parsed.len());
    for (name, view) in parsed.tensors() {
        let tensor = view.load(device).map_err(|e| {
            ModelError::checkpoint(path, format!("tensor '{}' could not be loaded: {}", name, e))
        })?;
        tensors.insert(name, tensor);
    }
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "Checkpoint loaded");
    Ok(tensors)
}

/// Load a file into a [`ParamSource`], optionally re-rooted under `prefix`.
pub fn load_source(path: &Path, device: &Device, prefix: Option<&str>) -> ModelResult<ParamSource> {
    let mut source = ParamSource::empty();
    source.add_tensors(path, load_tensors(path, device)?, prefix)?;
    Ok(source)
}

/// Write named tensors as a safetensors file.
pub fn save(tensors: Vec<(String, Tensor)>, path: &Path) -> ModelResult<()> {
    let count = tensors.len();
    let map: HashMap<String, Tensor> = tensors.into_iter().collect();
    candle_core::safetensors::save(&map, path).map_err(|e| ModelError::TensorError {
        message: format!("Failed to write checkpoint {}: {}", path.display(), e),
    })?;
    tracing::info!(path = %path.display(), tensors = count, "Checkpoint written");
    Ok(())
}

fn hex_prefix(checksum: &[u8; 32]) -> String {
    checksum[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use candle_core::DType;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_save_then_load_preserves_names_and_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heads.safetensors");
        let w = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        save(vec![("mask.0.weight".to_string(), w)], &path).unwrap();

        let loaded = load_tensors(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded["mask.0.weight"].to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
    }

    #[test]
    fn test_missing_file_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let err = load_tensors(&dir.path().join("absent.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, ModelError::CheckpointLoad { .. }));
    }

    #[test]
    fn test_garbage_file_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.safetensors");
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(matches!(
            load_tensors(&path, &Device::Cpu),
            Err(ModelError::CheckpointLoad { .. })
        ));
    }

    #[test]
    fn test_load_source_reroots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.safetensors");
        let t = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        save(vec![("text_projection.weight".to_string(), t)], &path).unwrap();

        let source = load_source(&path, &Device::Cpu, Some("backbone")).unwrap();
        assert_eq!(source.len(), 1);
    }
}
