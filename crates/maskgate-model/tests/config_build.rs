//! Building classifiers from TOML with a small custom CLIP.

use candle_core::{DType, Device, Tensor};
use maskgate_model::{AttributeClassifier, ModelConfig, ModelError};
use tempfile::TempDir;

const TINY_CLIP: &str = r#"
    [device]
    kind = "cpu"

    [backbone.clip]
    variant = "custom"
    projection_dim = 8

    [backbone.clip.text]
    vocab_size = 64
    hidden_size = 16
    num_hidden_layers = 1
    num_attention_heads = 2
    intermediate_size = 32
    max_position_embeddings = 8

    [backbone.clip.vision]
    hidden_size = 16
    num_hidden_layers = 1
    num_attention_heads = 2
    intermediate_size = 32
    image_size = 8
    patch_size = 4
"#;

fn config(classifier: &str) -> ModelConfig {
    ModelConfig::from_toml_str(&format!("{}\n{}", TINY_CLIP, classifier)).unwrap()
}

fn independent() -> ModelConfig {
    config(
        r#"
        [classifier]
        kind = "independent_heads"
        head = { hidden_dims = [16] }
        "#,
    )
}

fn images() -> Tensor {
    Tensor::rand(0f32, 1f32, (2, 3, 8, 8), &Device::Cpu).unwrap()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

#[test]
fn test_build_independent_heads() {
    let model = independent().build().unwrap();
    assert_eq!(model.kind(), "independent_heads");

    let logits = model.forward(&images()).unwrap();
    assert_eq!(logits.mask.dims(), &[2, 3]);
    assert_eq!(logits.gender.dims(), &[2, 2]);
    assert_eq!(logits.age.dims(), &[2, 3]);

    let partition = model.partition();
    assert!(partition.is_trainable("mask.0.weight"));
    assert!(partition
        .frozen()
        .iter()
        .all(|(name, _)| name.starts_with("backbone.")));
}

#[test]
fn test_wrong_image_size_is_input_shape_error() {
    let model = independent().build().unwrap();
    let bad = Tensor::zeros((1, 3, 12, 12), DType::F32, &Device::Cpu).unwrap();
    assert!(matches!(
        model.forward(&bad),
        Err(ModelError::InputShape { .. })
    ));
}

#[test]
fn test_resume_from_checkpoint_reproduces_logits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.safetensors");
    let mut config = independent();
    let model = config.build().unwrap();
    model.save_checkpoint(&path).unwrap();

    config.checkpoint = Some(path);
    let resumed = config.build().unwrap();
    let batch = images();
    let before = model.forward(&batch).unwrap();
    let after = resumed.forward(&batch).unwrap();
    assert_eq!(values(&before.mask), values(&after.mask));
    assert_eq!(values(&before.gender), values(&after.gender));
    assert_eq!(values(&before.age), values(&after.age));
}

#[test]
fn test_resume_with_different_head_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.safetensors");
    independent().build().unwrap().save_checkpoint(&path).unwrap();

    let mut wider = config(
        r#"
        [classifier]
        kind = "independent_heads"
        head = { hidden_dims = [24] }
        "#,
    );
    wider.checkpoint = Some(path);
    assert!(matches!(
        wider.build(),
        Err(ModelError::CheckpointLoad { .. })
    ));
}

#[test]
fn test_similarity_without_tokenizer_is_rejected() {
    let err = config("[classifier]\nkind = \"similarity\"\n").build().err().unwrap();
    assert!(matches!(err, ModelError::ConfigError { .. }));
}
