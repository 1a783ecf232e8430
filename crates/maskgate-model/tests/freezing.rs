//! Frozen parameters survive training steps bit-for-bit.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_nn::loss::cross_entropy;
use candle_nn::optim::{Optimizer, SGD};
use maskgate_model::{
    AttributeClassifier, AttributeLogits, BackboneLoader, CaptionSource, FreezePolicy,
    IndependentHeadsClassifier, IndependentHeadsConfig, ParamBuilder, SimilarityClassifier,
    SimilarityConfig,
};
use maskgate_test_utils::{
    images_from_features, one_hot_table, synthetic_captions, LookupBackboneLoader, LookupTokenizer,
    NUM_CAPTIONS,
};

const DIM: usize = 32;
const BATCH: usize = 6;

fn loader() -> LookupBackboneLoader {
    LookupBackboneLoader::new(one_hot_table(NUM_CAPTIONS, DIM, &Device::Cpu))
}

fn batch() -> Tensor {
    let features: Vec<Vec<f32>> = (0..BATCH)
        .map(|i| (0..DIM).map(|d| ((i * 5 + d) % 7) as f32 / 7.0).collect())
        .collect();
    images_from_features(&features, &Device::Cpu)
}

fn targets(classes: u32) -> Tensor {
    let t: Vec<u32> = (0..BATCH as u32).map(|i| i % classes).collect();
    Tensor::from_vec(t, BATCH, &Device::Cpu).unwrap()
}

fn loss(logits: &AttributeLogits) -> Tensor {
    let mask = cross_entropy(&logits.mask, &targets(3)).unwrap();
    let gender = cross_entropy(&logits.gender, &targets(2)).unwrap();
    let age = cross_entropy(&logits.age, &targets(3)).unwrap();
    ((mask + gender).unwrap() + age).unwrap()
}

fn snapshot(entries: &[(String, Tensor)]) -> HashMap<String, Vec<f32>> {
    entries
        .iter()
        .map(|(n, t)| (n.clone(), t.flatten_all().unwrap().to_vec1().unwrap()))
        .collect()
}

fn train(model: &dyn AttributeClassifier, steps: usize) {
    let mut sgd = SGD::new(model.partition().trainable_vars(), 0.05).unwrap();
    let images = batch();
    for _ in 0..steps {
        let logits = model.forward_t(&images, true).unwrap();
        sgd.backward_step(&loss(&logits)).unwrap();
    }
}

fn assert_frozen_unchanged_and_trainable_moved(model: &dyn AttributeClassifier, steps: usize) {
    let partition = model.partition();
    assert!(!partition.frozen().is_empty());
    let frozen_before = snapshot(partition.frozen());
    let trainable_before: HashMap<String, Vec<f32>> = partition
        .trainable()
        .iter()
        .map(|(n, v)| (n.clone(), v.as_tensor().flatten_all().unwrap().to_vec1().unwrap()))
        .collect();

    train(model, steps);

    for (name, after) in snapshot(partition.frozen()) {
        assert_eq!(frozen_before[&name], after, "frozen '{}' changed", name);
    }
    let moved = partition.trainable().iter().any(|(n, v)| {
        let after: Vec<f32> = v.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        after != trainable_before[n]
    });
    assert!(moved, "no trainable parameter changed");
}

#[test]
fn test_independent_heads_keep_backbone_frozen() {
    let loader = loader();
    let vb = ParamBuilder::fresh(loader.freeze_policy(), &Device::Cpu);
    let model = IndependentHeadsClassifier::new(&loader, &IndependentHeadsConfig::default(), vb).unwrap();
    assert!(model.partition().is_frozen("backbone.scale"));
    assert_frozen_unchanged_and_trainable_moved(&model, 3);
}

#[test]
fn test_frozen_head_stays_put() {
    let loader = loader();
    let policy = loader.freeze_policy().freeze("gender");
    let vb = ParamBuilder::fresh(policy, &Device::Cpu);
    let model = IndependentHeadsClassifier::new(&loader, &IndependentHeadsConfig::default(), vb).unwrap();
    assert!(model.partition().is_frozen("gender.0.weight"));
    assert!(model.partition().is_trainable("age.0.weight"));
    assert_frozen_unchanged_and_trainable_moved(&model, 2);
}

#[test]
fn test_similarity_reprojection_training() {
    let loader = loader();
    let set = synthetic_captions();
    let captions = CaptionSource::encode(set.clone(), Arc::new(LookupTokenizer::for_captions(&set, 4)));
    let vb = ParamBuilder::fresh(loader.freeze_policy(), &Device::Cpu);
    let model = SimilarityClassifier::new(&loader, &SimilarityConfig::default(), captions, vb).unwrap();
    assert_frozen_unchanged_and_trainable_moved(&model, 2);
}

#[test]
fn test_batch_norm_statistics_move_only_in_train_mode() {
    let loader = loader();
    let vb = ParamBuilder::fresh(FreezePolicy::trainable_all().freeze("backbone"), &Device::Cpu);
    let model = IndependentHeadsClassifier::new(&loader, &IndependentHeadsConfig::default(), vb).unwrap();
    let buffers = model.partition().buffers();
    assert!(!buffers.is_empty());
    let read = || -> Vec<Vec<f32>> {
        buffers
            .iter()
            .map(|(_, b)| b.get().flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    };

    let initial = read();
    model.forward_t(&batch(), false).unwrap();
    assert_eq!(read(), initial);
    model.forward_t(&batch(), true).unwrap();
    assert_ne!(read(), initial);
}
