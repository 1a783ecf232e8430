//! Construction-time parameter partitioning.
//!
//! Every tensor a model owns is requested through a [`ParamBuilder`] while the
//! model is being built. The builder consults the [`FreezePolicy`] once per
//! parameter name and places the tensor in exactly one group:
//!
//! ```text
//! ParamBuilder::get(name)
//!   ├── policy says trainable ──> Var (gradient-tracked)   ──> trainable set
//!   ├── policy says frozen    ──> detached Tensor          ──> frozen set
//! ParamBuilder::buffer(name)  ──> Buffer (running stats)   ──> buffer set
//! ```
//!
//! [`ParamBuilder::finish`] yields the [`ParameterPartition`]. An optimizer is
//! handed `partition.trainable_vars()` and nothing else, so a frozen tensor can
//! neither receive a gradient nor be stepped.

mod init;
mod source;

pub use init::Init;
pub use source::ParamSource;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{ModelError, ModelResult};

/// Which parameter names stay trainable.
///
/// A name is frozen when it falls under one of the frozen prefixes and under
/// none of the trainable exceptions. Prefixes match whole path segments:
/// `backbone` matches `backbone.x` but not `backbone2.x`.
#[derive(Debug, Clone, Default)]
pub struct FreezePolicy {
    frozen: Vec<String>,
    exceptions: Vec<String>,
}

impl FreezePolicy {
    /// Everything trainable.
    pub fn trainable_all() -> Self {
        Self::default()
    }

    /// Freeze everything under `prefix`.
    #[must_use]
    pub fn freeze(mut self, prefix: impl Into<String>) -> Self {
        self.frozen.push(prefix.into());
        self
    }

    /// Keep `prefix` trainable even if a frozen prefix covers it.
    #[must_use]
    pub fn with_exception(mut self, prefix: impl Into<String>) -> Self {
        self.exceptions.push(prefix.into());
        self
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        let frozen = self.frozen.iter().any(|p| covers(p, name));
        !frozen || self.exceptions.iter().any(|p| covers(p, name))
    }
}

/// Segment-aware prefix test.
pub(crate) fn covers(prefix: &str, name: &str) -> bool {
    prefix.is_empty()
        || name == prefix
        || (name.starts_with(prefix) && name.as_bytes().get(prefix.len()) == Some(&b'.'))
}

/// Mutable non-parameter state (batch-norm running statistics).
///
/// Shared between the layer that updates it and the partition that
/// checkpoints it.
#[derive(Debug, Clone)]
pub struct Buffer(Arc<RwLock<Tensor>>);

impl Buffer {
    pub fn new(tensor: Tensor) -> Self {
        Self(Arc::new(RwLock::new(tensor.detach())))
    }

    /// Current value.
    pub fn get(&self) -> Tensor {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the value. Always stored detached.
    pub fn set(&self, tensor: Tensor) {
        let tensor = tensor.detach();
        match self.0.write() {
            Ok(mut guard) => *guard = tensor,
            Err(poisoned) => *poisoned.into_inner() = tensor,
        }
    }
}

/// Frozen / trainable / buffer handles of one model instance.
#[derive(Debug, Default)]
pub struct ParameterPartition {
    frozen: Vec<(String, Tensor)>,
    trainable: Vec<(String, Var)>,
    buffers: Vec<(String, Buffer)>,
}

impl ParameterPartition {
    /// Handles for the optimizer. The only mutable parameters of the model.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn trainable(&self) -> &[(String, Var)] {
        &self.trainable
    }

    pub fn frozen(&self) -> &[(String, Tensor)] {
        &self.frozen
    }

    pub fn buffers(&self) -> &[(String, Buffer)] {
        &self.buffers
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        self.trainable.iter().any(|(n, _)| n == name)
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen.iter().any(|(n, _)| n == name)
    }

    pub fn num_trainable_params(&self) -> usize {
        self.trainable
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum()
    }

    pub fn num_frozen_params(&self) -> usize {
        self.frozen.iter().map(|(_, t)| t.elem_count()).sum()
    }

    /// Every named tensor (parameters and buffers), sorted by name.
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut all: Vec<(String, Tensor)> = self
            .frozen
            .iter()
            .map(|(n, t)| (n.clone(), t.clone()))
            .chain(
                self.trainable
                    .iter()
                    .map(|(n, v)| (n.clone(), v.as_tensor().clone())),
            )
            .chain(self.buffers.iter().map(|(n, b)| (n.clone(), b.get())))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[derive(Debug, Default)]
struct Registry {
    names: HashSet<String>,
    consumed: HashSet<String>,
    partition: ParameterPartition,
}

#[derive(Debug)]
struct BuilderInner {
    source: ParamSource,
    policy: FreezePolicy,
    device: Device,
    dtype: DType,
    registry: Mutex<Registry>,
}

/// Hands out named parameters and records which group each one joined.
///
/// Cheap to clone; `pp` returns a builder scoped under a sub-path, like
/// candle's `VarBuilder`.
#[derive(Debug, Clone)]
pub struct ParamBuilder {
    inner: Arc<BuilderInner>,
    path: Vec<String>,
}

impl ParamBuilder {
    pub fn new(source: ParamSource, policy: FreezePolicy, device: &Device) -> Self {
        Self {
            inner: Arc::new(BuilderInner {
                source,
                policy,
                device: device.clone(),
                dtype: DType::F32,
                registry: Mutex::new(Registry::default()),
            }),
            path: Vec::new(),
        }
    }

    /// Builder with no stored tensors: everything comes from initializers.
    pub fn fresh(policy: FreezePolicy, device: &Device) -> Self {
        Self::new(ParamSource::empty(), policy, device)
    }

    /// Scope under `segment`.
    pub fn pp(&self, segment: impl ToString) -> Self {
        let mut path = self.path.clone();
        path.push(segment.to_string());
        Self {
            inner: self.inner.clone(),
            path,
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Current dotted path.
    pub fn prefix(&self) -> String {
        self.path.join(".")
    }

    /// Whether the policy keeps `name` (a full dotted path) trainable.
    pub fn is_trainable(&self, name: &str) -> bool {
        self.inner.policy.is_trainable(name)
    }

    fn full_name(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix(), name)
        }
    }

    /// Resolve a tensor from the source or the initializer, validating shape.
    fn resolve(&self, full: &str, shape: &[usize], init: Init) -> ModelResult<Tensor> {
        match self.inner.source.lookup(full, shape)? {
            Some(tensor) => {
                self.lock()?.consumed.insert(full.to_string());
                Ok(tensor.to_dtype(self.inner.dtype)?)
            }
            None => init.tensor(full, shape, self.inner.dtype, &self.inner.device),
        }
    }

    fn lock(&self) -> ModelResult<std::sync::MutexGuard<'_, Registry>> {
        self.inner.registry.lock().map_err(|_| ModelError::ConfigError {
            message: "parameter registry lock poisoned".to_string(),
        })
    }

    fn claim(&self, registry: &mut Registry, full: &str) -> ModelResult<()> {
        if !registry.names.insert(full.to_string()) {
            return Err(ModelError::ConfigError {
                message: format!("parameter '{}' registered twice", full),
            });
        }
        Ok(())
    }

    /// Request a parameter. Returns the tensor the forward pass should use.
    pub fn get(&self, shape: &[usize], name: &str, init: Init) -> ModelResult<Tensor> {
        let full = self.full_name(name);
        let tensor = self.resolve(&full, shape, init)?;
        let trainable = self.inner.policy.is_trainable(&full);

        let mut registry = self.lock()?;
        self.claim(&mut registry, &full)?;
        if trainable {
            let var = Var::from_tensor(&tensor.detach())?;
            let handle = var.as_tensor().clone();
            registry.partition.trainable.push((full, var));
            Ok(handle)
        } else {
            let frozen = tensor.detach();
            registry.partition.frozen.push((full, frozen.clone()));
            Ok(frozen)
        }
    }

    /// Request a buffer (never trainable, never frozen).
    pub fn buffer(&self, shape: &[usize], name: &str, init: Init) -> ModelResult<Buffer> {
        let full = self.full_name(name);
        let tensor = self.resolve(&full, shape, init)?;
        let buffer = Buffer::new(tensor);

        let mut registry = self.lock()?;
        self.claim(&mut registry, &full)?;
        registry.partition.buffers.push((full, buffer.clone()));
        Ok(buffer)
    }

    /// Close the builder and hand back the partition.
    ///
    /// A stored tensor that no module asked for is an error when the source is
    /// strict or the tensor sits under a required prefix: the checkpoint does
    /// not describe this architecture.
    pub fn finish(self) -> ModelResult<ParameterPartition> {
        let mut registry = self.lock()?;
        let source = &self.inner.source;
        let mut unexpected: Vec<(&String, &std::path::Path)> = source
            .names()
            .filter(|n| !registry.consumed.contains(*n))
            .filter_map(|n| source.must_consume(n).map(|origin| (n, origin)))
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            let origin = unexpected[0].1;
            let names: Vec<&String> = unexpected.iter().map(|(n, _)| *n).collect();
            return Err(ModelError::checkpoint(
                origin,
                format!("unexpected tensors not used by the architecture: {:?}", names),
            ));
        }
        let partition = std::mem::take(&mut registry.partition);
        tracing::debug!(
            trainable = partition.trainable.len(),
            frozen = partition.frozen.len(),
            buffers = partition.buffers.len(),
            "Parameter partition finalized"
        );
        Ok(partition)
    }
}
