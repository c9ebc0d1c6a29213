//! Named weight lookup.
//!
//! Components resolve entries under a scope path such as
//! `decoder/layer_0/self_attention/linear_0/weight`. Presence or absence of
//! optional entries drives execution-path selection, so lookups come in two
//! flavours: [`WeightStore::get`] for required entries and
//! [`WeightStore::get_if_exists`] for optional ones.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::{LayerError, LayerResult};

/// Joins a scope and an entry name with the `/` separator.
pub fn scoped(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}/{name}")
    }
}

/// Read-only source of named tensors.
pub trait WeightStore: Send + Sync {
    /// Returns the tensor bound to `name`, if any.
    fn get_if_exists(&self, name: &str) -> Option<Tensor>;

    /// Returns the tensor bound to `name` or a [`LayerError::MissingWeight`].
    fn get(&self, name: &str) -> LayerResult<Tensor> {
        self.get_if_exists(name)
            .ok_or_else(|| LayerError::MissingWeight(name.to_string()))
    }

    /// Reports whether `name` is present.
    fn contains(&self, name: &str) -> bool {
        self.get_if_exists(name).is_some()
    }

    /// Reads a single-element entry as `f32`.
    fn get_scalar_if_exists(&self, name: &str) -> LayerResult<Option<f32>> {
        match self.get_if_exists(name) {
            None => Ok(None),
            Some(tensor) => {
                if tensor.elem_count() != 1 {
                    return Err(LayerError::shape(format!(
                        "{name}: expected a scalar, got shape {:?}",
                        tensor.dims()
                    )));
                }
                let value = tensor
                    .flatten_all()?
                    .to_dtype(DType::F32)?
                    .to_vec1::<f32>()?[0];
                Ok(Some(value))
            }
        }
    }
}

/// Hash-map backed store, optionally populated from a safetensors file.
#[derive(Debug, Default, Clone)]
pub struct MemoryWeightStore {
    entries: HashMap<String, Tensor>,
}

impl MemoryWeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every tensor of a safetensors file onto `device`.
    pub fn from_safetensors(path: impl AsRef<Path>, device: &Device) -> LayerResult<Self> {
        let entries = candle_core::safetensors::load(path.as_ref(), device)?;
        log::info!(
            "weight store loaded {} tensors from {}",
            entries.len(),
            path.as_ref().display()
        );
        Ok(Self { entries })
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.entries.insert(name.into(), tensor)
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Writes all entries to a safetensors file.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> LayerResult<()> {
        candle_core::safetensors::save(&self.entries, path.as_ref())?;
        Ok(())
    }
}

impl WeightStore for MemoryWeightStore {
    fn get_if_exists(&self, name: &str) -> Option<Tensor> {
        self.entries.get(name).cloned()
    }
}
