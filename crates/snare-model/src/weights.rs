//! Named weight dictionary shared by checkpoint IO, EMA and the network.

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::ArrayD;
use snare_core::Result;

use crate::npy;

/// Ordered map from parameter path (`classifier.fc.weight`) to tensor.
///
/// Iteration order is the sorted key order, so serialized checkpoints are
/// byte-stable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightStore {
    weights: BTreeMap<String, ArrayD<f32>>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, value: ArrayD<f32>) {
        self.weights.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.weights.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.weights.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.weights.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ArrayD<f32>)> {
        self.weights.iter_mut()
    }

    /// Write every tensor to an `.npz` checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        npy::write_npz(path, &self.weights)
    }

    /// Load a checkpoint previously written by [`WeightStore::save`].
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            weights: npy::read_npz(path)?,
        })
    }
}

impl FromIterator<(String, ArrayD<f32>)> for WeightStore {
    fn from_iter<T: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: T) -> Self {
        Self {
            weights: iter.into_iter().collect(),
        }
    }
}
