// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use sha3::{Digest, Sha3_256};

/// Component id prefixes used when minting model ids.
pub const AGENT_PREFIX: &str = "agent";
pub const AGGREGATOR_PREFIX: &str = "aggregator";
pub const DATABASE_PREFIX: &str = "database";

/// Whether a stored model is a single node's local update or an aggregated
/// cluster model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelType {
    #[default]
    Local = 0,
    Cluster = 1,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Local => "local",
            ModelType::Cluster => "cluster",
        }
    }
}

impl TryFrom<u8> for ModelType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(ModelType::Local),
            1 => Ok(ModelType::Cluster),
            n => Err(n),
        }
    }
}

/// An opaque set of named parameter arrays.
///
/// The coordination core never interprets the numbers; it only moves them
/// between nodes, buffers them per parameter name and hands them to the
/// aggregation callback. Insertion order is preserved: the first
/// participant's template fixes the order for the whole federation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ModelSet {
    entries: Vec<(String, Vec<f32>)>,
}

impl ModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, Vec<f32>)>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = values,
            None => self.entries.push((name, values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A set with the same names and shapes, all parameters zeroed. Used to
    /// seed the global model when the first participant's weights must not.
    pub fn zeroed_like(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(n, v)| (n.clone(), vec![0.0; v.len()]))
                .collect(),
        }
    }

    /// Total number of parameters across all arrays.
    pub fn param_count(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Rough wire size in bytes, used for metrics accounting.
    pub fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(n, v)| n.len() + v.len() * 4 + 8)
            .sum()
    }
}

/// Mints a model id from the component that produced it and the generation
/// time. The digest suffix keeps ids unique across restarts of the same
/// component.
pub fn generate_model_id(
    prefix: &str,
    component_id: &str,
    gen_time: u64,
) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(component_id.as_bytes());
    hasher.update(gen_time.to_le_bytes());
    let digest = hasher.finalize();

    format!("{}-{}-{}", prefix, component_id, hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_preserves_order_and_replaces() {
        let mut set = ModelSet::new();
        set.insert("layer1", vec![1.0, 2.0]);
        set.insert("layer0", vec![3.0]);
        set.insert("layer1", vec![4.0, 5.0]);

        let names: Vec<_> = set.names().collect();
        assert_eq!(names, vec!["layer1", "layer0"]);
        assert_eq!(set.get("layer1"), Some(&[4.0f32, 5.0][..]));
        assert_eq!(set.param_count(), 3);
    }

    #[test]
    fn zeroed_like_keeps_shapes() {
        let mut set = ModelSet::new();
        set.insert("w", vec![1.0, 2.0, 3.0]);
        set.insert("b", vec![4.0]);

        let zeroed = set.zeroed_like();
        assert_eq!(zeroed.get("w"), Some(&[0.0f32, 0.0, 0.0][..]));
        assert_eq!(zeroed.get("b"), Some(&[0.0f32][..]));
    }

    #[test]
    fn model_ids_are_stable_and_distinct() {
        let a = generate_model_id(AGENT_PREFIX, "node-1", 1000);
        let b = generate_model_id(AGENT_PREFIX, "node-1", 1000);
        let c = generate_model_id(AGENT_PREFIX, "node-1", 1001);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("agent-node-1-"));
    }
}
