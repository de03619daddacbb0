//! Secondary indices of one shard.
//!
//! Per-label and per-`(label, property)` entries map back to the owning
//! vertex by primary key. Maintenance is synchronous with the mutation that
//! touches the label or property; visibility is re-checked at query time
//! against the delta chain, so index entries themselves are unversioned.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{LabelId, PropertyId};
use crate::value::{PrimaryKey, Value};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Indices {
    label: BTreeMap<LabelId, BTreeSet<PrimaryKey>>,
    label_property: BTreeMap<(LabelId, PropertyId), BTreeSet<(Value, PrimaryKey)>>,
}

impl Indices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_label_entry(&mut self, label: LabelId, pk: &PrimaryKey) {
        self.label.entry(label).or_default().insert(pk.clone());
    }

    pub fn remove_label_entry(&mut self, label: LabelId, pk: &PrimaryKey) {
        if let Some(entries) = self.label.get_mut(&label) {
            entries.remove(pk);
        }
    }

    pub fn add_property_entry(
        &mut self,
        label: LabelId,
        property: PropertyId,
        value: &Value,
        pk: &PrimaryKey,
    ) {
        self.label_property
            .entry((label, property))
            .or_default()
            .insert((value.clone(), pk.clone()));
    }

    pub fn remove_property_entry(
        &mut self,
        label: LabelId,
        property: PropertyId,
        value: &Value,
        pk: &PrimaryKey,
    ) {
        if let Some(entries) = self.label_property.get_mut(&(label, property)) {
            entries.remove(&(value.clone(), pk.clone()));
        }
    }

    /// Vertices currently carrying `label` (visibility unchecked).
    pub fn vertices_with_label(&self, label: LabelId) -> impl Iterator<Item = &PrimaryKey> {
        self.label.get(&label).into_iter().flatten()
    }

    /// Splits off every entry whose vertex moved to `[split_key, ..)`.
    pub fn split_off(&mut self, split_key: &PrimaryKey) -> Indices {
        let mut moved = Indices::new();
        for (label, entries) in &mut self.label {
            let keep: BTreeSet<PrimaryKey> = entries
                .iter()
                .filter(|pk| *pk < split_key)
                .cloned()
                .collect();
            let gone: BTreeSet<PrimaryKey> = entries
                .iter()
                .filter(|pk| *pk >= split_key)
                .cloned()
                .collect();
            if !gone.is_empty() {
                moved.label.insert(*label, gone);
            }
            *entries = keep;
        }
        for (key, entries) in &mut self.label_property {
            let keep: BTreeSet<(Value, PrimaryKey)> = entries
                .iter()
                .filter(|(_, pk)| pk < split_key)
                .cloned()
                .collect();
            let gone: BTreeSet<(Value, PrimaryKey)> = entries
                .iter()
                .filter(|(_, pk)| pk >= split_key)
                .cloned()
                .collect();
            if !gone.is_empty() {
                moved.label_property.insert(key.clone(), gone);
            }
            *entries = keep;
        }
        moved
    }

    /// Installs entries produced by [`Self::split_off`] on the other side.
    pub fn absorb(&mut self, other: Indices) {
        for (label, entries) in other.label {
            self.label.entry(label).or_default().extend(entries);
        }
        for (key, entries) in other.label_property {
            self.label_property.entry(key).or_default().extend(entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn pk(a: i64) -> PrimaryKey {
        PrimaryKey::new(vec![Value::Int(a)])
    }

    #[test]
    fn split_off_partitions_entries() {
        let mut indices = Indices::new();
        let label = LabelId(1);
        let property = PropertyId(2);
        for k in [1, 5, 100, 1000] {
            indices.add_label_entry(label, &pk(k));
            indices.add_property_entry(label, property, &Value::Int(k), &pk(k));
        }
        let moved = indices.split_off(&pk(50));
        let kept: Vec<_> = indices.vertices_with_label(label).cloned().collect();
        assert_eq!(kept, vec![pk(1), pk(5)]);
        let gone: Vec<_> = moved.vertices_with_label(label).cloned().collect();
        assert_eq!(gone, vec![pk(100), pk(1000)]);
    }
}
