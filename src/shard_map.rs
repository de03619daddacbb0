//! Authoritative, versioned mapping from `(label, primary key)` to the shard
//! (replica set) owning that key.
//!
//! The coordinator owns the only writable copy; everyone else holds cached
//! snapshots and replaces them wholesale when told they are stale. Versions
//! are HLCs and strictly monotone; partial merges are not a thing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::hlc::Hlc;
use crate::rsm::Address;
use crate::types::{EdgeTypeId, LabelId, PropertyId};
use crate::value::{PrimaryKey, ValueType};

/// One member of a shard's replica set. The first peer in the list is the
/// current leader hint; routing tolerates the hint being wrong.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: Address,
    pub is_leader_hint: bool,
}

/// Identity of one shard: the label space it belongs to, the low end of the
/// key range it owns, and its replica set. Used verbatim as the router's
/// client-cache key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard {
    pub label: LabelId,
    pub low_key: PrimaryKey,
    pub peers: Vec<PeerInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub property_id: PropertyId,
    pub ty: ValueType,
}

/// The shards of one primary label, keyed by the low key of each owned
/// range. A shard owns `[its_key, next_key)`; the last shard is unbounded
/// above.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    pub shards: BTreeMap<PrimaryKey, Vec<PeerInfo>>,
    pub replication_factor: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    pub version: Hlc,
    labels: BTreeMap<String, LabelId>,
    label_names: BTreeMap<LabelId, String>,
    properties: BTreeMap<String, PropertyId>,
    property_names: BTreeMap<PropertyId, String>,
    edge_types: BTreeMap<String, EdgeTypeId>,
    edge_type_names: BTreeMap<EdgeTypeId, String>,
    pub schemas: BTreeMap<LabelId, Vec<SchemaProperty>>,
    pub label_spaces: BTreeMap<LabelId, LabelSpace>,
    next_label_id: u32,
    next_property_id: u32,
    next_edge_type_id: u32,
}

impl ShardMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a primary label with its primary-key schema. Append-only:
    /// re-registering an existing name returns the existing id unchanged.
    pub fn add_label(
        &mut self,
        name: &str,
        schema: Vec<SchemaProperty>,
        replication_factor: usize,
    ) -> LabelId {
        if let Some(id) = self.labels.get(name) {
            return *id;
        }
        let id = LabelId(self.next_label_id);
        self.next_label_id += 1;
        self.labels.insert(name.to_owned(), id);
        self.label_names.insert(id, name.to_owned());
        self.schemas.insert(id, schema);
        self.label_spaces.insert(
            id,
            LabelSpace {
                shards: BTreeMap::new(),
                replication_factor,
            },
        );
        id
    }

    pub fn intern_property(&mut self, name: &str) -> PropertyId {
        if let Some(id) = self.properties.get(name) {
            return *id;
        }
        let id = PropertyId(self.next_property_id);
        self.next_property_id += 1;
        self.properties.insert(name.to_owned(), id);
        self.property_names.insert(id, name.to_owned());
        id
    }

    pub fn intern_edge_type(&mut self, name: &str) -> EdgeTypeId {
        if let Some(id) = self.edge_types.get(name) {
            return *id;
        }
        let id = EdgeTypeId(self.next_edge_type_id);
        self.next_edge_type_id += 1;
        self.edge_types.insert(name.to_owned(), id);
        self.edge_type_names.insert(id, name.to_owned());
        id
    }

    /// Places a shard owning `[low_key, next_key)` in a label space. Used by
    /// the bootstrap path; later range changes go through [`Self::split_shard`].
    pub fn place_shard(
        &mut self,
        label: LabelId,
        low_key: PrimaryKey,
        peers: Vec<PeerInfo>,
    ) -> Result<()> {
        let space = self
            .label_spaces
            .get_mut(&label)
            .ok_or_else(|| TesseraError::NotFound(format!("label space {label}")))?;
        space.shards.insert(low_key, peers);
        Ok(())
    }

    pub fn get_label_id(&self, name: &str) -> Option<LabelId> {
        self.labels.get(name).copied()
    }

    pub fn label_name(&self, id: LabelId) -> Option<&str> {
        self.label_names.get(&id).map(String::as_str)
    }

    pub fn property_name(&self, id: PropertyId) -> Option<&str> {
        self.property_names.get(&id).map(String::as_str)
    }

    pub fn edge_type_name(&self, id: EdgeTypeId) -> Option<&str> {
        self.edge_type_names.get(&id).map(String::as_str)
    }

    pub fn get_property_id(&self, name: &str) -> Option<PropertyId> {
        self.properties.get(name).copied()
    }

    pub fn get_edge_type_id(&self, name: &str) -> Option<EdgeTypeId> {
        self.edge_types.get(name).copied()
    }

    pub fn label_registry(&self) -> impl Iterator<Item = (&String, LabelId)> {
        self.labels.iter().map(|(name, id)| (name, *id))
    }

    pub fn property_registry(&self) -> impl Iterator<Item = (&String, PropertyId)> {
        self.properties.iter().map(|(name, id)| (name, *id))
    }

    pub fn edge_type_registry(&self) -> impl Iterator<Item = (&String, EdgeTypeId)> {
        self.edge_types.iter().map(|(name, id)| (name, *id))
    }

    pub fn is_primary_label(&self, label: LabelId) -> bool {
        self.label_spaces.contains_key(&label)
    }

    /// Whether `property` participates in `label`'s primary key.
    pub fn is_primary_key_property(&self, label: LabelId, property: PropertyId) -> bool {
        self.schemas
            .get(&label)
            .map(|schema| schema.iter().any(|p| p.property_id == property))
            .unwrap_or(false)
    }

    /// Resolves the shard owning `key` within `label`'s space.
    pub fn shard_for_key(&self, label: LabelId, key: &PrimaryKey) -> Result<Shard> {
        let space = self
            .label_spaces
            .get(&label)
            .ok_or_else(|| TesseraError::NotFound(format!("label space {label}")))?;
        let (low_key, peers) = space
            .shards
            .range(..=key.clone())
            .next_back()
            .ok_or_else(|| TesseraError::NotFound(format!("shard for key {key}")))?;
        Ok(Shard {
            label,
            low_key: low_key.clone(),
            peers: peers.clone(),
        })
    }

    /// Every shard of one label space, in key order.
    pub fn shards_for_label(&self, label: LabelId) -> Result<Vec<Shard>> {
        let space = self
            .label_spaces
            .get(&label)
            .ok_or_else(|| TesseraError::NotFound(format!("label space {label}")))?;
        Ok(space
            .shards
            .iter()
            .map(|(low_key, peers)| Shard {
                label,
                low_key: low_key.clone(),
                peers: peers.clone(),
            })
            .collect())
    }

    /// Every shard in the map, label by label.
    pub fn all_shards(&self) -> Vec<Shard> {
        self.label_spaces
            .iter()
            .flat_map(|(label, space)| {
                space.shards.iter().map(|(low_key, peers)| Shard {
                    label: *label,
                    low_key: low_key.clone(),
                    peers: peers.clone(),
                })
            })
            .collect()
    }

    /// Validates a primary key against the label schema.
    pub fn check_primary_key(&self, label: LabelId, key: &PrimaryKey) -> Result<()> {
        let schema = self
            .schemas
            .get(&label)
            .ok_or_else(|| TesseraError::NotFound(format!("schema for label {label}")))?;
        if key.len() != schema.len() {
            return Err(TesseraError::SchemaViolation(format!(
                "primary key arity {} does not match schema arity {}",
                key.len(),
                schema.len()
            )));
        }
        for (ix, (value, prop)) in key.0.iter().zip(schema.iter()).enumerate() {
            if !value.conforms_to(prop.ty) {
                return Err(TesseraError::SchemaViolation(format!(
                    "primary key component {ix} has the wrong type for property {}",
                    prop.property_id
                )));
            }
        }
        Ok(())
    }

    /// Splits the shard immediately beneath `split_key`. The new shard is
    /// placed on `new_peers` when the coordinator has standby capacity, and
    /// inherits the parent's replica set otherwise. Fails with `Conflict`
    /// when the caller raced another map write, or when `split_key` is
    /// already a shard boundary.
    pub fn split_shard(
        &mut self,
        previous_version: Hlc,
        label: LabelId,
        split_key: PrimaryKey,
        new_peers: Option<Vec<PeerInfo>>,
        new_version: Hlc,
    ) -> Result<()> {
        if previous_version != self.version {
            return Err(TesseraError::Conflict(format!(
                "shard map version moved from {} to {}",
                previous_version.logical_id, self.version.logical_id
            )));
        }
        let space = self
            .label_spaces
            .get_mut(&label)
            .ok_or_else(|| TesseraError::NotFound(format!("label space {label}")))?;
        if space.shards.contains_key(&split_key) {
            return Err(TesseraError::Conflict(format!(
                "{split_key} is already a shard boundary"
            )));
        }
        let inherited = space
            .shards
            .range(..=split_key.clone())
            .next_back()
            .map(|(_, peers)| peers.clone())
            .ok_or_else(|| TesseraError::NotFound(format!("shard beneath {split_key}")))?;
        space.shards.insert(split_key, new_peers.unwrap_or(inherited));
        self.version = new_version;
        Ok(())
    }

    /// Stamps a structural change made through the bootstrap helpers.
    pub fn set_version(&mut self, version: Hlc) {
        self.version = version;
    }
}

/// Bidirectional name↔id registry rebuilt by the router on every shard-map
/// refresh.
#[derive(Debug, Default, Clone)]
pub struct NameIdMapper {
    name_to_id: HashMap<String, u64>,
    id_to_name: HashMap<u64, String>,
}

impl NameIdMapper {
    pub fn store_mapping(&mut self, id_to_name: HashMap<u64, String>) {
        self.name_to_id = id_to_name
            .iter()
            .map(|(id, name)| (name.clone(), *id))
            .collect();
        self.id_to_name = id_to_name;
    }

    pub fn id_to_name(&self, id: u64) -> Option<&str> {
        self.id_to_name.get(&id).map(String::as_str)
    }

    pub fn name_to_id(&self, name: &str) -> Option<u64> {
        self.name_to_id.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn int_key(values: &[i64]) -> PrimaryKey {
        PrimaryKey::new(values.iter().copied().map(Value::Int).collect())
    }

    fn test_map() -> (ShardMap, LabelId) {
        let mut map = ShardMap::new();
        let p1 = PropertyId(0);
        let label = map.add_label(
            "test_label",
            vec![
                SchemaProperty {
                    property_id: p1,
                    ty: ValueType::Int,
                },
                SchemaProperty {
                    property_id: PropertyId(1),
                    ty: ValueType::Int,
                },
            ],
            1,
        );
        let peers = vec![PeerInfo {
            address: Address::new(7),
            is_leader_hint: true,
        }];
        map.place_shard(label, int_key(&[0, 0]), peers.clone()).unwrap();
        map.place_shard(label, int_key(&[100, 0]), peers).unwrap();
        map.set_version(Hlc::new(1, 0));
        (map, label)
    }

    #[test]
    fn range_lookup_finds_owning_shard() {
        let (map, label) = test_map();
        let shard = map.shard_for_key(label, &int_key(&[13, 13])).unwrap();
        assert_eq!(shard.low_key, int_key(&[0, 0]));
        let shard = map.shard_for_key(label, &int_key(&[100, 0])).unwrap();
        assert_eq!(shard.low_key, int_key(&[100, 0]));
        let shard = map.shard_for_key(label, &int_key(&[5_000, 1])).unwrap();
        assert_eq!(shard.low_key, int_key(&[100, 0]));
    }

    #[test]
    fn split_requires_current_version() {
        let (mut map, label) = test_map();
        let err = map
            .split_shard(Hlc::new(0, 0), label, int_key(&[50, 0]), None, Hlc::new(2, 0))
            .unwrap_err();
        assert!(matches!(err, TesseraError::Conflict(_)));

        map.split_shard(Hlc::new(1, 0), label, int_key(&[50, 0]), None, Hlc::new(2, 0))
            .unwrap();
        assert_eq!(map.version, Hlc::new(2, 0));
        let shard = map.shard_for_key(label, &int_key(&[75, 0])).unwrap();
        assert_eq!(shard.low_key, int_key(&[50, 0]));
    }

    #[test]
    fn schema_check_rejects_bad_keys() {
        let (map, label) = test_map();
        assert!(map.check_primary_key(label, &int_key(&[1, 2])).is_ok());
        assert!(map.check_primary_key(label, &int_key(&[1])).is_err());
        let wrong_type = PrimaryKey::new(vec![Value::Int(0), Value::String("x".into())]);
        assert!(map.check_primary_key(label, &wrong_type).is_err());
    }

    #[test]
    fn registries_are_append_only() {
        let (mut map, label) = test_map();
        assert_eq!(map.add_label("test_label", Vec::new(), 1), label);
        let p = map.intern_property("age");
        assert_eq!(map.intern_property("age"), p);
        assert_eq!(map.get_property_id("age"), Some(p));
    }
}
