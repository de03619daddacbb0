//! Canonical value representation shared by the wire protocol, the storage
//! engine and the router.
//!
//! `Value` carries a total order (type-tag rank first, then the payload,
//! doubles via `total_cmp`) so that primary keys can key ordered containers
//! and the shard map can binary-search its label spaces.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{EdgeTypeId, Gid, LabelId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Vertex(Vertex),
    Edge(Edge),
    Path(Path),
}

/// Property types admissible in a label schema.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Double,
    String,
}

impl Value {
    fn tag_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Double(_) => 3,
            Value::String(_) => 4,
            Value::List(_) => 5,
            Value::Map(_) => 6,
            Value::Vertex(_) => 7,
            Value::Edge(_) => 8,
            Value::Path(_) => 9,
        }
    }

    /// Whether this value conforms to a schema property type.
    pub fn conforms_to(&self, ty: ValueType) -> bool {
        matches!(
            (self, ty),
            (Value::Bool(_), ValueType::Bool)
                | (Value::Int(_), ValueType::Int)
                | (Value::Double(_), ValueType::Double)
                | (Value::String(_), ValueType::String)
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (Value::Vertex(a), Value::Vertex(b)) => a.cmp(b),
            (Value::Edge(a), Value::Edge(b)) => a.id.cmp(&b.id),
            (Value::Path(a), Value::Path(b)) => a.cmp(b),
            _ => self.tag_rank().cmp(&other.tag_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

/// Ordered tuple of property values matching a label schema; compared
/// lexicographically in schema order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (ix, v) in self.0.iter().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            match v {
                Value::Int(i) => write!(f, "{i}")?,
                Value::Bool(b) => write!(f, "{b}")?,
                Value::Double(d) => write!(f, "{d}")?,
                Value::String(s) => write!(f, "{s:?}")?,
                other => write!(f, "{other:?}")?,
            }
        }
        write!(f, ")")
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Global vertex address: primary label plus primary key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId {
    pub label: LabelId,
    pub primary_key: PrimaryKey,
}

impl VertexId {
    pub fn new(label: LabelId, primary_key: PrimaryKey) -> Self {
        Self { label, primary_key }
    }
}

/// Wire representation of a vertex: its address and secondary labels.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    pub labels: Vec<LabelId>,
}

/// Global edge address: both endpoints plus the client-assigned gid.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId {
    pub src: VertexId,
    pub dst: VertexId,
    pub gid: Gid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub edge_type: EdgeTypeId,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathPart {
    pub dst: Vertex,
    pub edge: Gid,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    pub src: Vertex,
    pub parts: Vec<PathPart>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(values: Vec<i64>) -> PrimaryKey {
        PrimaryKey::new(values.into_iter().map(Value::Int).collect())
    }

    #[test]
    fn primary_keys_compare_lexicographically() {
        assert!(pk(vec![0, 0]) < pk(vec![0, 1]));
        assert!(pk(vec![0, 9]) < pk(vec![1, 0]));
        assert_eq!(pk(vec![13, 13]), pk(vec![13, 13]));
    }

    #[test]
    fn doubles_have_a_total_order() {
        let nan = Value::Double(f64::NAN);
        assert_eq!(nan.cmp(&nan), Ordering::Equal);
        assert!(Value::Double(1.0) < Value::Double(2.0));
    }

    #[test]
    fn mixed_types_rank_by_tag() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Int(i64::MAX) < Value::Double(f64::NEG_INFINITY));
        assert!(Value::Double(f64::INFINITY) < Value::String(String::new()));
    }

    #[test]
    fn values_round_trip_through_json() {
        let value = Value::Map(BTreeMap::from([
            ("k".to_owned(), Value::List(vec![Value::Int(1), Value::Null])),
            ("d".to_owned(), Value::Double(2.5)),
        ]));
        let bytes = serde_json::to_vec(&value).unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
