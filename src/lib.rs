//! Distributed execution core of a sharded, MVCC-backed property graph.
//!
//! Three pieces do the heavy lifting: the coordinator (a replicated state
//! machine owning the shard map and the hybrid logical clock), the per-shard
//! storage engine (delta-chain MVCC with an online splitter), and the
//! request router (client-side fan-out, pagination and commit across
//! shards). The RSM runtime underneath provides leader election, log
//! replication and client redirection over an in-process transport.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hlc;
pub mod logging;
pub mod msgs;
pub mod primitives;
pub mod router;
pub mod rsm;
pub mod shard_map;
pub mod storage;
pub mod types;
pub mod value;

pub use crate::cluster::{Cluster, LabelSpec};
pub use crate::config::ClusterConfig;
pub use crate::error::{Result, ShardError, ShardErrorKind, TesseraError};
pub use crate::hlc::Hlc;
pub use crate::router::{ExecutionState, ExecutionStatus, RequestRouter};
pub use crate::shard_map::{Shard, ShardMap};
pub use crate::storage::ShardEngine;
pub use crate::types::{EdgeTypeId, Gid, LabelId, PropertyId};
pub use crate::value::{PrimaryKey, Value, ValueType, VertexId};
