//! Per-shard MVCC storage: delta-chain versioning over vertex and edge
//! containers, secondary indices, the transaction table, and the online
//! splitter that rehomes a key suffix onto a new shard.

pub mod delta;
pub mod indices;
pub mod shard;
pub mod splitter;
pub mod transaction;
pub mod vertex;

pub use delta::{Delta, DeltaAction, DeltaId, PrevPtr};
pub use indices::Indices;
pub use shard::ShardEngine;
pub use splitter::SplitData;
pub use transaction::{Transaction, TxnStatus};
pub use vertex::{EdgeContainer, EdgeLink, EdgeRecord, VertexContainer, VertexRecord};
