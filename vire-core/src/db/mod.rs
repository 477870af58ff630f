//! Storage layer: the incrementally-rehashing dict, shards built from it,
//! and the sharded keyspace built from those.

pub mod crc16;
pub mod dict;
pub mod eviction;
pub mod expire;
pub mod keyspace;
pub mod shard;

pub use eviction::EvictionPolicy;
pub use keyspace::Keyspace;
pub use shard::{ClientId, Shard, ShardData};
