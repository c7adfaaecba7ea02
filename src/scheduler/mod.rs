//! Shard discovery and assignment.
//!
//! - [`discover_shards`]: list input files in a stable order
//! - [`artifact_exists`]: the "already done" check that makes runs resumable
//! - [`partition`]: deterministic shard-to-worker assignment

pub mod partition;
pub mod shard;

pub use partition::{partition, Assignment};
pub use shard::{artifact_exists, discover_shards, ShardStatus, WorkShard};
