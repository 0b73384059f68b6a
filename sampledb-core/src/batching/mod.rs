// batching/mod.rs
//! Buffered writes, adaptive batch sizing and sharding
//!
//! - [`SaveContext`] buffers per-sample mutations and flushes them as ordered
//!   bulk writes (static, size or latency strategy).
//! - [`adaptive_batches`] slices an item stream into batches whose size
//!   follows a latency or content-size target.
//! - [`shard`] partitions a view into disjoint shards for parallel workers.

pub mod adaptive;
pub mod save_context;
pub mod shard;

pub use adaptive::{
    adaptive_batches, BatchKind, BatchSizer, Batches, ContentSizeBatcher, LatencyBatcher,
    StaticBatcher,
};
pub use save_context::{FieldUpdate, SampleMutation, SaveContext};
pub use shard::{run_sharded, shard, shard_bounds, shard_with_policy, Shard, ShardPolicy, ShardSpec};
