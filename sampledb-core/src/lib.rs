// sampledb-core/src/lib.rs
// Pure Rust API - the document store is injected through PipelineStore

pub mod logging;

pub mod aggregation;
pub mod batching;
pub mod collection;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod path;
pub mod schema;
pub mod store;
pub mod value_utils;
pub mod view;

// Public exports
pub use aggregation::{run_aggregations, run_aggregations_partial, AggregationRequest, AggregationResult};
pub use batching::{adaptive_batches, run_sharded, shard, SampleMutation, SaveContext};
pub use collection::{Collection, GroupAssignment};
pub use config::{BatchingStrategy, EngineConfig};
pub use document::ObjectId;
pub use error::{MutationError, Result, SampleDbError};
pub use logging::{get_log_level, init_from_env, set_log_level, LogLevel};
pub use path::{resolve_path, ResolveOptions, ResolvedPath};
pub use schema::{get_dynamic_schema, DynamicSchema, FieldDescriptor, MediaType, SchemaCatalog};
pub use store::{MemoryStore, PipelineStore};
pub use view::{append_stage, build_view, PipelineOptions, View, ViewStage};
