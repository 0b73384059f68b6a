// store/mod.rs
//! Document store abstraction consumed by the core
//!
//! The core never talks to a database driver directly. Every round-trip goes
//! through [`PipelineStore`], which is injected into a
//! [`Collection`](crate::Collection) as an `Arc<dyn PipelineStore>`.
//!
//! ```text
//! PipelineStore trait
//!   ├── MemoryStore (in-process engine, counters, failure injection)
//!   └── driver adapters supplied by the embedding application
//! ```

pub mod memory;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use memory::MemoryStore;

/// One operation of a bulk write, keyed by a filter on the document
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertOne(Value),
    UpdateOne { filter: Value, update: Value },
    UpdateMany { filter: Value, update: Value },
    ReplaceOne { filter: Value, replacement: Value },
    DeleteOne { filter: Value },
    DeleteMany { filter: Value },
}

impl WriteOp {
    pub fn update_one(filter: Value, update: Value) -> Self {
        WriteOp::UpdateOne { filter, update }
    }

    pub fn update_many(filter: Value, update: Value) -> Self {
        WriteOp::UpdateMany { filter, update }
    }

    pub fn filter(&self) -> Option<&Value> {
        match self {
            WriteOp::InsertOne(_) => None,
            WriteOp::UpdateOne { filter, .. }
            | WriteOp::UpdateMany { filter, .. }
            | WriteOp::ReplaceOne { filter, .. }
            | WriteOp::DeleteOne { filter }
            | WriteOp::DeleteMany { filter } => Some(filter),
        }
    }

    /// Approximate serialized size, used by size-based batching
    pub fn byte_size(&self) -> usize {
        let body = match self {
            WriteOp::InsertOne(doc) => doc.to_string().len(),
            WriteOp::UpdateOne { filter, update } | WriteOp::UpdateMany { filter, update } => {
                filter.to_string().len() + update.to_string().len()
            }
            WriteOp::ReplaceOne {
                filter,
                replacement,
            } => filter.to_string().len() + replacement.to_string().len(),
            WriteOp::DeleteOne { filter } | WriteOp::DeleteMany { filter } => {
                filter.to_string().len()
            }
        };
        body + 16
    }
}

/// Counts reported by a bulk write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub matched: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl BulkWriteResult {
    pub fn merge(&mut self, other: &BulkWriteResult) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.deleted += other.deleted;
    }
}

/// Index metadata as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
}

impl IndexSpec {
    /// Index name in the `field_1_other_-1` convention
    pub fn default_name(keys: &[(String, i32)]) -> String {
        keys.iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Pipeline-executing document store
///
/// Implementations must be shareable across shard workers. Each call is one
/// round-trip; the core never holds a store lock across calls.
pub trait PipelineStore: Send + Sync {
    // ========================================================================
    // READS
    // ========================================================================

    /// Run an aggregation pipeline against a collection
    ///
    /// A collection that does not exist behaves like an empty one.
    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>>;

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Apply a batch of write operations
    ///
    /// With `ordered == true` the batch stops at the first failure, which is
    /// reported as [`MutationError`](crate::error::MutationError) carrying the
    /// number of operations that were applied before it.
    fn bulk_write(&self, collection: &str, ops: &[WriteOp], ordered: bool) -> Result<BulkWriteResult>;

    /// Insert documents, generating `_id`s where missing; returns the ids
    fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>>;

    // ========================================================================
    // INDEXES
    // ========================================================================

    fn create_index(&self, collection: &str, keys: &[(String, i32)], unique: bool) -> Result<String>;

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_default_name() {
        let keys = vec![("filepath".to_string(), 1), ("frame_number".to_string(), -1)];
        assert_eq!(IndexSpec::default_name(&keys), "filepath_1_frame_number_-1");
    }

    #[test]
    fn test_write_op_filter() {
        let op = WriteOp::update_one(json!({"_id": 1}), json!({"$set": {"a": 1}}));
        assert_eq!(op.filter(), Some(&json!({"_id": 1})));
        assert!(WriteOp::InsertOne(json!({})).filter().is_none());
        assert!(op.byte_size() > 16);
    }
}
