// store/memory.rs
//! In-memory pipeline store
//!
//! Executes pipelines with the in-process engine and applies bulk writes to
//! plain vectors of documents. Round-trips are counted so callers can assert
//! how many store calls a view or aggregation batch issued, and the next bulk
//! write can be made to fail on purpose.
//!
//! ```text
//! MemoryStore (PipelineStore implementation)
//!      ↓
//! RwLock<HashMap<String, Vec<Value>>> (collection -> documents, insertion order)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::{BulkWriteResult, IndexSpec, PipelineStore, WriteOp};
use crate::document::ObjectId;
use crate::engine::{apply_update, matches_filter, LookupSource, Pipeline, UpdateFailure};
use crate::error::{MutationError, Result, SampleDbError};

/// Pending failure injected into the next bulk write
#[derive(Debug, Clone)]
struct InjectedFailure {
    reason: String,
    /// Operations applied before the failure is raised
    after: usize,
}

/// In-memory store backend
///
/// # Examples
///
/// ```
/// use sampledb_core::store::{MemoryStore, PipelineStore};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.insert_many("samples", vec![json!({"n": 1}), json!({"n": 2})]).unwrap();
/// let out = store.aggregate("samples", &[json!({"$count": "count"})]).unwrap();
/// assert_eq!(out, vec![json!({"count": 2})]);
/// assert_eq!(store.aggregate_calls(), 1);
/// ```
#[derive(Default)]
pub struct MemoryStore {
    /// Collection name -> documents
    collections: RwLock<HashMap<String, Vec<Value>>>,

    /// Collection name -> indexes
    indexes: RwLock<HashMap<String, Vec<IndexSpec>>>,

    aggregate_calls: AtomicUsize,
    bulk_write_calls: AtomicUsize,
    fail_next: Mutex<Option<InjectedFailure>>,
}

/// Read-locked view of every collection, used for `$lookup`
struct Snapshot<'a>(&'a HashMap<String, Vec<Value>>);

impl LookupSource for Snapshot<'_> {
    fn collection_docs(&self, name: &str) -> Vec<Value> {
        self.0.get(name).cloned().unwrap_or_default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `aggregate` round-trips issued so far
    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    /// Number of `bulk_write` round-trips issued so far
    pub fn bulk_write_calls(&self) -> usize {
        self.bulk_write_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.aggregate_calls.store(0, Ordering::SeqCst);
        self.bulk_write_calls.store(0, Ordering::SeqCst);
    }

    /// Make the next bulk write fail before applying any operation
    pub fn fail_next_bulk_write(&self, reason: &str) {
        self.fail_next_bulk_write_after(reason, 0);
    }

    /// Make the next bulk write fail after applying `after` operations
    pub fn fail_next_bulk_write_after(&self, reason: &str, after: usize) {
        *self.fail_next.lock() = Some(InjectedFailure {
            reason: reason.to_string(),
            after,
        });
    }

    /// Copy of a collection's documents in storage order
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    fn apply_op(docs: &mut Vec<Value>, op: &WriteOp, result: &mut BulkWriteResult) -> std::result::Result<(), UpdateFailure> {
        let matching = |docs: &Vec<Value>, filter: &Value, many: bool| -> std::result::Result<Vec<usize>, UpdateFailure> {
            let mut hits = Vec::new();
            for (i, doc) in docs.iter().enumerate() {
                if matches_filter(doc, filter).map_err(|e| UpdateFailure::Invalid(e.to_string()))? {
                    hits.push(i);
                    if !many {
                        break;
                    }
                }
            }
            Ok(hits)
        };

        match op {
            WriteOp::InsertOne(doc) => {
                let mut doc = doc.clone();
                ensure_id(&mut doc);
                docs.push(doc);
                result.inserted += 1;
            }
            WriteOp::UpdateOne { filter, update } | WriteOp::UpdateMany { filter, update } => {
                let many = matches!(op, WriteOp::UpdateMany { .. });
                for i in matching(docs, filter, many)? {
                    result.matched += 1;
                    // Work on a copy so a failing update leaves the document untouched
                    let mut next = docs[i].clone();
                    if apply_update(&mut next, update)? {
                        docs[i] = next;
                        result.modified += 1;
                    }
                }
            }
            WriteOp::ReplaceOne {
                filter,
                replacement,
            } => {
                if let Some(&i) = matching(docs, filter, false)?.first() {
                    result.matched += 1;
                    let mut next = docs[i].clone();
                    if apply_update(&mut next, replacement)? {
                        docs[i] = next;
                        result.modified += 1;
                    }
                }
            }
            WriteOp::DeleteOne { filter } | WriteOp::DeleteMany { filter } => {
                let many = matches!(op, WriteOp::DeleteMany { .. });
                let hits = matching(docs, filter, many)?;
                for i in hits.into_iter().rev() {
                    docs.remove(i);
                    result.deleted += 1;
                }
            }
        }
        Ok(())
    }
}

fn ensure_id(doc: &mut Value) -> Value {
    if let Value::Object(map) = doc {
        map.entry("_id")
            .or_insert_with(|| ObjectId::new().to_value())
            .clone()
    } else {
        Value::Null
    }
}

fn to_mutation_error(failure: UpdateFailure, applied: usize) -> MutationError {
    match failure {
        UpdateFailure::NullArrayField(path) => MutationError::NullArrayField { path, applied },
        UpdateFailure::NotAnArray(path) => MutationError::NotAnArray { path, applied },
        UpdateFailure::Invalid(reason) => MutationError::WriteFailed { reason, applied },
    }
}

impl PipelineStore for MemoryStore {
    fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        let pipeline = Pipeline::from_stages(pipeline)?;

        let collections = self.collections.read();
        let docs = collections.get(collection).cloned().unwrap_or_default();
        pipeline.execute(docs, &Snapshot(&collections))
    }

    fn bulk_write(&self, collection: &str, ops: &[WriteOp], ordered: bool) -> Result<BulkWriteResult> {
        self.bulk_write_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self.fail_next.lock().take();

        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        let mut result = BulkWriteResult::default();
        let mut first_error: Option<MutationError> = None;

        for (i, op) in ops.iter().enumerate() {
            if let Some(failure) = injected.as_ref().filter(|f| f.after == i) {
                return Err(MutationError::WriteFailed {
                    reason: failure.reason.clone(),
                    applied: i,
                }
                .into());
            }
            if let Err(failure) = Self::apply_op(docs, op, &mut result) {
                let err = to_mutation_error(failure, i);
                if ordered {
                    return Err(err.into());
                }
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(result),
        }
    }

    fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut collections = self.collections.write();
        let target = collections.entry(collection.to_string()).or_default();
        let mut ids = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if !doc.is_object() {
                return Err(SampleDbError::Serialization(
                    "Document must be an object".to_string(),
                ));
            }
            ids.push(ensure_id(&mut doc));
            target.push(doc);
        }
        Ok(ids)
    }

    fn create_index(&self, collection: &str, keys: &[(String, i32)], unique: bool) -> Result<String> {
        if keys.is_empty() {
            return Err(SampleDbError::InvalidQuery(
                "Index requires at least one key".to_string(),
            ));
        }
        let name = IndexSpec::default_name(keys);
        let mut indexes = self.indexes.write();
        let entry = indexes.entry(collection.to_string()).or_default();
        if !entry.iter().any(|spec| spec.name == name) {
            entry.push(IndexSpec {
                name: name.clone(),
                keys: keys.to_vec(),
                unique,
            });
        }
        Ok(name)
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        Ok(self
            .indexes
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(docs: Vec<Value>) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_many("samples", docs).unwrap();
        store
    }

    #[test]
    fn test_insert_generates_object_ids() {
        let store = MemoryStore::new();
        let ids = store.insert_many("samples", vec![json!({"a": 1}), json!({"_id": 5})]).unwrap();
        assert!(crate::document::is_object_id(&ids[0]));
        assert_eq!(ids[1], json!(5));
        assert_eq!(store.count("samples"), 2);
    }

    #[test]
    fn test_aggregate_missing_collection_is_empty() {
        let store = MemoryStore::new();
        assert!(store.aggregate("nope", &[]).unwrap().is_empty());
        assert_eq!(store.aggregate_calls(), 1);
    }

    #[test]
    fn test_ordered_bulk_write_stops_at_null_array() {
        let store = store_with(vec![
            json!({"_id": 1, "tags": []}),
            json!({"_id": 2, "tags": null}),
            json!({"_id": 3, "tags": []}),
        ]);
        let ops: Vec<WriteOp> = (1..=3)
            .map(|i| WriteOp::update_one(json!({"_id": i}), json!({"$push": {"tags": "x"}})))
            .collect();
        let err = store.bulk_write("samples", &ops, true).unwrap_err();
        match err {
            SampleDbError::Mutation(MutationError::NullArrayField { path, applied }) => {
                assert_eq!(path, "tags");
                assert_eq!(applied, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let docs = store.documents("samples");
        assert_eq!(docs[0]["tags"], json!(["x"]));
        assert_eq!(docs[2]["tags"], json!([]));
    }

    #[test]
    fn test_unordered_bulk_write_continues() {
        let store = store_with(vec![json!({"_id": 1, "tags": null}), json!({"_id": 2, "tags": []})]);
        let ops: Vec<WriteOp> = (1..=2)
            .map(|i| WriteOp::update_one(json!({"_id": i}), json!({"$push": {"tags": "x"}})))
            .collect();
        assert!(store.bulk_write("samples", &ops, false).is_err());
        assert_eq!(store.documents("samples")[1]["tags"], json!(["x"]));
    }

    #[test]
    fn test_update_many_and_delete() {
        let store = store_with(vec![json!({"_id": 1, "n": 1}), json!({"_id": 2, "n": 1}), json!({"_id": 3, "n": 2})]);
        let result = store
            .bulk_write(
                "samples",
                &[
                    WriteOp::update_many(json!({"n": 1}), json!({"$set": {"seen": true}})),
                    WriteOp::DeleteOne { filter: json!({"n": 2}) },
                ],
                true,
            )
            .unwrap();
        assert_eq!(result.matched, 2);
        assert_eq!(result.modified, 2);
        assert_eq!(result.deleted, 1);
        assert_eq!(store.count("samples"), 2);
    }

    #[test]
    fn test_injected_failure_applies_prefix() {
        let store = store_with(vec![json!({"_id": 1}), json!({"_id": 2})]);
        store.fail_next_bulk_write_after("disk full", 1);
        let ops: Vec<WriteOp> = (1..=2)
            .map(|i| WriteOp::update_one(json!({"_id": i}), json!({"$set": {"x": 1}})))
            .collect();
        let err = store.bulk_write("samples", &ops, true).unwrap_err();
        assert!(matches!(err, SampleDbError::Mutation(MutationError::WriteFailed { applied: 1, .. })));
        assert_eq!(store.documents("samples")[0]["x"], json!(1));
        assert!(store.documents("samples")[1].get("x").is_none());

        // Injection is one-shot
        assert!(store.bulk_write("samples", &ops, true).is_ok());
    }

    #[test]
    fn test_lookup_reads_other_collection() {
        let store = store_with(vec![json!({"_id": 1})]);
        store
            .insert_many("frames.samples", vec![json!({"_sample_id": 1, "frame_number": 1})])
            .unwrap();
        let out = store
            .aggregate(
                "samples",
                &[json!({"$lookup": {"from": "frames.samples", "localField": "_id", "foreignField": "_sample_id", "as": "frames"}})],
            )
            .unwrap();
        assert_eq!(out[0]["frames"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_indexes() {
        let store = MemoryStore::new();
        let keys = vec![("filepath".to_string(), 1)];
        assert_eq!(store.create_index("samples", &keys, true).unwrap(), "filepath_1");
        store.create_index("samples", &keys, true).unwrap();
        assert_eq!(store.list_indexes("samples").unwrap().len(), 1);
    }
}
