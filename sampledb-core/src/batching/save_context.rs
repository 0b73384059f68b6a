// batching/save_context.rs
//! Buffered sample writes
//!
//! A [`SaveContext`] validates each registered [`SampleMutation`] against the
//! collection schema, turns it into one `UpdateOne` operation and flushes the
//! buffer as an ordered bulk write whenever its [`BatchingStrategy`] says so.
//! Whatever is still pending when the context is finished (or dropped) is
//! flushed as well.

use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::collection::Collection;
use crate::config::BatchingStrategy;
use crate::document::ObjectId;
use crate::error::{MutationError, Result, SampleDbError};
use crate::path::{resolve_path, ResolveOptions, ResolvedPath};
use crate::schema::{FieldDescriptor, SchemaCatalog};
use crate::store::{BulkWriteResult, PipelineStore, WriteOp};

/// One change to one field of a sample
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set(String, Value),
    Unset(String),
    /// Append to a list field
    Push(String, Value),
    /// Append to a list field unless already present
    AddToSet(String, Value),
}

impl FieldUpdate {
    pub fn path(&self) -> &str {
        match self {
            FieldUpdate::Set(p, _)
            | FieldUpdate::Unset(p)
            | FieldUpdate::Push(p, _)
            | FieldUpdate::AddToSet(p, _) => p,
        }
    }

    fn operator(&self) -> &'static str {
        match self {
            FieldUpdate::Set(..) => "$set",
            FieldUpdate::Unset(_) => "$unset",
            FieldUpdate::Push(..) => "$push",
            FieldUpdate::AddToSet(..) => "$addToSet",
        }
    }
}

/// Pending changes to one sample
///
/// # Examples
///
/// ```rust
/// use sampledb_core::{ObjectId, SampleMutation};
/// use serde_json::json;
///
/// let mutation = SampleMutation::new(ObjectId::new())
///     .set("reviewed", json!(true))
///     .push("tags", json!("validated"))
///     .unset("scratch");
/// assert_eq!(mutation.updates().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMutation {
    id: ObjectId,
    updates: Vec<FieldUpdate>,
}

impl SampleMutation {
    pub fn new(id: ObjectId) -> Self {
        SampleMutation {
            id,
            updates: Vec::new(),
        }
    }

    pub fn set(mut self, path: &str, value: Value) -> Self {
        self.updates.push(FieldUpdate::Set(path.to_string(), value));
        self
    }

    pub fn unset(mut self, path: &str) -> Self {
        self.updates.push(FieldUpdate::Unset(path.to_string()));
        self
    }

    pub fn push(mut self, path: &str, value: Value) -> Self {
        self.updates.push(FieldUpdate::Push(path.to_string(), value));
        self
    }

    pub fn add_to_set(mut self, path: &str, value: Value) -> Self {
        self.updates.push(FieldUpdate::AddToSet(path.to_string(), value));
        self
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn updates(&self) -> &[FieldUpdate] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Buffered writer for the samples of one collection
///
/// Single-owner: a context is not shared between threads. Use
/// [`Collection::with_save_context`] to get flush errors reported; dropping a
/// context with pending writes flushes them and only logs a failure.
pub struct SaveContext {
    collection: Collection,
    strategy: BatchingStrategy,
    allow_dynamic: bool,
    pending: Vec<WriteOp>,
    pending_ids: Vec<ObjectId>,
    pending_bytes: usize,
    last_flush: Instant,
    history: Vec<usize>,
    written: BulkWriteResult,
}

impl SaveContext {
    pub fn new(collection: Collection, strategy: BatchingStrategy) -> Self {
        crate::log_debug!(
            "Opened {} save context on '{}'",
            strategy.name(),
            collection.name()
        );
        SaveContext {
            collection,
            strategy,
            allow_dynamic: false,
            pending: Vec::new(),
            pending_ids: Vec::new(),
            pending_bytes: 0,
            last_flush: Instant::now(),
            history: Vec::new(),
            written: BulkWriteResult::default(),
        }
    }

    /// Accept fields that are not declared in the schema
    pub fn with_dynamic(mut self, allow_dynamic: bool) -> Self {
        self.allow_dynamic = allow_dynamic;
        self
    }

    pub fn strategy(&self) -> BatchingStrategy {
        self.strategy
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of operations written by each flush so far
    pub fn flush_history(&self) -> &[usize] {
        &self.history
    }

    /// Totals reported by the store across all flushes
    pub fn written(&self) -> BulkWriteResult {
        self.written
    }

    /// Validate and buffer `mutation`, flushing if the strategy triggers
    pub fn register(&mut self, mutation: SampleMutation) -> Result<()> {
        if mutation.is_empty() {
            return Ok(());
        }
        let schema = self.collection.schema();
        let mut update = Map::new();
        for field_update in &mutation.updates {
            let (path, value) = self.prepare(&schema, field_update)?;
            let entry = update
                .entry(field_update.operator().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(fields) = entry {
                fields.insert(path, value);
            }
        }

        let op = WriteOp::update_one(json!({"_id": mutation.id.to_value()}), Value::Object(update));
        self.pending_bytes += op.byte_size();
        self.pending.push(op);
        self.pending_ids.push(mutation.id);

        if self.should_flush() {
            self.flush()?;
        }
        Ok(())
    }

    fn should_flush(&self) -> bool {
        match self.strategy {
            BatchingStrategy::Static { batch_size } => self.pending.len() >= batch_size.max(1),
            BatchingStrategy::Size { target_bytes } => self.pending_bytes >= target_bytes,
            BatchingStrategy::Latency { target } => self.last_flush.elapsed() >= target,
        }
    }

    /// Storage path and storage value of one field update
    fn prepare(&self, schema: &SchemaCatalog, update: &FieldUpdate) -> Result<(String, Value)> {
        let raw = update.path();
        let options = ResolveOptions::new().with_allow_missing(self.allow_dynamic);
        let resolved = resolve_path(schema, raw, &options)?.ok_or_else(|| SampleDbError::InvalidPath {
            path: raw.to_string(),
            reason: "empty path".to_string(),
        })?;
        let invalid = |reason: &str| SampleDbError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };
        if resolved.is_frame_field {
            return Err(invalid("frame fields cannot be saved through a sample save context"));
        }
        if resolved.group_slice.is_some() {
            return Err(invalid("group slice paths are read-only"));
        }
        if let Some(list) = resolved
            .other_list_fields
            .iter()
            .find(|l| resolved.path.starts_with(&format!("{}.", l)))
        {
            return Err(invalid(&format!("cannot write through list field '{}'", list)));
        }
        check_writable(schema, &resolved)?;

        let value = match update {
            FieldUpdate::Unset(_) => return Ok((resolved.path, json!(""))),
            FieldUpdate::Set(_, value) => {
                let value = resolved.to_storage(value.clone())?;
                if let Some(leaf) = &resolved.leaf {
                    leaf.validate(raw, &value)?;
                }
                value
            }
            FieldUpdate::Push(_, value) | FieldUpdate::AddToSet(_, value) => {
                let value = resolved.to_storage(value.clone())?;
                match &resolved.leaf {
                    Some(FieldDescriptor::ListOf(element)) => element.validate(raw, &value)?,
                    Some(other) => {
                        return Err(SampleDbError::TypeMismatch {
                            field: raw.to_string(),
                            expected: "list".to_string(),
                            found: other.to_string(),
                        })
                    }
                    None => {}
                }
                value
            }
        };
        Ok((resolved.path, value))
    }

    /// Write every pending operation
    pub fn flush(&mut self) -> Result<()> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        let ids = std::mem::take(&mut self.pending_ids);
        self.pending_bytes = 0;
        self.history.push(ops.len());

        let store = self.collection.store().clone();
        let outcome = write_with_self_heal(store.as_ref(), self.collection.name(), &ops);
        self.collection.invalidate_samples(&ids);

        match outcome {
            Ok(result) => {
                self.written.merge(&result);
                crate::log_debug!(
                    "Flushed {} operations to '{}' ({} modified)",
                    ops.len(),
                    self.collection.name(),
                    result.modified
                );
                Ok(())
            }
            Err(e) => {
                crate::log_error!("Flush of {} operations to '{}' failed: {}", ops.len(), self.collection.name(), e);
                Err(e)
            }
        }
    }

    /// Flush what is pending and close the context
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for SaveContext {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            crate::log_error!("Save context dropped with a failed flush: {}", e);
        }
    }
}

/// Reject writes to read-only fields or to any field below one
fn check_writable(schema: &SchemaCatalog, resolved: &ResolvedPath) -> Result<()> {
    let mut prefix = String::new();
    for segment in resolved.path.split('.') {
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(segment);
        if schema.get_field(&prefix).map(|f| f.read_only).unwrap_or(false) {
            return Err(SampleDbError::ReadOnlyField(resolved.requested.clone()));
        }
    }
    Ok(())
}

/// Ordered bulk write that repairs one null list field
///
/// When `$push`/`$addToSet` hits a field stored as null, that field is set
/// to `[]` on the failing document and the unapplied tail is retried once.
fn write_with_self_heal(store: &dyn PipelineStore, collection: &str, ops: &[WriteOp]) -> Result<BulkWriteResult> {
    let (path, applied) = match store.bulk_write(collection, ops, true) {
        Err(SampleDbError::Mutation(MutationError::NullArrayField { path, applied })) => (path, applied),
        other => return other,
    };
    let Some(filter) = ops.get(applied).and_then(|op| op.filter()).cloned() else {
        return Err(MutationError::NullArrayField { path, applied }.into());
    };

    crate::log_warn!(
        "Field '{}' is null on operation {}; coercing to [] and retrying {} operations",
        path,
        applied,
        ops.len() - applied
    );
    store.bulk_write(
        collection,
        &[WriteOp::update_one(filter, json!({"$set": {path: []}}))],
        true,
    )?;

    match store.bulk_write(collection, &ops[applied..], true) {
        Ok(result) => Ok(result),
        Err(SampleDbError::Mutation(e)) => Err(SampleDbError::Mutation(e.offset_by(applied))),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::EngineConfig;
    use crate::schema::{labels, MediaType, ScalarKind};
    use crate::store::MemoryStore;

    fn collection() -> (Arc<MemoryStore>, Collection, Vec<ObjectId>) {
        let store = Arc::new(MemoryStore::new());
        let coll = Collection::new("saves", MediaType::Image, store.clone(), EngineConfig::default()).unwrap();
        coll.add_sample_field("score", FieldDescriptor::scalar(ScalarKind::Float))
            .unwrap();
        coll.add_sample_field("gt", labels::detections()).unwrap();
        coll.add_sample_field("_ref_id", FieldDescriptor::object_id()).unwrap();
        let ids = coll
            .add_samples((0..7).map(|i| json!({"filepath": format!("{}.jpg", i), "tags": []})).collect())
            .unwrap();
        (store, coll, ids)
    }

    #[test]
    fn test_static_strategy_flushes() {
        let (store, coll, ids) = collection();
        store.reset_counters();
        let mut ctx = coll.save_context(Some(BatchingStrategy::Static { batch_size: 3 }));
        for (i, id) in ids.iter().enumerate() {
            ctx.register(SampleMutation::new(id.clone()).set("score", json!(i as f64)))
                .unwrap();
        }
        assert_eq!(ctx.flush_history(), &[3, 3]);
        assert_eq!(ctx.pending_len(), 1);
        ctx.flush().unwrap();
        assert_eq!(ctx.flush_history(), &[3, 3, 1]);
        assert_eq!(store.bulk_write_calls(), 3);
    }

    #[test]
    fn test_latency_strategy_flushes_on_elapsed_time() {
        let (store, coll, ids) = collection();
        store.reset_counters();
        let mut ctx = coll.save_context(Some(BatchingStrategy::Latency { target: Duration::ZERO }));
        for id in ids.iter().take(3) {
            ctx.register(SampleMutation::new(id.clone()).set("score", json!(1.0)))
                .unwrap();
            assert_eq!(ctx.pending_len(), 0);
        }
        assert_eq!(ctx.flush_history(), &[1, 1, 1]);

        let mut ctx = coll.save_context(Some(BatchingStrategy::Latency {
            target: Duration::from_secs(3600),
        }));
        for id in &ids {
            ctx.register(SampleMutation::new(id.clone()).set("score", json!(2.0)))
                .unwrap();
        }
        assert!(ctx.flush_history().is_empty());
        assert_eq!(ctx.pending_len(), 7);
        ctx.finish().unwrap();
        assert_eq!(store.bulk_write_calls(), 4);
    }

    #[test]
    fn test_size_strategy_counts_bytes() {
        let (_, coll, ids) = collection();
        let mutation = SampleMutation::new(ids[0].clone()).set("score", json!(1.0));
        let one = WriteOp::update_one(
            json!({"_id": ids[0].to_value()}),
            json!({"$set": {"score": 1.0}}),
        )
        .byte_size();
        let mut ctx = coll.save_context(Some(BatchingStrategy::Size { target_bytes: one * 2 }));
        ctx.register(mutation.clone()).unwrap();
        assert_eq!(ctx.pending_len(), 1);
        ctx.register(mutation).unwrap();
        assert_eq!(ctx.pending_len(), 0);
        assert_eq!(ctx.flush_history(), &[2]);
    }

    #[test]
    fn test_validation_errors() {
        let (_, coll, ids) = collection();
        let mut ctx = coll.save_context(Some(BatchingStrategy::Static { batch_size: 10 }));
        let id = ids[0].clone();

        let err = ctx
            .register(SampleMutation::new(id.clone()).set("id", json!("x")))
            .unwrap_err();
        assert!(matches!(err, SampleDbError::ReadOnlyField(_)));

        let err = ctx
            .register(SampleMutation::new(id.clone()).set("score", json!("high")))
            .unwrap_err();
        assert!(matches!(err, SampleDbError::TypeMismatch { .. }));

        let err = ctx
            .register(SampleMutation::new(id.clone()).push("score", json!(1.0)))
            .unwrap_err();
        assert!(matches!(err, SampleDbError::TypeMismatch { .. }));

        let err = ctx
            .register(SampleMutation::new(id.clone()).set("nope", json!(1)))
            .unwrap_err();
        assert!(matches!(err, SampleDbError::UnknownField(_)));

        let err = ctx
            .register(SampleMutation::new(id).set("gt.detections.label", json!("cat")))
            .unwrap_err();
        assert!(matches!(err, SampleDbError::InvalidPath { .. }));
        assert_eq!(ctx.pending_len(), 0);
    }

    #[test]
    fn test_public_id_alias_is_stored_native() {
        let (store, coll, ids) = collection();
        let target = ObjectId::new();
        coll.with_save_context(None, |ctx| {
            ctx.register(SampleMutation::new(ids[0].clone()).set("ref_id", json!(target.to_hex())))
        })
        .unwrap();
        let doc = store
            .documents("saves")
            .into_iter()
            .find(|d| d["_id"] == ids[0].to_value())
            .unwrap();
        assert_eq!(doc["_ref_id"], target.to_value());
    }

    #[test]
    fn test_dynamic_fields() {
        let (store, coll, ids) = collection();
        let mut ctx = coll
            .save_context(Some(BatchingStrategy::Static { batch_size: 1 }))
            .with_dynamic(true);
        ctx.register(SampleMutation::new(ids[1].clone()).set("note", json!("ok")))
            .unwrap();
        drop(ctx);
        assert!(store.documents("saves").iter().any(|d| d["note"] == "ok"));
    }

    #[test]
    fn test_drop_flushes_pending() {
        let (store, coll, ids) = collection();
        {
            let mut ctx = coll.save_context(Some(BatchingStrategy::Static { batch_size: 100 }));
            ctx.register(SampleMutation::new(ids[2].clone()).push("tags", json!("dropped")))
                .unwrap();
        }
        assert!(store
            .documents("saves")
            .iter()
            .any(|d| d["tags"] == json!(["dropped"])));
    }
}
