// src/collection.rs
// Root handle over a sample collection and its frames

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::batching::SaveContext;
use crate::config::{BatchingStrategy, EngineConfig};
use crate::document::{document_id, ObjectId};
use crate::error::{Result, SampleDbError};
use crate::path::{PathCache, ResolveOptions, ResolvedPath};
use crate::schema::{
    CatalogStore, DynamicSchema, FieldDescriptor, MediaType, SchemaCatalog,
};
use crate::store::{IndexSpec, PipelineStore, WriteOp};
use crate::view::View;

const PATH_CACHE_CAPACITY: usize = 512;

/// Slice membership of one sample, used when declaring a group field
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAssignment {
    pub sample_id: ObjectId,
    pub group_id: ObjectId,
    pub slice: String,
}

impl GroupAssignment {
    pub fn new(sample_id: ObjectId, group_id: ObjectId, slice: &str) -> Self {
        GroupAssignment {
            sample_id,
            group_id,
            slice: slice.to_string(),
        }
    }
}

struct CollectionInner {
    name: String,
    store: Arc<dyn PipelineStore>,
    catalog: RwLock<SchemaCatalog>,
    catalog_store: Option<Box<dyn CatalogStore>>,
    config: EngineConfig,
    paths: PathCache,
    samples: DashMap<ObjectId, Value>,
}

/// Shared handle to a collection
///
/// Cloning is cheap; clones share the catalog, the path cache and the
/// sample cache. Shard workers each hold their own clone.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("media_type", &self.media_type())
            .finish()
    }
}

impl Collection {
    /// Create a collection with a fresh catalog
    pub fn new(
        name: &str,
        media_type: MediaType,
        store: Arc<dyn PipelineStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::build(name, SchemaCatalog::new(media_type), store, None, config)
    }

    /// Open a collection whose catalog is persisted in `catalog_store`
    ///
    /// A missing catalog is created with `media_type` and saved immediately.
    pub fn open(
        name: &str,
        media_type: MediaType,
        store: Arc<dyn PipelineStore>,
        catalog_store: Box<dyn CatalogStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let catalog = match catalog_store.load(name)? {
            Some(catalog) => {
                crate::log_debug!("Loaded catalog of '{}' (version {})", name, catalog.version());
                catalog
            }
            None => {
                let catalog = SchemaCatalog::new(media_type);
                catalog_store.save(name, &catalog)?;
                catalog
            }
        };
        Self::build(name, catalog, store, Some(catalog_store), config)
    }

    fn build(
        name: &str,
        catalog: SchemaCatalog,
        store: Arc<dyn PipelineStore>,
        catalog_store: Option<Box<dyn CatalogStore>>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if name.is_empty() || name.starts_with("frames.") {
            return Err(SampleDbError::InvalidQuery(format!(
                "Invalid collection name '{}'",
                name
            )));
        }
        Ok(Collection {
            inner: Arc::new(CollectionInner {
                name: name.to_string(),
                store,
                catalog: RwLock::new(catalog),
                catalog_store,
                config,
                paths: PathCache::new(PATH_CACHE_CAPACITY),
                samples: DashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Store collection holding this collection's frames
    pub fn frames_collection(&self) -> String {
        format!("frames.{}", self.inner.name)
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn media_type(&self) -> MediaType {
        self.inner.catalog.read().media_type()
    }

    /// Snapshot of the declared schema
    pub fn schema(&self) -> SchemaCatalog {
        self.inner.catalog.read().clone()
    }

    /// Unfiltered view of every sample
    pub fn view(&self) -> View {
        View::new(self.clone())
    }

    fn persist_catalog(&self, catalog: &SchemaCatalog) -> Result<()> {
        if let Some(store) = &self.inner.catalog_store {
            store.save(&self.inner.name, catalog)?;
        }
        Ok(())
    }

    // ========================================================================
    // SCHEMA
    // ========================================================================

    pub fn add_sample_field(&self, path: &str, descriptor: FieldDescriptor) -> Result<()> {
        let mut catalog = self.inner.catalog.write();
        catalog.add_field(path, descriptor)?;
        self.persist_catalog(&catalog)?;
        crate::log_debug!("Declared sample field '{}' on '{}'", path, self.inner.name);
        Ok(())
    }

    pub fn add_frame_field(&self, path: &str, descriptor: FieldDescriptor) -> Result<()> {
        let mut catalog = self.inner.catalog.write();
        catalog.add_frame_field(path, descriptor)?;
        self.persist_catalog(&catalog)?;
        crate::log_debug!("Declared frame field '{}' on '{}'", path, self.inner.name);
        Ok(())
    }

    /// Declare fields discovered by a dynamic schema scan
    ///
    /// Multi-typed fields are skipped with a warning. Returns the declared paths.
    pub fn add_dynamic_fields(&self, schema: &DynamicSchema) -> Result<Vec<String>> {
        let mut added = Vec::new();
        let mut catalog = self.inner.catalog.write();

        // BTreeMap order puts parents before their children
        for (path, observed) in &schema.fields {
            let Some(descriptor) = observed.as_single() else {
                crate::log_warn!(
                    "Skipping dynamic field '{}' with {} observed types",
                    path,
                    observed.0.len()
                );
                continue;
            };
            let (frames, field) = match path.strip_prefix("frames.") {
                Some(rest) if catalog.has_frames() => (true, rest),
                _ => (false, path.as_str()),
            };
            if let Some((parent, _)) = field.rsplit_once('.') {
                let declared = if frames {
                    catalog.get_frame_field(parent)
                } else {
                    catalog.get_field(parent)
                };
                if declared.is_none() {
                    crate::log_warn!("Skipping dynamic field '{}': parent is not declared", path);
                    continue;
                }
            }
            let result = if frames {
                catalog.add_frame_field(field, descriptor.clone())
            } else {
                catalog.add_field(field, descriptor.clone())
            };
            match result {
                Ok(()) => added.push(path.clone()),
                Err(e) => crate::log_warn!("Skipping dynamic field '{}': {}", path, e),
            }
        }

        if !added.is_empty() {
            self.persist_catalog(&catalog)?;
            crate::log_info!("Declared {} dynamic fields on '{}'", added.len(), self.inner.name);
        }
        Ok(added)
    }

    /// Resolve a path against the declared schema (memoized)
    pub fn resolve_path(&self, raw: &str, options: &ResolveOptions) -> Result<Option<ResolvedPath>> {
        let catalog = self.inner.catalog.read();
        self.inner.paths.resolve(&catalog, raw, options)
    }

    /// Convert the collection into a grouped collection
    ///
    /// Declares the group field, then writes every assignment in one ordered
    /// bulk write. If the write fails the catalog is restored, the assignments
    /// that were applied are unset, and the error is returned.
    pub fn add_group_field(
        &self,
        name: &str,
        default_slice: &str,
        slices: BTreeMap<String, MediaType>,
        assignments: &[GroupAssignment],
    ) -> Result<()> {
        if let Some(bad) = assignments.iter().find(|a| !slices.contains_key(&a.slice)) {
            return Err(SampleDbError::SchemaError(format!(
                "Sample {} is assigned to undeclared slice '{}'",
                bad.sample_id, bad.slice
            )));
        }

        let mut catalog = self.inner.catalog.write();
        let snapshot = catalog.clone();
        catalog.declare_group_field(name, default_slice, slices)?;

        let ops: Vec<WriteOp> = assignments
            .iter()
            .map(|a| {
                WriteOp::update_one(
                    json!({"_id": a.sample_id.to_value()}),
                    json!({"$set": {name: {
                        "_cls": "Group",
                        "_id": a.group_id.to_value(),
                        "name": a.slice,
                    }}}),
                )
            })
            .collect();

        if let Err(err) = self.inner.store.bulk_write(&self.inner.name, &ops, true) {
            *catalog = snapshot;
            let applied = match &err {
                SampleDbError::Mutation(m) => m.applied(),
                _ => 0,
            };
            crate::log_warn!(
                "Group field '{}' migration failed after {} writes, rolling back: {}",
                name,
                applied,
                err
            );
            if applied > 0 {
                let ids: Vec<Value> = assignments[..applied]
                    .iter()
                    .map(|a| a.sample_id.to_value())
                    .collect();
                let undo = WriteOp::update_many(
                    json!({"_id": {"$in": ids}}),
                    json!({"$unset": {name: ""}}),
                );
                if let Err(undo_err) = self.inner.store.bulk_write(&self.inner.name, &[undo], true) {
                    crate::log_error!("Failed to unset partial group assignments: {}", undo_err);
                }
            }
            return Err(err);
        }

        self.persist_catalog(&catalog)?;
        drop(catalog);
        self.inner.samples.clear();
        crate::log_info!(
            "Collection '{}' is now grouped by '{}' ({} assignments)",
            self.inner.name,
            name,
            assignments.len()
        );
        Ok(())
    }

    // ========================================================================
    // DOCUMENTS
    // ========================================================================

    /// Insert samples, validating declared top-level fields
    ///
    /// Undeclared fields are stored as dynamic attributes.
    pub fn add_samples(&self, docs: Vec<Value>) -> Result<Vec<ObjectId>> {
        let catalog = self.inner.catalog.read();
        let mut prepared = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let obj = doc
                .as_object_mut()
                .ok_or_else(|| SampleDbError::Serialization("Sample must be an object".to_string()))?;
            obj.entry("_id").or_insert_with(|| ObjectId::new().to_value());
            for (key, value) in obj.iter() {
                if let Some(info) = catalog.get_field(key) {
                    info.descriptor.validate(key, value)?;
                }
            }
            prepared.push(doc);
        }
        drop(catalog);

        let ids = self.inner.store.insert_many(&self.inner.name, prepared)?;
        ids.iter()
            .map(|id| {
                ObjectId::from_value(id).ok_or_else(|| {
                    SampleDbError::Serialization(format!("Store returned a non-ObjectId id: {}", id))
                })
            })
            .collect()
    }

    /// Insert frame documents
    ///
    /// Every frame needs a `_sample_id` and a `frame_number` that is not yet
    /// used by another frame of the same sample.
    pub fn add_frames(&self, frames: Vec<Value>) -> Result<usize> {
        let catalog = self.inner.catalog.read();
        if !catalog.has_frames() {
            return Err(SampleDbError::SchemaError(format!(
                "Collection '{}' has no frames",
                self.inner.name
            )));
        }

        let mut keys = Vec::with_capacity(frames.len());
        for frame in &frames {
            let sample = frame
                .get("_sample_id")
                .and_then(ObjectId::from_value)
                .ok_or_else(|| SampleDbError::SchemaError("Frame requires a '_sample_id'".to_string()))?;
            let number = frame
                .get("frame_number")
                .and_then(|v| v.as_u64())
                .filter(|n| *n >= 1)
                .ok_or_else(|| SampleDbError::SchemaError("Frame requires a 'frame_number' >= 1".to_string()))?;
            if let Some(obj) = frame.as_object() {
                for (key, value) in obj {
                    if let Some(info) = catalog.get_frame_field(key) {
                        info.descriptor.validate(key, value)?;
                    }
                }
            }
            keys.push((sample, number));
        }
        drop(catalog);

        let sample_ids: Vec<Value> = keys.iter().map(|(s, _)| s.to_value()).collect();
        let existing = self.inner.store.aggregate(
            &self.frames_collection(),
            &[
                json!({"$match": {"_sample_id": {"$in": sample_ids}}}),
                json!({"$project": {"_id": 0, "_sample_id": 1, "frame_number": 1}}),
            ],
        )?;
        let mut seen: ahash::AHashSet<(ObjectId, u64)> = existing
            .iter()
            .filter_map(|f| {
                Some((
                    f.get("_sample_id").and_then(ObjectId::from_value)?,
                    f.get("frame_number")?.as_u64()?,
                ))
            })
            .collect();
        for (sample, number) in &keys {
            if !seen.insert((sample.clone(), *number)) {
                return Err(SampleDbError::SchemaError(format!(
                    "Sample {} already has frame {}",
                    sample, number
                )));
            }
        }

        let count = frames.len();
        self.inner.store.insert_many(&self.frames_collection(), frames)?;
        Ok(count)
    }

    /// Fetch one sample, through the per-collection cache
    pub fn get_sample(&self, id: &ObjectId) -> Result<Option<Value>> {
        if let Some(hit) = self.inner.samples.get(id) {
            return Ok(Some(hit.value().clone()));
        }
        let mut docs = self.inner.store.aggregate(
            &self.inner.name,
            &[json!({"$match": {"_id": id.to_value()}}), json!({"$limit": 1})],
        )?;
        let doc = docs.pop();
        if let Some(doc) = &doc {
            if self.inner.samples.len() < self.inner.config.sample_cache_capacity {
                self.inner.samples.insert(id.clone(), doc.clone());
            }
        }
        Ok(doc)
    }

    /// Drop cached copies of the given samples
    pub fn invalidate_samples(&self, ids: &[ObjectId]) {
        for id in ids {
            self.inner.samples.remove(id);
        }
    }

    pub fn cached_sample_count(&self) -> usize {
        self.inner.samples.len()
    }

    /// Ids of every sample in storage order
    pub fn sample_ids(&self) -> Result<Vec<ObjectId>> {
        let docs = self
            .inner
            .store
            .aggregate(&self.inner.name, &[json!({"$project": {"_id": 1}})])?;
        Ok(docs.iter().filter_map(document_id).collect())
    }

    // ========================================================================
    // INDEXES
    // ========================================================================

    /// Create an index on sample fields or on frame fields
    ///
    /// A compound index cannot mix the two levels.
    pub fn create_index(&self, fields: &[(&str, i32)], unique: bool) -> Result<String> {
        let mut keys = Vec::with_capacity(fields.len());
        let mut frame_keys = 0;
        for (field, direction) in fields {
            let resolved = self
                .resolve_path(field, &ResolveOptions::new())?
                .ok_or_else(|| SampleDbError::InvalidQuery("Index field cannot be empty".to_string()))?;
            if resolved.is_frame_field {
                frame_keys += 1;
            }
            keys.push((resolved.path, *direction));
        }
        if frame_keys > 0 && frame_keys < keys.len() {
            return Err(SampleDbError::UnsupportedCompoundIndex(
                fields.iter().map(|(f, _)| f.to_string()).collect(),
            ));
        }

        let target = if frame_keys > 0 {
            self.frames_collection()
        } else {
            self.inner.name.clone()
        };
        let name = self.inner.store.create_index(&target, &keys, unique)?;
        crate::log_debug!("Created index '{}' on '{}'", name, target);
        Ok(name)
    }

    pub fn list_indexes(&self, frames: bool) -> Result<Vec<IndexSpec>> {
        if frames {
            self.inner.store.list_indexes(&self.frames_collection())
        } else {
            self.inner.store.list_indexes(&self.inner.name)
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Buffered writer flushing with `strategy` (or the configured default)
    pub fn save_context(&self, strategy: Option<BatchingStrategy>) -> SaveContext {
        SaveContext::new(
            self.clone(),
            strategy.unwrap_or(self.inner.config.default_batching),
        )
    }

    /// Run `f` with a save context that is always flushed afterwards
    ///
    /// An error from `f` takes precedence over a flush error.
    pub fn with_save_context<F, R>(&self, strategy: Option<BatchingStrategy>, f: F) -> Result<R>
    where
        F: FnOnce(&mut SaveContext) -> Result<R>,
    {
        let mut ctx = self.save_context(strategy);
        let result = f(&mut ctx);
        let flushed = ctx.finish();
        let value = result?;
        flushed?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{labels, MemoryCatalogStore, ScalarKind};
    use crate::store::MemoryStore;

    fn collection(media: MediaType) -> (Arc<MemoryStore>, Collection) {
        let store = Arc::new(MemoryStore::new());
        let coll = Collection::new("quickstart", media, store.clone(), EngineConfig::default()).unwrap();
        (store, coll)
    }

    #[test]
    fn test_add_samples_validates_declared_fields() {
        let (_, coll) = collection(MediaType::Image);
        coll.add_sample_field("gt", labels::classification()).unwrap();

        let ids = coll
            .add_samples(vec![json!({"filepath": "a.jpg", "gt": {"_cls": "Classification", "label": "cat"}})])
            .unwrap();
        assert_eq!(ids.len(), 1);

        let err = coll
            .add_samples(vec![json!({"filepath": 7})])
            .unwrap_err();
        assert!(matches!(err, SampleDbError::TypeMismatch { .. }));
    }

    #[test]
    fn test_get_sample_is_cached_and_invalidated() {
        let (store, coll) = collection(MediaType::Image);
        let ids = coll.add_samples(vec![json!({"filepath": "a.jpg"})]).unwrap();

        assert!(coll.get_sample(&ids[0]).unwrap().is_some());
        assert!(coll.get_sample(&ids[0]).unwrap().is_some());
        assert_eq!(store.aggregate_calls(), 1);
        assert_eq!(coll.cached_sample_count(), 1);

        coll.invalidate_samples(&ids);
        assert_eq!(coll.cached_sample_count(), 0);
    }

    #[test]
    fn test_frames_unique_per_sample() {
        let (store, coll) = collection(MediaType::Video);
        let ids = coll.add_samples(vec![json!({"filepath": "v.mp4"})]).unwrap();
        let frame = |n: u64| crate::document::new_frame(&ids[0], n, json!({}));

        assert_eq!(coll.add_frames(vec![frame(1), frame(2)]).unwrap(), 2);
        assert!(coll.add_frames(vec![frame(2)]).is_err());
        assert!(coll.add_frames(vec![frame(3), frame(3)]).is_err());
        assert_eq!(store.count("frames.quickstart"), 2);
    }

    #[test]
    fn test_frames_rejected_on_images() {
        let (_, coll) = collection(MediaType::Image);
        let sample = ObjectId::new();
        let err = coll
            .add_frames(vec![crate::document::new_frame(&sample, 1, json!({}))])
            .unwrap_err();
        assert!(matches!(err, SampleDbError::SchemaError(_)));
    }

    #[test]
    fn test_compound_index_cannot_mix_levels() {
        let (store, coll) = collection(MediaType::Video);
        coll.add_frame_field("gt", labels::detections()).unwrap();

        let err = coll
            .create_index(&[("filepath", 1), ("frames.frame_number", 1)], false)
            .unwrap_err();
        assert!(matches!(err, SampleDbError::UnsupportedCompoundIndex(_)));

        let name = coll
            .create_index(&[("frames._sample_id", 1), ("frames.frame_number", 1)], true)
            .unwrap();
        assert_eq!(name, "_sample_id_1_frame_number_1");
        assert_eq!(store.list_indexes("frames.quickstart").unwrap().len(), 1);
    }

    #[test]
    fn test_open_persists_catalog() {
        let store = Arc::new(MemoryStore::new());
        let catalogs = Arc::new(MemoryCatalogStore::new());

        struct Shared(Arc<MemoryCatalogStore>);
        impl CatalogStore for Shared {
            fn load(&self, collection: &str) -> Result<Option<SchemaCatalog>> {
                self.0.load(collection)
            }
            fn save(&self, collection: &str, catalog: &SchemaCatalog) -> Result<()> {
                self.0.save(collection, catalog)
            }
        }

        let coll = Collection::open(
            "persisted",
            MediaType::Image,
            store.clone(),
            Box::new(Shared(catalogs.clone())),
            EngineConfig::default(),
        )
        .unwrap();
        coll.add_sample_field("score", FieldDescriptor::scalar(ScalarKind::Float))
            .unwrap();

        let reopened = Collection::open(
            "persisted",
            MediaType::Video,
            store,
            Box::new(Shared(catalogs)),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(reopened.media_type(), MediaType::Image);
        assert!(reopened.schema().get_field("score").is_some());
    }
}
