// view/mod.rs
//! Immutable, lazily composed views
//!
//! A [`View`] is a collection plus an ordered list of [`ViewStage`]s. Adding a
//! stage validates it against the schema produced by the stages before it and
//! returns a new view; the parent view is never modified.
//!
//! ```text
//! [geoNear | active slice $match]
//!   → [frames $lookup]          (when a stage or request reads frame fields)
//!   → stage 1 … stage n
//!   → [group sibling swap]      (groups.<slice>.* requests)
//!   → [$unset frames]           (frames attached for stages only)
//! ```

pub mod stage;

use std::sync::Arc;

use serde_json::{json, Value};

use crate::collection::Collection;
use crate::error::Result;
use crate::path::{resolve_path, ResolveOptions, ResolvedPath};
use crate::schema::{MediaType, SchemaCatalog};
use stage::{LowerContext, ValidateContext};

pub use stage::ViewStage;

/// Scratch field used while swapping documents for their group siblings
const SIBLINGS_FIELD: &str = "_group_siblings";

/// How a view is lowered for one round-trip
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PipelineOptions {
    /// Attach each sample's frames as a `frames` array
    pub attach_frames: bool,
    /// Replace every sample by its group sibling in this slice
    pub group_slice: Option<String>,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames(mut self, attach_frames: bool) -> Self {
        self.attach_frames = attach_frames;
        self
    }

    pub fn with_group_slice(mut self, slice: Option<String>) -> Self {
        self.group_slice = slice;
        self
    }
}

/// Collection plus an immutable stage list
#[derive(Debug, Clone)]
pub struct View {
    collection: Collection,
    stages: Arc<[ViewStage]>,
}

impl View {
    pub fn new(collection: Collection) -> Self {
        View {
            collection,
            stages: Arc::from(Vec::new()),
        }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn stages(&self) -> &[ViewStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Schema seen after every stage of the view
    pub fn schema(&self) -> SchemaCatalog {
        let mut schema = self.collection.schema();
        for stage in self.stages.iter() {
            stage.transform_schema(&mut schema);
        }
        schema
    }

    pub fn media_type(&self) -> MediaType {
        self.schema().media_type()
    }

    fn transforms_schema(&self) -> bool {
        self.stages.iter().any(ViewStage::transforms_schema)
    }

    /// Return a new view with `stage` appended
    pub fn add_stage(&self, stage: ViewStage) -> Result<View> {
        let schema = self.schema();
        stage.validate(&ValidateContext {
            schema: &schema,
            previous: &self.stages,
            strict: self.collection.config().strict_fields,
        })?;

        let mut stages = Vec::with_capacity(self.stages.len() + 1);
        stages.extend(self.stages.iter().cloned());
        stages.push(stage);
        Ok(View {
            collection: self.collection.clone(),
            stages: Arc::from(stages),
        })
    }

    /// Resolve a path against the view's effective schema
    ///
    /// Views that reshape the schema bypass the collection's path cache.
    pub fn resolve_path(&self, raw: &str, options: &ResolveOptions) -> Result<Option<ResolvedPath>> {
        if self.transforms_schema() {
            resolve_path(&self.schema(), raw, options)
        } else {
            self.collection.resolve_path(raw, options)
        }
    }

    /// Lower the view into one store pipeline
    pub fn pipeline(&self, options: &PipelineOptions) -> Result<Vec<Value>> {
        let base = self.collection.schema();
        let group = base.group_field().cloned();
        let selects_slices = self
            .stages
            .iter()
            .any(|s| matches!(s, ViewStage::SelectGroupSlices(_)));

        // Implicit filter to the default slice of a grouped collection
        let slice_match = match (&group, selects_slices) {
            (Some(group), false) => Some(json!({format!("{}.name", group.name): group.default_slice})),
            _ => None,
        };

        let stage_frames = self.stages.iter().any(|s| s.needs_frames(&base));
        let frames_before_stages = stage_frames || (options.attach_frames && options.group_slice.is_none());
        let has_frames = base.has_frames();

        let mut pipeline = Vec::new();
        let mut stages = self.stages.iter().peekable();
        let mut schema = base.clone();
        let cached = !self.transforms_schema();

        let leads_with_geo = matches!(stages.peek(), Some(ViewStage::GeoNear { .. }));
        if !leads_with_geo {
            if let Some(filter) = &slice_match {
                pipeline.push(json!({"$match": filter}));
            }
        }
        let frames_lookup = json!({"$lookup": {
            "from": self.collection.frames_collection(),
            "localField": "_id",
            "foreignField": "_sample_id",
            "as": "frames",
            "pipeline": [{"$sort": {"frame_number": 1}}],
        }});

        if leads_with_geo {
            if let Some(stage) = stages.next() {
                let ctx = LowerContext {
                    schema: &schema,
                    collection: &self.collection,
                    cached,
                    geo_query: slice_match.clone(),
                };
                pipeline.extend(stage.to_pipeline(&ctx)?);
                stage.transform_schema(&mut schema);
            }
        }
        if frames_before_stages && has_frames {
            pipeline.push(frames_lookup.clone());
        }

        for stage in stages {
            let ctx = LowerContext {
                schema: &schema,
                collection: &self.collection,
                cached,
                geo_query: None,
            };
            pipeline.extend(stage.to_pipeline(&ctx)?);
            stage.transform_schema(&mut schema);
        }

        if let (Some(slice), Some(group)) = (&options.group_slice, &group) {
            let group_id = format!("{}._id", group.name);
            pipeline.push(json!({"$lookup": {
                "from": self.collection.name(),
                "localField": group_id,
                "foreignField": group_id,
                "as": SIBLINGS_FIELD,
            }}));
            pipeline.push(json!({"$unwind": format!("${}", SIBLINGS_FIELD)}));
            pipeline.push(json!({"$match": {format!("{}.{}.name", SIBLINGS_FIELD, group.name): slice}}));
            pipeline.push(json!({"$replaceRoot": {"newRoot": format!("${}", SIBLINGS_FIELD)}}));
            if options.attach_frames {
                pipeline.push(frames_lookup);
            }
        } else if stage_frames && !options.attach_frames && has_frames {
            pipeline.push(json!({"$unset": "frames"}));
        }

        Ok(pipeline)
    }

    /// Run the view plus `extra` stages in one round-trip
    pub fn aggregate(&self, options: &PipelineOptions, extra: &[Value]) -> Result<Vec<Value>> {
        let mut pipeline = self.pipeline(options)?;
        pipeline.extend_from_slice(extra);
        crate::log_trace!(
            "Pipeline on '{}': {}",
            self.collection.name(),
            Value::Array(pipeline.clone())
        );
        self.collection
            .store()
            .aggregate(self.collection.name(), &pipeline)
    }

    /// Materialize the samples of the view
    pub fn documents(&self) -> Result<Vec<Value>> {
        self.aggregate(&PipelineOptions::new(), &[])
    }

    /// Materialize the samples of the view with their frames attached
    pub fn documents_with_frames(&self) -> Result<Vec<Value>> {
        self.aggregate(&PipelineOptions::new().with_frames(true), &[])
    }

    // ========================================================================
    // STAGE SHORTHANDS
    // ========================================================================

    pub fn match_filter(&self, filter: Value) -> Result<View> {
        self.add_stage(ViewStage::Match(filter))
    }

    pub fn exists(&self, field: &str, exists: bool) -> Result<View> {
        self.add_stage(ViewStage::Exists {
            field: field.to_string(),
            exists,
        })
    }

    pub fn limit(&self, n: i64) -> Result<View> {
        self.add_stage(ViewStage::Limit(n))
    }

    pub fn skip(&self, n: usize) -> Result<View> {
        self.add_stage(ViewStage::Skip(n))
    }

    pub fn sort_by(&self, field: &str, reverse: bool) -> Result<View> {
        self.add_stage(ViewStage::SortBy {
            field: field.to_string(),
            reverse,
        })
    }

    pub fn select(&self, ids: &[&str]) -> Result<View> {
        self.add_stage(ViewStage::Select(ids.iter().map(|s| s.to_string()).collect()))
    }

    pub fn exclude(&self, ids: &[&str]) -> Result<View> {
        self.add_stage(ViewStage::Exclude(ids.iter().map(|s| s.to_string()).collect()))
    }

    pub fn select_fields(&self, fields: &[&str]) -> Result<View> {
        self.add_stage(ViewStage::SelectFields(fields.iter().map(|s| s.to_string()).collect()))
    }

    pub fn exclude_fields(&self, fields: &[&str]) -> Result<View> {
        self.add_stage(ViewStage::ExcludeFields(fields.iter().map(|s| s.to_string()).collect()))
    }

    pub fn filter_labels(&self, field: &str, filter: Value, only_matches: bool) -> Result<View> {
        self.add_stage(ViewStage::FilterLabels {
            field: field.to_string(),
            filter,
            only_matches,
        })
    }

    pub fn to_patches(&self, field: &str) -> Result<View> {
        self.add_stage(ViewStage::ToPatches {
            field: field.to_string(),
        })
    }

    pub fn group_by(&self, field: &str, order_by: Option<&str>, reverse: bool) -> Result<View> {
        self.add_stage(ViewStage::GroupBy {
            field: field.to_string(),
            order_by: order_by.map(String::from),
            reverse,
        })
    }

    pub fn geo_near(&self, point: (f64, f64), location_field: &str, max_distance: Option<f64>) -> Result<View> {
        self.add_stage(ViewStage::GeoNear {
            point,
            location_field: location_field.to_string(),
            max_distance,
            query: None,
        })
    }

    pub fn select_group_slices(&self, slices: &[&str]) -> Result<View> {
        self.add_stage(ViewStage::SelectGroupSlices(
            slices.iter().map(|s| s.to_string()).collect(),
        ))
    }
}

/// Build a view by appending `stages` to `base` in order
pub fn build_view(base: &View, stages: Vec<ViewStage>) -> Result<View> {
    let mut view = base.clone();
    for stage in stages {
        view = view.add_stage(stage)?;
    }
    Ok(view)
}

/// Return a new view with `stage` appended; `view` is left unchanged
pub fn append_stage(view: &View, stage: ViewStage) -> Result<View> {
    view.add_stage(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::schema::{labels, FieldDescriptor, ScalarKind};
    use crate::store::MemoryStore;

    fn collection() -> Collection {
        let store = Arc::new(MemoryStore::new());
        let coll = Collection::new("views", MediaType::Image, store, EngineConfig::default()).unwrap();
        coll.add_sample_field("gt", labels::detections()).unwrap();
        coll.add_sample_field("score", FieldDescriptor::scalar(ScalarKind::Float))
            .unwrap();
        coll.add_samples(vec![
            json!({"filepath": "a.jpg", "score": 0.9, "tags": ["train"],
                   "gt": {"_cls": "Detections", "detections": [
                       {"_cls": "Detection", "label": "cat", "confidence": 0.9},
                       {"_cls": "Detection", "label": "dog", "confidence": 0.4}]}}),
            json!({"filepath": "b.jpg", "score": 0.2, "tags": ["val"],
                   "gt": {"_cls": "Detections", "detections": [
                       {"_cls": "Detection", "label": "dog", "confidence": 0.8}]}}),
            json!({"filepath": "c.jpg", "score": 0.5, "tags": [], "gt": null}),
        ])
        .unwrap();
        coll
    }

    fn filepaths(view: &View) -> Vec<String> {
        view.documents()
            .unwrap()
            .iter()
            .map(|d| d["filepath"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_stage_order_is_significant() {
        let base = collection().view();
        let a = base
            .match_filter(json!({"score": {"$gt": 0.3}}))
            .unwrap()
            .limit(1)
            .unwrap();
        let b = base
            .limit(1)
            .unwrap()
            .match_filter(json!({"score": {"$lt": 0.3}}))
            .unwrap();
        assert_eq!(filepaths(&a), vec!["a.jpg"]);
        assert!(filepaths(&b).is_empty());
    }

    #[test]
    fn test_negative_limit_is_empty() {
        let view = collection().view().limit(-5).unwrap();
        assert!(view.documents().unwrap().is_empty());
    }

    #[test]
    fn test_sort_and_skip() {
        let view = collection().view().sort_by("score", true).unwrap().skip(1).unwrap();
        assert_eq!(filepaths(&view), vec!["c.jpg", "b.jpg"]);
    }

    #[test]
    fn test_filter_labels_only_matches() {
        let view = collection()
            .view()
            .filter_labels("gt", json!({"$eq": ["$label", "cat"]}), true)
            .unwrap();
        let docs = view.documents().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["gt"]["detections"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_to_patches() {
        let view = collection().view().to_patches("gt").unwrap();
        let docs = view.documents().unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0]["gt"]["label"], "cat");
        assert!(docs[0].get("score").is_none());
        assert_eq!(docs[0]["_sample_id"], docs[1]["_sample_id"]);
        assert!(view.resolve_path("gt.label", &ResolveOptions::new()).unwrap().is_some());
    }

    #[test]
    fn test_select_fields_keeps_defaults() {
        let view = collection().view().select_fields(&["score"]).unwrap();
        let docs = view.documents().unwrap();
        assert!(docs[0].get("gt").is_none());
        assert!(docs[0].get("filepath").is_some());
        assert!(view.match_filter(json!({"gt": null})).is_err());
    }

    #[test]
    fn test_group_by_makes_groups_contiguous() {
        let view = collection()
            .view()
            .group_by("tags", None, false)
            .unwrap();
        assert_eq!(view.documents().unwrap().len(), 3);
    }

    #[test]
    fn test_exists() {
        let view = collection().view().exists("gt", true).unwrap();
        assert_eq!(filepaths(&view), vec!["a.jpg", "b.jpg"]);
        let view = collection().view().exists("gt", false).unwrap();
        assert_eq!(filepaths(&view), vec!["c.jpg"]);
    }
}
