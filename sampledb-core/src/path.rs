// src/path.rs
//! Field path resolution
//!
//! Maps a user-facing dotted path onto its storage location:
//!
//! ```text
//! "frames.gt.detections[].label"
//!     │      │          │
//!     │      │          └─ explicit unwind marker
//!     │      └─ walked through the frame schema
//!     └─ frame prefix (video collections only)
//! ```
//!
//! The result records which list fields must be unwound (ancestors first),
//! which list fields are left intact, and whether the leaf is an ID field
//! whose values need string ⇄ native conversion.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use crate::document::{native_ids_to_strings, strings_to_native_ids};
use crate::error::{Result, SampleDbError};
use crate::schema::{FieldDescriptor, FieldInfo, SchemaCatalog};

const UNWIND_MARKER: &str = "[]";
const FRAMES_PREFIX: &str = "frames";
const GROUPS_PREFIX: &str = "groups";

/// Options of a single resolution
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResolveOptions {
    /// Unwind every non-terminal list field on the path
    pub auto_unwind: bool,
    /// Also unwind the terminal field when it is a list
    pub unwind_terminal: bool,
    /// Resolve undeclared root fields instead of failing
    pub allow_missing: bool,
    /// Output field replacing the root of the resolved path
    pub new_field: Option<String>,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options used by aggregations: unwind everything down to the leaf
    pub fn flattened() -> Self {
        ResolveOptions {
            auto_unwind: true,
            unwind_terminal: true,
            ..Self::default()
        }
    }

    pub fn with_auto_unwind(mut self, auto_unwind: bool) -> Self {
        self.auto_unwind = auto_unwind;
        self
    }

    pub fn with_unwind_terminal(mut self, unwind_terminal: bool) -> Self {
        self.unwind_terminal = unwind_terminal;
        self
    }

    pub fn with_allow_missing(mut self, allow_missing: bool) -> Self {
        self.allow_missing = allow_missing;
        self
    }

    pub fn with_new_field(mut self, new_field: &str) -> Self {
        self.new_field = Some(new_field.to_string());
        self
    }
}

/// Storage location of a requested path
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// Path as requested
    pub requested: String,
    /// Canonical path, `frames.`/`groups.<slice>.` prefixes and markers stripped
    pub path: String,
    pub is_frame_field: bool,
    /// Bare `frames` path
    pub is_frames_root: bool,
    /// Slice named by a `groups.<slice>.` prefix
    pub group_slice: Option<String>,
    /// Whether the frames list itself is unwound (frame fields only)
    pub unwind_frames: bool,
    /// List fields to unwind, ancestors first (canonical form)
    pub unwind_list: Vec<String>,
    /// List fields on the path that are left intact
    pub other_list_fields: Vec<String>,
    /// Leaf is a reference (ID) field
    pub is_id_field: bool,
    /// The leaf was requested through its public name (`id`, `sample_id`, ...)
    pub public_id: bool,
    /// Declared descriptor of the leaf, if any
    pub leaf: Option<FieldDescriptor>,
    /// Renamed output path (see [`ResolveOptions::new_field`])
    pub new_path: Option<String>,
}

impl ResolvedPath {
    fn frames_root(requested: &str, unwind_frames: bool) -> Self {
        ResolvedPath {
            requested: requested.to_string(),
            path: String::new(),
            is_frame_field: true,
            is_frames_root: true,
            group_slice: None,
            unwind_frames,
            unwind_list: Vec::new(),
            other_list_fields: Vec::new(),
            is_id_field: false,
            public_id: false,
            leaf: None,
            new_path: None,
        }
    }

    /// Path inside a pipeline document (frames are attached as `frames`)
    pub fn full_path(&self) -> String {
        prefixed(self.is_frame_field, &self.path)
    }

    /// `$unwind` targets in pipeline order
    pub fn full_unwinds(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.unwind_list.len() + 1);
        if self.is_frame_field && self.unwind_frames {
            out.push(FRAMES_PREFIX.to_string());
        }
        out.extend(
            self.unwind_list
                .iter()
                .map(|u| prefixed(self.is_frame_field, u)),
        );
        out
    }

    /// Path results are written to
    pub fn output_path(&self) -> String {
        match &self.new_path {
            Some(p) => prefixed(self.is_frame_field, p),
            None => self.full_path(),
        }
    }

    /// Whether values read through this path are converted to strings
    pub fn converts_ids(&self) -> bool {
        self.is_id_field && self.public_id
    }

    /// Convert stored values into the requested representation
    pub fn to_output(&self, value: Value) -> Value {
        if self.converts_ids() {
            native_ids_to_strings(value)
        } else {
            value
        }
    }

    /// Convert caller values into the stored representation
    pub fn to_storage(&self, value: Value) -> Result<Value> {
        if self.is_id_field && self.public_id {
            strings_to_native_ids(&self.requested, value)
        } else {
            Ok(value)
        }
    }

    /// Deepest list-of-documents field on the path, walking right to left
    pub fn document_list_root(&self, schema: &SchemaCatalog) -> Option<String> {
        let mut parts: Vec<&str> = self.path.split('.').collect();
        while !parts.is_empty() {
            let candidate = parts.join(".");
            let info = if self.is_frame_field {
                schema.get_frame_field(&candidate)
            } else {
                schema.get_field(&candidate)
            };
            if info.map(|f| f.descriptor.is_document_list()).unwrap_or(false) {
                return Some(prefixed(self.is_frame_field, &candidate));
            }
            parts.pop();
        }
        None
    }
}

fn prefixed(frames: bool, path: &str) -> String {
    match (frames, path.is_empty()) {
        (true, true) => FRAMES_PREFIX.to_string(),
        (true, false) => format!("{}.{}", FRAMES_PREFIX, path),
        (false, _) => path.to_string(),
    }
}

/// Split a raw path into segments and the indices carrying `[]`
fn parse_markers(raw: &str) -> Result<(Vec<String>, Vec<usize>)> {
    let mut segments = Vec::new();
    let mut forced = Vec::new();

    for (i, part) in raw.split('.').enumerate() {
        let (name, marked) = match part.strip_suffix(UNWIND_MARKER) {
            Some(name) => (name, true),
            None => (part, false),
        };
        if name.is_empty() || name.contains(UNWIND_MARKER) {
            return Err(SampleDbError::InvalidPath {
                path: raw.to_string(),
                reason: format!("malformed segment '{}'", part),
            });
        }
        if marked {
            forced.push(i);
        }
        segments.push(name.to_string());
    }
    Ok((segments, forced))
}

/// Find the stored name of an ID field requested through its alias
fn id_alias(fields: &BTreeMap<String, FieldInfo>, name: &str) -> Option<String> {
    let alias = match name.strip_prefix('_') {
        Some(public) => public.to_string(),
        None => format!("_{}", name),
    };
    fields
        .get(&alias)
        .filter(|info| info.descriptor.is_id())
        .map(|_| alias)
}

/// Resolve `raw` against `schema`
///
/// Returns `Ok(None)` for an empty path.
///
/// # Examples
///
/// ```rust
/// use sampledb_core::path::{resolve_path, ResolveOptions};
/// use sampledb_core::schema::{labels, MediaType, SchemaCatalog};
///
/// let mut schema = SchemaCatalog::new(MediaType::Image);
/// schema.add_field("gt", labels::detections()).unwrap();
///
/// let options = ResolveOptions::new().with_auto_unwind(true);
/// let resolved = resolve_path(&schema, "gt.detections.label", &options)
///     .unwrap()
///     .unwrap();
/// assert_eq!(resolved.unwind_list, vec!["gt.detections".to_string()]);
/// ```
pub fn resolve_path(
    schema: &SchemaCatalog,
    raw: &str,
    options: &ResolveOptions,
) -> Result<Option<ResolvedPath>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let (segments, forced) = parse_markers(raw)?;
    let invalid = |reason: &str| SampleDbError::InvalidPath {
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut start = 0;
    let mut is_frame_field = false;
    let mut unwind_frames = false;
    let mut group_slice = None;

    if segments[0] == FRAMES_PREFIX && !schema.sample_fields().contains_key(FRAMES_PREFIX) {
        if !schema.has_frames() {
            return Err(invalid("frame fields require a collection with video media"));
        }
        is_frame_field = true;
        start = 1;
        let terminal = segments.len() == 1;
        unwind_frames = forced.contains(&0)
            || (!terminal && options.auto_unwind)
            || (terminal && options.unwind_terminal);
        if terminal {
            return Ok(Some(ResolvedPath::frames_root(raw, unwind_frames)));
        }
    } else if segments[0] == GROUPS_PREFIX && !schema.sample_fields().contains_key(GROUPS_PREFIX) {
        let group = schema
            .group_field()
            .ok_or_else(|| invalid("group paths require a grouped collection"))?;
        let slice = segments
            .get(1)
            .ok_or_else(|| invalid("missing group slice name"))?;
        if !group.slices.contains_key(slice) {
            return Err(invalid(&format!("unknown group slice '{}'", slice)));
        }
        if segments.len() < 3 {
            return Err(invalid("group slice paths must name a field"));
        }
        group_slice = Some(slice.clone());
        start = 2;
    }

    let rest = &segments[start..];
    let mut current = Some(schema.fields(is_frame_field));
    let mut canonical: Vec<String> = Vec::with_capacity(rest.len());
    let mut unwind_list = Vec::new();
    let mut other_list_fields = Vec::new();
    let mut leaf = None;
    let mut is_id_field = false;

    for (i, segment) in rest.iter().enumerate() {
        let last = i + 1 == rest.len();
        let index = start + i;

        let mut name = segment.clone();
        let mut info = current.and_then(|fields| fields.get(&name));
        if info.is_none() && last {
            if let Some(alias) = current.and_then(|fields| id_alias(fields, &name)) {
                info = current.and_then(|fields| fields.get(&alias));
                name = alias;
            }
        }
        canonical.push(name);
        let prefix = canonical.join(".");

        match info {
            None => {
                if i == 0 && !options.allow_missing {
                    return Err(SampleDbError::UnknownField(prefixed(is_frame_field, segment)));
                }
                // Undeclared below this point: only explicit markers apply
                if forced.contains(&index) {
                    unwind_list.push(prefix);
                }
                current = None;
            }
            Some(info) => {
                if last {
                    leaf = Some(info.descriptor.clone());
                    is_id_field = info.descriptor.is_id();
                }
                if info.descriptor.is_list() {
                    let unwind = forced.contains(&index)
                        || (!last && options.auto_unwind)
                        || (last && options.unwind_terminal);
                    if unwind {
                        unwind_list.push(prefix);
                    } else {
                        other_list_fields.push(prefix);
                    }
                } else if forced.contains(&index) {
                    return Err(invalid(&format!("'{}' is not a list field", prefix)));
                }
                current = info.descriptor.embedded_fields();
            }
        }
    }

    sort_by_depth(&mut unwind_list);
    sort_by_depth(&mut other_list_fields);

    let path = canonical.join(".");
    let public_id = is_id_field && !rest.last().map(|s| s.starts_with('_')).unwrap_or(false);
    let new_path = options.new_field.as_ref().map(|new_root| {
        match path.split_once('.') {
            Some((_, tail)) => format!("{}.{}", new_root, tail),
            None => new_root.clone(),
        }
    });

    Ok(Some(ResolvedPath {
        requested: raw.to_string(),
        path,
        is_frame_field,
        is_frames_root: false,
        group_slice,
        unwind_frames,
        unwind_list,
        other_list_fields,
        is_id_field,
        public_id,
        leaf,
        new_path,
    }))
}

/// Ancestors before descendants; siblings lexically
fn sort_by_depth(paths: &mut Vec<String>) {
    paths.sort_by(|a, b| {
        let da = a.matches('.').count();
        let db = b.matches('.').count();
        da.cmp(&db).then_with(|| a.cmp(b))
    });
    paths.dedup();
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PathCacheKey {
    version: u64,
    path: String,
    options: ResolveOptions,
}

/// Memoized resolutions of one collection, keyed by catalog version
///
/// Failed resolutions are not cached.
pub struct PathCache {
    entries: Mutex<LruCache<PathCacheKey, Option<ResolvedPath>>>,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        PathCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn resolve(
        &self,
        schema: &SchemaCatalog,
        raw: &str,
        options: &ResolveOptions,
    ) -> Result<Option<ResolvedPath>> {
        let key = PathCacheKey {
            version: schema.version(),
            path: raw.to_string(),
            options: options.clone(),
        };
        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(hit.clone());
        }

        let resolved = resolve_path(schema, raw, options)?;
        self.entries.lock().put(key, resolved.clone());
        Ok(resolved)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PathCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCache").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ObjectId;
    use crate::schema::{labels, MediaType, ScalarKind};
    use serde_json::json;

    fn image_schema() -> SchemaCatalog {
        let mut schema = SchemaCatalog::new(MediaType::Image);
        schema.add_field("gt", labels::detections()).unwrap();
        schema
            .add_field("ref", FieldDescriptor::object_id())
            .unwrap();
        schema
    }

    fn video_schema() -> SchemaCatalog {
        let mut schema = SchemaCatalog::new(MediaType::Video);
        schema.add_frame_field("gt", labels::detections()).unwrap();
        schema
    }

    fn resolve(schema: &SchemaCatalog, path: &str, options: ResolveOptions) -> ResolvedPath {
        resolve_path(schema, path, &options).unwrap().unwrap()
    }

    // ========== basic resolution ==========

    #[test]
    fn test_empty_path_is_none() {
        let schema = image_schema();
        assert!(resolve_path(&schema, "", &ResolveOptions::new()).unwrap().is_none());
        assert!(resolve_path(&schema, "  ", &ResolveOptions::new()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_root_field() {
        let schema = image_schema();
        let err = resolve_path(&schema, "predictions.label", &ResolveOptions::new()).unwrap_err();
        assert!(matches!(err, SampleDbError::UnknownField(ref f) if f == "predictions"));

        let resolved = resolve(
            &schema,
            "predictions.label",
            ResolveOptions::new().with_allow_missing(true),
        );
        assert_eq!(resolved.path, "predictions.label");
        assert!(resolved.leaf.is_none());
    }

    #[test]
    fn test_terminal_list_not_auto_unwound() {
        let schema = image_schema();
        let resolved = resolve(&schema, "gt.detections", ResolveOptions::new().with_auto_unwind(true));
        assert!(resolved.unwind_list.is_empty());
        assert_eq!(resolved.other_list_fields, vec!["gt.detections"]);

        let resolved = resolve(&schema, "gt.detections", ResolveOptions::flattened());
        assert_eq!(resolved.unwind_list, vec!["gt.detections"]);
    }

    #[test]
    fn test_list_left_intact_without_auto_unwind() {
        let schema = image_schema();
        let resolved = resolve(&schema, "gt.detections.label", ResolveOptions::new());
        assert!(resolved.unwind_list.is_empty());
        assert_eq!(resolved.other_list_fields, vec!["gt.detections"]);
        assert_eq!(resolved.leaf, Some(FieldDescriptor::scalar(ScalarKind::String)));
    }

    // ========== explicit markers ==========

    #[test]
    fn test_explicit_markers_force_unwinds() {
        let mut schema = image_schema();
        schema
            .add_field(
                "gt.detections.points",
                FieldDescriptor::list_of(FieldDescriptor::list_of(FieldDescriptor::scalar(
                    ScalarKind::Float,
                ))),
            )
            .unwrap();

        let resolved = resolve(&schema, "gt.detections[].points[]", ResolveOptions::new());
        assert_eq!(
            resolved.unwind_list,
            vec!["gt.detections".to_string(), "gt.detections.points".to_string()]
        );
        assert_eq!(resolved.path, "gt.detections.points");
    }

    #[test]
    fn test_marker_on_scalar_rejected() {
        let schema = image_schema();
        let err = resolve_path(&schema, "filepath[]", &ResolveOptions::new()).unwrap_err();
        assert!(matches!(err, SampleDbError::InvalidPath { .. }));
        assert!(resolve_path(&schema, "gt..label", &ResolveOptions::new()).is_err());
    }

    #[test]
    fn test_markers_on_dynamic_fields() {
        let schema = image_schema();
        let resolved = resolve(
            &schema,
            "extra[].items[].value",
            ResolveOptions::new().with_allow_missing(true),
        );
        assert_eq!(resolved.unwind_list, vec!["extra", "extra.items"]);
    }

    // ========== id aliasing ==========

    #[test]
    fn test_public_id_alias() {
        let schema = image_schema();
        let resolved = resolve(&schema, "id", ResolveOptions::new());
        assert_eq!(resolved.path, "_id");
        assert!(resolved.is_id_field);
        assert!(resolved.converts_ids());

        let oid = ObjectId::new();
        assert_eq!(resolved.to_output(oid.to_value()), json!(oid.to_hex()));
        assert_eq!(resolved.to_storage(json!(oid.to_hex())).unwrap(), oid.to_value());
    }

    #[test]
    fn test_private_id_keeps_native() {
        let schema = image_schema();
        let resolved = resolve(&schema, "_id", ResolveOptions::new());
        assert!(resolved.is_id_field);
        assert!(!resolved.converts_ids());

        let oid = ObjectId::new();
        assert_eq!(resolved.to_output(oid.to_value()), oid.to_value());
    }

    #[test]
    fn test_nested_label_id_alias() {
        let schema = image_schema();
        let resolved = resolve(&schema, "gt.detections.id", ResolveOptions::new());
        assert_eq!(resolved.path, "gt.detections._id");
        assert!(resolved.converts_ids());
    }

    #[test]
    fn test_public_reference_field_converts() {
        let schema = image_schema();
        let resolved = resolve(&schema, "ref", ResolveOptions::new());
        assert_eq!(resolved.path, "ref");
        assert!(resolved.converts_ids());
    }

    // ========== frames and groups ==========

    #[test]
    fn test_frame_prefix() {
        let schema = video_schema();
        let resolved = resolve(&schema, "frames.gt.detections.label", ResolveOptions::flattened());
        assert!(resolved.is_frame_field);
        assert_eq!(resolved.path, "gt.detections.label");
        assert_eq!(resolved.full_path(), "frames.gt.detections.label");
        assert_eq!(resolved.full_unwinds(), vec!["frames", "frames.gt.detections"]);
    }

    #[test]
    fn test_frames_root_marker() {
        let schema = video_schema();
        let resolved = resolve(&schema, "frames", ResolveOptions::new());
        assert!(resolved.is_frames_root);
        assert_eq!(resolved.full_path(), "frames");
        assert!(resolved.full_unwinds().is_empty());

        let resolved = resolve(&schema, "frames[]", ResolveOptions::new());
        assert_eq!(resolved.full_unwinds(), vec!["frames"]);
    }

    #[test]
    fn test_frame_sample_id_alias() {
        let schema = video_schema();
        let resolved = resolve(&schema, "frames.sample_id", ResolveOptions::new());
        assert_eq!(resolved.path, "_sample_id");
        assert!(resolved.converts_ids());
    }

    #[test]
    fn test_frames_on_image_collection_rejected() {
        let schema = image_schema();
        let err = resolve_path(&schema, "frames.gt", &ResolveOptions::new()).unwrap_err();
        assert!(err.to_string().contains("video"));
    }

    #[test]
    fn test_group_slice_prefix() {
        let mut schema = image_schema();
        let slices = [
            ("left".to_string(), MediaType::Image),
            ("right".to_string(), MediaType::Image),
        ]
        .into_iter()
        .collect();
        schema.declare_group_field("group", "left", slices).unwrap();

        let resolved = resolve(&schema, "groups.right.filepath", ResolveOptions::new());
        assert_eq!(resolved.group_slice.as_deref(), Some("right"));
        assert_eq!(resolved.path, "filepath");

        assert!(resolve_path(&schema, "groups.center.filepath", &ResolveOptions::new()).is_err());
        assert!(resolve_path(&image_schema(), "groups.left.filepath", &ResolveOptions::new()).is_err());
    }

    // ========== renaming ==========

    #[test]
    fn test_new_field_substitutes_root() {
        let schema = image_schema();
        let resolved = resolve(
            &schema,
            "gt.detections.label",
            ResolveOptions::new().with_new_field("predictions"),
        );
        assert_eq!(resolved.output_path(), "predictions.detections.label");
    }

    #[test]
    fn test_document_list_root() {
        let schema = image_schema();
        let resolved = resolve(&schema, "gt.detections.label", ResolveOptions::flattened());
        assert_eq!(resolved.document_list_root(&schema).as_deref(), Some("gt.detections"));

        let resolved = resolve(&schema, "filepath", ResolveOptions::flattened());
        assert_eq!(resolved.document_list_root(&schema), None);
    }

    // ========== cache ==========

    #[test]
    fn test_cache_keyed_by_version() {
        let mut schema = image_schema();
        let cache = PathCache::new(8);
        let options = ResolveOptions::new();

        assert!(cache.resolve(&schema, "weather", &options).is_err());
        assert!(cache.is_empty());

        schema
            .add_field("weather", FieldDescriptor::scalar(ScalarKind::String))
            .unwrap();
        assert!(cache.resolve(&schema, "weather", &options).unwrap().is_some());
        assert!(cache.resolve(&schema, "weather", &options).unwrap().is_some());
        assert_eq!(cache.len(), 1);
    }
}
