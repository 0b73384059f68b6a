// view/stage.rs
// View stages: validation, schema effects and pipeline lowering

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::collection::Collection;
use crate::document::{strings_to_native_ids, ObjectId};
use crate::error::{Result, SampleDbError};
use crate::path::{resolve_path, ResolveOptions, ResolvedPath};
use crate::schema::{FieldDescriptor, FieldInfo, MediaType, SchemaCatalog};

/// Field holding the distance computed by a geo-proximity stage
const GEO_DISTANCE_FIELD: &str = "_geo_distance";

/// One atomic read-only transformation of a view
#[derive(Debug, Clone, PartialEq)]
pub enum ViewStage {
    /// Keep samples matching a query filter
    Match(Value),
    /// Keep samples whose field is (or is not) populated
    Exists { field: String, exists: bool },
    /// Keep the first `n` samples; `n <= 0` yields nothing
    Limit(i64),
    Skip(usize),
    SortBy { field: String, reverse: bool },
    /// Keep samples with the given ids (hex strings)
    Select(Vec<String>),
    /// Drop samples with the given ids (hex strings)
    Exclude(Vec<String>),
    /// Keep only these fields (plus default fields)
    SelectFields(Vec<String>),
    ExcludeFields(Vec<String>),
    /// Filter the labels of a label field
    ///
    /// `filter` is an aggregation expression over one label; `"$label"`
    /// refers to the label's own attributes.
    FilterLabels {
        field: String,
        filter: Value,
        only_matches: bool,
    },
    /// One document per label of a label-list field
    ToPatches { field: String },
    /// Reorder samples so that samples sharing a value are contiguous
    GroupBy {
        field: String,
        order_by: Option<String>,
        reverse: bool,
    },
    /// Sort by distance from a `[longitude, latitude]` point
    GeoNear {
        point: (f64, f64),
        location_field: String,
        max_distance: Option<f64>,
        query: Option<Value>,
    },
    /// Flatten a grouped collection to the given slices
    SelectGroupSlices(Vec<String>),
}

/// What a stage is validated against when appended
pub(crate) struct ValidateContext<'a> {
    /// Effective schema after the preceding stages
    pub schema: &'a SchemaCatalog,
    pub previous: &'a [ViewStage],
    pub strict: bool,
}

/// What a stage is lowered with
pub(crate) struct LowerContext<'a> {
    pub schema: &'a SchemaCatalog,
    pub collection: &'a Collection,
    /// Resolutions may use the collection's path cache
    pub cached: bool,
    /// Extra condition merged into a leading geo-proximity stage
    pub geo_query: Option<Value>,
}

impl LowerContext<'_> {
    fn resolve(&self, stage: &ViewStage, path: &str, options: &ResolveOptions) -> Result<ResolvedPath> {
        let resolved = if self.cached {
            self.collection.resolve_path(path, options)?
        } else {
            resolve_path(self.schema, path, options)?
        };
        resolved.ok_or_else(|| stage.invalid("field path cannot be empty"))
    }
}

fn lenient() -> ResolveOptions {
    ResolveOptions::new().with_allow_missing(true)
}

fn is_frame_path(schema: &SchemaCatalog, path: &str) -> bool {
    schema.has_frames()
        && !schema.sample_fields().contains_key("frames")
        && (path == "frames" || path.starts_with("frames.") || path.starts_with("frames[]"))
}

/// Field paths named by a query filter (logical operators are walked)
fn filter_paths(filter: &Value, out: &mut Vec<String>) {
    let Some(obj) = filter.as_object() else {
        return;
    };
    for (key, cond) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                if let Some(items) = cond.as_array() {
                    for item in items {
                        filter_paths(item, out);
                    }
                }
            }
            k if k.starts_with('$') => {}
            path => out.push(path.to_string()),
        }
    }
}

fn convert_id_operand(field: &str, value: Value) -> Result<Value> {
    match value {
        Value::String(_) | Value::Array(_) => strings_to_native_ids(field, value),
        other => Ok(other),
    }
}

/// Convert string ids in a condition on an ID field to native ids
fn convert_id_condition(field: &str, cond: Value) -> Result<Value> {
    match cond {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) && !is_object_id_map(&map) => {
            let mut out = Map::new();
            for (op, operand) in map {
                let operand = match op.as_str() {
                    "$eq" | "$ne" | "$in" | "$nin" => convert_id_operand(field, operand)?,
                    _ => operand,
                };
                out.insert(op, operand);
            }
            Ok(Value::Object(out))
        }
        other => convert_id_operand(field, other),
    }
}

fn is_object_id_map(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.contains_key("$oid")
}

/// Rewrite a filter's field paths to their storage paths
fn rewrite_filter(
    filter: &Value,
    resolve: &mut dyn FnMut(&str) -> Result<ResolvedPath>,
) -> Result<Value> {
    let obj = filter.as_object().ok_or_else(|| SampleDbError::InvalidStage {
        stage: "Match".to_string(),
        reason: "filter must be an object".to_string(),
    })?;
    let mut out = Map::new();
    for (key, cond) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let items = cond.as_array().ok_or_else(|| {
                    SampleDbError::InvalidQuery(format!("{} requires an array", key))
                })?;
                let mut rewritten = Vec::with_capacity(items.len());
                for item in items {
                    rewritten.push(rewrite_filter(item, &mut *resolve)?);
                }
                out.insert(key.clone(), Value::Array(rewritten));
            }
            k if k.starts_with('$') => {
                out.insert(key.clone(), cond.clone());
            }
            path => {
                let resolved = resolve(path)?;
                let cond = if resolved.is_id_field {
                    convert_id_condition(path, cond.clone())?
                } else {
                    cond.clone()
                };
                out.insert(resolved.full_path(), cond);
            }
        }
    }
    Ok(Value::Object(out))
}

/// Rewrite `"$attr"` references of a label filter to `"$$this.attr"`
fn label_expression(expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            Value::String(format!("$$this.{}", &s[1..]))
        }
        Value::Array(items) => Value::Array(items.iter().map(label_expression).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), label_expression(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Path of the list of label documents inside a label field
///
/// `gt` declared as `Detections` yields `gt.detections`; a list of
/// documents yields itself; a single label yields `None`.
fn label_list_path(path: &str, descriptor: &FieldDescriptor) -> Option<String> {
    if descriptor.is_document_list() {
        return Some(path.to_string());
    }
    if let FieldDescriptor::EmbeddedDocument { fields, .. } = descriptor {
        return fields
            .values()
            .find(|f| f.descriptor.is_document_list())
            .map(|f| format!("{}.{}", path, f.name));
    }
    None
}

impl ViewStage {
    pub fn name(&self) -> &'static str {
        match self {
            ViewStage::Match(_) => "Match",
            ViewStage::Exists { .. } => "Exists",
            ViewStage::Limit(_) => "Limit",
            ViewStage::Skip(_) => "Skip",
            ViewStage::SortBy { .. } => "SortBy",
            ViewStage::Select(_) => "Select",
            ViewStage::Exclude(_) => "Exclude",
            ViewStage::SelectFields(_) => "SelectFields",
            ViewStage::ExcludeFields(_) => "ExcludeFields",
            ViewStage::FilterLabels { .. } => "FilterLabels",
            ViewStage::ToPatches { .. } => "ToPatches",
            ViewStage::GroupBy { .. } => "GroupBy",
            ViewStage::GeoNear { .. } => "GeoNear",
            ViewStage::SelectGroupSlices(_) => "SelectGroupSlices",
        }
    }

    fn invalid(&self, reason: &str) -> SampleDbError {
        SampleDbError::InvalidStage {
            stage: self.name().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the stage changes the schema seen by later stages
    pub fn transforms_schema(&self) -> bool {
        matches!(
            self,
            ViewStage::SelectFields(_)
                | ViewStage::ExcludeFields(_)
                | ViewStage::ToPatches { .. }
                | ViewStage::SelectGroupSlices(_)
        )
    }

    /// Whether lowering needs the frames of each sample attached
    pub(crate) fn needs_frames(&self, schema: &SchemaCatalog) -> bool {
        match self {
            ViewStage::Match(filter) => {
                let mut paths = Vec::new();
                filter_paths(filter, &mut paths);
                paths.iter().any(|p| is_frame_path(schema, p))
            }
            ViewStage::Exists { field, .. } => is_frame_path(schema, field),
            _ => false,
        }
    }

    fn resolve_for_validation(&self, ctx: &ValidateContext<'_>, path: &str) -> Result<ResolvedPath> {
        let options = ResolveOptions::new().with_allow_missing(!ctx.strict);
        resolve_path(ctx.schema, path, &options)?.ok_or_else(|| self.invalid("field path cannot be empty"))
    }

    /// Sample-level field of a stage that cannot operate on frames
    fn sample_field(&self, ctx: &ValidateContext<'_>, path: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve_for_validation(ctx, path)?;
        if resolved.is_frame_field {
            return Err(self.invalid(&format!("frame field '{}' is not supported", path)));
        }
        if resolved.group_slice.is_some() {
            return Err(self.invalid(&format!("group slice path '{}' is not supported", path)));
        }
        Ok(resolved)
    }

    /// Check the stage against the effective schema of the view it joins
    pub(crate) fn validate(&self, ctx: &ValidateContext<'_>) -> Result<()> {
        match self {
            ViewStage::Match(filter) => {
                if !filter.is_object() {
                    return Err(self.invalid("filter must be an object"));
                }
                let mut paths = Vec::new();
                filter_paths(filter, &mut paths);
                for path in paths {
                    let resolved = self.resolve_for_validation(ctx, &path)?;
                    if resolved.group_slice.is_some() {
                        return Err(self.invalid("group slice paths cannot be filtered"));
                    }
                }
                Ok(())
            }
            ViewStage::Exists { field, .. } => self.resolve_for_validation(ctx, field).map(|_| ()),
            ViewStage::Limit(_) | ViewStage::Skip(_) => Ok(()),
            ViewStage::SortBy { field, .. } => self.sample_field(ctx, field).map(|_| ()),
            ViewStage::Select(ids) | ViewStage::Exclude(ids) => {
                for id in ids {
                    ObjectId::parse_str(id)?;
                }
                Ok(())
            }
            ViewStage::SelectFields(fields) => {
                for field in fields {
                    self.sample_field(ctx, field)?;
                }
                Ok(())
            }
            ViewStage::ExcludeFields(fields) => {
                for field in fields {
                    let resolved = self.sample_field(ctx, field)?;
                    let root = resolved.path.split('.').next().unwrap_or_default();
                    if ctx.schema.get_field(root).map(|f| f.is_default).unwrap_or(false) {
                        return Err(self.invalid(&format!("cannot exclude default field '{}'", root)));
                    }
                }
                Ok(())
            }
            ViewStage::FilterLabels { field, filter, .. } => {
                let resolved = self.sample_field(ctx, field)?;
                match &resolved.leaf {
                    Some(d) if d.is_embedded() => Ok(()),
                    Some(d) => Err(self.invalid(&format!("'{}' is not a label field ({})", field, d))),
                    None => Err(self.invalid(&format!("'{}' is not a declared label field", field))),
                }?;
                if !filter.is_object() && !filter.is_boolean() {
                    return Err(self.invalid("label filter must be an expression"));
                }
                Ok(())
            }
            ViewStage::ToPatches { field } => {
                if ctx
                    .previous
                    .iter()
                    .any(|s| matches!(s, ViewStage::ToPatches { .. } | ViewStage::GroupBy { .. }))
                {
                    return Err(self.invalid("patches cannot be extracted after GroupBy or ToPatches"));
                }
                let resolved = self.sample_field(ctx, field)?;
                let has_list = resolved
                    .leaf
                    .as_ref()
                    .and_then(|d| label_list_path(&resolved.path, d))
                    .is_some();
                if !has_list {
                    return Err(self.invalid(&format!("'{}' does not hold a list of labels", field)));
                }
                Ok(())
            }
            ViewStage::GroupBy { field, order_by, .. } => {
                if ctx
                    .previous
                    .iter()
                    .any(|s| matches!(s, ViewStage::GroupBy { .. }))
                {
                    return Err(self.invalid("a view can only be grouped once"));
                }
                self.sample_field(ctx, field)?;
                if let Some(order_by) = order_by {
                    self.sample_field(ctx, order_by)?;
                }
                Ok(())
            }
            ViewStage::GeoNear {
                location_field,
                query,
                ..
            } => {
                if !ctx.previous.is_empty() {
                    return Err(self.invalid("geo-proximity must be the first stage of a view"));
                }
                self.sample_field(ctx, location_field)?;
                if let Some(query) = query {
                    if !query.is_object() {
                        return Err(self.invalid("query must be an object"));
                    }
                }
                Ok(())
            }
            ViewStage::SelectGroupSlices(slices) => {
                let group = ctx
                    .schema
                    .group_field()
                    .ok_or_else(|| self.invalid("collection is not grouped"))?;
                if slices.is_empty() {
                    return Err(self.invalid("at least one slice is required"));
                }
                if let Some(unknown) = slices.iter().find(|s| !group.slices.contains_key(*s)) {
                    return Err(self.invalid(&format!("unknown slice '{}'", unknown)));
                }
                if ctx
                    .previous
                    .iter()
                    .any(|s| matches!(s, ViewStage::SelectGroupSlices(_)))
                {
                    return Err(self.invalid("slices were already selected"));
                }
                Ok(())
            }
        }
    }

    /// Effective schema after this stage
    pub(crate) fn transform_schema(&self, schema: &mut SchemaCatalog) {
        match self {
            ViewStage::SelectFields(fields) => {
                let roots: Vec<&str> = fields
                    .iter()
                    .map(|f| f.split('.').next().unwrap_or_default())
                    .collect();
                let kept: BTreeMap<String, FieldInfo> = schema
                    .sample_fields()
                    .iter()
                    .filter(|(name, info)| info.is_default || roots.contains(&name.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                schema.replace_sample_fields(kept);
            }
            ViewStage::ExcludeFields(fields) => {
                // Nested paths and ID aliases resolve as in lowering
                for field in fields {
                    if let Ok(Some(resolved)) = resolve_path(schema, field, &lenient()) {
                        let _ = schema.remove_field(&resolved.path, resolved.is_frame_field);
                    }
                }
            }
            ViewStage::ToPatches { field } => {
                let Some(info) = schema.get_field(field).cloned() else {
                    return;
                };
                let element = label_list_path(field, &info.descriptor)
                    .and_then(|list| schema.get_field(&list).cloned())
                    .and_then(|list| list.descriptor.element().cloned());
                let mut kept: BTreeMap<String, FieldInfo> = schema
                    .sample_fields()
                    .iter()
                    .filter(|(name, info)| info.is_default && name.as_str() != "frames")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                kept.insert(
                    "_sample_id".to_string(),
                    FieldInfo::new("_sample_id", FieldDescriptor::object_id())
                        .read_only()
                        .default_field(),
                );
                if let Some(element) = element {
                    kept.insert(field.clone(), FieldInfo::new(field, element));
                }
                schema.replace_sample_fields(kept);
            }
            ViewStage::SelectGroupSlices(slices) => {
                let media: Vec<MediaType> = schema
                    .group_field()
                    .map(|g| slices.iter().filter_map(|s| g.slices.get(s).copied()).collect())
                    .unwrap_or_default();
                if let Some(first) = media.first() {
                    if media.iter().all(|m| m == first) {
                        schema.set_media_type(*first);
                    }
                }
            }
            _ => {}
        }
    }

    /// Lower the stage into pipeline stages
    pub(crate) fn to_pipeline(&self, ctx: &LowerContext<'_>) -> Result<Vec<Value>> {
        match self {
            ViewStage::Match(filter) => {
                let filter = rewrite_filter(filter, &mut |path: &str| self.resolve_lenient(ctx, path))?;
                Ok(vec![json!({"$match": filter})])
            }
            ViewStage::Exists { field, exists } => {
                let resolved = self.resolve_lenient(ctx, field)?;
                let cond = if *exists {
                    json!({"$exists": true, "$ne": null})
                } else {
                    Value::Null
                };
                Ok(vec![json!({"$match": {resolved.full_path(): cond}})])
            }
            ViewStage::Limit(n) if *n <= 0 => Ok(vec![json!({"$match": {"_id": null}})]),
            ViewStage::Limit(n) => Ok(vec![json!({"$limit": n})]),
            ViewStage::Skip(0) => Ok(Vec::new()),
            ViewStage::Skip(n) => Ok(vec![json!({"$skip": n})]),
            ViewStage::SortBy { field, reverse } => {
                let resolved = self.resolve_lenient(ctx, field)?;
                let direction = if *reverse { -1 } else { 1 };
                let mut sort = Map::new();
                sort.insert(resolved.full_path(), json!(direction));
                if resolved.path != "_id" {
                    sort.insert("_id".to_string(), json!(1));
                }
                Ok(vec![json!({"$sort": sort})])
            }
            ViewStage::Select(ids) | ViewStage::Exclude(ids) => {
                let ids = ids
                    .iter()
                    .map(|id| ObjectId::parse_str(id).map(|oid| oid.to_value()))
                    .collect::<Result<Vec<_>>>()?;
                let op = if matches!(self, ViewStage::Select(_)) { "$in" } else { "$nin" };
                Ok(vec![json!({"$match": {"_id": {op: ids}}})])
            }
            ViewStage::SelectFields(fields) => {
                let mut project = Map::new();
                for (name, info) in ctx.schema.sample_fields() {
                    if info.is_default {
                        project.insert(name.clone(), json!(true));
                    }
                }
                for field in fields {
                    let resolved = self.resolve_lenient(ctx, field)?;
                    let root = resolved.path.split('.').next().unwrap_or_default().to_string();
                    project.insert(root, json!(true));
                }
                if ctx.schema.has_frames() {
                    project.insert("frames".to_string(), json!(true));
                }
                Ok(vec![json!({"$project": project})])
            }
            ViewStage::ExcludeFields(fields) => {
                let mut project = Map::new();
                for field in fields {
                    let resolved = self.resolve_lenient(ctx, field)?;
                    project.insert(resolved.path, json!(false));
                }
                Ok(vec![json!({"$project": project})])
            }
            ViewStage::FilterLabels {
                field,
                filter,
                only_matches,
            } => {
                let resolved = self.resolve_lenient(ctx, field)?;
                let path = resolved.full_path();
                let cond = label_expression(filter);
                let list = resolved
                    .leaf
                    .as_ref()
                    .and_then(|d| label_list_path(&path, d));

                let mut stages = Vec::new();
                match list {
                    Some(list) => {
                        let reference = format!("${}", list);
                        stages.push(json!({"$set": {list.clone(): {"$cond": {
                            "if": {"$isArray": reference},
                            "then": {"$filter": {"input": reference, "as": "this", "cond": cond}},
                            "else": reference,
                        }}}}));
                        if *only_matches {
                            stages.push(json!({"$match": {"$expr": {"$gt": [
                                {"$size": {"$ifNull": [reference, []]}}, 0
                            ]}}}));
                        }
                    }
                    None => {
                        let reference = format!("${}", path);
                        stages.push(json!({"$set": {path.clone(): {"$let": {
                            "vars": {"this": reference},
                            "in": {"$cond": [cond, "$$this", null]},
                        }}}}));
                        if *only_matches {
                            stages.push(json!({"$match": {path: {"$ne": null}}}));
                        }
                    }
                }
                Ok(stages)
            }
            ViewStage::ToPatches { field } => {
                let resolved = self.resolve_lenient(ctx, field)?;
                let list = resolved
                    .leaf
                    .as_ref()
                    .and_then(|d| label_list_path(&resolved.path, d))
                    .ok_or_else(|| self.invalid(&format!("'{}' does not hold a list of labels", field)))?;

                let mut project = Map::new();
                for (name, info) in ctx.schema.sample_fields() {
                    if info.is_default {
                        project.insert(name.clone(), json!(true));
                    }
                }
                project.insert(resolved.path.clone(), json!(true));

                let list_ref = format!("${}", list);
                Ok(vec![
                    json!({"$project": project}),
                    json!({"$unwind": list_ref}),
                    json!({"$set": {
                        "_sample_id": "$_id",
                        "_id": {"$ifNull": [format!("{}._id", list_ref), "$_id"]},
                        resolved.path.clone(): list_ref,
                    }}),
                ])
            }
            ViewStage::GroupBy {
                field,
                order_by,
                reverse,
            } => {
                let resolved = self.resolve_lenient(ctx, field)?;
                let mut stages = Vec::new();
                if let Some(order_by) = order_by {
                    let order = self.resolve_lenient(ctx, order_by)?;
                    let direction = if *reverse { -1 } else { 1 };
                    stages.push(json!({"$sort": {order.full_path(): direction}}));
                }
                stages.push(json!({"$group": {
                    "_id": format!("${}", resolved.full_path()),
                    "docs": {"$push": "$$ROOT"},
                }}));
                stages.push(json!({"$sort": {"_id": 1}}));
                stages.push(json!({"$unwind": "$docs"}));
                stages.push(json!({"$replaceRoot": {"newRoot": "$docs"}}));
                Ok(stages)
            }
            ViewStage::GeoNear {
                point,
                location_field,
                max_distance,
                query,
            } => {
                let resolved = self.resolve_lenient(ctx, location_field)?;
                let key = match resolved.leaf.as_ref().and_then(|d| d.embedded_fields()) {
                    Some(fields) if fields.contains_key("point") => format!("{}.point", resolved.path),
                    _ => resolved.path.clone(),
                };

                let mut conditions = Vec::new();
                if let Some(query) = query {
                    conditions.push(rewrite_filter(query, &mut |path: &str| self.resolve_lenient(ctx, path))?);
                }
                if let Some(extra) = &ctx.geo_query {
                    conditions.push(extra.clone());
                }

                let mut spec = Map::new();
                spec.insert(
                    "near".to_string(),
                    json!({"type": "Point", "coordinates": [point.0, point.1]}),
                );
                spec.insert("key".to_string(), json!(key));
                spec.insert("distanceField".to_string(), json!(GEO_DISTANCE_FIELD));
                if let Some(max) = max_distance {
                    spec.insert("maxDistance".to_string(), json!(max));
                }
                match conditions.len() {
                    0 => {}
                    1 => {
                        spec.insert("query".to_string(), conditions.remove(0));
                    }
                    _ => {
                        spec.insert("query".to_string(), json!({"$and": conditions}));
                    }
                }
                Ok(vec![
                    json!({"$geoNear": spec}),
                    json!({"$unset": GEO_DISTANCE_FIELD}),
                ])
            }
            ViewStage::SelectGroupSlices(slices) => {
                let group = ctx
                    .schema
                    .group_field()
                    .ok_or_else(|| self.invalid("collection is not grouped"))?;
                Ok(vec![json!({"$match": {format!("{}.name", group.name): {"$in": slices}}})])
            }
        }
    }

    fn resolve_lenient(&self, ctx: &LowerContext<'_>, path: &str) -> Result<ResolvedPath> {
        ctx.resolve(self, path, &lenient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{labels, ScalarKind};

    fn schema() -> SchemaCatalog {
        let mut schema = SchemaCatalog::new(MediaType::Image);
        schema.add_field("gt", labels::detections()).unwrap();
        schema.add_field("label", labels::classification()).unwrap();
        schema
            .add_field("score", FieldDescriptor::scalar(ScalarKind::Float))
            .unwrap();
        schema
    }

    fn validate(stage: &ViewStage, schema: &SchemaCatalog, previous: &[ViewStage]) -> Result<()> {
        stage.validate(&ValidateContext {
            schema,
            previous,
            strict: true,
        })
    }

    #[test]
    fn test_match_rejects_unknown_root() {
        let schema = schema();
        let stage = ViewStage::Match(json!({"nope": 1}));
        assert!(matches!(
            validate(&stage, &schema, &[]),
            Err(SampleDbError::UnknownField(_))
        ));
        let stage = ViewStage::Match(json!({"$or": [{"score": {"$gt": 0.5}}, {"gt.detections.label": "cat"}]}));
        assert!(validate(&stage, &schema, &[]).is_ok());
    }

    #[test]
    fn test_rewrite_filter_converts_public_ids() {
        let mut schema = schema();
        schema.add_field("_ref_id", FieldDescriptor::object_id()).unwrap();
        let hex = ObjectId::new().to_hex().to_string();
        let filter = json!({"ref_id": {"$in": [hex.clone()]}, "id": hex.clone()});
        let out = rewrite_filter(&filter, &mut |p: &str| {
            Ok(resolve_path(&schema, p, &lenient())?.unwrap())
        })
        .unwrap();
        assert_eq!(out["_ref_id"]["$in"][0], json!({"$oid": hex}));
        assert_eq!(out["_id"], json!({"$oid": hex}));
    }

    #[test]
    fn test_exclude_default_field_rejected() {
        let schema = schema();
        let stage = ViewStage::ExcludeFields(vec!["filepath".to_string()]);
        assert!(validate(&stage, &schema, &[]).is_err());
        let stage = ViewStage::ExcludeFields(vec!["score".to_string()]);
        assert!(validate(&stage, &schema, &[]).is_ok());

        let mut after = schema.clone();
        stage.transform_schema(&mut after);
        assert!(after.get_field("score").is_none());
        assert!(after.get_field("gt").is_some());
    }

    #[test]
    fn test_exclude_nested_and_aliased_fields() {
        let mut schema = schema();
        schema.add_field("_ref_id", FieldDescriptor::object_id()).unwrap();
        let stage = ViewStage::ExcludeFields(vec!["gt.detections".to_string(), "ref_id".to_string()]);
        assert!(validate(&stage, &schema, &[]).is_ok());

        let mut after = schema.clone();
        stage.transform_schema(&mut after);
        assert!(after.get_field("gt").is_some());
        assert!(after.get_field("gt.detections").is_none());
        assert!(after.get_field("_ref_id").is_none());
        assert!(after.get_field("score").is_some());
    }

    #[test]
    fn test_geo_near_must_be_first() {
        let mut schema = schema();
        schema.add_field("location", labels::geo_location()).unwrap();
        let stage = ViewStage::GeoNear {
            point: (2.35, 48.85),
            location_field: "location".to_string(),
            max_distance: None,
            query: None,
        };
        assert!(validate(&stage, &schema, &[]).is_ok());
        assert!(validate(&stage, &schema, &[ViewStage::Limit(3)]).is_err());
    }

    #[test]
    fn test_patches_schema() {
        let schema = schema();
        let stage = ViewStage::ToPatches {
            field: "gt".to_string(),
        };
        assert!(validate(&stage, &schema, &[]).is_ok());
        let not_a_list = ViewStage::ToPatches {
            field: "label".to_string(),
        };
        assert!(validate(&not_a_list, &schema, &[]).is_err());

        let mut after = schema.clone();
        stage.transform_schema(&mut after);
        assert_eq!(after.get_field("gt").unwrap().descriptor.document_type(), Some("Detection"));
        assert!(after.get_field("_sample_id").unwrap().descriptor.is_id());
        assert!(after.get_field("score").is_none());

        let again = validate(&stage, &after, &[stage.clone()]);
        assert!(again.is_err());
    }

    #[test]
    fn test_group_by_once() {
        let schema = schema();
        let stage = ViewStage::GroupBy {
            field: "label.label".to_string(),
            order_by: Some("score".to_string()),
            reverse: false,
        };
        assert!(validate(&stage, &schema, &[]).is_ok());
        assert!(validate(&stage, &schema, &[stage.clone()]).is_err());
    }

    #[test]
    fn test_label_expression_rewrites_attribute_refs() {
        let expr = json!({"$and": [{"$eq": ["$label", "cat"]}, {"$gt": ["$confidence", "$$threshold"]}]});
        assert_eq!(
            label_expression(&expr),
            json!({"$and": [{"$eq": ["$$this.label", "cat"]}, {"$gt": ["$$this.confidence", "$$threshold"]}]})
        );
    }
}
