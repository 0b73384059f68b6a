// engine/pipeline.rs
// Aggregation pipeline execution over in-memory documents

use std::cmp::Ordering;

use ahash::AHashMap;
use serde_json::{Map, Value};

use super::expr::{values_equal, EvalContext, Expr};
use super::filter::matches_filter;
use crate::error::{Result, SampleDbError};
use crate::value_utils::{
    canonical_json_string, compare_values_total, compare_values_with_none, get_nested_value,
    number_to_value, remove_nested_value, set_nested_value,
};

const EARTH_RADIUS_METERS: f64 = 6_378_100.0;

/// Documents of other collections, for `$lookup`
pub trait LookupSource {
    fn collection_docs(&self, name: &str) -> Vec<Value>;
}

/// Source with no other collections
pub struct NoLookup;

impl LookupSource for NoLookup {
    fn collection_docs(&self, _name: &str) -> Vec<Value> {
        Vec::new()
    }
}

fn agg_error(message: impl Into<String>) -> SampleDbError {
    SampleDbError::AggregationError(message.into())
}

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Value),
    Project(ProjectStage),
    AddFields(Vec<(String, Expr)>),
    Unset(Vec<String>),
    Unwind(UnwindStage),
    Group(GroupStage),
    Sort(Vec<(String, i64)>),
    Limit(usize),
    Skip(usize),
    Count(String),
    Facet(Vec<(String, Pipeline)>),
    ReplaceRoot(Expr),
    Lookup(LookupStage),
    Bucket(BucketStage),
    GeoNear(GeoNearStage),
}

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expr),
}

/// $unwind stage - one document per array element
#[derive(Debug, Clone)]
pub struct UnwindStage {
    path: String,
    preserve_null_and_empty: bool,
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Expr,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

#[derive(Debug, Clone)]
pub struct Accumulator {
    op: AccumulatorOp,
    expr: Expr,
}

/// $lookup stage - equality join against another collection
#[derive(Debug, Clone)]
pub struct LookupStage {
    from: String,
    local_field: String,
    foreign_field: String,
    as_field: String,
    pipeline: Option<Pipeline>,
}

/// $bucket stage - histogram over explicit boundaries
#[derive(Debug, Clone)]
pub struct BucketStage {
    group_by: Expr,
    boundaries: Vec<f64>,
    default: Option<Value>,
    output: Vec<(String, Accumulator)>,
}

/// $geoNear stage - distance-sorted documents around a point
#[derive(Debug, Clone)]
pub struct GeoNearStage {
    near: (f64, f64),
    key: String,
    distance_field: String,
    max_distance: Option<f64>,
    query: Option<Value>,
}

impl Pipeline {
    /// Create pipeline from a JSON array of stages; an empty pipeline is the identity
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        let stages = pipeline_json
            .as_array()
            .ok_or_else(|| agg_error("Pipeline must be an array"))?;
        Self::from_stages(stages)
    }

    pub fn from_stages(stages: &[Value]) -> Result<Self> {
        let stages = stages
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Execute pipeline on documents
    pub fn execute(&self, mut docs: Vec<Value>, source: &dyn LookupSource) -> Result<Vec<Value>> {
        for stage in &self.stages {
            docs = stage.execute(docs, source)?;
        }
        Ok(docs)
    }
}

fn single_entry<'a>(value: &'a Value, what: &str) -> Result<(&'a String, &'a Value)> {
    let obj = value
        .as_object()
        .ok_or_else(|| agg_error(format!("{} must be an object", what)))?;
    if obj.len() != 1 {
        return Err(agg_error(format!("{} must have exactly one operator", what)));
    }
    obj.iter()
        .next()
        .ok_or_else(|| agg_error(format!("{} must have exactly one operator", what)))
}

fn field_ref(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .map(|s| s.to_string())
        .ok_or_else(|| agg_error(format!("{} must be a field reference starting with $", what)))
}

fn non_negative(value: &Value, what: &str) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| agg_error(format!("{} must be a non-negative integer", what)))
}

impl Stage {
    /// Parse stage from JSON
    fn from_json(stage_json: &Value) -> Result<Self> {
        let (name, spec) = single_entry(stage_json, "Stage")?;

        match name.as_str() {
            "$match" => {
                if !spec.is_object() {
                    return Err(agg_error("$match must be an object"));
                }
                Ok(Stage::Match(spec.clone()))
            }
            "$project" => Ok(Stage::Project(ProjectStage::from_json(spec)?)),
            "$set" | "$addFields" => {
                let obj = spec
                    .as_object()
                    .ok_or_else(|| agg_error(format!("{} must be an object", name)))?;
                let fields = obj
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Stage::AddFields(fields))
            }
            "$unset" => {
                let fields = match spec {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .map(|v| v.as_str().map(String::from).ok_or_else(|| agg_error("$unset fields must be strings")))
                        .collect::<Result<Vec<_>>>()?,
                    _ => return Err(agg_error("$unset requires a field name or list of names")),
                };
                Ok(Stage::Unset(fields))
            }
            "$unwind" => Ok(Stage::Unwind(UnwindStage::from_json(spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(spec)?)),
            "$sort" => {
                let obj = spec.as_object().ok_or_else(|| agg_error("$sort must be an object"))?;
                let mut fields = Vec::with_capacity(obj.len());
                for (field, dir) in obj {
                    match dir.as_i64() {
                        Some(d @ (1 | -1)) => fields.push((field.clone(), d)),
                        _ => return Err(agg_error("Sort direction must be 1 or -1")),
                    }
                }
                Ok(Stage::Sort(fields))
            }
            "$limit" => {
                let n = non_negative(spec, "$limit")?;
                if n == 0 {
                    return Err(agg_error("$limit must be positive"));
                }
                Ok(Stage::Limit(n))
            }
            "$skip" => Ok(Stage::Skip(non_negative(spec, "$skip")?)),
            "$count" => {
                let field = spec
                    .as_str()
                    .filter(|s| !s.is_empty() && !s.starts_with('$'))
                    .ok_or_else(|| agg_error("$count requires a non-empty field name"))?;
                Ok(Stage::Count(field.to_string()))
            }
            "$facet" => {
                let obj = spec.as_object().ok_or_else(|| agg_error("$facet must be an object"))?;
                let mut branches = Vec::with_capacity(obj.len());
                for (k, v) in obj {
                    branches.push((k.clone(), Pipeline::from_json(v)?));
                }
                Ok(Stage::Facet(branches))
            }
            "$replaceRoot" => {
                let root = spec
                    .get("newRoot")
                    .ok_or_else(|| agg_error("$replaceRoot requires 'newRoot'"))?;
                Ok(Stage::ReplaceRoot(Expr::parse(root)?))
            }
            "$lookup" => Ok(Stage::Lookup(LookupStage::from_json(spec)?)),
            "$bucket" => Ok(Stage::Bucket(BucketStage::from_json(spec)?)),
            "$geoNear" => Ok(Stage::GeoNear(GeoNearStage::from_json(spec)?)),
            _ => Err(agg_error(format!("Unknown pipeline stage: {}", name))),
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Value>, source: &dyn LookupSource) -> Result<Vec<Value>> {
        match self {
            Stage::Match(filter) => {
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches_filter(&doc, filter)? {
                        out.push(doc);
                    }
                }
                Ok(out)
            }
            Stage::Project(stage) => docs.iter().map(|d| stage.project_document(d)).collect(),
            Stage::AddFields(fields) => docs
                .into_iter()
                .map(|mut doc| {
                    let mut computed = Vec::with_capacity(fields.len());
                    for (path, expr) in fields {
                        computed.push((path, expr.eval_doc(&doc)?));
                    }
                    for (path, value) in computed {
                        match value {
                            Some(v) => set_nested_value(&mut doc, path, v),
                            None => {
                                remove_nested_value(&mut doc, path);
                            }
                        }
                    }
                    Ok(doc)
                })
                .collect(),
            Stage::Unset(fields) => Ok(docs
                .into_iter()
                .map(|mut doc| {
                    for f in fields {
                        remove_nested_value(&mut doc, f);
                    }
                    doc
                })
                .collect()),
            Stage::Unwind(stage) => Ok(stage.execute(docs)),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Sort(fields) => {
                let mut docs = docs;
                docs.sort_by(|a, b| {
                    for (field, dir) in fields {
                        let ord = compare_values_with_none(
                            get_nested_value(a, field),
                            get_nested_value(b, field),
                        );
                        let ord = if *dir < 0 { ord.reverse() } else { ord };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
                Ok(docs)
            }
            Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
            Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
            Stage::Count(field) => {
                if docs.is_empty() {
                    return Ok(Vec::new());
                }
                let mut out = Map::new();
                out.insert(field.clone(), Value::from(docs.len()));
                Ok(vec![Value::Object(out)])
            }
            Stage::Facet(branches) => {
                let mut out = Map::new();
                for (name, pipeline) in branches {
                    let results = pipeline.execute(docs.clone(), source)?;
                    out.insert(name.clone(), Value::Array(results));
                }
                Ok(vec![Value::Object(out)])
            }
            Stage::ReplaceRoot(expr) => docs
                .iter()
                .map(|doc| match expr.eval_doc(doc)? {
                    Some(v @ Value::Object(_)) => Ok(v),
                    other => Err(agg_error(format!(
                        "'newRoot' must evaluate to a document, got {:?}",
                        other
                    ))),
                })
                .collect(),
            Stage::Lookup(stage) => stage.execute(docs, source),
            Stage::Bucket(stage) => stage.execute(docs),
            Stage::GeoNear(stage) => stage.execute(docs),
        }
    }
}

impl ProjectStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| agg_error("$project must be an object"))?;
        let mut fields = Vec::with_capacity(obj.len());
        for (field, value) in obj {
            let action = match value {
                Value::Bool(true) => ProjectField::Include,
                Value::Bool(false) => ProjectField::Exclude,
                Value::Number(n) => match n.as_i64() {
                    Some(0) => ProjectField::Exclude,
                    Some(1) => ProjectField::Include,
                    _ => return Err(agg_error(format!("Invalid project value: {}", n))),
                },
                other => ProjectField::Computed(Expr::parse(other)?),
            };
            fields.push((field.clone(), action));
        }
        Ok(ProjectStage { fields })
    }

    fn project_document(&self, doc: &Value) -> Result<Value> {
        // Include mode if anything is included or computed; `_id: 0` is
        // allowed alongside inclusions
        let include_mode = self
            .fields
            .iter()
            .any(|(_, action)| !matches!(action, ProjectField::Exclude));

        if !include_mode {
            let mut out = doc.clone();
            for (field, _) in &self.fields {
                remove_nested_value(&mut out, field);
            }
            return Ok(out);
        }

        let mut out = Value::Object(Map::new());
        let id_excluded = self
            .fields
            .iter()
            .any(|(f, a)| f == "_id" && matches!(a, ProjectField::Exclude));
        if !id_excluded {
            if let Some(id) = doc.get("_id") {
                set_nested_value(&mut out, "_id", id.clone());
            }
        }

        for (field, action) in &self.fields {
            match action {
                ProjectField::Include => {
                    if let Some(v) = super::expr::field_path_value(doc, field) {
                        set_nested_value(&mut out, field, v);
                    }
                }
                ProjectField::Computed(expr) => {
                    if let Some(v) = expr.eval_doc(doc)? {
                        set_nested_value(&mut out, field, v);
                    }
                }
                ProjectField::Exclude => {
                    if field != "_id" {
                        return Err(agg_error(format!(
                            "Cannot exclude '{}' in an inclusion projection",
                            field
                        )));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl UnwindStage {
    fn from_json(spec: &Value) -> Result<Self> {
        match spec {
            Value::String(_) => Ok(UnwindStage {
                path: field_ref(spec, "$unwind path")?,
                preserve_null_and_empty: false,
            }),
            Value::Object(obj) => Ok(UnwindStage {
                path: field_ref(
                    obj.get("path").ok_or_else(|| agg_error("$unwind requires 'path'"))?,
                    "$unwind path",
                )?,
                preserve_null_and_empty: obj
                    .get("preserveNullAndEmptyArrays")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }),
            _ => Err(agg_error("$unwind requires a path")),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match get_nested_value(&doc, &self.path) {
                Some(Value::Array(items)) if !items.is_empty() => {
                    for item in items.clone() {
                        let mut copy = doc.clone();
                        set_nested_value(&mut copy, &self.path, item);
                        out.push(copy);
                    }
                }
                Some(Value::Array(_)) | Some(Value::Null) | None => {
                    if self.preserve_null_and_empty {
                        out.push(doc);
                    }
                }
                // Non-array values unwind to themselves
                Some(_) => out.push(doc),
            }
        }
        out
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let (op, arg) = single_entry(spec, "Accumulator")?;
        let op = match op.as_str() {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            "$count" => AccumulatorOp::Count,
            other => return Err(agg_error(format!("Unknown accumulator: {}", other))),
        };
        Ok(Accumulator {
            op,
            expr: Expr::parse(arg)?,
        })
    }

    fn compute(&self, docs: &[&Value]) -> Result<Value> {
        if self.op == AccumulatorOp::Count {
            return Ok(Value::from(docs.len()));
        }

        let mut values = Vec::with_capacity(docs.len());
        for doc in docs {
            values.push(self.expr.eval(&EvalContext::new(doc))?);
        }

        Ok(match self.op {
            AccumulatorOp::Sum => {
                let nums: Vec<&serde_json::Number> = values
                    .iter()
                    .filter_map(|v| match v {
                        Some(Value::Number(n)) => Some(n),
                        _ => None,
                    })
                    .collect();
                if nums.iter().all(|n| n.is_i64()) {
                    Value::from(nums.iter().filter_map(|n| n.as_i64()).sum::<i64>())
                } else {
                    number_to_value(nums.iter().filter_map(|n| n.as_f64()).sum())
                }
            }
            AccumulatorOp::Avg => {
                let nums: Vec<f64> = values.iter().flatten().filter_map(|v| v.as_f64()).collect();
                if nums.is_empty() {
                    Value::Null
                } else {
                    let mean = nums.iter().sum::<f64>() / nums.len() as f64;
                    serde_json::Number::from_f64(mean)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            AccumulatorOp::Min | AccumulatorOp::Max => {
                let present = values.into_iter().flatten().filter(|v| !v.is_null());
                let best = if self.op == AccumulatorOp::Min {
                    present.min_by(compare_values_total)
                } else {
                    present.max_by(compare_values_total)
                };
                best.unwrap_or(Value::Null)
            }
            AccumulatorOp::First => values.into_iter().next().flatten().unwrap_or(Value::Null),
            AccumulatorOp::Last => values.into_iter().last().flatten().unwrap_or(Value::Null),
            AccumulatorOp::Push => Value::Array(values.into_iter().flatten().collect()),
            AccumulatorOp::AddToSet => {
                let mut seen = ahash::AHashSet::new();
                let mut out = Vec::new();
                for v in values.into_iter().flatten() {
                    if seen.insert(canonical_json_string(&v)) {
                        out.push(v);
                    }
                }
                Value::Array(out)
            }
            AccumulatorOp::Count => Value::from(docs.len()),
        })
    }
}

fn parse_accumulators(obj: &Map<String, Value>, skip: &str) -> Result<Vec<(String, Accumulator)>> {
    obj.iter()
        .filter(|(k, _)| k.as_str() != skip)
        .map(|(k, v)| Ok((k.clone(), Accumulator::from_json(v)?)))
        .collect()
}

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| agg_error("$group must be an object"))?;
        let id = obj
            .get("_id")
            .ok_or_else(|| agg_error("Group stage must have _id field"))?;
        Ok(GroupStage {
            id: Expr::parse(id)?,
            accumulators: parse_accumulators(obj, "_id")?,
        })
    }

    /// Groups are emitted in order of first appearance
    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut index: AHashMap<String, usize> = AHashMap::new();
        let mut groups: Vec<(Value, Vec<&Value>)> = Vec::new();

        for doc in &docs {
            let key = self.id.eval_doc(doc)?.unwrap_or(Value::Null);
            let canonical = canonical_json_string(&key);
            match index.get(&canonical) {
                Some(&i) => groups[i].1.push(doc),
                None => {
                    index.insert(canonical, groups.len());
                    groups.push((key, vec![doc]));
                }
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for (field, acc) in &self.accumulators {
                out.insert(field.clone(), acc.compute(&members)?);
            }
            results.push(Value::Object(out));
        }
        Ok(results)
    }
}

impl LookupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let get = |key: &str| {
            spec.get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| agg_error(format!("$lookup requires '{}'", key)))
        };
        Ok(LookupStage {
            from: get("from")?,
            local_field: get("localField")?,
            foreign_field: get("foreignField")?,
            as_field: get("as")?,
            pipeline: spec.get("pipeline").map(Pipeline::from_json).transpose()?,
        })
    }

    /// Joined documents keep the foreign collection's storage order unless
    /// a sub-pipeline reorders them
    fn execute(&self, docs: Vec<Value>, source: &dyn LookupSource) -> Result<Vec<Value>> {
        let foreign = source.collection_docs(&self.from);
        docs.into_iter()
            .map(|mut doc| {
                let local = get_nested_value(&doc, &self.local_field).cloned();
                let matches: Vec<Value> = foreign
                    .iter()
                    .filter(|f| {
                        let Some(fv) = get_nested_value(f, &self.foreign_field) else {
                            return local.is_none();
                        };
                        match &local {
                            Some(Value::Array(items)) => items.iter().any(|l| values_equal(l, fv)),
                            Some(l) => values_equal(l, fv),
                            None => fv.is_null(),
                        }
                    })
                    .cloned()
                    .collect();
                let matches = match &self.pipeline {
                    Some(pipeline) => pipeline.execute(matches, source)?,
                    None => matches,
                };
                set_nested_value(&mut doc, &self.as_field, Value::Array(matches));
                Ok(doc)
            })
            .collect()
    }
}

impl BucketStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| agg_error("$bucket must be an object"))?;
        let group_by = Expr::parse(
            obj.get("groupBy")
                .ok_or_else(|| agg_error("$bucket requires 'groupBy'"))?,
        )?;
        let boundaries = obj
            .get("boundaries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| agg_error("$bucket requires 'boundaries'"))?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| agg_error("$bucket boundaries must be numbers")))
            .collect::<Result<Vec<_>>>()?;
        if boundaries.len() < 2 || boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(agg_error("$bucket boundaries must be at least two ascending values"));
        }
        let output = match obj.get("output").and_then(|v| v.as_object()) {
            Some(o) => parse_accumulators(o, "")?,
            None => vec![(
                "count".to_string(),
                Accumulator {
                    op: AccumulatorOp::Count,
                    expr: Expr::Literal(Value::Null),
                },
            )],
        };
        Ok(BucketStage {
            group_by,
            boundaries,
            default: obj.get("default").cloned(),
            output,
        })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let bins = self.boundaries.len() - 1;
        let mut buckets: Vec<Vec<&Value>> = vec![Vec::new(); bins];
        let mut overflow: Vec<&Value> = Vec::new();

        for doc in &docs {
            let value = self.group_by.eval_doc(doc)?.and_then(|v| v.as_f64());
            let bin = value.and_then(|x| {
                self.boundaries
                    .windows(2)
                    .position(|w| x >= w[0] && x < w[1])
            });
            match bin {
                Some(i) => buckets[i].push(doc),
                None if self.default.is_some() => overflow.push(doc),
                None => {
                    return Err(agg_error(
                        "$bucket could not find a matching branch and no default was given",
                    ))
                }
            }
        }

        let mut results = Vec::new();
        for (i, members) in buckets.iter().enumerate() {
            if members.is_empty() {
                continue;
            }
            results.push(self.bucket_doc(number_to_value(self.boundaries[i]), members)?);
        }
        if let (Some(default), false) = (&self.default, overflow.is_empty()) {
            results.push(self.bucket_doc(default.clone(), &overflow)?);
        }
        Ok(results)
    }

    fn bucket_doc(&self, id: Value, members: &[&Value]) -> Result<Value> {
        let mut out = Map::new();
        out.insert("_id".to_string(), id);
        for (field, acc) in &self.output {
            out.insert(field.clone(), acc.compute(members)?);
        }
        Ok(Value::Object(out))
    }
}

/// `[lng, lat]` from a GeoJSON point or a legacy coordinate pair
fn point_coordinates(value: &Value) -> Option<(f64, f64)> {
    let coords = match value {
        Value::Array(_) => value,
        Value::Object(obj) => obj.get("coordinates")?,
        _ => return None,
    };
    let items = coords.as_array()?;
    if items.len() != 2 {
        return None;
    }
    Some((items[0].as_f64()?, items[1].as_f64()?))
}

/// Great-circle distance in meters
pub fn haversine_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lng1, lat1) = (a.0.to_radians(), a.1.to_radians());
    let (lng2, lat2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

impl GeoNearStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let near = spec
            .get("near")
            .and_then(point_coordinates)
            .ok_or_else(|| agg_error("$geoNear requires a 'near' point"))?;
        let key = spec
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| agg_error("$geoNear requires 'key'"))?;
        let distance_field = spec
            .get("distanceField")
            .and_then(|v| v.as_str())
            .ok_or_else(|| agg_error("$geoNear requires 'distanceField'"))?;
        Ok(GeoNearStage {
            near,
            key: key.to_string(),
            distance_field: distance_field.to_string(),
            max_distance: spec.get("maxDistance").and_then(|v| v.as_f64()),
            query: spec.get("query").cloned(),
        })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut hits = Vec::new();
        for mut doc in docs {
            if let Some(query) = &self.query {
                if !matches_filter(&doc, query)? {
                    continue;
                }
            }
            let Some(point) = get_nested_value(&doc, &self.key).and_then(point_coordinates) else {
                continue;
            };
            let distance = haversine_distance(self.near, point);
            if self.max_distance.map(|m| distance > m).unwrap_or(false) {
                continue;
            }
            set_nested_value(&mut doc, &self.distance_field, number_to_value(distance));
            hits.push((distance, doc));
        }
        hits.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        Ok(hits.into_iter().map(|(_, d)| d).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn run(pipeline: Value, docs: Vec<Value>) -> Vec<Value> {
        Pipeline::from_json(&pipeline)
            .unwrap()
            .execute(docs, &NoLookup)
            .unwrap()
    }

    fn samples() -> Vec<Value> {
        vec![
            json!({"_id": 1, "tags": ["train"], "gt": {"detections": [{"label": "cat"}, {"label": "dog"}]}}),
            json!({"_id": 2, "tags": ["val"], "gt": {"detections": [{"label": "cat"}]}}),
            json!({"_id": 3, "tags": [], "gt": null}),
        ]
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        assert_eq!(run(json!([]), samples()).len(), 3);
    }

    #[test]
    fn test_unwind_group_count_values() {
        let results = run(
            json!([
                {"$unwind": "$gt.detections"},
                {"$group": {"_id": "$gt.detections.label", "count": {"$sum": 1}}},
                {"$sort": {"_id": 1}}
            ]),
            samples(),
        );
        assert_eq!(
            results,
            vec![json!({"_id": "cat", "count": 2}), json!({"_id": "dog", "count": 1})]
        );
    }

    #[test]
    fn test_unwind_preserve() {
        let results = run(
            json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]),
            samples(),
        );
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_count_on_empty_input_emits_nothing() {
        assert!(run(json!([{"$match": {"_id": 99}}, {"$count": "count"}]), samples()).is_empty());
        assert_eq!(run(json!([{"$count": "n"}]), samples()), vec![json!({"n": 3})]);
    }

    #[test]
    fn test_facet_branches_share_input() {
        let results = run(
            json!([{"$facet": {
                "n": [{"$count": "count"}],
                "tags": [{"$unwind": "$tags"}, {"$group": {"_id": null, "all": {"$addToSet": "$tags"}}}]
            }}]),
            samples(),
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["n"], json!([{"count": 3}]));
        assert_eq!(results[0]["tags"][0]["all"], json!(["train", "val"]));
    }

    #[test]
    fn test_project_computed_and_excluded() {
        let results = run(
            json!([{"$project": {"_id": 0, "n": {"$size": {"$ifNull": ["$tags", []]}}}}]),
            samples(),
        );
        assert_eq!(results, vec![json!({"n": 1}), json!({"n": 1}), json!({"n": 0})]);

        let results = run(json!([{"$project": {"gt": 0, "tags": 0}}]), samples());
        assert_eq!(results[0], json!({"_id": 1}));
    }

    #[test]
    fn test_set_filter_labels() {
        let results = run(
            json!([{"$set": {"gt.detections": {"$filter": {
                "input": "$gt.detections", "as": "this", "cond": {"$eq": ["$$this.label", "dog"]}
            }}}}]),
            samples(),
        );
        assert_eq!(results[0]["gt"]["detections"], json!([{"label": "dog"}]));
        assert_eq!(results[1]["gt"]["detections"], json!([]));
    }

    #[test]
    fn test_group_min_max_ignore_nulls() {
        let docs = vec![json!({"v": 3}), json!({"v": null}), json!({"v": -1}), json!({})];
        let results = run(
            json!([{"$group": {"_id": null, "min": {"$min": "$v"}, "max": {"$max": "$v"}, "sum": {"$sum": "$v"}}}]),
            docs,
        );
        assert_eq!(results, vec![json!({"_id": null, "min": -1, "max": 3, "sum": 2})]);
    }

    #[test]
    fn test_bucket_with_default() {
        let docs = vec![json!({"v": 0.1}), json!({"v": 0.6}), json!({"v": 0.7}), json!({"v": "x"})];
        let results = run(
            json!([{"$bucket": {"groupBy": "$v", "boundaries": [0, 0.5, 1.0], "default": "other"}}]),
            docs,
        );
        assert_eq!(
            results,
            vec![
                json!({"_id": 0, "count": 1}),
                json!({"_id": 0.5, "count": 2}),
                json!({"_id": "other", "count": 1}),
            ]
        );
    }

    struct MapSource(HashMap<String, Vec<Value>>);

    impl LookupSource for MapSource {
        fn collection_docs(&self, name: &str) -> Vec<Value> {
            self.0.get(name).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn test_lookup_frames() {
        let source = MapSource(HashMap::from([(
            "frames.video".to_string(),
            vec![
                json!({"_sample_id": 1, "frame_number": 1}),
                json!({"_sample_id": 2, "frame_number": 1}),
                json!({"_sample_id": 1, "frame_number": 2}),
            ],
        )]));
        let pipeline = Pipeline::from_json(&json!([{"$lookup": {
            "from": "frames.video", "localField": "_id", "foreignField": "_sample_id", "as": "frames"
        }}]))
        .unwrap();
        let results = pipeline
            .execute(vec![json!({"_id": 1}), json!({"_id": 3})], &source)
            .unwrap();
        assert_eq!(results[0]["frames"].as_array().unwrap().len(), 2);
        assert_eq!(results[1]["frames"], json!([]));
    }

    #[test]
    fn test_lookup_sub_pipeline_orders_matches() {
        let source = MapSource(HashMap::from([(
            "frames.video".to_string(),
            vec![
                json!({"_sample_id": 1, "frame_number": 3}),
                json!({"_sample_id": 1, "frame_number": 1}),
                json!({"_sample_id": 1, "frame_number": 2}),
            ],
        )]));
        let pipeline = Pipeline::from_json(&json!([{"$lookup": {
            "from": "frames.video", "localField": "_id", "foreignField": "_sample_id", "as": "frames",
            "pipeline": [{"$sort": {"frame_number": 1}}]
        }}]))
        .unwrap();
        let results = pipeline.execute(vec![json!({"_id": 1})], &source).unwrap();
        let numbers: Vec<&Value> = results[0]["frames"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| &f["frame_number"])
            .collect();
        assert_eq!(numbers, vec![&json!(1), &json!(2), &json!(3)]);

        assert!(Pipeline::from_json(&json!([{"$lookup": {
            "from": "f", "localField": "_id", "foreignField": "_sample_id", "as": "frames",
            "pipeline": {"$sort": {"frame_number": 1}}
        }}]))
        .is_err());
    }

    #[test]
    fn test_geo_near_sorts_by_distance() {
        let docs = vec![
            json!({"_id": "far", "loc": {"point": {"type": "Point", "coordinates": [10.0, 10.0]}}}),
            json!({"_id": "near", "loc": {"point": {"type": "Point", "coordinates": [0.01, 0.01]}}}),
            json!({"_id": "none"}),
        ];
        let results = run(
            json!([{"$geoNear": {
                "near": {"type": "Point", "coordinates": [0.0, 0.0]},
                "key": "loc.point", "distanceField": "dist"
            }}]),
            docs.clone(),
        );
        let ids: Vec<&Value> = results.iter().map(|d| &d["_id"]).collect();
        assert_eq!(ids, vec![&json!("near"), &json!("far")]);

        let results = run(
            json!([{"$geoNear": {"near": [0.0, 0.0], "key": "loc.point", "distanceField": "d", "maxDistance": 5000.0}}]),
            docs,
        );
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_invalid_stages() {
        assert!(Pipeline::from_json(&json!([{"$limit": 0}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$bogus": {}}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$match": 1, "$limit": 1}])).is_err());
        assert!(Pipeline::from_json(&json!({"$match": {}})).is_err());
    }
}
