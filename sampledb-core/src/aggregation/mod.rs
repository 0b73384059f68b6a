// aggregation/mod.rs
//! Analytic requests over a view
//!
//! Each [`AggregationRequest`] lowers itself to a pipeline fragment and
//! parses the documents that fragment produces. The [`compiler`] decides how
//! many store round-trips a batch of requests needs.

pub mod compiler;

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{Result, SampleDbError};
use crate::path::{ResolveOptions, ResolvedPath};
use crate::schema::{ObservedTypes, SchemaCatalog};
use crate::value_utils::compare_values_total;
use crate::view::View;

pub use compiler::{run_aggregations, run_aggregations_partial};

/// Scratch field holding the value of a request's expression
const VALUE_FIELD: &str = "__value";
/// Expression variable naming the value at the request's field
const VALUE_VAR: &str = "$$value";

/// How a request may share a round-trip with others
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionClass {
    /// Lowers to a single `$project` expression merged with other batchable requests
    Batchable,
    /// Returns one payload per document and always runs alone
    BigResult,
    /// Runs as one branch of a `$facet` stage
    Facetable,
}

/// The computation a request performs
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationKind {
    /// Number of documents, or of non-null values of a field
    Count,
    /// Sorted distinct non-null values
    Distinct,
    /// Minimum and maximum non-null value
    Bounds,
    /// Occurrences of every value
    CountValues,
    /// Counts over `bins` equal-width bins of `range`
    HistogramValues { bins: usize, range: (f64, f64) },
    Sum,
    Mean,
    /// Per-document values
    Values {
        missing_value: Option<Value>,
        unwind: bool,
    },
    /// Keys and value types of the embedded documents at a path
    Schema { dynamic_only: bool },
    /// Types of the elements of a list field
    ListSchema,
}

impl AggregationKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationKind::Count => "Count",
            AggregationKind::Distinct => "Distinct",
            AggregationKind::Bounds => "Bounds",
            AggregationKind::CountValues => "CountValues",
            AggregationKind::HistogramValues { .. } => "HistogramValues",
            AggregationKind::Sum => "Sum",
            AggregationKind::Mean => "Mean",
            AggregationKind::Values { .. } => "Values",
            AggregationKind::Schema { .. } => "Schema",
            AggregationKind::ListSchema => "ListSchema",
        }
    }
}

/// Result of one request
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationResult {
    Count(u64),
    Distinct(Vec<Value>),
    Bounds { min: Value, max: Value },
    CountValues(Vec<(Value, u64)>),
    Histogram {
        counts: Vec<u64>,
        edges: Vec<f64>,
        /// Values outside the range
        other: u64,
    },
    Sum(Value),
    Mean(f64),
    Values(Vec<Value>),
    Schema(BTreeMap<String, ObservedTypes>),
    ListSchema(ObservedTypes),
}

impl AggregationResult {
    pub fn as_count(&self) -> Option<u64> {
        match self {
            AggregationResult::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&[Value]> {
        match self {
            AggregationResult::Distinct(v) | AggregationResult::Values(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_schema(self) -> Option<BTreeMap<String, ObservedTypes>> {
        match self {
            AggregationResult::Schema(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn into_list_schema(self) -> Option<ObservedTypes> {
        match self {
            AggregationResult::ListSchema(types) => Some(types),
            _ => None,
        }
    }
}

/// One analytic computation over a view
///
/// # Examples
///
/// ```rust
/// use sampledb_core::aggregation::AggregationRequest;
/// use serde_json::json;
///
/// let count = AggregationRequest::count(None);
/// let labels = AggregationRequest::distinct("gt.detections.label");
/// let area = AggregationRequest::sum("gt.detections.bounding_box")
///     .with_expr(json!({"$multiply": [
///         {"$arrayElemAt": ["$$value", 2]},
///         {"$arrayElemAt": ["$$value", 3]},
///     ]}));
/// assert_eq!(labels.field(), Some("gt.detections.label"));
/// assert!(count.field().is_none());
/// # let _ = area;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    kind: AggregationKind,
    field: Option<String>,
    expr: Option<Value>,
}

impl AggregationRequest {
    pub fn new(kind: AggregationKind, field: Option<&str>) -> Self {
        AggregationRequest {
            kind,
            field: field.map(String::from),
            expr: None,
        }
    }

    pub fn count(field: Option<&str>) -> Self {
        Self::new(AggregationKind::Count, field)
    }

    pub fn distinct(field: &str) -> Self {
        Self::new(AggregationKind::Distinct, Some(field))
    }

    pub fn bounds(field: &str) -> Self {
        Self::new(AggregationKind::Bounds, Some(field))
    }

    pub fn count_values(field: &str) -> Self {
        Self::new(AggregationKind::CountValues, Some(field))
    }

    pub fn histogram_values(field: &str, bins: usize, range: (f64, f64)) -> Self {
        Self::new(AggregationKind::HistogramValues { bins, range }, Some(field))
    }

    pub fn sum(field: &str) -> Self {
        Self::new(AggregationKind::Sum, Some(field))
    }

    pub fn mean(field: &str) -> Self {
        Self::new(AggregationKind::Mean, Some(field))
    }

    /// One value per sample; list fields are returned whole
    pub fn values(field: &str) -> Self {
        Self::new(
            AggregationKind::Values {
                missing_value: None,
                unwind: false,
            },
            Some(field),
        )
    }

    /// Embedded document keys at `field`, or top-level keys when `None`
    pub fn schema(field: Option<&str>, dynamic_only: bool) -> Self {
        Self::new(AggregationKind::Schema { dynamic_only }, field)
    }

    pub fn list_schema(field: &str) -> Self {
        Self::new(AggregationKind::ListSchema, Some(field))
    }

    /// Evaluate `expr` instead of the raw value; `$$value` refers to the field
    pub fn with_expr(mut self, expr: Value) -> Self {
        self.expr = Some(expr);
        self
    }

    /// Value reported for samples where the field is missing or null
    pub fn with_missing_value(mut self, value: Value) -> Self {
        if let AggregationKind::Values { missing_value, .. } = &mut self.kind {
            *missing_value = Some(value);
        }
        self
    }

    /// Flatten list fields on the path into one value per element
    pub fn with_unwind(mut self, flatten: bool) -> Self {
        if let AggregationKind::Values { unwind, .. } = &mut self.kind {
            *unwind = flatten;
        }
        self
    }

    pub fn kind(&self) -> &AggregationKind {
        &self.kind
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn expr(&self) -> Option<&Value> {
        self.expr.as_ref()
    }

    fn requires_target(&self) -> bool {
        !matches!(
            self.kind,
            AggregationKind::Count | AggregationKind::Schema { .. }
        )
    }

    /// Options used to resolve the request's field
    pub(crate) fn resolve_options(&self, strict: bool) -> ResolveOptions {
        let options = match self.kind {
            AggregationKind::Values { unwind: false, .. } => ResolveOptions::new(),
            // Expressions see a terminal list whole
            _ => ResolveOptions::flattened().with_unwind_terminal(self.expr.is_none()),
        };
        let allow_missing = !strict
            || matches!(
                self.kind,
                AggregationKind::Schema { .. } | AggregationKind::ListSchema
            );
        options.with_allow_missing(allow_missing)
    }

    pub(crate) fn check_target(&self) -> Result<()> {
        if self.requires_target() && self.field.is_none() && self.expr.is_none() {
            return Err(SampleDbError::AggregationError(format!(
                "{} requires a field or an expression",
                self.kind.name()
            )));
        }
        if let AggregationKind::HistogramValues { bins, range } = &self.kind {
            if *bins == 0 || !range.0.is_finite() || !range.1.is_finite() {
                return Err(SampleDbError::AggregationError(
                    "HistogramValues requires at least one bin and a finite range".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn execution_class(&self, resolved: Option<&ResolvedPath>) -> ExecutionClass {
        match &self.kind {
            AggregationKind::Values { .. } => {
                let unwinds = resolved.map(|r| !r.full_unwinds().is_empty()).unwrap_or(false);
                if unwinds {
                    ExecutionClass::BigResult
                } else {
                    ExecutionClass::Batchable
                }
            }
            _ => ExecutionClass::Facetable,
        }
    }

    /// Expression evaluating to the request's value on a pipeline document
    pub(crate) fn value_expression(&self, resolved: Option<&ResolvedPath>) -> Value {
        let base = field_reference(resolved);
        let value = match &self.expr {
            Some(expr) => substitute_value(expr, &base),
            None => Value::String(base),
        };
        match &self.kind {
            AggregationKind::Values {
                missing_value: Some(missing),
                ..
            } => json!({"$ifNull": [value, missing]}),
            _ => value,
        }
    }

    /// Unwinds plus the scratch value stage; returns the value reference
    fn prelude(&self, resolved: Option<&ResolvedPath>, stages: &mut Vec<Value>) -> String {
        if let Some(resolved) = resolved {
            for unwind in resolved.full_unwinds() {
                stages.push(json!({"$unwind": format!("${}", unwind)}));
            }
        }
        match &self.expr {
            Some(expr) => {
                let expr = substitute_value(expr, &field_reference(resolved));
                stages.push(json!({"$set": {VALUE_FIELD: expr}}));
                format!("${}", VALUE_FIELD)
            }
            None => field_reference(resolved),
        }
    }

    /// Pipeline fragment computing this request on its own
    pub(crate) fn pipeline(&self, resolved: Option<&ResolvedPath>) -> Result<Vec<Value>> {
        let mut stages = Vec::new();

        if self.kind == AggregationKind::Count && self.field.is_none() && self.expr.is_none() {
            stages.push(json!({"$count": "count"}));
            return Ok(stages);
        }
        if self.kind == AggregationKind::ListSchema {
            if let Some(resolved) = resolved {
                let full = resolved.full_path();
                if !resolved.full_unwinds().contains(&full) && !full.is_empty() {
                    let mut unwinds = resolved.full_unwinds();
                    unwinds.push(full);
                    for unwind in unwinds {
                        stages.push(json!({"$unwind": format!("${}", unwind)}));
                    }
                    let value = match &self.expr {
                        Some(expr) => {
                            let expr = substitute_value(expr, &field_reference(Some(resolved)));
                            stages.push(json!({"$set": {VALUE_FIELD: expr}}));
                            format!("${}", VALUE_FIELD)
                        }
                        None => field_reference(Some(resolved)),
                    };
                    stages.push(list_schema_group(&value));
                    return Ok(stages);
                }
            }
        }

        let value = self.prelude(resolved, &mut stages);
        let not_null = || {
            let field = value.trim_start_matches('$').to_string();
            json!({"$match": {field: {"$exists": true, "$ne": null}}})
        };

        match &self.kind {
            AggregationKind::Count => {
                stages.push(not_null());
                stages.push(json!({"$count": "count"}));
            }
            AggregationKind::Distinct => {
                stages.push(not_null());
                stages.push(json!({"$group": {"_id": null, "values": {"$addToSet": value}}}));
            }
            AggregationKind::Bounds => {
                stages.push(not_null());
                stages.push(json!({"$group": {
                    "_id": null,
                    "min": {"$min": value},
                    "max": {"$max": value},
                }}));
            }
            AggregationKind::CountValues => {
                stages.push(json!({"$group": {"_id": value, "count": {"$sum": 1}}}));
            }
            AggregationKind::HistogramValues { bins, range } => {
                let edges = histogram_edges(*bins, *range);
                stages.push(not_null());
                stages.push(json!({"$bucket": {
                    "groupBy": value,
                    "boundaries": edges,
                    "default": "other",
                    "output": {"count": {"$sum": 1}},
                }}));
            }
            AggregationKind::Sum => {
                stages.push(json!({"$group": {"_id": null, "total": {"$sum": value}}}));
            }
            AggregationKind::Mean => {
                stages.push(json!({"$group": {"_id": null, "mean": {"$avg": value}}}));
            }
            AggregationKind::Values { missing_value, .. } => {
                let projected = match missing_value {
                    Some(missing) => json!({"$ifNull": [value, missing]}),
                    None => Value::String(value),
                };
                stages.push(json!({"$project": {"_id": 0, "v": projected}}));
            }
            AggregationKind::Schema { .. } => {
                let is_object = json!({"$eq": [{"$type": value}, "object"]});
                stages.push(json!({"$project": {"_id": 0, "kv": {"$cond": [
                    is_object,
                    {"$objectToArray": value},
                    null,
                ]}}}));
                stages.push(json!({"$unwind": "$kv"}));
                stages.push(json!({"$group": {
                    "_id": "$kv.k",
                    "types": {"$addToSet": {"$type": "$kv.v"}},
                    "classes": {"$addToSet": "$kv.v._cls"},
                }}));
            }
            AggregationKind::ListSchema => {
                stages.push(list_schema_group(&value));
            }
        }
        Ok(stages)
    }

    /// Default result when the pipeline produced nothing
    pub fn default_result(&self) -> AggregationResult {
        match &self.kind {
            AggregationKind::Count => AggregationResult::Count(0),
            AggregationKind::Distinct => AggregationResult::Distinct(Vec::new()),
            AggregationKind::Bounds => AggregationResult::Bounds {
                min: Value::Null,
                max: Value::Null,
            },
            AggregationKind::CountValues => AggregationResult::CountValues(Vec::new()),
            AggregationKind::HistogramValues { bins, range } => AggregationResult::Histogram {
                counts: vec![0; *bins],
                edges: histogram_edges(*bins, *range),
                other: 0,
            },
            AggregationKind::Sum => AggregationResult::Sum(json!(0)),
            AggregationKind::Mean => AggregationResult::Mean(0.0),
            AggregationKind::Values { .. } => AggregationResult::Values(Vec::new()),
            AggregationKind::Schema { .. } => AggregationResult::Schema(BTreeMap::new()),
            AggregationKind::ListSchema => AggregationResult::ListSchema(ObservedTypes::default()),
        }
    }

    /// Parse the documents produced by [`pipeline`](Self::pipeline)
    pub(crate) fn parse(
        &self,
        resolved: Option<&ResolvedPath>,
        schema: &SchemaCatalog,
        docs: Vec<Value>,
    ) -> Result<AggregationResult> {
        if docs.is_empty() {
            return Ok(self.default_result());
        }
        let output = |v: Value| match resolved {
            Some(r) => r.to_output(v),
            None => v,
        };

        Ok(match &self.kind {
            AggregationKind::Count => AggregationResult::Count(
                docs[0].get("count").and_then(|c| c.as_u64()).unwrap_or(0),
            ),
            AggregationKind::Distinct => {
                let mut values = match docs[0].get("values") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                values.sort_by(compare_values_total);
                AggregationResult::Distinct(values.into_iter().map(output).collect())
            }
            AggregationKind::Bounds => AggregationResult::Bounds {
                min: output(docs[0].get("min").cloned().unwrap_or(Value::Null)),
                max: output(docs[0].get("max").cloned().unwrap_or(Value::Null)),
            },
            AggregationKind::CountValues => {
                let mut counts: Vec<(Value, u64)> = docs
                    .into_iter()
                    .map(|doc| {
                        let count = doc.get("count").and_then(|c| c.as_u64()).unwrap_or(0);
                        let key = doc.get("_id").cloned().unwrap_or(Value::Null);
                        (key, count)
                    })
                    .collect();
                counts.sort_by(|a, b| compare_values_total(&a.0, &b.0));
                AggregationResult::CountValues(
                    counts.into_iter().map(|(k, c)| (output(k), c)).collect(),
                )
            }
            AggregationKind::HistogramValues { bins, range } => {
                let edges = histogram_edges(*bins, *range);
                let mut counts = vec![0u64; *bins];
                let mut other = 0;
                for doc in &docs {
                    let count = doc.get("count").and_then(|c| c.as_u64()).unwrap_or(0);
                    let id = doc.get("_id").cloned().unwrap_or(Value::Null);
                    match id.as_f64().and_then(|v| edges.iter().position(|e| *e == v)) {
                        Some(i) if i < counts.len() => counts[i] += count,
                        _ => other += count,
                    }
                }
                AggregationResult::Histogram {
                    counts,
                    edges,
                    other,
                }
            }
            AggregationKind::Sum => {
                AggregationResult::Sum(docs[0].get("total").cloned().unwrap_or(json!(0)))
            }
            AggregationKind::Mean => {
                AggregationResult::Mean(docs[0].get("mean").and_then(|m| m.as_f64()).unwrap_or(0.0))
            }
            AggregationKind::Values { .. } => AggregationResult::Values(
                docs.into_iter()
                    .map(|doc| output(doc.get("v").cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
            AggregationKind::Schema { dynamic_only } => {
                let mut fields = BTreeMap::new();
                for doc in &docs {
                    let Some(name) = doc.get("_id").and_then(|k| k.as_str()) else {
                        continue;
                    };
                    if name == "_cls" {
                        continue;
                    }
                    if *dynamic_only && is_declared(schema, resolved, name) {
                        continue;
                    }
                    let types = ObservedTypes::from_type_names(
                        &string_list(doc.get("types")),
                        &string_list(doc.get("classes")),
                    );
                    if !types.is_empty() {
                        fields.insert(name.to_string(), types);
                    }
                }
                AggregationResult::Schema(fields)
            }
            AggregationKind::ListSchema => AggregationResult::ListSchema(ObservedTypes::from_type_names(
                &string_list(docs[0].get("types")),
                &string_list(docs[0].get("classes")),
            )),
        })
    }

    /// Parse the documents of a shared `$project` batch
    pub(crate) fn parse_batched(
        &self,
        resolved: Option<&ResolvedPath>,
        key: &str,
        docs: &[Value],
    ) -> AggregationResult {
        let missing = match &self.kind {
            AggregationKind::Values { missing_value, .. } => missing_value.clone(),
            _ => None,
        };
        let values = docs
            .iter()
            .map(|doc| {
                let value = doc
                    .get(key)
                    .cloned()
                    .or_else(|| missing.clone())
                    .unwrap_or(Value::Null);
                match resolved {
                    Some(r) => r.to_output(value),
                    None => value,
                }
            })
            .collect();
        AggregationResult::Values(values)
    }
}

fn list_schema_group(value: &str) -> Value {
    json!({"$group": {
        "_id": null,
        "types": {"$addToSet": {"$type": value}},
        "classes": {"$addToSet": format!("{}._cls", value)},
    }})
}

/// `"$path"`, or `"$$ROOT"` for the document itself
fn field_reference(resolved: Option<&ResolvedPath>) -> String {
    match resolved.map(|r| r.full_path()) {
        Some(path) if !path.is_empty() => format!("${}", path),
        _ => "$$ROOT".to_string(),
    }
}

/// Replace `$$value` references with `base`
fn substitute_value(expr: &Value, base: &str) -> Value {
    match expr {
        Value::String(s) if s == VALUE_VAR => Value::String(base.to_string()),
        Value::String(s) if s.starts_with("$$value.") => {
            Value::String(format!("{}{}", base, &s[VALUE_VAR.len()..]))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, base)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, base)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// `bins + 1` evenly spaced edges; the last edge is nudged so `range.1` is counted
pub(crate) fn histogram_edges(bins: usize, range: (f64, f64)) -> Vec<f64> {
    let (lo, mut hi) = range;
    if hi <= lo {
        hi = lo + 1.0;
    }
    let step = (hi - lo) / bins as f64;
    let mut edges: Vec<f64> = (0..=bins).map(|i| lo + step * i as f64).collect();
    if let Some(last) = edges.last_mut() {
        *last = hi + step * 1e-6;
    }
    edges
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn is_declared(schema: &SchemaCatalog, resolved: Option<&ResolvedPath>, name: &str) -> bool {
    let (frames, path) = match resolved {
        Some(r) if !r.path.is_empty() => (r.is_frame_field, format!("{}.{}", r.path, name)),
        Some(r) => (r.is_frame_field, name.to_string()),
        None => (false, name.to_string()),
    };
    if frames {
        schema.get_frame_field(&path).is_some()
    } else {
        schema.get_field(&path).is_some()
    }
}

// ============================================================================
// VIEW SHORTHANDS
// ============================================================================

impl View {
    fn run_one(&self, request: AggregationRequest) -> Result<AggregationResult> {
        let mut results = run_aggregations(self, &[request])?;
        results
            .pop()
            .ok_or_else(|| SampleDbError::AggregationError("missing aggregation result".to_string()))
    }

    /// Number of samples in the view
    pub fn count(&self) -> Result<u64> {
        let result = self.run_one(AggregationRequest::count(None))?;
        Ok(result.as_count().unwrap_or(0))
    }

    /// Number of non-null values of `field`, list fields flattened
    pub fn count_field(&self, field: &str) -> Result<u64> {
        let result = self.run_one(AggregationRequest::count(Some(field)))?;
        Ok(result.as_count().unwrap_or(0))
    }

    pub fn distinct(&self, field: &str) -> Result<Vec<Value>> {
        match self.run_one(AggregationRequest::distinct(field))? {
            AggregationResult::Distinct(values) => Ok(values),
            _ => Ok(Vec::new()),
        }
    }

    pub fn bounds(&self, field: &str) -> Result<(Value, Value)> {
        match self.run_one(AggregationRequest::bounds(field))? {
            AggregationResult::Bounds { min, max } => Ok((min, max)),
            _ => Ok((Value::Null, Value::Null)),
        }
    }

    pub fn values(&self, field: &str) -> Result<Vec<Value>> {
        match self.run_one(AggregationRequest::values(field))? {
            AggregationResult::Values(values) => Ok(values),
            _ => Ok(Vec::new()),
        }
    }
}
