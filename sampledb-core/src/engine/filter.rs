// engine/filter.rs
//! Query filter matching for `$match` stages
//!
//! Each operator implements [`OperatorMatcher`] and is registered by name in
//! [`OPERATOR_REGISTRY`]. Field conditions are evaluated against every value
//! reachable at the dotted path, so `{"gt.detections.label": "cat"}` matches
//! when any detection is a cat.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

use super::expr::{truthy, values_equal, Expr};
use crate::error::{Result, SampleDbError};
use crate::value_utils::{collect_path_values, compare_values, type_name};

// ============================================================================
// REGEX CACHE
// ============================================================================

lazy_static! {
    /// Compiled patterns keyed by "pattern:options"
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN)));
}

/// Prefix a pattern with inline flags for the supported options (i, m, s, x)
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();

    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}:{}", pattern, options);
    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options)).map_err(|e| {
        SampleDbError::InvalidQuery(format!("Invalid regex pattern '{}': {}", pattern, e))
    })?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

fn regex_matches(doc_value: Option<&Value>, pattern: &str, options: &str) -> Result<bool> {
    let regex = get_or_compile_regex(pattern, options)?;
    Ok(match doc_value {
        Some(Value::String(s)) => regex.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .any(|v| v.as_str().map(|s| regex.is_match(s)).unwrap_or(false)),
        _ => false,
    })
}

// ============================================================================
// OPERATOR TRAIT
// ============================================================================

/// A query operator (`$eq`, `$in`, `$and`, ...)
pub trait OperatorMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// `doc_value` is the value at the field (`None` if missing), `document`
    /// the whole document for operators that recurse
    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool>;
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        Ok(eq_matches(doc_value, filter_value))
    }
}

fn eq_matches(doc_value: Option<&Value>, filter_value: &Value) -> bool {
    match doc_value {
        // {field: null} matches missing fields
        None => filter_value.is_null(),
        Some(v) => {
            if values_equal(v, filter_value) {
                return true;
            }
            match v {
                Value::Array(items) => items.iter().any(|item| values_equal(item, filter_value)),
                _ => false,
            }
        }
    }
}

pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        Ok(!eq_matches(doc_value, filter_value))
    }
}

/// `$gt`, `$gte`, `$lt`, `$lte`
pub struct CompareOperator {
    name: &'static str,
    accept: fn(std::cmp::Ordering) -> bool,
}

impl OperatorMatcher for CompareOperator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let Some(v) = doc_value else {
            return Ok(false);
        };
        if let Some(ordering) = compare_values(v, filter_value) {
            if (self.accept)(ordering) {
                return Ok(true);
            }
        }
        if let Value::Array(items) = v {
            return Ok(items.iter().any(|item| {
                compare_values(item, filter_value)
                    .map(self.accept)
                    .unwrap_or(false)
            }));
        }
        Ok(false)
    }
}

// ============================================================================
// ARRAY OPERATORS
// ============================================================================

pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let candidates = filter_value
            .as_array()
            .ok_or_else(|| SampleDbError::InvalidQuery("$in requires an array".to_string()))?;
        Ok(candidates.iter().any(|c| eq_matches(doc_value, c)))
    }
}

pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let candidates = filter_value
            .as_array()
            .ok_or_else(|| SampleDbError::InvalidQuery("$nin requires an array".to_string()))?;
        Ok(!candidates.iter().any(|c| eq_matches(doc_value, c)))
    }
}

pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let expected = filter_value
            .as_u64()
            .ok_or_else(|| SampleDbError::InvalidQuery("$size requires a non-negative integer".to_string()))?;
        Ok(matches!(doc_value, Some(Value::Array(items)) if items.len() as u64 == expected))
    }
}

pub struct ElemMatchOperator;

impl OperatorMatcher for ElemMatchOperator {
    fn name(&self) -> &'static str {
        "$elemMatch"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let Some(Value::Array(items)) = doc_value else {
            return Ok(false);
        };
        let is_operator_form = filter_value
            .as_object()
            .map(|o| o.keys().all(|k| k.starts_with('$')))
            .unwrap_or(false);

        for item in items {
            let hit = if is_operator_form {
                matches_condition(Some(item), filter_value, None)?
            } else {
                matches_filter(item, filter_value)?
            };
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// ELEMENT OPERATORS
// ============================================================================

pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let should_exist = filter_value
            .as_bool()
            .ok_or_else(|| SampleDbError::InvalidQuery("$exists requires a boolean".to_string()))?;
        Ok(doc_value.is_some() == should_exist)
    }
}

pub struct TypeOperator;

impl OperatorMatcher for TypeOperator {
    fn name(&self) -> &'static str {
        "$type"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let names: Vec<&str> = match filter_value {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
            _ => {
                return Err(SampleDbError::InvalidQuery(
                    "$type requires a type name or a list of names".to_string(),
                ))
            }
        };
        let Some(v) = doc_value else {
            return Ok(false);
        };
        let actual = type_name(v);
        Ok(names.iter().any(|n| {
            *n == actual || (*n == "number" && (actual == "int" || actual == "double"))
        }))
    }
}

pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, _: Option<&Value>) -> Result<bool> {
        let pattern = filter_value
            .as_str()
            .ok_or_else(|| SampleDbError::InvalidQuery("$regex requires a string pattern".to_string()))?;
        regex_matches(doc_value, pattern, "")
    }
}

// ============================================================================
// LOGICAL OPERATORS
// ============================================================================

fn sub_filters<'a>(name: &str, filter_value: &'a Value) -> Result<&'a Vec<Value>> {
    filter_value
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| SampleDbError::InvalidQuery(format!("{} requires a non-empty array", name)))
}

fn require_document<'a>(name: &str, document: Option<&'a Value>) -> Result<&'a Value> {
    document.ok_or_else(|| SampleDbError::InvalidQuery(format!("{} requires document context", name)))
}

pub struct AndOperator;

impl OperatorMatcher for AndOperator {
    fn name(&self) -> &'static str {
        "$and"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, document: Option<&Value>) -> Result<bool> {
        let doc = require_document(self.name(), document)?;
        for f in sub_filters(self.name(), filter_value)? {
            if !matches_filter(doc, f)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct OrOperator;

impl OperatorMatcher for OrOperator {
    fn name(&self) -> &'static str {
        "$or"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, document: Option<&Value>) -> Result<bool> {
        let doc = require_document(self.name(), document)?;
        for f in sub_filters(self.name(), filter_value)? {
            if matches_filter(doc, f)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub struct NorOperator;

impl OperatorMatcher for NorOperator {
    fn name(&self) -> &'static str {
        "$nor"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, document: Option<&Value>) -> Result<bool> {
        Ok(!OrOperator.matches(doc_value, filter_value, document)?)
    }
}

pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(&self, doc_value: Option<&Value>, filter_value: &Value, document: Option<&Value>) -> Result<bool> {
        if !filter_value.is_object() {
            return Err(SampleDbError::InvalidQuery("$not requires an operator expression".to_string()));
        }
        Ok(!matches_condition(doc_value, filter_value, document)?)
    }
}

/// `$expr`: evaluate an aggregation expression against the document
pub struct ExprOperator;

impl OperatorMatcher for ExprOperator {
    fn name(&self) -> &'static str {
        "$expr"
    }

    fn matches(&self, _: Option<&Value>, filter_value: &Value, document: Option<&Value>) -> Result<bool> {
        let doc = require_document(self.name(), document)?;
        let value = Expr::parse(filter_value)?.eval_doc(doc)?;
        Ok(truthy(value.as_ref()))
    }
}

// ============================================================================
// OPERATOR REGISTRY
// ============================================================================

lazy_static! {
    /// Every supported query operator by name
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let mut registry: HashMap<&'static str, Box<dyn OperatorMatcher>> = HashMap::new();

        registry.insert("$eq", Box::new(EqOperator));
        registry.insert("$ne", Box::new(NeOperator));
        registry.insert("$gt", Box::new(CompareOperator { name: "$gt", accept: |o| o.is_gt() }));
        registry.insert("$gte", Box::new(CompareOperator { name: "$gte", accept: |o| o.is_ge() }));
        registry.insert("$lt", Box::new(CompareOperator { name: "$lt", accept: |o| o.is_lt() }));
        registry.insert("$lte", Box::new(CompareOperator { name: "$lte", accept: |o| o.is_le() }));

        registry.insert("$in", Box::new(InOperator));
        registry.insert("$nin", Box::new(NinOperator));
        registry.insert("$size", Box::new(SizeOperator));
        registry.insert("$elemMatch", Box::new(ElemMatchOperator));

        registry.insert("$exists", Box::new(ExistsOperator));
        registry.insert("$type", Box::new(TypeOperator));
        registry.insert("$regex", Box::new(RegexOperator));

        registry.insert("$and", Box::new(AndOperator));
        registry.insert("$or", Box::new(OrOperator));
        registry.insert("$nor", Box::new(NorOperator));
        registry.insert("$not", Box::new(NotOperator));
        registry.insert("$expr", Box::new(ExprOperator));

        registry
    };
}

fn lookup_operator(name: &str) -> Result<&'static dyn OperatorMatcher> {
    OPERATOR_REGISTRY
        .get(name)
        .map(|op| op.as_ref())
        .ok_or_else(|| SampleDbError::InvalidQuery(format!("Unknown operator: {}", name)))
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Match a field value against a condition (`{"$gt": 1}` or a literal)
fn matches_condition(doc_value: Option<&Value>, condition: &Value, document: Option<&Value>) -> Result<bool> {
    let Value::Object(ops) = condition else {
        return Ok(eq_matches(doc_value, condition));
    };
    if !ops.keys().any(|k| k.starts_with('$'))
        || crate::document::is_object_id(condition)
        || crate::document::is_date(condition)
    {
        return Ok(eq_matches(doc_value, condition));
    }

    for (op_name, op_value) in ops {
        match op_name.as_str() {
            "$options" => continue,
            "$regex" => {
                let pattern = op_value.as_str().ok_or_else(|| {
                    SampleDbError::InvalidQuery("$regex requires a string pattern".to_string())
                })?;
                let options = ops.get("$options").and_then(|v| v.as_str()).unwrap_or("");
                if !regex_matches(doc_value, pattern, options)? {
                    return Ok(false);
                }
            }
            name => {
                if !lookup_operator(name)?.matches(doc_value, op_value, document)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Main entry point: does `document` satisfy `filter`?
///
/// ```rust
/// use serde_json::json;
/// use sampledb_core::engine::filter::matches_filter;
///
/// let doc = json!({"tags": ["train"], "gt": {"detections": [{"label": "cat"}]}});
/// assert!(matches_filter(&doc, &json!({"tags": "train"})).unwrap());
/// assert!(matches_filter(&doc, &json!({"gt.detections.label": {"$in": ["cat", "dog"]}})).unwrap());
/// assert!(!matches_filter(&doc, &json!({"gt.detections.label": "bird"})).unwrap());
/// ```
pub fn matches_filter(document: &Value, filter: &Value) -> Result<bool> {
    let filter_obj = filter
        .as_object()
        .ok_or_else(|| SampleDbError::InvalidQuery("Filter must be an object".to_string()))?;

    for (key, condition) in filter_obj {
        if key.starts_with('$') {
            if !lookup_operator(key)?.matches(None, condition, Some(document))? {
                return Ok(false);
            }
            continue;
        }

        // Gather every value at the path; several values act like one array
        let candidates = collect_path_values(document, key);
        let combined;
        let doc_value = match candidates.len() {
            0 => None,
            1 => Some(candidates[0]),
            _ => {
                let mut flat = Vec::with_capacity(candidates.len());
                for c in candidates {
                    match c {
                        Value::Array(items) => flat.extend(items.iter().cloned()),
                        other => flat.push(other.clone()),
                    }
                }
                combined = Value::Array(flat);
                Some(&combined)
            }
        };

        if !matches_condition(doc_value, condition, Some(document))? {
            return Ok(false);
        }
    }
    Ok(true)
}
