// engine/update.rs
// Update operators applied by bulk writes

use serde_json::{Map, Value};

use super::expr::values_equal;
use crate::value_utils::{get_nested_mut, number_to_value, remove_nested_value, set_nested_value};

/// Why an update could not be applied to a document
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateFailure {
    /// `$push`/`$addToSet` on a field stored as null
    NullArrayField(String),
    /// `$push`/`$addToSet` on a non-array value
    NotAnArray(String),
    Invalid(String),
}

/// Apply an update document; returns whether the document changed
///
/// An update without `$` operators replaces the document (keeping `_id`).
pub fn apply_update(doc: &mut Value, update: &Value) -> Result<bool, UpdateFailure> {
    let ops = update
        .as_object()
        .ok_or_else(|| UpdateFailure::Invalid("Update must be an object".to_string()))?;

    if !ops.keys().any(|k| k.starts_with('$')) {
        let id = doc.get("_id").cloned();
        let mut replacement = update.clone();
        if let (Some(id), Value::Object(map)) = (id, &mut replacement) {
            map.insert("_id".to_string(), id);
        }
        let changed = *doc != replacement;
        *doc = replacement;
        return Ok(changed);
    }

    let before = doc.clone();
    for (op, fields) in ops {
        let fields = fields
            .as_object()
            .ok_or_else(|| UpdateFailure::Invalid(format!("{} requires an object", op)))?;
        match op.as_str() {
            "$set" => apply_set(doc, fields)?,
            "$unset" => {
                for path in fields.keys() {
                    remove_nested_value(doc, path);
                }
            }
            "$inc" => apply_inc(doc, fields)?,
            "$push" => apply_push(doc, fields, false)?,
            "$addToSet" => apply_push(doc, fields, true)?,
            other => {
                return Err(UpdateFailure::Invalid(format!(
                    "Unknown update operator: {}",
                    other
                )))
            }
        }
    }
    Ok(*doc != before)
}

fn apply_set(doc: &mut Value, fields: &Map<String, Value>) -> Result<(), UpdateFailure> {
    for (path, value) in fields {
        if path == "_id" {
            return Err(UpdateFailure::Invalid("Cannot modify _id".to_string()));
        }
        set_nested_value(doc, path, value.clone());
    }
    Ok(())
}

fn apply_inc(doc: &mut Value, fields: &Map<String, Value>) -> Result<(), UpdateFailure> {
    for (path, delta) in fields {
        let delta = delta
            .as_f64()
            .ok_or_else(|| UpdateFailure::Invalid(format!("$inc on '{}' requires a number", path)))?;
        let next = match get_nested_mut(doc, path) {
            None | Some(Value::Null) => delta,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) + delta,
            Some(_) => {
                return Err(UpdateFailure::Invalid(format!(
                    "Cannot apply $inc to non-numeric field '{}'",
                    path
                )))
            }
        };
        set_nested_value(doc, path, number_to_value(next));
    }
    Ok(())
}

/// Values named by a `$push` argument, expanding `{"$each": [...]}`
fn push_values(value: &Value) -> Vec<Value> {
    match value.get("$each") {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![value.clone()],
    }
}

fn apply_push(doc: &mut Value, fields: &Map<String, Value>, unique: bool) -> Result<(), UpdateFailure> {
    for (path, value) in fields {
        let values = push_values(value);
        match get_nested_mut(doc, path) {
            None => {
                let mut items: Vec<Value> = Vec::with_capacity(values.len());
                for v in values {
                    if !unique || !items.iter().any(|x| values_equal(x, &v)) {
                        items.push(v);
                    }
                }
                set_nested_value(doc, path, Value::Array(items));
            }
            Some(Value::Null) => return Err(UpdateFailure::NullArrayField(path.clone())),
            Some(Value::Array(items)) => {
                for v in values {
                    if !unique || !items.iter().any(|x| values_equal(x, &v)) {
                        items.push(v);
                    }
                }
            }
            Some(_) => return Err(UpdateFailure::NotAnArray(path.clone())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_unset() {
        let mut doc = json!({"_id": 1, "a": {"b": 1}});
        assert!(apply_update(&mut doc, &json!({"$set": {"a.c": 2}, "$unset": {"a.b": ""}})).unwrap());
        assert_eq!(doc, json!({"_id": 1, "a": {"c": 2}}));
        assert!(!apply_update(&mut doc, &json!({"$set": {"a.c": 2}})).unwrap());
    }

    #[test]
    fn test_push_onto_null_fails_typed() {
        let mut doc = json!({"tags": null});
        let err = apply_update(&mut doc, &json!({"$push": {"tags": "x"}})).unwrap_err();
        assert_eq!(err, UpdateFailure::NullArrayField("tags".to_string()));
    }

    #[test]
    fn test_push_creates_missing_array() {
        let mut doc = json!({});
        apply_update(&mut doc, &json!({"$push": {"tags": {"$each": ["a", "b"]}}})).unwrap();
        assert_eq!(doc, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn test_add_to_set_dedupes() {
        let mut doc = json!({"tags": ["a"]});
        apply_update(&mut doc, &json!({"$addToSet": {"tags": {"$each": ["a", "b", "b"]}}})).unwrap();
        assert_eq!(doc, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn test_push_onto_scalar_fails() {
        let mut doc = json!({"tags": "a"});
        let err = apply_update(&mut doc, &json!({"$push": {"tags": "b"}})).unwrap_err();
        assert!(matches!(err, UpdateFailure::NotAnArray(_)));
    }

    #[test]
    fn test_inc() {
        let mut doc = json!({"n": 1});
        apply_update(&mut doc, &json!({"$inc": {"n": 2, "m": 1.5}})).unwrap();
        assert_eq!(doc, json!({"n": 3, "m": 1.5}));
    }

    #[test]
    fn test_replacement_keeps_id() {
        let mut doc = json!({"_id": 7, "a": 1});
        apply_update(&mut doc, &json!({"b": 2})).unwrap();
        assert_eq!(doc, json!({"_id": 7, "b": 2}));
    }
}
