//! Value utility functions shared across modules
//!
//! Nested field access, ordering and canonical encoding of JSON values.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::document::{is_date, is_object_id};

/// Get nested value from JSON with dot notation support
///
/// Supports:
/// - Simple fields: "filepath"
/// - Nested objects: "metadata.width"
/// - Array indexing: "detections.detections.0.label"
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use sampledb_core::value_utils::get_nested_value;
///
/// let doc = json!({"metadata": {"width": 640}});
/// assert_eq!(get_nested_value(&doc, "metadata.width"), Some(&json!(640)));
/// ```
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => {
                let index = part.parse::<usize>().ok()?;
                value = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Collect every value reachable at `path`, traversing arrays implicitly
///
/// This is the query-language reading of a dotted path: `"dets.label"`
/// over `{"dets": [{"label": "a"}, {"label": "b"}]}` yields both labels.
/// A terminal array is returned as a single value.
pub fn collect_path_values<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    };
    let mut out = Vec::new();
    collect_inner(doc, &parts, &mut out);
    out
}

fn collect_inner<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect_inner(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect_inner(child, rest, out);
                }
                return;
            }
            for item in items {
                collect_inner(item, parts, out);
            }
        }
        _ => {}
    }
}

/// Set a value at a nested path, creating intermediate objects
///
/// Intermediate values that are not objects are replaced.
///
/// ```
/// use serde_json::json;
/// use sampledb_core::value_utils::set_nested_value;
///
/// let mut doc = json!({"filepath": "a.jpg"});
/// set_nested_value(&mut doc, "metadata.width", json!(640));
/// assert_eq!(doc["metadata"]["width"], 640);
/// ```
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;

    for (i, part) in parts.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if i == parts.len() - 1 {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at a nested path, returning it
pub fn remove_nested_value(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.remove(path),
        Some((parent, leaf)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.as_object_mut()?.get_mut(part)?;
            }
            current.as_object_mut()?.remove(leaf)
        }
    }
}

/// Get a mutable reference to the value at a nested path
pub fn get_nested_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(arr) => arr.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Aggregation `$type` name of a value
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "int"
            } else {
                "double"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        v if is_object_id(v) => "objectId",
        v if is_date(v) => "date",
        Value::Object(_) => "object",
    }
}

/// Canonical cross-type sort rank
///
/// null < numbers < strings < objects < arrays < objectId < bool < date
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        v if is_object_id(v) => 5,
        v if is_date(v) => 7,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 6,
    }
}

/// Compare two JSON values of the same kind
///
/// Returns `None` for values of incompatible kinds (string vs number).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            let f1 = n1.as_f64()?;
            let f2 = n2.as_f64()?;
            f1.partial_cmp(&f2)
        }
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ if is_object_id(a) && is_object_id(b) => Some(a["$oid"].as_str()?.cmp(b["$oid"].as_str()?)),
        _ if is_date(a) && is_date(b) => {
            let da = crate::document::parse_date(a)?;
            let db = crate::document::parse_date(b)?;
            Some(da.cmp(&db))
        }
        _ => None,
    }
}

/// Total order used by `$sort`, `$min` and `$max`
pub fn compare_values_total(a: &Value, b: &Value) -> Ordering {
    if let Some(ord) = compare_values(a, b) {
        return ord;
    }
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let ord = compare_values_total(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => canonical_json_string(a).cmp(&canonical_json_string(b)),
    }
}

/// Compare two optional values; missing sorts before everything
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => compare_values_total(av, bv),
    }
}

/// Canonical string of a JSON value with object keys sorted
///
/// Used to deduplicate values (`$addToSet`, group keys) regardless of key
/// insertion order.
///
/// ```
/// use serde_json::json;
/// use sampledb_core::value_utils::canonical_json_string;
///
/// assert_eq!(
///     canonical_json_string(&json!({"a": 1, "b": 2})),
///     canonical_json_string(&json!({"b": 2, "a": 1}))
/// );
/// ```
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));

            let inner: String = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), canonical_json_string(v)))
                .collect::<Vec<_>>()
                .join(",");

            format!("{{{}}}", inner)
        }
        Value::Array(arr) => {
            let inner: String = arr
                .iter()
                .map(canonical_json_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Numeric view of a value
pub fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Build a JSON number, preferring integers for whole values
pub fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ObjectId;
    use serde_json::json;

    #[test]
    fn test_get_nested_value_array_index() {
        let doc = json!({"items": [{"name": "item1"}, {"name": "item2"}]});
        assert_eq!(get_nested_value(&doc, "items.1.name"), Some(&json!("item2")));
        assert_eq!(get_nested_value(&doc, "items.5.name"), None);
    }

    #[test]
    fn test_collect_path_values_traverses_lists() {
        let doc = json!({
            "gt": {"detections": [{"label": "cat"}, {"label": "dog"}, {"score": 1}]}
        });
        let values = collect_path_values(&doc, "gt.detections.label");
        assert_eq!(values, vec![&json!("cat"), &json!("dog")]);

        let lists = collect_path_values(&doc, "gt.detections");
        assert_eq!(lists.len(), 1);
        assert!(lists[0].is_array());
    }

    #[test]
    fn test_set_nested_value_replaces_scalars() {
        let mut doc = json!({"metadata": null});
        set_nested_value(&mut doc, "metadata.width", json!(10));
        assert_eq!(doc, json!({"metadata": {"width": 10}}));
    }

    #[test]
    fn test_remove_nested_value() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        assert_eq!(remove_nested_value(&mut doc, "a.b"), Some(json!(1)));
        assert_eq!(doc, json!({"a": {"c": 2}}));
        assert_eq!(remove_nested_value(&mut doc, "a.zzz"), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(&json!(1)), "int");
        assert_eq!(type_name(&json!(1.5)), "double");
        assert_eq!(type_name(&json!({"x": 1})), "object");
        assert_eq!(type_name(&ObjectId::new().to_value()), "objectId");
        assert_eq!(type_name(&json!({"$date": "2024-01-01T00:00:00Z"})), "date");
    }

    #[test]
    fn test_total_order_across_types() {
        let mut values = vec![json!(true), json!("b"), json!(null), json!(3), json!("a")];
        values.sort_by(compare_values_total);
        assert_eq!(
            values,
            vec![json!(null), json!(3), json!("a"), json!("b"), json!(true)]
        );
    }

    #[test]
    fn test_compare_values_incompatible() {
        assert_eq!(compare_values(&json!("string"), &json!(42)), None);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Some(Ordering::Greater));
    }

    #[test]
    fn test_canonical_json_string_normalizes_numbers_and_keys() {
        assert_eq!(canonical_json_string(&json!(1.0)), canonical_json_string(&json!(1)));
        assert_eq!(
            canonical_json_string(&json!([{"b": 2, "a": 1}])),
            r#"[{"a":1,"b":2}]"#
        );
    }
}
