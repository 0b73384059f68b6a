// src/document.rs
//! Native document identifiers and extended-JSON helpers
//!
//! Sample, frame and label documents are plain `serde_json::Value` objects.
//! Values that have no JSON counterpart use MongoDB extended JSON:
//!
//! - ObjectId: `{"$oid": "<24 hex chars>"}`
//! - Date:     `{"$date": "<RFC 3339>"}`
//!
//! Public id fields (`id`, `sample_id`) expose the hex string, private ones
//! (`_id`, `_sample_id`) hold the native form.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Result, SampleDbError};

const OID_KEY: &str = "$oid";
const DATE_KEY: &str = "$date";

/// 12-byte document identifier, stored as 24 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        let bytes = Uuid::new_v4().into_bytes();
        let hex: String = bytes[..12].iter().map(|b| format!("{:02x}", b)).collect();
        ObjectId(hex)
    }

    /// Parse a 24 character hex string
    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(ObjectId(s.to_ascii_lowercase()))
        } else {
            Err(SampleDbError::TypeMismatch {
                field: "id".to_string(),
                expected: "24 character hex ObjectId".to_string(),
                found: format!("'{}'", s),
            })
        }
    }

    pub fn to_hex(&self) -> &str {
        &self.0
    }

    /// Native extended-JSON representation
    pub fn to_value(&self) -> Value {
        json!({ OID_KEY: self.0 })
    }

    /// Accept both the native form and a plain hex string
    pub fn from_value(value: &Value) -> Option<ObjectId> {
        match value {
            Value::String(s) => ObjectId::parse_str(s).ok(),
            Value::Object(map) => map
                .get(OID_KEY)
                .and_then(|v| v.as_str())
                .and_then(|s| ObjectId::parse_str(s).ok()),
            _ => None,
        }
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True for `{"$oid": ...}`
pub fn is_object_id(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key(OID_KEY))
}

/// True for `{"$date": ...}`
pub fn is_date(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key(DATE_KEY))
}

pub fn date_value(datetime: DateTime<Utc>) -> Value {
    json!({ DATE_KEY: datetime.to_rfc3339() })
}

/// Parse an extended-JSON date or an RFC 3339 string
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get(DATE_KEY)?.as_str()?,
        _ => return None,
    };
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert native ids to their hex strings, recursing into lists
pub fn native_ids_to_strings(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.into_iter().map(native_ids_to_strings).collect())
        }
        v if is_object_id(&v) => match ObjectId::from_value(&v) {
            Some(oid) => Value::String(oid.0),
            None => v,
        },
        v => v,
    }
}

/// Convert hex strings to native ids, recursing into lists
///
/// Nulls pass through; anything else that is not an id is a type mismatch.
pub fn strings_to_native_ids(field: &str, value: Value) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => items
            .into_iter()
            .map(|v| strings_to_native_ids(field, v))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        v if is_object_id(&v) => Ok(v),
        Value::String(s) => ObjectId::parse_str(&s)
            .map(|oid| oid.to_value())
            .map_err(|_| SampleDbError::TypeMismatch {
                field: field.to_string(),
                expected: "ObjectId".to_string(),
                found: format!("'{}'", s),
            }),
        other => Err(SampleDbError::TypeMismatch {
            field: field.to_string(),
            expected: "ObjectId".to_string(),
            found: crate::value_utils::type_name(&other).to_string(),
        }),
    }
}

/// Build a new sample document with a fresh `_id`
///
/// ```rust
/// use serde_json::json;
/// use sampledb_core::document::new_sample;
///
/// let sample = new_sample("/data/img_001.jpg", json!({"tags": ["train"]}));
/// assert_eq!(sample["filepath"], "/data/img_001.jpg");
/// assert!(sample["_id"].get("$oid").is_some());
/// ```
pub fn new_sample(filepath: &str, fields: Value) -> Value {
    let mut doc = Map::new();
    doc.insert("_id".to_string(), ObjectId::new().to_value());
    doc.insert("filepath".to_string(), Value::String(filepath.to_string()));
    doc.insert("tags".to_string(), Value::Array(Vec::new()));
    doc.insert("metadata".to_string(), Value::Null);
    if let Value::Object(extra) = fields {
        for (k, v) in extra {
            doc.insert(k, v);
        }
    }
    Value::Object(doc)
}

/// Build a frame document owned by `sample_id`
pub fn new_frame(sample_id: &ObjectId, frame_number: u64, fields: Value) -> Value {
    let mut doc = Map::new();
    doc.insert("_id".to_string(), ObjectId::new().to_value());
    doc.insert("_sample_id".to_string(), sample_id.to_value());
    doc.insert("frame_number".to_string(), Value::from(frame_number));
    if let Value::Object(extra) = fields {
        for (k, v) in extra {
            doc.insert(k, v);
        }
    }
    Value::Object(doc)
}

/// Extract the `_id` of a stored document
pub fn document_id(doc: &Value) -> Option<ObjectId> {
    doc.get("_id").and_then(ObjectId::from_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_roundtrip() {
        let oid = ObjectId::new();
        assert_eq!(oid.to_hex().len(), 24);
        assert_eq!(ObjectId::from_value(&oid.to_value()), Some(oid.clone()));
        assert_eq!(ObjectId::from_value(&json!(oid.to_hex())), Some(oid));
    }

    #[test]
    fn test_parse_rejects_bad_hex() {
        assert!(ObjectId::parse_str("xyz").is_err());
        assert!(ObjectId::parse_str("zzzzzzzzzzzzzzzzzzzzzzzz").is_err());
        assert!(ObjectId::parse_str("ABCDEFABCDEFABCDEFABCDEF").is_ok());
    }

    #[test]
    fn test_id_conversions_recurse_into_lists() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        let native = json!([a.to_value(), b.to_value()]);

        let strings = native_ids_to_strings(native.clone());
        assert_eq!(strings, json!([a.to_hex(), b.to_hex()]));

        let back = strings_to_native_ids("ids", strings).unwrap();
        assert_eq!(back, native);
    }

    #[test]
    fn test_strings_to_native_rejects_numbers() {
        let err = strings_to_native_ids("id", json!(5)).unwrap_err();
        assert!(matches!(err, SampleDbError::TypeMismatch { .. }));
    }

    #[test]
    fn test_date_helpers() {
        let now = Utc::now();
        let value = date_value(now);
        assert!(is_date(&value));
        let parsed = parse_date(&value).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
        assert!(parse_date(&json!("not a date")).is_none());
    }

    #[test]
    fn test_new_frame_links_sample() {
        let sample_id = ObjectId::new();
        let frame = new_frame(&sample_id, 3, json!({"label": "x"}));
        assert_eq!(frame["_sample_id"], sample_id.to_value());
        assert_eq!(frame["frame_number"], 3);
        assert_eq!(frame["label"], "x");
    }
}
