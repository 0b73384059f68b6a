use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{is_object_id, parse_date, ObjectId};
use crate::error::{Result, SampleDbError};
use crate::value_utils::type_name;

/// Leaf value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    String,
    DateTime,
    /// Untyped leaf; accepts any value
    Any,
}

impl ScalarKind {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "bool" | "boolean" => Some(Self::Bool),
            "int" | "integer" | "long" => Some(Self::Int),
            "float" | "double" | "number" => Some(Self::Float),
            "string" => Some(Self::String),
            "date" | "datetime" => Some(Self::DateTime),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ScalarKind::Bool => value.is_boolean(),
            ScalarKind::Int => value.is_i64() || value.is_u64(),
            ScalarKind::Float => value.is_number(),
            ScalarKind::String => value.is_string(),
            ScalarKind::DateTime => parse_date(value).is_some(),
            ScalarKind::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::String => "string",
            ScalarKind::DateTime => "datetime",
            ScalarKind::Any => "any",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::Float)
    }
}

/// Native representation of reference fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKind {
    ObjectId,
}

/// Declared or observed type of a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldDescriptor {
    Scalar(ScalarKind),
    ListOf(Box<FieldDescriptor>),
    EmbeddedDocument {
        document_type: String,
        fields: BTreeMap<String, FieldInfo>,
    },
    Reference(IdKind),
}

/// A named field of a document shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub descriptor: FieldDescriptor,
    pub read_only: bool,
    /// Guaranteed by the schema; cannot be excluded or deleted
    pub is_default: bool,
}

impl FieldInfo {
    pub fn new(name: &str, descriptor: FieldDescriptor) -> Self {
        FieldInfo {
            name: name.to_string(),
            descriptor,
            read_only: false,
            is_default: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn default_field(mut self) -> Self {
        self.is_default = true;
        self
    }
}

impl FieldDescriptor {
    pub fn scalar(kind: ScalarKind) -> Self {
        FieldDescriptor::Scalar(kind)
    }

    pub fn list_of(element: FieldDescriptor) -> Self {
        FieldDescriptor::ListOf(Box::new(element))
    }

    pub fn object_id() -> Self {
        FieldDescriptor::Reference(IdKind::ObjectId)
    }

    pub fn embedded(document_type: &str, fields: Vec<FieldInfo>) -> Self {
        FieldDescriptor::EmbeddedDocument {
            document_type: document_type.to_string(),
            fields: fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldDescriptor::ListOf(_))
    }

    pub fn is_id(&self) -> bool {
        matches!(self, FieldDescriptor::Reference(_))
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, FieldDescriptor::EmbeddedDocument { .. })
    }

    /// `ListOf(EmbeddedDocument)`
    pub fn is_document_list(&self) -> bool {
        matches!(self, FieldDescriptor::ListOf(inner) if inner.is_embedded())
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldDescriptor::Scalar(kind) if kind.is_numeric())
    }

    pub fn element(&self) -> Option<&FieldDescriptor> {
        match self {
            FieldDescriptor::ListOf(inner) => Some(inner),
            _ => None,
        }
    }

    /// Fields of an embedded document (or of the documents of a list)
    pub fn embedded_fields(&self) -> Option<&BTreeMap<String, FieldInfo>> {
        match self {
            FieldDescriptor::EmbeddedDocument { fields, .. } => Some(fields),
            FieldDescriptor::ListOf(inner) => inner.embedded_fields(),
            _ => None,
        }
    }

    pub fn embedded_fields_mut(&mut self) -> Option<&mut BTreeMap<String, FieldInfo>> {
        match self {
            FieldDescriptor::EmbeddedDocument { fields, .. } => Some(fields),
            FieldDescriptor::ListOf(inner) => inner.embedded_fields_mut(),
            _ => None,
        }
    }

    pub fn document_type(&self) -> Option<&str> {
        match self {
            FieldDescriptor::EmbeddedDocument { document_type, .. } => Some(document_type),
            FieldDescriptor::ListOf(inner) => inner.document_type(),
            _ => None,
        }
    }

    /// Same shape, ignoring nested field declarations of embedded documents
    pub fn same_kind(&self, other: &FieldDescriptor) -> bool {
        match (self, other) {
            (FieldDescriptor::Scalar(a), FieldDescriptor::Scalar(b)) => a == b,
            (FieldDescriptor::ListOf(a), FieldDescriptor::ListOf(b)) => a.same_kind(b),
            (
                FieldDescriptor::EmbeddedDocument { document_type: a, .. },
                FieldDescriptor::EmbeddedDocument { document_type: b, .. },
            ) => a == b,
            (FieldDescriptor::Reference(a), FieldDescriptor::Reference(b)) => a == b,
            _ => false,
        }
    }

    /// Validate a value before it is serialized into a write
    ///
    /// Nulls are accepted for every field. Embedded documents may carry
    /// undeclared (dynamic) attributes; declared ones are validated.
    pub fn validate(&self, field: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }

        let mismatch = || SampleDbError::TypeMismatch {
            field: field.to_string(),
            expected: self.to_string(),
            found: type_name(value).to_string(),
        };

        match self {
            FieldDescriptor::Scalar(kind) => {
                if kind.matches(value) {
                    Ok(())
                } else {
                    Err(mismatch())
                }
            }
            FieldDescriptor::Reference(IdKind::ObjectId) => {
                let ok = is_object_id(value)
                    || value.as_str().map(|s| ObjectId::parse_str(s).is_ok()).unwrap_or(false);
                if ok {
                    Ok(())
                } else {
                    Err(mismatch())
                }
            }
            FieldDescriptor::ListOf(inner) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                for (i, item) in items.iter().enumerate() {
                    inner.validate(&format!("{}.{}", field, i), item)?;
                }
                Ok(())
            }
            FieldDescriptor::EmbeddedDocument { document_type, fields } => {
                let obj = value.as_object().filter(|_| !is_object_id(value)).ok_or_else(mismatch)?;
                if let Some(cls) = obj.get("_cls").and_then(|v| v.as_str()) {
                    if cls != document_type {
                        return Err(SampleDbError::TypeMismatch {
                            field: field.to_string(),
                            expected: document_type.clone(),
                            found: cls.to_string(),
                        });
                    }
                }
                for (name, info) in fields {
                    if let Some(child) = obj.get(name) {
                        info.descriptor.validate(&format!("{}.{}", field, name), child)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Descriptor for an aggregation `$type` name
    ///
    /// `document_type` names embedded documents (their `_cls`) when known.
    pub fn from_type_name(name: &str, document_type: Option<&str>) -> Option<FieldDescriptor> {
        match name {
            "int" | "long" => Some(FieldDescriptor::Scalar(ScalarKind::Int)),
            "double" | "decimal" => Some(FieldDescriptor::Scalar(ScalarKind::Float)),
            "string" => Some(FieldDescriptor::Scalar(ScalarKind::String)),
            "bool" => Some(FieldDescriptor::Scalar(ScalarKind::Bool)),
            "date" => Some(FieldDescriptor::Scalar(ScalarKind::DateTime)),
            "objectId" => Some(FieldDescriptor::Reference(IdKind::ObjectId)),
            "array" => Some(FieldDescriptor::list_of(FieldDescriptor::Scalar(ScalarKind::Any))),
            "object" => Some(FieldDescriptor::EmbeddedDocument {
                document_type: document_type.unwrap_or(DYNAMIC_DOCUMENT).to_string(),
                fields: BTreeMap::new(),
            }),
            _ => None,
        }
    }
}

/// Document type recorded for embedded documents without a `_cls`
pub const DYNAMIC_DOCUMENT: &str = "DynamicEmbeddedDocument";

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDescriptor::Scalar(kind) => f.write_str(kind.as_str()),
            FieldDescriptor::ListOf(inner) => write!(f, "list<{}>", inner),
            FieldDescriptor::EmbeddedDocument { document_type, .. } => {
                write!(f, "embedded<{}>", document_type)
            }
            FieldDescriptor::Reference(IdKind::ObjectId) => f.write_str("objectId"),
        }
    }
}

/// Every type observed for one dynamic path
///
/// A field that is a bool in some documents and a string in others is
/// reported with both descriptors instead of failing the scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedTypes(pub Vec<FieldDescriptor>);

impl ObservedTypes {
    pub fn single(descriptor: FieldDescriptor) -> Self {
        ObservedTypes(vec![descriptor])
    }

    /// Build from `$type` names (and `_cls` names for embedded documents)
    ///
    /// `int` and `double` collapse to `float`; `null` is ignored.
    pub fn from_type_names(names: &[String], classes: &[String]) -> Self {
        let has_int = names.iter().any(|n| n == "int" || n == "long");
        let has_float = names.iter().any(|n| n == "double" || n == "decimal");
        let mut observed = ObservedTypes::default();

        for name in names {
            if has_int && has_float && (name == "int" || name == "long") {
                continue;
            }
            if name == "object" && !classes.is_empty() {
                for cls in classes {
                    if let Some(d) = FieldDescriptor::from_type_name(name, Some(cls)) {
                        observed.push(d);
                    }
                }
                continue;
            }
            if let Some(d) = FieldDescriptor::from_type_name(name, None) {
                observed.push(d);
            }
        }
        observed
    }

    pub fn push(&mut self, descriptor: FieldDescriptor) {
        if !self.0.iter().any(|d| d.same_kind(&descriptor)) {
            self.0.push(descriptor);
        }
    }

    pub fn merge(&mut self, other: ObservedTypes) {
        for d in other.0 {
            self.push(d);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_single(&self) -> Option<&FieldDescriptor> {
        if self.0.len() == 1 {
            self.0.first()
        } else {
            None
        }
    }

    pub fn contains_embedded(&self) -> bool {
        self.0.iter().any(|d| d.is_embedded())
    }

    pub fn contains_list(&self) -> bool {
        self.0.iter().any(|d| d.is_list())
    }

    /// Replace untyped list observations with a typed element
    pub fn set_list_element(&mut self, element: FieldDescriptor) {
        for d in self.0.iter_mut() {
            if d.is_list() {
                *d = FieldDescriptor::list_of(element.clone());
            }
        }
    }
}

/// Built-in label document shapes
pub mod labels {
    use super::*;

    pub fn detection() -> FieldDescriptor {
        FieldDescriptor::embedded(
            "Detection",
            vec![
                FieldInfo::new("_id", FieldDescriptor::object_id()).read_only(),
                FieldInfo::new("label", FieldDescriptor::scalar(ScalarKind::String)),
                FieldInfo::new("confidence", FieldDescriptor::scalar(ScalarKind::Float)),
                FieldInfo::new(
                    "bounding_box",
                    FieldDescriptor::list_of(FieldDescriptor::scalar(ScalarKind::Float)),
                ),
                FieldInfo::new(
                    "tags",
                    FieldDescriptor::list_of(FieldDescriptor::scalar(ScalarKind::String)),
                ),
            ],
        )
    }

    pub fn detections() -> FieldDescriptor {
        FieldDescriptor::embedded(
            "Detections",
            vec![FieldInfo::new("detections", FieldDescriptor::list_of(detection()))],
        )
    }

    pub fn classification() -> FieldDescriptor {
        FieldDescriptor::embedded(
            "Classification",
            vec![
                FieldInfo::new("_id", FieldDescriptor::object_id()).read_only(),
                FieldInfo::new("label", FieldDescriptor::scalar(ScalarKind::String)),
                FieldInfo::new("confidence", FieldDescriptor::scalar(ScalarKind::Float)),
            ],
        )
    }

    /// GeoJSON point holder used by geo-proximity stages
    pub fn geo_location() -> FieldDescriptor {
        FieldDescriptor::embedded(
            "GeoLocation",
            vec![FieldInfo::new("point", FieldDescriptor::scalar(ScalarKind::Any))],
        )
    }

    pub fn metadata() -> FieldDescriptor {
        FieldDescriptor::embedded(
            "Metadata",
            vec![
                FieldInfo::new("size_bytes", FieldDescriptor::scalar(ScalarKind::Int)),
                FieldInfo::new("mime_type", FieldDescriptor::scalar(ScalarKind::String)),
                FieldInfo::new("width", FieldDescriptor::scalar(ScalarKind::Int)),
                FieldInfo::new("height", FieldDescriptor::scalar(ScalarKind::Int)),
            ],
        )
    }

    pub fn group() -> FieldDescriptor {
        FieldDescriptor::embedded(
            "Group",
            vec![
                FieldInfo::new("_id", FieldDescriptor::object_id()).read_only(),
                FieldInfo::new("name", FieldDescriptor::scalar(ScalarKind::String)),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========== ScalarKind tests ==========

    #[test]
    fn test_scalar_kind_from_str() {
        assert_eq!(ScalarKind::from_str("integer"), Some(ScalarKind::Int));
        assert_eq!(ScalarKind::from_str("number"), Some(ScalarKind::Float));
        assert_eq!(ScalarKind::from_str("blob"), None);
    }

    #[test]
    fn test_float_accepts_ints_but_int_rejects_floats() {
        assert!(ScalarKind::Float.matches(&json!(3)));
        assert!(!ScalarKind::Int.matches(&json!(3.5)));
    }

    // ========== validate tests ==========

    #[test]
    fn test_validate_nested_detection() {
        let good = json!({
            "_cls": "Detections",
            "detections": [{"label": "cat", "confidence": 0.9, "extra": "dynamic"}]
        });
        assert!(labels::detections().validate("gt", &good).is_ok());

        let bad = json!({"detections": [{"label": 5}]});
        let err = labels::detections().validate("gt", &bad).unwrap_err();
        assert!(err.to_string().contains("gt.detections.0.label"));
    }

    #[test]
    fn test_validate_rejects_wrong_cls() {
        let value = json!({"_cls": "Classification", "label": "cat"});
        assert!(labels::detection().validate("det", &value).is_err());
    }

    #[test]
    fn test_validate_reference_accepts_hex_and_native() {
        let oid = ObjectId::new();
        let d = FieldDescriptor::object_id();
        assert!(d.validate("ref", &oid.to_value()).is_ok());
        assert!(d.validate("ref", &json!(oid.to_hex())).is_ok());
        assert!(d.validate("ref", &json!("nope")).is_err());
    }

    #[test]
    fn test_validate_datetime() {
        let d = FieldDescriptor::scalar(ScalarKind::DateTime);
        assert!(d.validate("created", &json!({"$date": "2024-05-01T10:00:00Z"})).is_ok());
        assert!(d.validate("created", &json!("yesterday")).is_err());
    }

    #[test]
    fn test_null_always_valid() {
        assert!(labels::detections().validate("gt", &Value::Null).is_ok());
    }

    // ========== ObservedTypes tests ==========

    #[test]
    fn test_observed_types_collapse_numeric() {
        let observed = ObservedTypes::from_type_names(
            &["int".to_string(), "double".to_string(), "null".to_string()],
            &[],
        );
        assert_eq!(observed.as_single(), Some(&FieldDescriptor::scalar(ScalarKind::Float)));
    }

    #[test]
    fn test_observed_types_keep_conflicts() {
        let observed =
            ObservedTypes::from_type_names(&["bool".to_string(), "string".to_string()], &[]);
        assert_eq!(observed.0.len(), 2);
        assert!(observed.as_single().is_none());
    }

    #[test]
    fn test_observed_embedded_uses_cls() {
        let observed =
            ObservedTypes::from_type_names(&["object".to_string()], &["Detection".to_string()]);
        assert_eq!(observed.as_single().and_then(|d| d.document_type()), Some("Detection"));
    }

    #[test]
    fn test_descriptor_display() {
        assert_eq!(labels::detections().to_string(), "embedded<Detections>");
        assert_eq!(
            FieldDescriptor::list_of(FieldDescriptor::scalar(ScalarKind::String)).to_string(),
            "list<string>"
        );
    }
}
