// schema/catalog.rs
// Declared sample and frame schemas of one collection

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::field::{labels, FieldDescriptor, FieldInfo, ScalarKind};
use crate::error::{Result, SampleDbError};

/// Media kind of a collection (or of one group slice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Image,
    Video,
    /// Samples are partitioned into named slices of a group field
    Group,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Group => "group",
        }
    }
}

/// Group field declaration of a grouped collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupField {
    pub name: String,
    pub default_slice: String,
    pub slices: BTreeMap<String, MediaType>,
}

/// Field declarations of a collection
///
/// Every mutation bumps `version`, which keys cached path resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    media_type: MediaType,
    sample_fields: BTreeMap<String, FieldInfo>,
    frame_fields: BTreeMap<String, FieldInfo>,
    group_field: Option<GroupField>,
    version: u64,
}

impl SchemaCatalog {
    /// Catalog with the default fields of `media_type`
    pub fn new(media_type: MediaType) -> Self {
        let mut sample_fields = BTreeMap::new();
        for info in default_sample_fields() {
            sample_fields.insert(info.name.clone(), info);
        }

        let mut catalog = SchemaCatalog {
            media_type,
            sample_fields,
            frame_fields: BTreeMap::new(),
            group_field: None,
            version: 0,
        };
        if media_type == MediaType::Video {
            catalog.init_frame_fields();
        }
        catalog
    }

    fn init_frame_fields(&mut self) {
        if !self.frame_fields.is_empty() {
            return;
        }
        for info in default_frame_fields() {
            self.frame_fields.insert(info.name.clone(), info);
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn group_field(&self) -> Option<&GroupField> {
        self.group_field.as_ref()
    }

    /// Whether `frames.` paths are legal
    pub fn has_frames(&self) -> bool {
        match self.media_type {
            MediaType::Video => true,
            MediaType::Group => self
                .group_field
                .as_ref()
                .map(|g| g.slices.values().any(|m| *m == MediaType::Video))
                .unwrap_or(false),
            MediaType::Image => false,
        }
    }

    pub fn fields(&self, frames: bool) -> &BTreeMap<String, FieldInfo> {
        if frames {
            &self.frame_fields
        } else {
            &self.sample_fields
        }
    }

    pub fn sample_fields(&self) -> &BTreeMap<String, FieldInfo> {
        &self.sample_fields
    }

    pub fn frame_fields(&self) -> &BTreeMap<String, FieldInfo> {
        &self.frame_fields
    }

    /// Look up a dotted sample-level path, descending into embedded
    /// documents and through lists of embedded documents
    pub fn get_field(&self, path: &str) -> Option<&FieldInfo> {
        lookup(&self.sample_fields, path)
    }

    pub fn get_frame_field(&self, path: &str) -> Option<&FieldInfo> {
        lookup(&self.frame_fields, path)
    }

    /// Look up a path that may carry a `frames.` prefix
    pub fn get_any_field(&self, path: &str) -> Option<&FieldInfo> {
        match path.strip_prefix("frames.") {
            Some(rest) if self.has_frames() => self.get_frame_field(rest),
            _ => self.get_field(path),
        }
    }

    /// Declare a sample field; nested paths extend their embedded parent
    pub fn add_field(&mut self, path: &str, descriptor: FieldDescriptor) -> Result<()> {
        insert(&mut self.sample_fields, path, descriptor)?;
        self.version += 1;
        Ok(())
    }

    pub fn add_frame_field(&mut self, path: &str, descriptor: FieldDescriptor) -> Result<()> {
        if !self.has_frames() {
            return Err(SampleDbError::SchemaError(format!(
                "Cannot declare frame field '{}' on a {} collection",
                path,
                self.media_type.as_str()
            )));
        }
        insert(&mut self.frame_fields, path, descriptor)?;
        self.version += 1;
        Ok(())
    }

    /// Remove a declared field; default fields cannot be removed
    pub fn remove_field(&mut self, path: &str, frames: bool) -> Result<Option<FieldInfo>> {
        let fields = if frames {
            &mut self.frame_fields
        } else {
            &mut self.sample_fields
        };
        let removed = remove(fields, path)?;
        if removed.is_some() {
            self.version += 1;
        }
        Ok(removed)
    }

    /// Convert into a grouped collection
    ///
    /// The first slice media type seen for a video slice enables frame fields.
    pub fn declare_group_field(
        &mut self,
        name: &str,
        default_slice: &str,
        slices: BTreeMap<String, MediaType>,
    ) -> Result<()> {
        if self.group_field.is_some() {
            return Err(SampleDbError::SchemaError(
                "Collection already has a group field".to_string(),
            ));
        }
        if !slices.contains_key(default_slice) {
            return Err(SampleDbError::SchemaError(format!(
                "Default slice '{}' is not one of the declared slices",
                default_slice
            )));
        }
        if self.sample_fields.contains_key(name) {
            return Err(SampleDbError::SchemaError(format!(
                "Field '{}' already exists",
                name
            )));
        }

        self.sample_fields.insert(
            name.to_string(),
            FieldInfo::new(name, labels::group()).default_field(),
        );
        if slices.values().any(|m| *m == MediaType::Video) {
            self.init_frame_fields();
        }
        self.group_field = Some(GroupField {
            name: name.to_string(),
            default_slice: default_slice.to_string(),
            slices,
        });
        self.media_type = MediaType::Group;
        self.version += 1;
        Ok(())
    }

    /// Flatten to the media type of selected slices
    pub(crate) fn set_media_type(&mut self, media_type: MediaType) {
        self.media_type = media_type;
        self.version += 1;
    }

    /// Replace the whole sample field table (used by reshaping view stages)
    pub(crate) fn replace_sample_fields(&mut self, fields: BTreeMap<String, FieldInfo>) {
        self.sample_fields = fields;
        self.version += 1;
    }

    /// Paths of every declared embedded document (or list of them)
    ///
    /// Frame paths are returned with their `frames.` prefix.
    pub fn embedded_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_embedded(&self.sample_fields, "", &mut out);
        if self.has_frames() {
            collect_embedded(&self.frame_fields, "frames.", &mut out);
        }
        out
    }
}

fn default_sample_fields() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("_id", FieldDescriptor::object_id())
            .read_only()
            .default_field(),
        FieldInfo::new("filepath", FieldDescriptor::scalar(ScalarKind::String)).default_field(),
        FieldInfo::new(
            "tags",
            FieldDescriptor::list_of(FieldDescriptor::scalar(ScalarKind::String)),
        )
        .default_field(),
        FieldInfo::new("metadata", labels::metadata()).default_field(),
    ]
}

fn default_frame_fields() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("_id", FieldDescriptor::object_id())
            .read_only()
            .default_field(),
        FieldInfo::new("_sample_id", FieldDescriptor::object_id())
            .read_only()
            .default_field(),
        FieldInfo::new("frame_number", FieldDescriptor::scalar(ScalarKind::Int))
            .read_only()
            .default_field(),
    ]
}

fn lookup<'a>(fields: &'a BTreeMap<String, FieldInfo>, path: &str) -> Option<&'a FieldInfo> {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    let info = fields.get(head)?;
    match rest {
        None => Some(info),
        Some(rest) => lookup(info.descriptor.embedded_fields()?, rest),
    }
}

fn insert(
    fields: &mut BTreeMap<String, FieldInfo>,
    path: &str,
    descriptor: FieldDescriptor,
) -> Result<()> {
    match path.split_once('.') {
        None => {
            if let Some(existing) = fields.get(path) {
                if existing.descriptor.same_kind(&descriptor) {
                    return Ok(());
                }
                return Err(SampleDbError::SchemaError(format!(
                    "Field '{}' already exists with type {}",
                    path, existing.descriptor
                )));
            }
            fields.insert(path.to_string(), FieldInfo::new(path, descriptor));
            Ok(())
        }
        Some((head, rest)) => {
            let parent = fields.get_mut(head).ok_or_else(|| {
                SampleDbError::SchemaError(format!("Parent field '{}' is not declared", head))
            })?;
            let kind = parent.descriptor.to_string();
            let children = parent.descriptor.embedded_fields_mut().ok_or_else(|| {
                SampleDbError::SchemaError(format!(
                    "Cannot declare '{}' inside non-document field '{}' ({})",
                    rest, head, kind
                ))
            })?;
            insert(children, rest, descriptor)
        }
    }
}

fn remove(fields: &mut BTreeMap<String, FieldInfo>, path: &str) -> Result<Option<FieldInfo>> {
    match path.split_once('.') {
        None => {
            if fields.get(path).map(|f| f.is_default).unwrap_or(false) {
                return Err(SampleDbError::SchemaError(format!(
                    "Cannot remove default field '{}'",
                    path
                )));
            }
            Ok(fields.remove(path))
        }
        Some((head, rest)) => match fields
            .get_mut(head)
            .and_then(|f| f.descriptor.embedded_fields_mut())
        {
            Some(children) => remove(children, rest),
            None => Ok(None),
        },
    }
}

fn collect_embedded(fields: &BTreeMap<String, FieldInfo>, prefix: &str, out: &mut Vec<String>) {
    for (name, info) in fields {
        if let Some(children) = info.descriptor.embedded_fields() {
            let path = format!("{}{}", prefix, name);
            collect_embedded(children, &format!("{}.", path), out);
            out.push(path);
        }
    }
}
