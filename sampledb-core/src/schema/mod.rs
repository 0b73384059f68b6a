// schema/mod.rs
//! Field declarations, schema catalogs and dynamic schema introspection

pub mod catalog;
pub mod dynamic;
pub mod field;
pub mod persist;

pub use catalog::{GroupField, MediaType, SchemaCatalog};
pub use dynamic::{get_dynamic_schema, DynamicSchema};
pub use field::{labels, FieldDescriptor, FieldInfo, IdKind, ObservedTypes, ScalarKind};
pub use persist::{CatalogStore, FileCatalogStore, MemoryCatalogStore};
