//! Schema module for tessel.
//!
//! This module contains the schema definitions: properties, classes and the
//! per-version column index cache.

mod column_info;
mod object_schema;
mod property;

pub use column_info::{ClassColumns, ColumnDetails, ColumnIndices};
pub use object_schema::{check_naming_rules, ObjectSchema, ObjectSchemaBuilder, Schema};
pub use property::Property;
