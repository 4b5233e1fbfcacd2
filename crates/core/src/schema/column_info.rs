//! Column index cache: (class, field name) to column key.
//!
//! Built once per schema version from the stored schema and shared by every
//! instance that opens the same file at that version.

use super::object_schema::{ObjectSchema, Schema};
use crate::error::{Error, Result};
use crate::row::ColKey;
use crate::types::ColumnType;
use hashbrown::HashMap;
use std::sync::Arc;

/// Resolved description of one column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDetails {
    pub key: ColKey,
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub target_class: Option<String>,
}

/// Column details for one class.
#[derive(Clone, Debug)]
pub struct ClassColumns {
    class: String,
    columns: Vec<ColumnDetails>,
    by_name: HashMap<String, usize>,
    primary_key: Option<usize>,
}

impl ClassColumns {
    /// Builds the column details of a stored class.
    pub fn from_schema(schema: &ObjectSchema) -> Self {
        let columns: Vec<ColumnDetails> = schema
            .properties()
            .iter()
            .enumerate()
            .map(|(i, p)| ColumnDetails {
                key: ColKey(i as u32),
                name: p.name().to_string(),
                col_type: p.col_type(),
                nullable: p.is_nullable(),
                primary_key: p.is_primary_key(),
                target_class: p.target_class().map(str::to_string),
            })
            .collect();
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        let primary_key = columns.iter().position(|c| c.primary_key);
        Self {
            class: schema.name().to_string(),
            columns,
            by_name,
            primary_key,
        }
    }

    /// Returns the class name.
    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns all columns in key order.
    #[inline]
    pub fn columns(&self) -> &[ColumnDetails] {
        &self.columns
    }

    /// Looks up a field by name.
    pub fn get(&self, field: &str) -> Option<&ColumnDetails> {
        self.by_name.get(field).map(|&i| &self.columns[i])
    }

    /// Looks up a field by name, failing with an unknown-field error.
    pub fn require(&self, field: &str) -> Result<&ColumnDetails> {
        self.get(field)
            .ok_or_else(|| Error::unknown_field(&self.class, field))
    }

    /// Looks up a column by key.
    pub fn by_key(&self, key: ColKey) -> Option<&ColumnDetails> {
        self.columns.get(key.index())
    }

    /// Returns the primary key column if the class has one.
    pub fn primary_key(&self) -> Option<&ColumnDetails> {
        self.primary_key.map(|i| &self.columns[i])
    }
}

/// Column details for every class of a schema version.
#[derive(Clone, Debug, Default)]
pub struct ColumnIndices {
    schema_version: u64,
    classes: HashMap<String, Arc<ClassColumns>>,
}

impl ColumnIndices {
    /// Builds the cache for the given stored schema.
    pub fn build(schema: &Schema, schema_version: u64) -> Self {
        let classes = schema
            .classes()
            .iter()
            .map(|c| (c.name().to_string(), Arc::new(ClassColumns::from_schema(c))))
            .collect();
        Self {
            schema_version,
            classes,
        }
    }

    /// Returns the schema version the cache was built for.
    #[inline]
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    /// Returns the columns of a class.
    pub fn class(&self, name: &str) -> Option<Arc<ClassColumns>> {
        self.classes.get(name).cloned()
    }

    /// Returns the columns of a class, failing with an unknown-class error.
    pub fn require_class(&self, name: &str) -> Result<Arc<ClassColumns>> {
        self.class(name).ok_or_else(|| Error::unknown_class(name))
    }

    /// Returns the names of all cached classes.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}
