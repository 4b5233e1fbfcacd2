//! Property (field) definition for an object schema.

use crate::types::{CollectionType, ColumnType, DataType};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A persisted field of a class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Field name.
    name: String,
    /// Stored type and collection shape.
    col_type: ColumnType,
    /// Whether this field (or, for collections, its elements) may hold null.
    nullable: bool,
    /// Whether this field is the class's primary key.
    primary_key: bool,
    /// Whether lookups on this field should be indexed.
    indexed: bool,
    /// Target class of link fields.
    target_class: Option<String>,
}

impl Property {
    /// Creates a new property definition.
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        let nullable =
            !col_type.collection.is_collection() && col_type.data_type.is_nullable_by_default();
        Self {
            name: name.into(),
            col_type,
            nullable,
            primary_key: false,
            indexed: false,
            target_class: None,
        }
    }

    /// Creates a single-value property.
    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, ColumnType::single(data_type))
    }

    /// Creates a link to one object of `target`.
    pub fn link(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(name, ColumnType::single(DataType::Link));
        prop.target_class = Some(target.into());
        prop
    }

    /// Creates an ordered list of links to objects of `target`.
    pub fn link_list(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(name, ColumnType::list(DataType::Link));
        prop.target_class = Some(target.into());
        prop
    }

    /// Creates an ordered list of scalars.
    pub fn list(name: impl Into<String>, element: DataType) -> Self {
        Self::new(name, ColumnType::list(element))
    }

    /// Creates an unordered set of scalars.
    pub fn set(name: impl Into<String>, element: DataType) -> Self {
        Self::new(name, ColumnType::set(element))
    }

    /// Sets whether this property is nullable. Single links are always nullable.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable || self.is_single_link();
        self
    }

    /// Marks this property as indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub(crate) fn set_primary_key(&mut self, primary_key: bool) {
        self.primary_key = primary_key;
        if primary_key {
            self.indexed = true;
        }
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Returns the property name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the column type.
    #[inline]
    pub fn col_type(&self) -> ColumnType {
        self.col_type
    }

    /// Returns the element data type.
    #[inline]
    pub fn data_type(&self) -> DataType {
        self.col_type.data_type
    }

    /// Returns the collection shape.
    #[inline]
    pub fn collection(&self) -> CollectionType {
        self.col_type.collection
    }

    /// Returns whether this property is nullable.
    #[inline]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Returns whether this property is the primary key.
    #[inline]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Returns the target class of a link property.
    pub fn target_class(&self) -> Option<&str> {
        self.target_class.as_deref()
    }

    fn is_single_link(&self) -> bool {
        self.col_type == ColumnType::single(DataType::Link)
    }

    /// Returns the value a new object starts with for this property.
    pub fn default_value(&self) -> Value {
        if self.col_type.collection.is_collection() {
            Value::List(Vec::new())
        } else if self.nullable {
            Value::Null
        } else {
            Value::default_for_type(self.col_type.data_type)
        }
    }
}
