//! Data type definitions for tessel.
//!
//! This module defines the stored column types and the collection shape a
//! column can take.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Stored type of a column (or of the elements of a collection column).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean (true/false)
    Bool,
    /// 64-bit signed integer
    Int,
    /// 32-bit floating point number
    Float,
    /// 64-bit floating point number
    Double,
    /// UTF-8 string
    String,
    /// Binary blob
    Binary,
    /// Point in time, milliseconds since the Unix epoch
    Date,
    /// 128-bit decimal
    Decimal,
    /// 12-byte object identifier
    ObjectId,
    /// RFC 4122 UUID
    Uuid,
    /// Link to an object of a fixed target class
    Link,
    /// Polymorphic value: any scalar or a typed link
    Mixed,
}

/// Comparison family of a type. Values compare only within one family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    Bool,
    Numeric,
    Text,
    Binary,
    Temporal,
    ObjectId,
    Uuid,
    Link,
    Mixed,
}

impl DataType {
    /// Returns the comparison family of this type.
    pub fn family(&self) -> TypeFamily {
        match self {
            DataType::Bool => TypeFamily::Bool,
            DataType::Int | DataType::Float | DataType::Double | DataType::Decimal => {
                TypeFamily::Numeric
            }
            DataType::String => TypeFamily::Text,
            DataType::Binary => TypeFamily::Binary,
            DataType::Date => TypeFamily::Temporal,
            DataType::ObjectId => TypeFamily::ObjectId,
            DataType::Uuid => TypeFamily::Uuid,
            DataType::Link => TypeFamily::Link,
            DataType::Mixed => TypeFamily::Mixed,
        }
    }

    /// Returns true for types that support sum and average.
    pub fn is_numeric(&self) -> bool {
        self.family() == TypeFamily::Numeric
    }

    /// Returns true for types that support min and max.
    pub fn is_ordered(&self) -> bool {
        matches!(self.family(), TypeFamily::Numeric | TypeFamily::Temporal)
    }

    /// Returns whether this type can be used as a primary key.
    pub fn is_primary_key_capable(&self) -> bool {
        matches!(
            self,
            DataType::Int | DataType::String | DataType::ObjectId | DataType::Uuid
        )
    }

    /// Returns whether this type is nullable by default.
    pub fn is_nullable_by_default(&self) -> bool {
        matches!(
            self,
            DataType::String
                | DataType::Binary
                | DataType::Date
                | DataType::Decimal
                | DataType::ObjectId
                | DataType::Uuid
                | DataType::Link
                | DataType::Mixed
        )
    }

    /// Returns the type name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Binary => "binary",
            DataType::Date => "date",
            DataType::Decimal => "decimal128",
            DataType::ObjectId => "object_id",
            DataType::Uuid => "uuid",
            DataType::Link => "object",
            DataType::Mixed => "mixed",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of a column: a single value, an ordered list or an unordered set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionType {
    #[default]
    Single,
    List,
    Set,
}

impl CollectionType {
    #[inline]
    pub fn is_collection(&self) -> bool {
        !matches!(self, CollectionType::Single)
    }
}

/// Full column type: element type plus collection shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnType {
    pub data_type: DataType,
    pub collection: CollectionType,
}

impl ColumnType {
    pub const fn single(data_type: DataType) -> Self {
        Self {
            data_type,
            collection: CollectionType::Single,
        }
    }

    pub const fn list(data_type: DataType) -> Self {
        Self {
            data_type,
            collection: CollectionType::List,
        }
    }

    pub const fn set(data_type: DataType) -> Self {
        Self {
            data_type,
            collection: CollectionType::Set,
        }
    }

    /// Returns true for single links and link collections.
    pub fn is_link(&self) -> bool {
        self.data_type == DataType::Link
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.collection {
            CollectionType::Single => write!(f, "{}", self.data_type),
            CollectionType::List => write!(f, "list<{}>", self.data_type),
            CollectionType::Set => write!(f, "set<{}>", self.data_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_family() {
        assert!(DataType::Int.is_numeric());
        assert!(DataType::Decimal.is_numeric());
        assert!(!DataType::Date.is_numeric());
        assert!(DataType::Date.is_ordered());
        assert!(!DataType::String.is_ordered());
    }

    #[test]
    fn test_nullable_by_default() {
        assert!(!DataType::Bool.is_nullable_by_default());
        assert!(!DataType::Int.is_nullable_by_default());
        assert!(DataType::String.is_nullable_by_default());
        assert!(DataType::Link.is_nullable_by_default());
    }

    #[test]
    fn test_column_type_display() {
        assert_eq!(ColumnType::single(DataType::Int).to_string(), "int");
        assert_eq!(ColumnType::list(DataType::Link).to_string(), "list<object>");
        assert_eq!(ColumnType::set(DataType::String).to_string(), "set<string>");
    }
}
