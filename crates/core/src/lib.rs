//! Tessel Core - Core types and schema definitions for the tessel object database.
//!
//! This crate provides the foundational types shared by every tessel crate:
//!
//! - `DataType`/`ColumnType`: stored types and collection shapes
//! - `Value`: values that can be stored in a cell, including links
//! - `Row`, `ObjKey`, `ColKey`: stored objects and their keys
//! - `schema`: class definitions and the column index cache
//! - `pattern_match`: string predicates with case folding
//! - `Error`: the error taxonomy for every layer
//!
//! # Example
//!
//! ```rust
//! use tessel_core::{DataType, ObjKey, Row, Value};
//! use tessel_core::schema::ObjectSchemaBuilder;
//!
//! let person = ObjectSchemaBuilder::new("Person")
//!     .unwrap()
//!     .field("id", DataType::Int)
//!     .unwrap()
//!     .field("name", DataType::String)
//!     .unwrap()
//!     .primary_key("id")
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let row = Row::new(ObjKey(0), vec![Value::Int(1), Value::from("Alice")]);
//! assert_eq!(person.property_index("name"), Some(1));
//! assert_eq!(row.values()[1], Value::String("Alice".into()));
//! ```

mod error;
pub mod pattern_match;
mod row;
pub mod schema;
mod types;
mod value;

pub use error::{Error, ErrorCategory, Result};
pub use row::{ColKey, ObjKey, Row};
pub use types::{CollectionType, ColumnType, DataType, TypeFamily};
pub use value::{Decimal128, FromValue, ObjectId, TypedLink, Value};
