//! Tessel Storage - Reference storage engine for the tessel object database.
//!
//! This crate provides the storage handle the client layer is built on:
//!
//! - `TableData`: objects of one class with a primary-key index
//! - `Group`: all tables of one committed version, copied on write
//! - `ChangeLog`: per-commit record of inserted, modified and deleted objects
//! - `SharedFile`: process-wide version history, write lock and persistence
//! - `SharedGroup`: a handle with begin/commit/cancel and version advance
//!
//! # Example
//!
//! ```rust
//! use tessel_storage::{FileOptions, SharedGroup};
//! use tessel_core::schema::ObjectSchemaBuilder;
//! use tessel_core::{DataType, Value};
//!
//! let options = FileOptions { in_memory: true, ..Default::default() };
//! let mut group = SharedGroup::open("doc-example", &options).unwrap();
//!
//! group.begin_transaction().unwrap();
//! let (g, log) = group.write().unwrap();
//! let schema = ObjectSchemaBuilder::new("Person")
//!     .unwrap()
//!     .field("name", DataType::String)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! g.add_table(schema, log).unwrap();
//! g.create_object("Person", vec![Value::from("Alice")], log).unwrap();
//! group.commit_transaction().unwrap();
//!
//! assert_eq!(group.table("Person").unwrap().len(), 1);
//! ```

pub mod group;
pub mod journal;
mod persist;
pub mod shared_file;
pub mod table;
pub mod transaction;

pub use group::Group;
pub use journal::{ChangeLog, TableChanges};
pub use persist::{fingerprint, KeyFingerprint};
pub use shared_file::{
    canonical_path, CommitNotifier, FileOptions, HandleId, NotifierId, SharedFile, VersionId,
    VersionPin,
};
pub use table::{check_value, TableData};
pub use transaction::{SharedGroup, TransactionState};
