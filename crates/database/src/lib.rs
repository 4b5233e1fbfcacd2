//! Tessel database - live objects over a versioned object store.
//!
//! This crate is the client layer of tessel. It opens files through the
//! storage engine and hands out thread-confined views that stay current as
//! the file moves forward.
//!
//! # Core Components
//!
//! - `Realm`: a per-thread instance of one file, with transactions and
//!   change listeners
//! - `Configuration`: where the file lives, its schema and how to migrate it
//! - `Object`: a live stored object with typed field accessors
//! - `Results`, `List`, `RealmSet`: live collections
//! - `RealmQuery`: the query builder bound to an instance
//! - `Looper`: the per-thread event loop that delivers remote changes and
//!   asynchronous query results
//!
//! # Example
//!
//! ```ignore
//! use tessel_database::{Configuration, Realm};
//! use tessel_core::schema::ObjectSchemaBuilder;
//! use tessel_core::DataType;
//!
//! let person = ObjectSchemaBuilder::new("Person")?
//!     .field("name", DataType::String)?
//!     .field("age", DataType::Int)?
//!     .build()?;
//! let config = Configuration::builder("people.tessel").class(person).build()?;
//! let realm = Realm::get_instance(&config)?;
//!
//! realm.execute_transaction(|r| {
//!     let jane = r.create_object("Person")?;
//!     jane.set("name", "Jane")?;
//!     jane.set("age", 20i64)
//! })?;
//!
//! let jane = realm.where_("Person")?.equal_to("name", "Jane")?.find_first()?;
//! ```

mod collection;
mod copy;
mod executor;
mod registry;
mod row_ref;

pub mod config;
pub mod list;
pub mod looper;
pub mod migration;
pub mod object;
pub mod query;
pub mod realm;
pub mod record;
pub mod results;
pub mod set;

pub use collection::{ListListener, SetListener};
pub use config::{Configuration, ConfigurationBuilder, InitialData, ENCRYPTION_KEY_LEN};
pub use executor::AsyncTask;
pub use list::{List, ListIter};
pub use looper::Looper;
pub use migration::{Migration, MigrationContext, MigrationObject};
pub use object::{Object, ObjectListener};
pub use query::RealmQuery;
pub use realm::{Realm, RealmListener, WaitStopper};
pub use record::{FieldValue, RealmModel, Record};
pub use results::{Results, ResultsIter, ResultsListener, Snapshot};
pub use set::{RealmSet, SetIter};

pub use tessel_core::pattern_match::Case;
pub use tessel_core::{Error, ErrorCategory, Result, Value};
pub use tessel_query::SortOrder;
pub use tessel_reactive::{CollectionChangeSet, ListenerId, ObjectChangeSet};
