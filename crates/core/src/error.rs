//! Error types for tessel.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tessel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of errors, so callers can tell I/O from cipher from
/// schema failures without matching every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ThreadConfinement,
    InvalidObject,
    Transaction,
    Schema,
    Query,
    ConcurrentModification,
    Io,
    Encryption,
    Usage,
    Background,
}

/// Error types for tessel operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("instance accessed from an incorrect thread: {detail}")]
    WrongThread { detail: String },

    #[error("object is no longer valid: it was deleted or its instance was closed ({class})")]
    InvalidObject { class: String },

    #[error("instance for '{}' is closed", path.display())]
    InstanceClosed { path: PathBuf },

    #[error("cannot modify managed objects outside of a write transaction")]
    NotInTransaction,

    #[error("the instance is already in a write transaction")]
    AlreadyInTransaction,

    #[error("type mismatch on field '{field}': expected {expected}, actual {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("field '{field}' does not exist on class '{class}'")]
    UnknownField { class: String, field: String },

    #[error("class '{class}' is not part of the schema")]
    UnknownClass { class: String },

    #[error("primary key field '{field}' of class '{class}' cannot be changed after the object was created")]
    PrimaryKeyImmutable { class: String, field: String },

    #[error("an object of class '{class}' with primary key {value} already exists")]
    DuplicatePrimaryKey { class: String, value: String },

    #[error("field '{field}' of class '{class}' is not nullable")]
    NullNotAllowed { class: String, field: String },

    #[error("migration is required for '{}': stored schema version {stored:?}, required {required}", path.display())]
    MigrationRequired {
        path: PathBuf,
        stored: Option<u64>,
        required: u64,
    },

    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    #[error("collection was modified during iteration")]
    ConcurrentModification,

    #[error("i/o error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encryption key does not match the file '{}'", path.display())]
    Encryption { path: PathBuf },

    #[error("file '{}' is corrupted: {message}", path.display())]
    Corrupted { path: PathBuf, message: String },

    #[error("operation not supported: {message}")]
    UnsupportedOperation { message: String },

    #[error("cannot mix objects from different instances: {message}")]
    CrossInstance { message: String },

    #[error("malformed query: {message}")]
    MalformedQuery { message: String },

    #[error("index {index} is out of bounds for size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("task was cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Background(#[source] Box<Error>),
}

impl Error {
    /// Creates a thread-confinement error.
    pub fn wrong_thread(detail: impl Into<String>) -> Self {
        Error::WrongThread {
            detail: detail.into(),
        }
    }

    /// Creates an invalid object error.
    pub fn invalid_object(class: impl Into<String>) -> Self {
        Error::InvalidObject {
            class: class.into(),
        }
    }

    /// Creates a closed instance error.
    pub fn instance_closed(path: impl Into<PathBuf>) -> Self {
        Error::InstanceClosed { path: path.into() }
    }

    /// Creates a type mismatch error from a field and two type descriptions.
    pub fn type_mismatch(
        field: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Error::TypeMismatch {
            field: field.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(class: impl Into<String>, field: impl Into<String>) -> Self {
        Error::UnknownField {
            class: class.into(),
            field: field.into(),
        }
    }

    /// Creates an unknown class error.
    pub fn unknown_class(class: impl Into<String>) -> Self {
        Error::UnknownClass {
            class: class.into(),
        }
    }

    /// Creates a primary key immutability error.
    pub fn primary_key_immutable(class: impl Into<String>, field: impl Into<String>) -> Self {
        Error::PrimaryKeyImmutable {
            class: class.into(),
            field: field.into(),
        }
    }

    /// Creates a duplicate primary key error.
    pub fn duplicate_primary_key(class: impl Into<String>, value: impl ToString) -> Self {
        Error::DuplicatePrimaryKey {
            class: class.into(),
            value: value.to_string(),
        }
    }

    /// Creates a null constraint error.
    pub fn null_not_allowed(class: impl Into<String>, field: impl Into<String>) -> Self {
        Error::NullNotAllowed {
            class: class.into(),
            field: field.into(),
        }
    }

    /// Creates a schema mismatch error.
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Creates an I/O error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a corrupted file error.
    pub fn corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Corrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            message: message.into(),
        }
    }

    /// Creates a cross instance error.
    pub fn cross_instance(message: impl Into<String>) -> Self {
        Error::CrossInstance {
            message: message.into(),
        }
    }

    /// Creates a malformed query error.
    pub fn malformed_query(message: impl Into<String>) -> Self {
        Error::MalformedQuery {
            message: message.into(),
        }
    }

    /// Creates an index out of bounds error.
    pub fn out_of_bounds(index: usize, size: usize) -> Self {
        Error::IndexOutOfBounds { index, size }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    /// Wraps an error raised on a worker thread for delivery on its origin thread.
    pub fn background(inner: Error) -> Self {
        match inner {
            already @ Error::Background(_) => already,
            other => Error::Background(Box::new(other)),
        }
    }

    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::WrongThread { .. } => ErrorCategory::ThreadConfinement,
            Error::InvalidObject { .. } | Error::InstanceClosed { .. } => {
                ErrorCategory::InvalidObject
            }
            Error::NotInTransaction | Error::AlreadyInTransaction => ErrorCategory::Transaction,
            Error::UnknownClass { .. }
            | Error::MigrationRequired { .. }
            | Error::SchemaMismatch { .. } => ErrorCategory::Schema,
            Error::TypeMismatch { .. } | Error::UnknownField { .. } | Error::MalformedQuery { .. } => {
                ErrorCategory::Query
            }
            Error::ConcurrentModification => ErrorCategory::ConcurrentModification,
            Error::Io { .. } | Error::Corrupted { .. } => ErrorCategory::Io,
            Error::Encryption { .. } => ErrorCategory::Encryption,
            Error::Background(_) => ErrorCategory::Background,
            Error::PrimaryKeyImmutable { .. }
            | Error::DuplicatePrimaryKey { .. }
            | Error::NullNotAllowed { .. }
            | Error::UnsupportedOperation { .. }
            | Error::CrossInstance { .. }
            | Error::IndexOutOfBounds { .. }
            | Error::InvalidArgument { .. }
            | Error::IllegalState { .. }
            | Error::Cancelled => ErrorCategory::Usage,
        }
    }

    /// Returns the error raised on the worker if this is a background failure.
    pub fn background_cause(&self) -> Option<&Error> {
        match self {
            Error::Background(inner) => Some(inner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_error_display() {
        let err = Error::type_mismatch("age", DataType::String, DataType::Int);
        let msg = err.to_string();
        assert!(msg.contains("age"));
        assert!(msg.contains("string"));
        assert!(msg.contains("int"));

        let err = Error::unknown_field("Person", "nmae");
        assert!(err.to_string().contains("nmae"));

        let err = Error::MigrationRequired {
            path: "db.tessel".into(),
            stored: Some(1),
            required: 2,
        };
        assert!(err.to_string().contains("db.tessel"));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            Error::io("x", io::Error::new(io::ErrorKind::Other, "disk")).category(),
            ErrorCategory::Io
        );
        assert_eq!(
            Error::Encryption { path: "x".into() }.category(),
            ErrorCategory::Encryption
        );
        assert_eq!(
            Error::schema_mismatch("differs").category(),
            ErrorCategory::Schema
        );
        assert_eq!(Error::NotInTransaction.category(), ErrorCategory::Transaction);
    }

    #[test]
    fn test_background_is_not_double_wrapped() {
        let err = Error::background(Error::background(Error::Cancelled));
        match err.background_cause() {
            Some(Error::Cancelled) => {}
            other => panic!("unexpected cause: {:?}", other),
        }
    }
}
