//! Row references held by live objects.
//!
//! A reference is either invalid or attached to an object key. Attached
//! references come in two flavours: checked references re-verify the column
//! against the stored schema on every access, which dynamic instances need
//! because their schema can change underneath them; unchecked references
//! trust the column indices validated when a typed instance was opened.

use std::sync::Arc;
use tessel_core::schema::{ClassColumns, ColumnDetails};
use tessel_core::{Error, ObjKey, Result, Row, Value};
use tessel_storage::Group;

/// Whether column accesses are re-validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Checked,
    Unchecked,
}

/// Reference from a live object to its row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowRef {
    /// Detached: every access fails.
    Invalid,
    Attached { key: ObjKey, access: Access },
}

impl RowRef {
    pub fn attached(key: ObjKey, access: Access) -> Self {
        RowRef::Attached { key, access }
    }

    /// Returns the object key if attached.
    pub fn key(&self) -> Option<ObjKey> {
        match self {
            RowRef::Invalid => None,
            RowRef::Attached { key, .. } => Some(*key),
        }
    }

    /// Returns true if the reference is attached and the row still exists.
    pub fn is_valid(&self, group: &Group, class: &str) -> bool {
        match self {
            RowRef::Invalid => false,
            RowRef::Attached { key, .. } => group.table(class).is_some_and(|t| t.contains(*key)),
        }
    }

    /// Returns the row, failing with an invalid-object error if the
    /// reference is detached or the row was deleted.
    pub fn row<'g>(&self, group: &'g Group, class: &str) -> Result<&'g Arc<Row>> {
        let RowRef::Attached { key, .. } = self else {
            return Err(Error::invalid_object(class));
        };
        group
            .table(class)
            .and_then(|t| t.get(*key))
            .ok_or_else(|| Error::invalid_object(class))
    }

    /// Resolves `field` and checks it against the stored schema when the
    /// reference is checked.
    pub fn column<'c>(&self, group: &Group, columns: &'c ClassColumns, field: &str) -> Result<&'c ColumnDetails> {
        let details = columns.require(field)?;
        if let RowRef::Attached {
            access: Access::Checked,
            ..
        } = self
        {
            let table = group.require_table(columns.class())?;
            let stored = table.schema().properties().get(details.key.index());
            match stored {
                Some(p) if p.name() == details.name && p.col_type() == details.col_type => {}
                _ => {
                    return Err(Error::schema_mismatch(format!(
                        "field '{}.{}' changed since it was resolved",
                        columns.class(),
                        field
                    )))
                }
            }
        }
        Ok(details)
    }

    /// Reads one field.
    pub fn get(&self, group: &Group, columns: &ClassColumns, field: &str) -> Result<Value> {
        let details = self.column(group, columns, field)?;
        let row = self.row(group, columns.class())?;
        Ok(row.get(details.key).cloned().unwrap_or(Value::Null))
    }
}
