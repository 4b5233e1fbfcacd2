//! Row structure for tessel.
//!
//! This module defines the object and column keys and the `Row` struct which
//! represents one stored object in a table.

use crate::value::Value;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Stable identifier of an object within its table. Keys are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjKey(pub i64);

impl ObjKey {
    #[inline]
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a column within the rows of a table at one schema version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColKey(pub u32);

impl ColKey {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col#{}", self.0)
    }
}

/// An object stored in a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Key of the object.
    key: ObjKey,
    /// Version number for change detection. Incremented on each update.
    version: u64,
    /// Values stored in this row, indexed by column key.
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row with the given key and values.
    /// Version defaults to 1 for new rows.
    pub fn new(key: ObjKey, values: Vec<Value>) -> Self {
        Self {
            key,
            version: 1,
            values,
        }
    }

    /// Returns the object key.
    #[inline]
    pub fn key(&self) -> ObjKey {
        self.key
    }

    /// Returns the version number.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Increments the version number and returns the new value.
    #[inline]
    pub fn increment_version(&mut self) -> u64 {
        self.version = self.version.wrapping_add(1);
        self.version
    }

    /// Returns a reference to the values.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns a mutable reference to the values.
    #[inline]
    pub fn values_mut(&mut self) -> &mut Vec<Value> {
        &mut self.values
    }

    /// Gets the value stored under a column.
    pub fn get(&self, col: ColKey) -> Option<&Value> {
        self.values.get(col.index())
    }

    /// Gets a mutable reference to the value stored under a column.
    pub fn get_mut(&mut self, col: ColKey) -> Option<&mut Value> {
        self.values.get_mut(col.index())
    }

    /// Sets a value under a column. Returns false if the column is out of range.
    pub fn set(&mut self, col: ColKey, value: Value) -> bool {
        match self.values.get_mut(col.index()) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Returns the number of values in this row.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if this row has no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
