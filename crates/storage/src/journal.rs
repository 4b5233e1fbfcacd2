//! Per-commit change logs.
//!
//! Every write transaction records which objects were inserted, modified
//! (and in which columns) or deleted. Committed logs are kept by the shared
//! file so readers can compute what changed between two versions.

use std::collections::{BTreeMap, BTreeSet};
use tessel_core::{ColKey, ObjKey};

/// Changes to a single table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableChanges {
    /// Objects created.
    inserted: BTreeSet<ObjKey>,
    /// Pre-existing objects changed, with the columns that changed.
    modified: BTreeMap<ObjKey, BTreeSet<ColKey>>,
    /// Pre-existing objects removed.
    deleted: BTreeSet<ObjKey>,
}

impl TableChanges {
    /// Records an insertion.
    pub fn insert(&mut self, key: ObjKey) {
        self.inserted.insert(key);
    }

    /// Records a modification of one column.
    pub fn modify(&mut self, key: ObjKey, col: ColKey) {
        // Objects created in this log are reported as insertions only.
        if self.inserted.contains(&key) || self.deleted.contains(&key) {
            return;
        }
        self.modified.entry(key).or_default().insert(col);
    }

    /// Records a deletion.
    pub fn delete(&mut self, key: ObjKey) {
        // Created and removed within the same log: never observable.
        if self.inserted.remove(&key) {
            return;
        }
        self.modified.remove(&key);
        self.deleted.insert(key);
    }

    /// Applies a later set of changes on top of this one.
    pub fn merge(&mut self, later: &TableChanges) {
        for key in &later.inserted {
            self.insert(*key);
        }
        for (key, cols) in &later.modified {
            for col in cols {
                self.modify(*key, *col);
            }
        }
        for key in &later.deleted {
            self.delete(*key);
        }
    }

    /// Returns inserted keys.
    pub fn inserted(&self) -> &BTreeSet<ObjKey> {
        &self.inserted
    }

    /// Returns modified keys with their changed columns.
    pub fn modified(&self) -> &BTreeMap<ObjKey, BTreeSet<ColKey>> {
        &self.modified
    }

    /// Returns deleted keys.
    pub fn deleted(&self) -> &BTreeSet<ObjKey> {
        &self.deleted
    }

    /// Returns true if the object was modified.
    pub fn is_modified(&self, key: ObjKey) -> bool {
        self.modified.contains_key(&key)
    }

    /// Returns true if the object was deleted.
    pub fn is_deleted(&self, key: ObjKey) -> bool {
        self.deleted.contains(&key)
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Changes made by one or more consecutive commits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeLog {
    tables: BTreeMap<String, TableChanges>,
    schema_changed: bool,
}

impl ChangeLog {
    /// Creates an empty change log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the changes of one table, if any were recorded.
    pub fn table(&self, name: &str) -> Option<&TableChanges> {
        self.tables.get(name)
    }

    /// Returns the changes of one table for recording.
    pub fn table_mut(&mut self, name: &str) -> &mut TableChanges {
        self.tables.entry(name.to_string()).or_default()
    }

    /// Returns all tables with recorded changes.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableChanges)> {
        self.tables.iter().map(|(name, changes)| (name.as_str(), changes))
    }

    /// Marks the log as containing schema changes. Column keys recorded
    /// before a schema change may no longer be meaningful.
    pub fn mark_schema_changed(&mut self) {
        self.schema_changed = true;
    }

    /// Returns true if the schema changed.
    #[inline]
    pub fn schema_changed(&self) -> bool {
        self.schema_changed
    }

    /// Applies a later log on top of this one.
    pub fn merge(&mut self, later: &ChangeLog) {
        self.schema_changed |= later.schema_changed;
        for (name, changes) in &later.tables {
            self.table_mut(name).merge(changes);
        }
    }

    /// Returns true if no object or schema change was recorded.
    pub fn is_empty(&self) -> bool {
        !self.schema_changed && self.tables.values().all(TableChanges::is_empty)
    }
}
