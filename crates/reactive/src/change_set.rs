//! Change sets for collections and objects.
//!
//! A `CollectionChangeSet` describes the difference between two evaluations
//! of the same live collection by index: deletions refer to the previous
//! evaluation, insertions and modifications to the new one. Moves are
//! reported as a deletion plus an insertion.

use hashbrown::HashMap;
use std::hash::Hash;

/// Index-based changes of a collection between two evaluations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionChangeSet {
    deletions: Vec<usize>,
    insertions: Vec<usize>,
    modifications: Vec<usize>,
}

impl CollectionChangeSet {
    /// Creates an empty change set.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the change set of a first evaluation: every element is an
    /// insertion.
    pub fn initial(len: usize) -> Self {
        Self {
            insertions: (0..len).collect(),
            ..Self::default()
        }
    }

    /// Computes the changes from `old` to `new`.
    ///
    /// Elements are matched by value, counting duplicates, so a value that
    /// appears twice in `old` and once in `new` yields one deletion.
    /// Elements present on both sides are reported as modified when
    /// `is_modified` says so.
    pub fn compute<K, F>(old: &[K], new: &[K], is_modified: F) -> Self
    where
        K: Eq + Hash,
        F: Fn(&K) -> bool,
    {
        let mut remaining: HashMap<&K, usize> = HashMap::with_capacity(new.len());
        for key in new {
            *remaining.entry(key).or_insert(0) += 1;
        }
        let mut deletions = Vec::new();
        let mut kept: HashMap<&K, usize> = HashMap::with_capacity(old.len());
        for (index, key) in old.iter().enumerate() {
            match remaining.get_mut(key) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    *kept.entry(key).or_insert(0) += 1;
                }
                _ => deletions.push(index),
            }
        }

        let mut insertions = Vec::new();
        let mut modifications = Vec::new();
        for (index, key) in new.iter().enumerate() {
            match kept.get_mut(key) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if is_modified(key) {
                        modifications.push(index);
                    }
                }
                _ => insertions.push(index),
            }
        }

        Self {
            deletions,
            insertions,
            modifications,
        }
    }

    /// Indices in the previous evaluation that are gone.
    #[inline]
    pub fn deletions(&self) -> &[usize] {
        &self.deletions
    }

    /// Indices in the new evaluation that were not there before.
    #[inline]
    pub fn insertions(&self) -> &[usize] {
        &self.insertions
    }

    /// Indices in the new evaluation whose object changed.
    #[inline]
    pub fn modifications(&self) -> &[usize] {
        &self.modifications
    }

    /// Returns true if nothing changed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty() && self.modifications.is_empty()
    }

    /// Returns the total number of reported changes.
    #[inline]
    pub fn len(&self) -> usize {
        self.deletions.len() + self.insertions.len() + self.modifications.len()
    }
}

/// Changes of one object between two versions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectChangeSet {
    deleted: bool,
    changed_fields: Vec<String>,
}

impl ObjectChangeSet {
    pub fn new(deleted: bool, changed_fields: Vec<String>) -> Self {
        Self {
            deleted,
            changed_fields,
        }
    }

    /// Change set of a deleted object.
    pub fn deleted() -> Self {
        Self::new(true, Vec::new())
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Names of the fields whose value changed.
    #[inline]
    pub fn changed_fields(&self) -> &[String] {
        &self.changed_fields
    }

    pub fn is_field_changed(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.deleted && self.changed_fields.is_empty()
    }
}
