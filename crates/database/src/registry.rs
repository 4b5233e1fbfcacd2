//! Process-wide registry of open instances.
//!
//! Instances are cached per (file, thread, kind): opening the same file
//! twice on one thread returns the same underlying instance with its
//! reference count incremented. The registry also holds what every
//! instance of a file shares: the first configuration, the worker pool and
//! the column indices of the validated schema version.
//!
//! The registry lock is only held for bookkeeping. Opening the file,
//! validating the schema and running migrations happen outside it.

use crate::config::Configuration;
use crate::executor::Executor;
use crate::realm::RealmInner;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tessel_core::schema::ColumnIndices;
use tessel_core::{Error, Result};
use tracing::debug;

/// Typed and dynamic instances of one thread are cached separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    pub thread: ThreadId,
    pub dynamic: bool,
}

struct Slot {
    count: usize,
    inner: Weak<RealmInner>,
}

struct FileEntry {
    config: Configuration,
    typed_version: Option<u64>,
    executor: Arc<Executor>,
    validated: Option<(u64, Arc<ColumnIndices>)>,
    slots: HashMap<SlotKey, Slot>,
}

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, FileEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Outcome of [`acquire`].
pub(crate) enum Acquired {
    /// The thread already has an instance; its count was incremented.
    Existing(Arc<RealmInner>),
    /// A new instance must be created and then passed to [`insert`].
    New {
        executor: Arc<Executor>,
        validated: Option<(u64, Arc<ColumnIndices>)>,
    },
}

/// Looks up the instance of `slot` for `path`, checking `config` agrees with
/// the configuration the file was first opened with.
pub(crate) fn acquire(path: &Path, slot: SlotKey, config: &Configuration) -> Result<Acquired> {
    let mut registry = REGISTRY.lock();
    let typed = !slot.dynamic;
    let entry = registry.entry(path.to_path_buf()).or_insert_with(|| FileEntry {
        config: config.clone(),
        typed_version: None,
        executor: Executor::new(&path.display().to_string(), config.max_async_workers()),
        validated: None,
        slots: HashMap::new(),
    });
    let version_conflict = typed && entry.typed_version.is_some_and(|v| v != config.schema_version());
    let compatible = entry.config.check_compatible(config, false).and_then(|()| {
        if version_conflict {
            Err(Error::illegal_state(format!(
                "'{}' is already open with a different schema version",
                path.display()
            )))
        } else {
            Ok(())
        }
    });
    if let Err(e) = compatible {
        abandon_locked(&mut registry, path);
        return Err(e);
    }

    if let Some(existing) = entry.slots.get_mut(&slot) {
        if let Some(inner) = existing.inner.upgrade() {
            existing.count += 1;
            return Ok(Acquired::Existing(inner));
        }
    }
    Ok(Acquired::New {
        executor: Arc::clone(&entry.executor),
        validated: entry.validated.clone(),
    })
}

/// Records a newly created instance with a count of one.
pub(crate) fn insert(path: &Path, slot: SlotKey, inner: &Arc<RealmInner>, schema_version: Option<u64>) {
    let mut registry = REGISTRY.lock();
    if let Some(entry) = registry.get_mut(path) {
        if !slot.dynamic && entry.typed_version.is_none() {
            entry.typed_version = schema_version;
        }
        entry.slots.insert(
            slot,
            Slot {
                count: 1,
                inner: Arc::downgrade(inner),
            },
        );
    }
}

/// Caches the indices of a validated schema version.
pub(crate) fn store_validated(path: &Path, version: u64, indices: Arc<ColumnIndices>) {
    if let Some(entry) = REGISTRY.lock().get_mut(path) {
        entry.validated = Some((version, indices));
    }
}

/// Drops the file entry if nothing was inserted, after a failed open.
pub(crate) fn abandon(path: &Path) {
    abandon_locked(&mut REGISTRY.lock(), path);
}

fn abandon_locked(registry: &mut HashMap<PathBuf, FileEntry>, path: &Path) {
    if registry.get(path).is_some_and(|e| e.slots.is_empty()) {
        registry.remove(path);
    }
}

/// Decrements the count of `slot`. Returns true if that was the last
/// reference, in which case the caller shuts the instance down.
pub(crate) fn release(path: &Path, slot: SlotKey) -> bool {
    let mut registry = REGISTRY.lock();
    let Some(entry) = registry.get_mut(path) else {
        return false;
    };
    let last = match entry.slots.get_mut(&slot) {
        Some(s) if s.count > 1 => {
            s.count -= 1;
            false
        }
        Some(_) => {
            entry.slots.remove(&slot);
            true
        }
        None => false,
    };
    if entry.slots.is_empty() {
        debug!(path = %path.display(), "last instance closed");
        registry.remove(path);
    }
    last
}

/// Number of open references to `path` across all threads.
pub(crate) fn global_count(path: &Path) -> usize {
    REGISTRY
        .lock()
        .get(path)
        .map(|e| e.slots.values().map(|s| s.count).sum())
        .unwrap_or(0)
}

/// Number of open references to `path` held by `thread`.
pub(crate) fn local_count(path: &Path, thread: ThreadId) -> usize {
    REGISTRY
        .lock()
        .get(path)
        .map(|e| {
            e.slots
                .iter()
                .filter(|(k, _)| k.thread == thread)
                .map(|(_, s)| s.count)
                .sum()
        })
        .unwrap_or(0)
}

/// Returns true if any instance of `path` is open.
pub(crate) fn is_open(path: &Path) -> bool {
    REGISTRY.lock().contains_key(path)
}
