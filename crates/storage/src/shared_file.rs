//! Process-wide state of one open file.
//!
//! Every handle on the same canonical path shares one `SharedFile`: the
//! committed version history, the single-writer lock, the change logs between
//! retained versions and the commit notifiers.

use crate::group::Group;
use crate::journal::ChangeLog;
use crate::persist::{self, KeyFingerprint};
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tessel_core::{Error, Result};
use tracing::{debug, info};

/// A committed version of a file. Versions only grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies one handle on a shared file.
pub type HandleId = u64;

/// Identifies a registered commit notifier.
pub type NotifierId = u64;

/// Callback invoked after every commit with the new version.
pub type CommitNotifier = Arc<dyn Fn(VersionId) + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

static OPEN_FILES: Lazy<Mutex<HashMap<PathBuf, Weak<SharedFile>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// How to open a shared file.
#[derive(Clone, Debug, Default)]
pub struct FileOptions {
    /// Keep everything in memory; the path is only an identifier.
    pub in_memory: bool,
    /// Encryption key, verified against the fingerprint stored in the file.
    pub key: Option<Vec<u8>>,
    /// Reject write transactions.
    pub read_only: bool,
}

struct FileState {
    latest: VersionId,
    versions: BTreeMap<VersionId, Arc<Group>>,
    /// Log that produced each version from its predecessor.
    logs: BTreeMap<VersionId, Arc<ChangeLog>>,
    pins: HashMap<HandleId, VersionId>,
    writer: Option<HandleId>,
    /// Open `SharedGroup` handles; version pins are not counted.
    handles: usize,
}

impl FileState {
    fn prune(&mut self) {
        let oldest = self
            .pins
            .values()
            .copied()
            .min()
            .unwrap_or(self.latest)
            .min(self.latest);
        self.versions.retain(|v, _| *v >= oldest);
        self.logs.retain(|v, _| *v > oldest);
    }
}

/// State shared by all handles on one file.
pub struct SharedFile {
    path: PathBuf,
    in_memory: bool,
    read_only: bool,
    key: Option<KeyFingerprint>,
    state: Mutex<FileState>,
    writer_released: Condvar,
    version_advanced: Condvar,
    notifiers: Mutex<Vec<(NotifierId, CommitNotifier)>>,
}

impl SharedFile {
    /// Opens (or joins) the shared state for a path, creating the file if
    /// it does not exist.
    pub fn open(path: impl AsRef<Path>, options: &FileOptions) -> Result<Arc<SharedFile>> {
        let path = canonical_path(path.as_ref(), options.in_memory);
        let key = options.key.as_deref().map(persist::fingerprint);

        let mut open_files = OPEN_FILES.lock();
        if let Some(existing) = open_files.get(&path).and_then(Weak::upgrade) {
            if existing.key != key {
                return Err(Error::Encryption { path });
            }
            if existing.in_memory != options.in_memory {
                return Err(Error::illegal_state(format!(
                    "'{}' is already open with a different in-memory setting",
                    path.display()
                )));
            }
            return Ok(existing);
        }

        let (version, group) = if options.in_memory {
            (1, Group::new())
        } else if path.exists() {
            let loaded = persist::read_file(&path, key.as_ref())?;
            (loaded.version, loaded.group)
        } else if options.read_only {
            return Err(Error::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "read-only file does not exist"),
            ));
        } else {
            let group = Group::new();
            persist::write_file(&path, key.as_ref(), 1, &group)?;
            info!(path = %path.display(), "created file");
            (1, group)
        };

        let latest = VersionId(version);
        let mut versions = BTreeMap::new();
        versions.insert(latest, Arc::new(group));
        let file = Arc::new(SharedFile {
            path: path.clone(),
            in_memory: options.in_memory,
            read_only: options.read_only,
            key,
            state: Mutex::new(FileState {
                latest,
                versions,
                logs: BTreeMap::new(),
                pins: HashMap::new(),
                writer: None,
                handles: 0,
            }),
            writer_released: Condvar::new(),
            version_advanced: Condvar::new(),
            notifiers: Mutex::new(Vec::new()),
        });
        open_files.retain(|_, weak| weak.strong_count() > 0);
        open_files.insert(path, Arc::downgrade(&file));
        Ok(file)
    }

    /// Returns true if some handle currently has the path open. A shared
    /// file kept alive only by closed handles or version pins is not open.
    pub fn is_open(path: impl AsRef<Path>, in_memory: bool) -> bool {
        let path = canonical_path(path.as_ref(), in_memory);
        let file = OPEN_FILES.lock().get(&path).and_then(Weak::upgrade);
        file.is_some_and(|file| file.handle_count() > 0)
    }

    /// Returns the number of open `SharedGroup` handles.
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles
    }

    /// Deletes the file at `path` and its temporary sibling. Fails while the
    /// file is open. Returns true if a file was removed.
    pub fn remove_file(path: impl AsRef<Path>) -> Result<bool> {
        let path = canonical_path(path.as_ref(), false);
        {
            let mut open_files = OPEN_FILES.lock();
            let file = open_files.get(&path).and_then(Weak::upgrade);
            if file.is_some_and(|file| file.handle_count() > 0) {
                return Err(Error::illegal_state(format!(
                    "'{}' cannot be deleted while it is open",
                    path.display()
                )));
            }
            // Closed handles must not resurrect the deleted contents.
            open_files.remove(&path);
        }
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        let _ = std::fs::remove_file(path.with_file_name(name));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Returns the canonical path (or in-memory identifier).
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the latest committed version.
    pub fn latest_version(&self) -> VersionId {
        self.state.lock().latest
    }

    /// Returns the latest version and its group.
    pub(crate) fn latest(&self) -> (VersionId, Arc<Group>) {
        let state = self.state.lock();
        let group = state
            .versions
            .get(&state.latest)
            .cloned()
            .unwrap_or_default();
        (state.latest, group)
    }

    /// Returns a retained version.
    pub(crate) fn version(&self, version: VersionId) -> Option<Arc<Group>> {
        self.state.lock().versions.get(&version).cloned()
    }

    /// Records which version a handle reads, keeping it retained.
    pub(crate) fn pin(&self, handle: HandleId, version: VersionId) {
        let mut state = self.state.lock();
        state.pins.insert(handle, version);
        state.prune();
    }

    /// Retains `version` until the returned pin is dropped. Returns `None`
    /// if the version is no longer retained.
    pub fn pin_version(self: &Arc<Self>, version: VersionId) -> Option<VersionPin> {
        let id = next_id();
        {
            let mut state = self.state.lock();
            if !state.versions.contains_key(&version) {
                return None;
            }
            state.pins.insert(id, version);
        }
        Some(VersionPin {
            file: Arc::clone(self),
            id,
            version,
        })
    }

    /// Registers an open handle reading `version`.
    pub(crate) fn attach_handle(&self, handle: HandleId, version: VersionId) {
        let mut state = self.state.lock();
        state.handles += 1;
        state.pins.insert(handle, version);
        state.prune();
    }

    /// Unregisters an open handle, releasing its pin and writer lock.
    pub(crate) fn detach_handle(&self, handle: HandleId) {
        let mut state = self.state.lock();
        state.handles = state.handles.saturating_sub(1);
        drop(state);
        self.unpin(handle);
    }

    /// Releases a handle's pin and, if it holds it, the writer lock.
    pub(crate) fn unpin(&self, handle: HandleId) {
        let mut state = self.state.lock();
        state.pins.remove(&handle);
        if state.writer == Some(handle) {
            state.writer = None;
            self.writer_released.notify_one();
        }
        state.prune();
    }

    /// Blocks until the writer lock is free, then takes it.
    pub(crate) fn acquire_writer(&self, handle: HandleId) -> Result<()> {
        if self.read_only {
            return Err(Error::illegal_state(format!(
                "'{}' was opened read-only",
                self.path.display()
            )));
        }
        let mut state = self.state.lock();
        while state.writer.is_some_and(|w| w != handle) {
            self.writer_released.wait(&mut state);
        }
        state.writer = Some(handle);
        Ok(())
    }

    /// Releases the writer lock without committing.
    pub(crate) fn release_writer(&self, handle: HandleId) {
        let mut state = self.state.lock();
        if state.writer == Some(handle) {
            state.writer = None;
            self.writer_released.notify_one();
        }
    }

    /// Publishes a new version. The group is persisted first; on failure the
    /// version is not published.
    pub(crate) fn commit(&self, handle: HandleId, group: Group, log: ChangeLog) -> Result<VersionId> {
        let version = {
            let mut state = self.state.lock();
            if state.writer != Some(handle) {
                return Err(Error::illegal_state("commit without holding the write lock"));
            }
            let version = VersionId(state.latest.0 + 1);
            if !self.in_memory {
                persist::write_file(&self.path, self.key.as_ref(), version.0, &group)?;
            }
            state.latest = version;
            state.versions.insert(version, Arc::new(group));
            state.logs.insert(version, Arc::new(log));
            state.pins.insert(handle, version);
            state.writer = None;
            state.prune();
            version
        };
        debug!(path = %self.path.display(), %version, "committed");
        self.writer_released.notify_one();
        self.wake_waiters();

        let notifiers: Vec<CommitNotifier> =
            self.notifiers.lock().iter().map(|(_, n)| n.clone()).collect();
        for notify in notifiers {
            notify(version);
        }
        Ok(version)
    }

    /// Merges the logs of every commit in `(from, to]`.
    pub(crate) fn changes_between(&self, from: VersionId, to: VersionId) -> ChangeLog {
        let mut merged = ChangeLog::new();
        if to <= from {
            return merged;
        }
        let state = self.state.lock();
        let mut expected = from.0 + 1;
        for (version, log) in state.logs.range(VersionId(from.0 + 1)..=to) {
            if version.0 != expected {
                // A gap means logs were pruned; report a full change.
                merged.mark_schema_changed();
            }
            merged.merge(log);
            expected = version.0 + 1;
        }
        if expected <= to.0 {
            merged.mark_schema_changed();
        }
        merged
    }

    /// Registers a callback run after every commit.
    pub fn add_notifier(&self, notifier: CommitNotifier) -> NotifierId {
        let id = next_id();
        self.notifiers.lock().push((id, notifier));
        id
    }

    /// Removes a commit callback.
    pub fn remove_notifier(&self, id: NotifierId) {
        self.notifiers.lock().retain(|(n, _)| *n != id);
    }

    /// Blocks until a version newer than `after` is committed or `stop` is
    /// set. Returns true if a newer version exists.
    pub fn wait_for_change(&self, after: VersionId, stop: &AtomicBool) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.latest > after {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.version_advanced.wait(&mut state);
        }
    }

    /// Wakes every thread blocked in `wait_for_change` so it re-checks its
    /// stop flag.
    pub fn wake_waiters(&self) {
        let _state = self.state.lock();
        self.version_advanced.notify_all();
    }

    /// Writes the latest version to `destination` with an optional new key.
    pub fn write_copy(&self, destination: impl AsRef<Path>, key: Option<&[u8]>) -> Result<()> {
        let destination = destination.as_ref();
        if destination.exists() {
            return Err(Error::io(
                destination,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination exists"),
            ));
        }
        let (version, group) = self.latest();
        let key = key.map(persist::fingerprint);
        persist::write_file(destination, key.as_ref(), version.0, &group)
    }

    /// Rewrites the file from the latest version and drops unpinned history.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.prune();
        if self.in_memory {
            return Ok(());
        }
        let latest = state.latest;
        let group = state.versions.get(&latest).cloned().unwrap_or_default();
        persist::write_file(&self.path, self.key.as_ref(), latest.0, &group)?;
        info!(path = %self.path.display(), "compacted");
        Ok(())
    }
}

impl fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFile")
            .field("path", &self.path)
            .field("in_memory", &self.in_memory)
            .finish()
    }
}

/// Keeps one committed version of a file retained, so that a result
/// computed at that version on one thread can be adopted by another.
pub struct VersionPin {
    file: Arc<SharedFile>,
    id: HandleId,
    version: VersionId,
}

impl VersionPin {
    /// Returns the retained version.
    #[inline]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Returns the file the version belongs to.
    #[inline]
    pub fn file(&self) -> &Arc<SharedFile> {
        &self.file
    }
}

impl Drop for VersionPin {
    fn drop(&mut self) {
        self.file.unpin(self.id);
    }
}

impl fmt::Debug for VersionPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionPin")
            .field("path", &self.file.path)
            .field("version", &self.version)
            .finish()
    }
}

/// Resolves the identity of a file: the canonical path for on-disk files
/// (canonicalizing the parent if the file does not exist yet), the raw
/// identifier for in-memory ones.
pub fn canonical_path(path: &Path, in_memory: bool) -> PathBuf {
    if in_memory {
        return PathBuf::from(format!("mem:{}", path.display()));
    }
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}
