//! Storage handle with transaction support.
//!
//! A `SharedGroup` reads one committed version of a shared file and can run
//! one write transaction at a time. Writes happen on a private copy of the
//! group and become visible to other handles only on commit.

use crate::group::Group;
use crate::journal::ChangeLog;
use crate::shared_file::{next_id, FileOptions, HandleId, SharedFile, VersionId, VersionPin};
use crate::table::TableData;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tessel_core::{Error, Result};
use tracing::debug;

/// Transaction state of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Reading a committed version.
    Reading,
    /// A write transaction is active.
    Writing,
    /// The handle was closed.
    Closed,
}

struct WriteTransaction {
    group: Group,
    log: ChangeLog,
}

/// A handle on a shared file.
pub struct SharedGroup {
    file: Arc<SharedFile>,
    id: HandleId,
    version: VersionId,
    snapshot: Arc<Group>,
    write: Option<WriteTransaction>,
    /// Bumped whenever the visible contents change without a version change.
    mutation_seq: u64,
    closed: bool,
}

impl SharedGroup {
    /// Opens a handle on the file at `path`, reading the latest version.
    pub fn open(path: impl AsRef<Path>, options: &FileOptions) -> Result<Self> {
        let file = SharedFile::open(path, options)?;
        Ok(Self::attach(file))
    }

    /// Opens a handle on an already opened shared file.
    pub fn attach(file: Arc<SharedFile>) -> Self {
        let id = next_id();
        let (version, snapshot) = file.latest();
        file.attach_handle(id, version);
        Self {
            file,
            id,
            version,
            snapshot,
            write: None,
            mutation_seq: 0,
            closed: false,
        }
    }

    /// Returns the shared file.
    #[inline]
    pub fn file(&self) -> &Arc<SharedFile> {
        &self.file
    }

    /// Returns the canonical path of the file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        if self.closed {
            TransactionState::Closed
        } else if self.write.is_some() {
            TransactionState::Writing
        } else {
            TransactionState::Reading
        }
    }

    /// Returns true if a write transaction is active.
    #[inline]
    pub fn is_in_transaction(&self) -> bool {
        self.write.is_some()
    }

    /// Returns true if the handle was closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the version this handle reads.
    #[inline]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Returns the newest committed version of the file.
    pub fn latest_version(&self) -> VersionId {
        self.file.latest_version()
    }

    /// Returns a counter that changes whenever visible contents change,
    /// including uncommitted writes of this handle.
    #[inline]
    pub fn mutation_seq(&self) -> u64 {
        self.mutation_seq
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::instance_closed(self.file.path()));
        }
        Ok(())
    }

    /// Returns the group visible to this handle: the transaction's copy while
    /// writing, the pinned version otherwise.
    pub fn read(&self) -> &Group {
        match &self.write {
            Some(tx) => &tx.group,
            None => &self.snapshot,
        }
    }

    /// Gets a table of the visible group.
    pub fn table(&self, name: &str) -> Option<&TableData> {
        self.read().table(name)
    }

    /// Returns the group and change log of the active transaction.
    pub fn write(&mut self) -> Result<(&mut Group, &mut ChangeLog)> {
        self.check_open()?;
        match &mut self.write {
            Some(tx) => {
                self.mutation_seq += 1;
                Ok((&mut tx.group, &mut tx.log))
            }
            None => Err(Error::NotInTransaction),
        }
    }

    /// Begins a write transaction. Blocks until no other handle writes, then
    /// advances to the latest version.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.check_open()?;
        if self.write.is_some() {
            return Err(Error::AlreadyInTransaction);
        }
        self.file.acquire_writer(self.id)?;
        let (latest, group) = self.file.latest();
        self.set_version(latest, group);
        self.write = Some(WriteTransaction {
            group: (*self.snapshot).clone(),
            log: ChangeLog::new(),
        });
        Ok(())
    }

    /// Commits the active transaction and returns the new version. On a
    /// failed commit the transaction is rolled back.
    pub fn commit_transaction(&mut self) -> Result<VersionId> {
        self.check_open()?;
        let tx = self.write.take().ok_or(Error::NotInTransaction)?;
        let snapshot = tx.group.clone();
        match self.file.commit(self.id, tx.group, tx.log) {
            Ok(version) => {
                self.version = version;
                self.snapshot = Arc::new(snapshot);
                self.mutation_seq += 1;
                Ok(version)
            }
            Err(err) => {
                self.file.release_writer(self.id);
                self.mutation_seq += 1;
                Err(err)
            }
        }
    }

    /// Discards the active transaction.
    pub fn cancel_transaction(&mut self) -> Result<()> {
        self.check_open()?;
        if self.write.take().is_none() {
            return Err(Error::NotInTransaction);
        }
        self.file.release_writer(self.id);
        self.mutation_seq += 1;
        Ok(())
    }

    /// Returns the changes committed between two versions.
    pub fn changes_between(&self, from: VersionId, to: VersionId) -> ChangeLog {
        self.file.changes_between(from, to)
    }

    /// Moves the read view to a newer committed version.
    pub fn advance_to_version(&mut self, version: VersionId) -> Result<()> {
        self.check_open()?;
        if self.write.is_some() {
            return Err(Error::illegal_state("cannot advance during a write transaction"));
        }
        if version < self.version {
            return Err(Error::illegal_state(format!(
                "cannot move from {} back to {}",
                self.version, version
            )));
        }
        if version == self.version {
            return Ok(());
        }
        let group = self.file.version(version).ok_or_else(|| {
            Error::illegal_state(format!("{} is no longer retained", version))
        })?;
        self.set_version(version, group);
        Ok(())
    }

    /// Moves the read view to the latest committed version and returns it.
    pub fn advance_to_latest(&mut self) -> Result<VersionId> {
        self.check_open()?;
        if self.write.is_some() {
            return Err(Error::illegal_state("cannot advance during a write transaction"));
        }
        let (latest, group) = self.file.latest();
        self.set_version(latest, group);
        Ok(latest)
    }

    fn set_version(&mut self, version: VersionId, group: Arc<Group>) {
        if version != self.version {
            debug!(path = %self.file.path().display(), from = %self.version, to = %version, "advancing");
            self.version = version;
            self.snapshot = group;
            self.mutation_seq += 1;
            self.file.pin(self.id, version);
        }
    }

    /// Pins the version this handle reads so it stays retained after the
    /// handle closes.
    pub fn pin_current(&self) -> Result<VersionPin> {
        self.check_open()?;
        self.file
            .pin_version(self.version)
            .ok_or_else(|| Error::illegal_state(format!("{} is no longer retained", self.version)))
    }

    /// Blocks until another handle commits a newer version or `stop` is set.
    pub fn wait_for_change(&self, stop: &AtomicBool) -> bool {
        self.file.wait_for_change(self.version, stop)
    }

    /// Writes the latest version to a new file, optionally with a new key.
    pub fn write_copy(&self, destination: impl AsRef<Path>, key: Option<&[u8]>) -> Result<()> {
        self.check_open()?;
        self.file.write_copy(destination, key)
    }

    /// Rewrites the file from the latest version.
    pub fn compact(&self) -> Result<()> {
        self.check_open()?;
        self.file.compact()
    }

    /// Closes the handle, discarding any active transaction.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.write = None;
        self.closed = true;
        self.file.detach_handle(self.id);
    }
}

impl Drop for SharedGroup {
    fn drop(&mut self) {
        self.close();
    }
}
