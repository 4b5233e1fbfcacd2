//! Thread-confined instances.
//!
//! A [`Realm`] is a reference-counted handle on one open file for one
//! thread. Every public entry point checks that it is called on the thread
//! that opened the instance and that the instance is still open; objects,
//! lists and results derived from it carry the same checks.
//!
//! The instance reads one committed version at a time. It moves forward
//! when the thread commits, when [`Realm::refresh`] or
//! [`Realm::wait_for_change`] is called, or (on a thread with a prepared
//! [`Looper`]) when another thread commits. While asynchronous queries are
//! live, remote commits are not adopted directly: the queries are first
//! re-evaluated on a worker, and the instance moves to the version the
//! worker saw once the batch is delivered, so results and the visible
//! version never disagree.

use crate::config::{Configuration, ENCRYPTION_KEY_LEN};
use crate::copy::{copy_object, copy_record};
use crate::executor::{AsyncTask, Executor};
use crate::collection::{self, CollectionState};
use crate::looper::{Looper, Task};
use crate::migration::{Migration, MigrationContext};
use crate::object::{Object, ObjectState};
use crate::query::RealmQuery;
use crate::record::{RealmModel, Record};
use crate::registry::{self, Acquired, SlotKey};
use crate::results::{Results, ResultsState};
use crate::row_ref::Access;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use tessel_core::schema::{ColumnIndices, Property, Schema};
use tessel_core::{Error, ObjKey, Result, Value};
use tessel_query::{Query, QueryBuilder};
use tessel_reactive::{
    BatchId, BatchOutcome, ChangeController, ChangeDecision, ListenerId, ListenerRegistry,
    MailboxSender, WeakRegistry,
};
use tessel_storage::{ChangeLog, Group, NotifierId, SharedFile, SharedGroup, VersionId, VersionPin};
use tracing::{debug, error, info, warn};

/// Callback fired after the instance moved to a newer version.
pub type RealmListener = dyn Fn(&Realm) + Send + Sync;

/// Identifies the exact contents an instance shows: the version it reads
/// and, within a write transaction, how many writes were made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Stamp {
    pub version: VersionId,
    pub seq: u64,
}

/// Mutable state of an instance, guarded by one lock. Collections and
/// objects lock their own data only while this lock is held or not at all,
/// and no callback runs under either.
pub(crate) struct RealmState {
    pub group: SharedGroup,
    pub indices: Arc<ColumnIndices>,
    pub controller: ChangeController,
    pub listeners: ListenerRegistry<RealmListener>,
    pub results: WeakRegistry<ResultsState>,
    pub objects: WeakRegistry<ObjectState>,
    pub lists: WeakRegistry<CollectionState>,
    /// Version listeners last saw; pinned so its change logs stay retained.
    notified: Option<VersionPin>,
    notifier: Option<NotifierId>,
}

impl RealmState {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            version: self.group.version(),
            seq: self.group.mutation_seq(),
        }
    }

    fn rebuild_indices(&mut self) {
        self.indices = Arc::new(stored_indices(self.group.read()));
    }

    fn async_targets(&mut self) -> Vec<AsyncTarget> {
        let mut targets: Vec<AsyncTarget> = self
            .results
            .live()
            .into_iter()
            .filter(|(_, r)| r.is_async())
            .map(|(_, r)| AsyncTarget::Results(r))
            .collect();
        targets.extend(
            self.objects
                .live()
                .into_iter()
                .filter(|(_, o)| o.is_pending())
                .map(|(_, o)| AsyncTarget::Object(o)),
        );
        targets
    }

    fn refresh_unloaded(&mut self) {
        let unloaded = self
            .async_targets()
            .iter()
            .filter(|t| !t.is_loaded())
            .count();
        self.controller.set_unloaded(unloaded);
    }
}

fn stored_indices(group: &Group) -> ColumnIndices {
    ColumnIndices::build(&group.schema(), group.schema_version().unwrap_or(0))
}

/// Something an asynchronous query fills in.
#[derive(Clone)]
pub(crate) enum AsyncTarget {
    Results(Arc<ResultsState>),
    Object(Arc<ObjectState>),
}

enum WeakTarget {
    Results(Weak<ResultsState>),
    Object(Weak<ObjectState>),
}

/// Result of evaluating one target on a worker.
pub(crate) enum Answer {
    Keys(Vec<ObjKey>),
    First(Option<ObjKey>),
}

impl AsyncTarget {
    fn is_loaded(&self) -> bool {
        match self {
            AsyncTarget::Results(r) => r.is_loaded(),
            AsyncTarget::Object(o) => !o.is_pending(),
        }
    }

    fn request_seq(&self) -> u64 {
        match self {
            AsyncTarget::Results(r) => r.request_seq(),
            AsyncTarget::Object(o) => o.request_seq(),
        }
    }

    fn query(&self) -> Option<Query> {
        match self {
            AsyncTarget::Results(r) => Some(r.query().clone()),
            AsyncTarget::Object(o) => o.pending_query(),
        }
    }

    fn begin_request(&self) -> u64 {
        match self {
            AsyncTarget::Results(r) => r.begin_request(),
            AsyncTarget::Object(o) => o.begin_request(),
        }
    }

    fn adopt(&self, answer: Answer, stamp: Option<Stamp>, access: Access) {
        match (self, answer) {
            (AsyncTarget::Results(r), Answer::Keys(keys)) => r.adopt(keys, stamp),
            (AsyncTarget::Object(o), Answer::First(key)) => o.adopt(key, access),
            _ => {}
        }
    }

    fn downgrade(&self) -> WeakTarget {
        match self {
            AsyncTarget::Results(r) => WeakTarget::Results(Arc::downgrade(r)),
            AsyncTarget::Object(o) => WeakTarget::Object(Arc::downgrade(o)),
        }
    }
}

impl WeakTarget {
    fn upgrade(&self) -> Option<AsyncTarget> {
        match self {
            WeakTarget::Results(r) => r.upgrade().map(AsyncTarget::Results),
            WeakTarget::Object(o) => o.upgrade().map(AsyncTarget::Object),
        }
    }

    fn wants_first(&self) -> bool {
        matches!(self, WeakTarget::Object(_))
    }
}

struct Request {
    target: WeakTarget,
    seq: u64,
    query: Query,
}

/// Evaluates `query` the way a live collection does: a vanished source
/// (a deleted list owner or backlink target) yields nothing.
pub(crate) fn evaluate_keys(query: &Query, group: &Group) -> Result<Vec<ObjKey>> {
    if !query.is_source_valid(group) {
        return Ok(Vec::new());
    }
    query.execute(group)
}

/// Runs `f` against the latest version of `file` through a short-lived
/// handle, and pins that version so the origin thread can move to it.
fn evaluate_on_worker<T>(file: Arc<SharedFile>, f: impl FnOnce(&Group) -> Result<T>) -> Result<(T, VersionPin)> {
    let mut group = SharedGroup::attach(file);
    let value = f(group.read())?;
    let pin = group.pin_current()?;
    group.close();
    Ok((value, pin))
}

fn into_background(err: Error) -> Error {
    if err.background_cause().is_some() {
        err
    } else {
        Error::background(err)
    }
}

fn no_looper(what: &str) -> Error {
    Error::illegal_state(format!("{} needs a looper on the calling thread", what))
}

/// Shared part of an instance. `Realm` handles, objects and collections all
/// hold it through an `Arc`.
pub(crate) struct RealmInner {
    config: Configuration,
    path: PathBuf,
    owner: ThreadId,
    dynamic: bool,
    file: Arc<SharedFile>,
    executor: Arc<Executor>,
    mailbox: Option<MailboxSender<Task>>,
    closed: AtomicBool,
    stop_wait: Arc<AtomicBool>,
    state: Mutex<RealmState>,
}

impl RealmInner {
    fn open(
        config: &Configuration,
        path: PathBuf,
        dynamic: bool,
        executor: Arc<Executor>,
        validated: Option<(u64, Arc<ColumnIndices>)>,
    ) -> Result<Arc<Self>> {
        let group = SharedGroup::open(config.path(), &config.file_options())?;
        let file = Arc::clone(group.file());
        let indices = Arc::new(stored_indices(group.read()));
        let inner = Arc::new(RealmInner {
            config: config.clone(),
            path,
            owner: std::thread::current().id(),
            dynamic,
            file,
            executor,
            mailbox: Looper::sender(),
            closed: AtomicBool::new(false),
            stop_wait: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RealmState {
                group,
                indices,
                controller: ChangeController::new(),
                listeners: ListenerRegistry::new(),
                results: WeakRegistry::new(),
                objects: WeakRegistry::new(),
                lists: WeakRegistry::new(),
                notified: None,
                notifier: None,
            }),
        });
        if !dynamic {
            inner.prepare_schema(validated)?;
        }

        let mut state = inner.state.lock();
        state.notified = Some(state.group.pin_current()?);
        if let Some(mailbox) = &inner.mailbox {
            let mailbox = mailbox.clone();
            state.notifier = Some(inner.file.add_notifier(Arc::new(move |_version| {
                mailbox.signal_version_changed();
            })));
        }
        debug!(path = %inner.path.display(), dynamic, version = %state.group.version(), "opened instance");
        drop(state);
        Ok(inner)
    }

    /// Thread first, then liveness.
    pub(crate) fn check(&self) -> Result<()> {
        let current = std::thread::current().id();
        if current != self.owner {
            return Err(Error::wrong_thread(format!(
                "'{}' was opened on {:?} and used from {:?}",
                self.path.display(),
                self.owner,
                current
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::instance_closed(&self.path));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Dynamic instances re-validate columns on every access.
    #[inline]
    pub(crate) fn access(&self) -> Access {
        if self.dynamic {
            Access::Checked
        } else {
            Access::Unchecked
        }
    }

    #[inline]
    pub(crate) fn has_looper(&self) -> bool {
        self.mailbox.is_some()
    }

    /// Locks the state after checking thread and liveness.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, RealmState>> {
        self.check()?;
        Ok(self.state.lock())
    }

    /// Runs a read against the visible group.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Group, &Arc<ColumnIndices>) -> Result<T>) -> Result<T> {
        let state = self.lock()?;
        f(state.group.read(), &state.indices)
    }

    /// Runs a write inside the active transaction.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&mut Group, &mut ChangeLog, &ColumnIndices) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock()?;
        let indices = Arc::clone(&state.indices);
        let (group, log) = state.group.write()?;
        f(group, log, &indices)
    }

    fn view(self: &Arc<Self>) -> Realm {
        Realm::view(Arc::clone(self))
    }

    // ---- schema ----

    fn validate_schema(&self, group: &Group) -> Result<()> {
        let mut problems = Vec::new();
        for expected in self.config.schema() {
            match group.table(expected.name()) {
                None => problems.push(format!("class '{}' is missing", expected.name())),
                Some(table) => problems.extend(table.schema().differences(expected)),
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::schema_mismatch(problems.join("; ")))
        }
    }

    /// Brings the stored schema in line with the configuration.
    fn prepare_schema(self: &Arc<Self>, validated: Option<(u64, Arc<ColumnIndices>)>) -> Result<()> {
        let required = self.config.schema_version();
        let stored = self.state.lock().group.read().schema_version();
        if let (Some((version, indices)), Some(stored)) = (&validated, stored) {
            if *version == stored && stored == required {
                self.state.lock().indices = Arc::clone(indices);
                return Ok(());
            }
        }

        let stored = match stored {
            Some(v) => Some(v),
            None => self.create_schema(false)?,
        };
        match stored {
            None => {}
            Some(stored) if stored > required => {
                return Err(Error::invalid_argument(format!(
                    "'{}' has schema version {}, newer than the configured {}",
                    self.path.display(),
                    stored,
                    required
                )))
            }
            Some(stored) if stored == required => {
                let valid = self.validate_schema(self.state.lock().group.read());
                if let Err(err) = valid {
                    if !self.config.delete_if_migration_needed() {
                        return Err(err);
                    }
                    self.create_schema(true)?;
                }
            }
            Some(stored) => {
                if self.config.is_read_only() {
                    return Err(Error::MigrationRequired {
                        path: self.path.clone(),
                        stored: Some(stored),
                        required,
                    });
                }
                if let Some(migration) = self.config.migration() {
                    self.migrate(migration.as_ref(), stored, required)?;
                } else if self.config.delete_if_migration_needed() {
                    self.create_schema(true)?;
                } else {
                    return Err(Error::MigrationRequired {
                        path: self.path.clone(),
                        stored: Some(stored),
                        required,
                    });
                }
            }
        }

        let indices = {
            let mut state = self.state.lock();
            state.rebuild_indices();
            Arc::clone(&state.indices)
        };
        registry::store_validated(&self.path, required, indices);
        Ok(())
    }

    /// Creates the declared classes and runs the initial data callback.
    /// With `wipe` the stored contents are discarded first. Returns the
    /// stored version instead if another thread created the schema first.
    fn create_schema(self: &Arc<Self>, wipe: bool) -> Result<Option<u64>> {
        if self.config.is_read_only() {
            return Err(Error::MigrationRequired {
                path: self.path.clone(),
                stored: None,
                required: self.config.schema_version(),
            });
        }
        {
            let mut state = self.state.lock();
            state.group.begin_transaction()?;
            if !wipe {
                if let Some(existing) = state.group.read().schema_version() {
                    state.group.cancel_transaction()?;
                    return Ok(Some(existing));
                }
            }
            let created = self.add_declared_classes(&mut state, wipe);
            if let Err(err) = created {
                state.group.cancel_transaction()?;
                return Err(err);
            }
            state.rebuild_indices();
        }

        if let Some(initial) = self.config.initial_data() {
            if let Err(err) = initial(&self.view()) {
                let mut state = self.state.lock();
                if state.group.is_in_transaction() {
                    state.group.cancel_transaction()?;
                }
                return Err(err);
            }
        }

        let version = self.state.lock().group.commit_transaction()?;
        if wipe {
            info!(path = %self.path.display(), %version, "schema reset after a version change");
        } else {
            info!(path = %self.path.display(), %version, "schema created");
        }
        Ok(None)
    }

    fn add_declared_classes(&self, state: &mut RealmState, wipe: bool) -> Result<()> {
        let (group, log) = state.group.write()?;
        if wipe {
            *group = Group::new();
            log.mark_schema_changed();
        }
        for class in self.config.schema() {
            match group.table(class.name()) {
                Some(table) => {
                    let differences = table.schema().differences(class);
                    if !differences.is_empty() {
                        return Err(Error::schema_mismatch(differences.join("; ")));
                    }
                }
                None => group.add_table(class.clone(), log)?,
            }
        }
        group.set_schema_version(self.config.schema_version(), log);
        Ok(())
    }

    fn migrate(&self, migration: &dyn Migration, from: u64, to: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.group.begin_transaction()?;
        let outcome = (|| -> Result<()> {
            let (group, log) = state.group.write()?;
            migration.migrate(&mut MigrationContext::new(group, log), from, to)?;
            self.validate_schema(group)?;
            group.set_schema_version(to, log);
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                state.group.commit_transaction()?;
                info!(path = %self.path.display(), from, to, "migrated");
                Ok(())
            }
            Err(err) => {
                state.group.cancel_transaction()?;
                warn!(path = %self.path.display(), from, to, error = %err, "migration failed, schema version left unchanged");
                Err(err)
            }
        }
    }

    // ---- change propagation ----

    /// Handles a "version changed" signal from the looper.
    pub(crate) fn on_version_changed(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let batch = {
            let mut state = self.state.lock();
            if state.group.is_in_transaction() || state.group.is_closed() {
                return Ok(());
            }
            if state.group.latest_version() <= state.group.version() {
                None
            } else {
                let targets = state.async_targets();
                state.refresh_unloaded();
                match state.controller.on_change(!targets.is_empty()) {
                    ChangeDecision::AdvanceNow => {
                        state.group.advance_to_latest()?;
                        None
                    }
                    ChangeDecision::SubmitBatch(id) => Some((id, targets)),
                    ChangeDecision::Coalesced => return Ok(()),
                }
            }
        };
        match batch {
            Some((id, targets)) => self.submit_batch(id, targets),
            None => self.send_notifications(),
        }
    }

    fn submit_batch(self: &Arc<Self>, id: BatchId, targets: Vec<AsyncTarget>) -> Result<()> {
        let requests: Vec<Request> = targets
            .iter()
            .filter_map(|target| {
                let query = target.query()?;
                Some(Request {
                    target: target.downgrade(),
                    seq: target.begin_request(),
                    query,
                })
            })
            .collect();
        self.submit_requests(Some(id), requests)
    }

    /// Starts background evaluation of one target.
    pub(crate) fn request(self: &Arc<Self>, target: AsyncTarget) -> Result<()> {
        self.check()?;
        let Some(query) = target.query() else {
            return Ok(());
        };
        let request = Request {
            target: target.downgrade(),
            seq: target.begin_request(),
            query,
        };
        {
            let mut state = self.state.lock();
            match &target {
                AsyncTarget::Results(r) => {
                    state.results.register(r);
                }
                AsyncTarget::Object(o) => {
                    state.objects.register(o);
                }
            }
            state.refresh_unloaded();
        }
        self.submit_requests(None, vec![request])
    }

    fn submit_requests(self: &Arc<Self>, batch: Option<BatchId>, requests: Vec<Request>) -> Result<()> {
        let mailbox = self.mailbox.clone().ok_or_else(|| no_looper("asynchronous evaluation"))?;
        let file = Arc::clone(&self.file);
        let origin = Arc::downgrade(self);
        let failure_mailbox = mailbox.clone();
        let failure_origin = origin.clone();
        let label = if batch.is_some() { "batch re-evaluation" } else { "async query" };

        self.executor.submit(
            label,
            move |_task| {
                let outcome = evaluate_on_worker(file, |group| {
                    requests
                        .iter()
                        .map(|r| {
                            if r.target.wants_first() {
                                if !r.query.is_source_valid(group) {
                                    return Ok(Answer::First(None));
                                }
                                r.query.find_first(group).map(Answer::First)
                            } else {
                                evaluate_keys(&r.query, group).map(Answer::Keys)
                            }
                        })
                        .collect::<Result<Vec<_>>>()
                });
                let posted = mailbox.post(Box::new(move || match origin.upgrade() {
                    Some(inner) => inner.deliver(batch, requests, outcome),
                    None => Ok(()),
                }));
                if !posted {
                    debug!(task = label, "origin thread is gone, dropping results");
                }
            },
            Some(Box::new(move |err: Error| {
                failure_mailbox.post(Box::new(move || match failure_origin.upgrade() {
                    Some(inner) => inner.deliver(batch, Vec::new(), Err(err)),
                    None => Ok(()),
                }));
            })),
        );
        Ok(())
    }

    /// Applies worker results on the origin thread. A result is adopted iff
    /// it was computed at a version no older than the one the instance
    /// reads and it answers the most recent request for its target.
    fn deliver(
        self: &Arc<Self>,
        batch: Option<BatchId>,
        requests: Vec<Request>,
        outcome: Result<(Vec<Answer>, VersionPin)>,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut retry = Vec::new();
        let rerun;
        {
            let mut state = self.state.lock();
            if state.group.is_closed() {
                return Ok(());
            }
            let (answers, pin) = match outcome {
                Ok(delivered) => delivered,
                Err(err) => {
                    let rerun = batch.is_some() && state.controller.abandon_batch();
                    state.refresh_unloaded();
                    drop(state);
                    if rerun {
                        self.on_version_changed()?;
                    }
                    return Err(into_background(err));
                }
            };
            let worker = pin.version();
            let caller = state.group.version();
            let adopt = match batch {
                Some(id) => {
                    let resolution = state.controller.on_batch_delivered(id, worker, caller);
                    rerun = resolution.rerun;
                    resolution.outcome == BatchOutcome::Adopt
                }
                None => {
                    rerun = false;
                    worker >= caller
                }
            };
            if adopt && worker > caller {
                state.group.advance_to_version(worker)?;
            }
            // Inside a transaction the answers lack the uncommitted writes.
            let stamp = (!state.group.is_in_transaction()).then(|| state.stamp());
            for (request, answer) in requests.into_iter().zip(answers) {
                let Some(target) = request.target.upgrade() else {
                    continue;
                };
                let latest = target.request_seq();
                if adopt && ChangeController::accepts(worker, caller, request.seq, latest) {
                    target.adopt(answer, stamp, self.access());
                } else {
                    debug!(seq = request.seq, latest, %worker, %caller, "discarding superseded result");
                    if request.seq == latest && !target.is_loaded() {
                        retry.push(target);
                    }
                }
            }
            state.refresh_unloaded();
        }
        for target in retry {
            self.request(target)?;
        }
        self.send_notifications()?;
        if rerun {
            self.on_version_changed()?;
        }
        Ok(())
    }

    /// Moves to the latest version right away and notifies.
    pub(crate) fn refresh(self: &Arc<Self>) -> Result<bool> {
        let advanced = {
            let mut state = self.lock()?;
            if state.group.is_in_transaction() {
                return Ok(false);
            }
            let before = state.group.version();
            state.group.advance_to_latest()? > before
        };
        self.send_notifications()?;
        Ok(advanced)
    }

    /// Fires every listener whose data changed since the last notification.
    /// Change sets are computed under the lock; callbacks run after it is
    /// released, global listeners first.
    pub(crate) fn send_notifications(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let (global, results, lists, objects) = {
            let mut state = self.state.lock();
            if state.group.is_in_transaction() || state.group.is_closed() {
                return Ok(());
            }
            let Some(notified) = state.notified.as_ref().map(VersionPin::version) else {
                return Ok(());
            };
            let current = state.group.version();
            let log = state.group.changes_between(notified, current);
            if log.schema_changed() {
                state.rebuild_indices();
            }
            let global = if current > notified {
                state.notified = Some(state.group.pin_current()?);
                state.listeners.snapshot()
            } else {
                Vec::new()
            };

            let mut results = Vec::new();
            for (_, target) in state.results.live() {
                match target.pending_notification(&state, &log) {
                    Ok(Some(pending)) => results.push((target, pending)),
                    Ok(None) => {}
                    Err(err) => warn!(class = target.query().class(), error = %err, "skipping results notification"),
                }
            }
            let mut lists = Vec::new();
            for (_, target) in state.lists.live() {
                if let Some(pending) = target.pending_notification(&state, &log) {
                    lists.push((target, pending));
                }
            }
            let mut objects = Vec::new();
            for (_, target) in state.objects.live() {
                if let Some(pending) = target.pending_notification(&state, &log) {
                    objects.push((target, pending));
                }
            }
            (global, results, lists, objects)
        };

        if !global.is_empty() {
            let realm = self.view();
            for listener in global {
                listener(&realm);
            }
        }
        for (target, (listeners, changes)) in results {
            let handle = Results::from_state(Arc::clone(self), target);
            for listener in listeners {
                listener(&handle, &changes);
            }
        }
        for (target, pending) in lists {
            collection::fire(self, target, pending);
        }
        for (target, (listeners, changes)) in objects {
            let handle = Object::from_state(Arc::clone(self), target);
            for listener in listeners {
                listener(&handle, &changes);
            }
        }
        Ok(())
    }

    /// Tears the instance down after its last handle was released.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_wait.store(true, Ordering::Release);
        self.file.wake_waiters();
        let mut state = self.state.lock();
        if let Some(id) = state.notifier.take() {
            self.file.remove_notifier(id);
        }
        if state.group.is_in_transaction() {
            warn!(path = %self.path.display(), "closing with an open write transaction, rolling back");
        }
        state.notified = None;
        state.listeners.clear();
        state.results.clear();
        state.objects.clear();
        state.lists.clear();
        state.group.close();
        debug!(path = %self.path.display(), "instance closed");
    }
}

impl Drop for RealmInner {
    fn drop(&mut self) {
        if let Some(id) = self.state.get_mut().notifier.take() {
            self.file.remove_notifier(id);
        }
    }
}

/// Wakes a thread blocked in [`Realm::wait_for_change`]. Can be sent to and
/// used from any thread.
#[derive(Clone)]
pub struct WaitStopper {
    flag: Arc<AtomicBool>,
    file: Arc<SharedFile>,
}

impl WaitStopper {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        self.file.wake_waiters();
    }
}

impl fmt::Debug for WaitStopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitStopper").field("file", &self.file.path()).finish()
    }
}

/// Handle on an open file, confined to the thread that opened it.
///
/// Handles returned by [`Realm::get_instance`] are counted: opening the same
/// file again on the same thread returns another handle on the same
/// instance, and the instance closes when every handle was closed.
pub struct Realm {
    inner: Arc<RealmInner>,
    counted: bool,
    released: bool,
}

impl Realm {
    /// Opens a typed instance: the stored schema is created, validated or
    /// migrated to match `config`.
    pub fn get_instance(config: &Configuration) -> Result<Realm> {
        Self::open(config, false)
    }

    /// Opens a dynamic instance that uses whatever schema is stored.
    pub fn get_dynamic_instance(config: &Configuration) -> Result<Realm> {
        Self::open(config, true)
    }

    fn open(config: &Configuration, dynamic: bool) -> Result<Realm> {
        let path = config.canonical_path();
        let slot = SlotKey {
            thread: std::thread::current().id(),
            dynamic,
        };
        match registry::acquire(&path, slot, config)? {
            Acquired::Existing(inner) => Ok(Realm {
                inner,
                counted: true,
                released: false,
            }),
            Acquired::New { executor, validated } => {
                match RealmInner::open(config, path.clone(), dynamic, executor, validated) {
                    Ok(inner) => {
                        registry::insert(&path, slot, &inner, (!dynamic).then(|| config.schema_version()));
                        Looper::attach(&inner);
                        Ok(Realm {
                            inner,
                            counted: true,
                            released: false,
                        })
                    }
                    Err(err) => {
                        registry::abandon(&path);
                        Err(err)
                    }
                }
            }
        }
    }

    /// An uncounted handle, handed to listeners and callbacks.
    pub(crate) fn view(inner: Arc<RealmInner>) -> Realm {
        Realm {
            inner,
            counted: false,
            released: false,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RealmInner> {
        &self.inner
    }

    fn check(&self) -> Result<()> {
        self.inner.check()?;
        if self.released {
            return Err(Error::instance_closed(&self.inner.path));
        }
        Ok(())
    }

    // The accessors below read fixed metadata and may be called from any
    // thread, like the stopper.

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    /// Canonical path (or in-memory identifier) of the file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// True once this handle or the whole instance was closed. Never fails,
    /// so a closed or foreign handle can be inspected safely.
    pub fn is_closed(&self) -> bool {
        self.released || self.inner.is_closed()
    }

    pub fn is_dynamic(&self) -> bool {
        self.inner.dynamic
    }

    /// Version this instance reads.
    pub fn version(&self) -> Result<VersionId> {
        self.check()?;
        Ok(self.inner.state.lock().group.version())
    }

    /// Schema as stored in the file.
    pub fn schema(&self) -> Result<Schema> {
        self.check()?;
        Ok(self.inner.state.lock().group.read().schema())
    }

    /// Releases this handle. The instance closes with its last handle.
    /// Closing twice is a no-op; closing a handle given to a listener is an
    /// error.
    pub fn close(&mut self) -> Result<()> {
        self.inner.check().or_else(|err| match err {
            Error::InstanceClosed { .. } => Ok(()),
            err => Err(err),
        })?;
        if !self.counted {
            return Err(Error::illegal_state("only handles returned by get_instance can be closed"));
        }
        if self.released {
            return Ok(());
        }
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
        let slot = SlotKey {
            thread: self.inner.owner,
            dynamic: self.inner.dynamic,
        };
        if registry::release(&self.inner.path, slot) {
            self.inner.shutdown();
        }
    }

    // ---- transactions ----

    /// Begins a write transaction, blocking while another thread writes.
    /// The instance moves to the latest version first.
    pub fn begin_transaction(&self) -> Result<()> {
        self.check()?;
        self.inner.state.lock().group.begin_transaction()
    }

    /// Commits and notifies this thread's listeners before returning.
    pub fn commit_transaction(&self) -> Result<()> {
        self.check()?;
        self.inner.state.lock().group.commit_transaction()?;
        self.inner.send_notifications()
    }

    /// Rolls back the active transaction.
    pub fn cancel_transaction(&self) -> Result<()> {
        self.check()?;
        self.inner.state.lock().group.cancel_transaction()?;
        self.inner.send_notifications()
    }

    pub fn is_in_transaction(&self) -> Result<bool> {
        self.check()?;
        Ok(self.inner.state.lock().group.is_in_transaction())
    }

    /// Runs `transaction` inside a write transaction, committing on success
    /// and rolling back on error.
    pub fn execute_transaction<F>(&self, transaction: F) -> Result<()>
    where
        F: FnOnce(&Realm) -> Result<()>,
    {
        self.begin_transaction()?;
        match transaction(self) {
            Ok(()) => self.commit_transaction(),
            Err(err) => {
                if self.is_in_transaction()? {
                    self.cancel_transaction()?;
                }
                Err(err)
            }
        }
    }

    /// Runs `transaction` on a worker with its own instance. Failures are
    /// logged, or raised from [`Looper::poll`] when the calling thread has
    /// a looper.
    pub fn execute_transaction_async<F>(&self, transaction: F) -> Result<AsyncTask>
    where
        F: FnOnce(&Realm) -> Result<()> + Send + 'static,
    {
        self.submit_transaction(Box::new(transaction), None, None)
    }

    /// Like [`Realm::execute_transaction_async`], with callbacks run on the
    /// calling thread's looper after the instance moved past the commit.
    /// A cancelled transaction runs neither callback.
    pub fn execute_transaction_async_with<F, S, E>(&self, transaction: F, on_success: S, on_error: E) -> Result<AsyncTask>
    where
        F: FnOnce(&Realm) -> Result<()> + Send + 'static,
        S: FnOnce() + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.submit_transaction(Box::new(transaction), Some(Box::new(on_success)), Some(Box::new(on_error)))
    }

    #[allow(clippy::type_complexity)]
    fn submit_transaction(
        &self,
        transaction: Box<dyn FnOnce(&Realm) -> Result<()> + Send>,
        on_success: Option<Box<dyn FnOnce() + Send>>,
        on_error: Option<Box<dyn FnOnce(Error) + Send>>,
    ) -> Result<AsyncTask> {
        self.check()?;
        let mailbox = self.inner.mailbox.clone();
        if mailbox.is_none() && (on_success.is_some() || on_error.is_some()) {
            return Err(no_looper("transaction callbacks"));
        }
        let config = self.inner.config.clone();
        let dynamic = self.inner.dynamic;
        let origin = Arc::downgrade(&self.inner);
        let on_error = Arc::new(Mutex::new(on_error));
        let failure_handler = Arc::clone(&on_error);
        let failure_mailbox = mailbox.clone();

        let task = self.inner.executor.submit(
            "async transaction",
            move |task| {
                let outcome = run_transaction(&config, dynamic, task, transaction);
                if matches!(outcome, Err(Error::Cancelled)) {
                    debug!(path = %config.path().display(), "async transaction cancelled");
                    return;
                }
                match mailbox {
                    Some(mailbox) => {
                        mailbox.post(Box::new(move || {
                            if outcome.is_ok() {
                                if let Some(inner) = origin.upgrade() {
                                    if !inner.is_closed() {
                                        inner.refresh()?;
                                    }
                                }
                            }
                            match outcome {
                                Ok(()) => {
                                    if let Some(callback) = on_success {
                                        callback();
                                    }
                                    Ok(())
                                }
                                Err(err) => match on_error.lock().take() {
                                    Some(callback) => {
                                        callback(err);
                                        Ok(())
                                    }
                                    None => Err(Error::background(err)),
                                },
                            }
                        }));
                    }
                    None => {
                        if let Err(err) = outcome {
                            error!(path = %config.path().display(), error = %err, "async transaction failed");
                        }
                    }
                }
            },
            Some(Box::new(move |err: Error| {
                if let Some(mailbox) = failure_mailbox {
                    mailbox.post(Box::new(move || match failure_handler.lock().take() {
                        Some(callback) => {
                            callback(err);
                            Ok(())
                        }
                        None => Err(Error::background(err)),
                    }));
                }
            })),
        );
        Ok(task)
    }

    // ---- objects ----

    /// Creates an object of a class without a primary key.
    pub fn create_object(&self, class: &str) -> Result<Object> {
        let key = self.inner.write(|group, log, indices| {
            let columns = indices.require_class(class)?;
            if let Some(pk) = columns.primary_key() {
                return Err(Error::invalid_argument(format!(
                    "'{}' has primary key '{}'; use create_object_with_primary_key",
                    class, pk.name
                )));
            }
            let values = default_values(group, class)?;
            group.create_object(class, values, log)
        })?;
        Ok(Object::attached(Arc::clone(&self.inner), class, key))
    }

    /// Creates an object with the given primary key value.
    pub fn create_object_with_primary_key(&self, class: &str, primary_key: impl Into<Value>) -> Result<Object> {
        let primary_key = primary_key.into();
        let key = self.inner.write(|group, log, indices| {
            let columns = indices.require_class(class)?;
            let pk = columns
                .primary_key()
                .ok_or_else(|| Error::invalid_argument(format!("'{}' has no primary key", class)))?;
            let mut values = default_values(group, class)?;
            values[pk.key.index()] = primary_key;
            group.create_object(class, values, log)
        })?;
        Ok(Object::attached(Arc::clone(&self.inner), class, key))
    }

    /// Stores a record and the records nested in it. Fails if an object
    /// with the record's primary key exists; nested records with existing
    /// primary keys are merged.
    pub fn copy_to_realm(&self, record: &Record) -> Result<Object> {
        self.copy_in(record, false)
    }

    /// Stores a record, merging it into an existing object with the same
    /// primary key.
    pub fn copy_to_realm_or_update(&self, record: &Record) -> Result<Object> {
        self.copy_in(record, true)
    }

    fn copy_in(&self, record: &Record, update: bool) -> Result<Object> {
        let key = self
            .inner
            .write(|group, log, indices| copy_record(group, log, indices, record, update))?;
        Ok(Object::attached(Arc::clone(&self.inner), record.class(), key))
    }

    pub fn insert_model<T: RealmModel>(&self, model: &T) -> Result<Object> {
        self.copy_to_realm(&model.to_record())
    }

    pub fn insert_or_update_model<T: RealmModel>(&self, model: &T) -> Result<Object> {
        self.copy_to_realm_or_update(&model.to_record())
    }

    /// Detached copy of `object`, following links `depth` levels deep.
    pub fn copy_from_realm(&self, object: &Object, depth: usize) -> Result<Record> {
        self.check()?;
        if !Arc::ptr_eq(object.inner(), &self.inner) {
            return Err(Error::cross_instance("the object belongs to another instance"));
        }
        let key = object.key()?;
        self.inner
            .read(|group, indices| copy_object(group, indices, object.class(), key, depth))
    }

    pub fn copy_model_from_realm<T: RealmModel>(&self, object: &Object, depth: usize) -> Result<T> {
        T::from_record(&self.copy_from_realm(object, depth)?)
    }

    // ---- queries ----

    /// Starts a query over every object of `class`.
    pub fn where_(&self, class: &str) -> Result<RealmQuery> {
        self.check()?;
        let indices = Arc::clone(&self.inner.state.lock().indices);
        Ok(RealmQuery::new(Arc::clone(&self.inner), QueryBuilder::new(indices, class)?))
    }

    pub fn where_model<T: RealmModel>(&self) -> Result<RealmQuery> {
        self.where_(&T::class_name()?)
    }

    /// Every object of `class`, as live results.
    pub fn all_objects(&self, class: &str) -> Result<Results> {
        self.where_(class)?.find_all()
    }

    pub fn object_for_primary_key(&self, class: &str, value: impl Into<Value>) -> Result<Option<Object>> {
        let value = value.into();
        let key = self.inner.read(|group, indices| {
            let columns = indices.require_class(class)?;
            let pk = columns
                .primary_key()
                .ok_or_else(|| Error::invalid_argument(format!("'{}' has no primary key", class)))?;
            if !value.fits(pk.col_type.data_type) {
                return Err(Error::type_mismatch(&pk.name, pk.col_type, value.type_name()));
            }
            Ok(group.require_table(class)?.find_by_primary_key(&value))
        })?;
        Ok(key.map(|key| Object::attached(Arc::clone(&self.inner), class, key)))
    }

    /// Deletes every object of every class.
    pub fn delete_all(&self) -> Result<()> {
        self.inner.write(|group, log, _| {
            let classes: Vec<String> = group.table_names().map(str::to_string).collect();
            for class in classes {
                group.clear_table(&class, log)?;
            }
            Ok(())
        })
    }

    /// Deletes every object of `class`.
    pub fn delete_all_of(&self, class: &str) -> Result<()> {
        self.inner.write(|group, log, indices| {
            indices.require_class(class)?;
            group.clear_table(class, log)
        })
    }

    /// Edits the stored schema of a dynamic instance inside a write
    /// transaction.
    pub fn update_schema<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut MigrationContext<'_>) -> Result<()>,
    {
        self.check()?;
        if !self.inner.dynamic {
            return Err(Error::unsupported("only dynamic instances can edit the schema"));
        }
        let mut state = self.inner.state.lock();
        let (group, log) = state.group.write()?;
        edit(&mut MigrationContext::new(group, log))?;
        state.rebuild_indices();
        Ok(())
    }

    // ---- listeners ----

    /// Adds a listener fired after the instance moved to a newer version.
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Realm) + Send + Sync + 'static,
    {
        self.check()?;
        Ok(self.inner.state.lock().listeners.subscribe(Arc::new(listener)))
    }

    /// Adds a listener that is dropped once the caller drops its `Arc`.
    pub fn add_weak_change_listener(&self, listener: &Arc<RealmListener>) -> Result<ListenerId> {
        self.check()?;
        Ok(self.inner.state.lock().listeners.subscribe_weak(listener))
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<bool> {
        self.check()?;
        Ok(self.inner.state.lock().listeners.unsubscribe(id))
    }

    pub fn remove_all_change_listeners(&self) -> Result<()> {
        self.check()?;
        self.inner.state.lock().listeners.clear();
        Ok(())
    }

    // ---- refresh and waiting ----

    /// Moves to the latest version and fires listeners. Returns whether the
    /// version changed.
    pub fn refresh(&self) -> Result<bool> {
        self.check()?;
        if self.inner.state.lock().group.is_in_transaction() {
            return Err(Error::illegal_state("cannot refresh inside a write transaction"));
        }
        self.inner.refresh()
    }

    /// Blocks until another thread commits or the wait is stopped, then
    /// refreshes. Returns false if the wait was stopped. Not available on a
    /// thread with a looper, which refreshes on its own.
    pub fn wait_for_change(&self) -> Result<bool> {
        self.check()?;
        if self.inner.has_looper() {
            return Err(Error::illegal_state("cannot wait for changes on a thread with a looper"));
        }
        let version = {
            let state = self.inner.state.lock();
            if state.group.is_in_transaction() {
                return Err(Error::illegal_state("cannot wait for changes inside a write transaction"));
            }
            state.group.version()
        };
        let changed = self.inner.file.wait_for_change(version, &self.inner.stop_wait);
        self.inner.stop_wait.store(false, Ordering::Release);
        if changed && !self.inner.is_closed() {
            self.inner.refresh()?;
        }
        Ok(changed)
    }

    /// Stops a pending [`Realm::wait_for_change`].
    pub fn stop_wait_for_change(&self) {
        self.stopper().stop();
    }

    /// Returns a handle that stops [`Realm::wait_for_change`] from another
    /// thread.
    pub fn stopper(&self) -> WaitStopper {
        WaitStopper {
            flag: Arc::clone(&self.inner.stop_wait),
            file: Arc::clone(&self.inner.file),
        }
    }

    // ---- files ----

    /// Writes the latest version to `destination`, optionally under a new
    /// encryption key.
    pub fn write_copy_to(&self, destination: impl AsRef<Path>, key: Option<&[u8]>) -> Result<()> {
        self.check()?;
        if let Some(key) = key {
            if key.len() != ENCRYPTION_KEY_LEN {
                return Err(Error::invalid_argument(format!(
                    "encryption key must be {} bytes, got {}",
                    ENCRYPTION_KEY_LEN,
                    key.len()
                )));
            }
        }
        self.inner.state.lock().group.write_copy(destination, key)
    }

    /// Deletes the file of `config`. Fails while an instance is open.
    pub fn delete_realm(config: &Configuration) -> Result<bool> {
        let path = config.canonical_path();
        if registry::is_open(&path) || SharedFile::is_open(config.path(), config.is_in_memory()) {
            return Err(Error::illegal_state(format!(
                "'{}' cannot be deleted while it is open",
                path.display()
            )));
        }
        if config.is_in_memory() {
            return Ok(false);
        }
        SharedFile::remove_file(&path)
    }

    /// Rewrites the file of `config`. Returns false, doing nothing, while an
    /// instance is open.
    pub fn compact_realm(config: &Configuration) -> Result<bool> {
        let path = config.canonical_path();
        if registry::is_open(&path) || SharedFile::is_open(config.path(), config.is_in_memory()) {
            return Ok(false);
        }
        let group = SharedGroup::open(config.path(), &config.file_options())?;
        group.compact()?;
        Ok(true)
    }

    /// Opens and closes the file of `config`, running its migration.
    pub fn migrate_realm(config: &Configuration) -> Result<()> {
        let path = config.canonical_path();
        if registry::is_open(&path) {
            return Err(Error::illegal_state(format!(
                "'{}' cannot be migrated while it is open",
                path.display()
            )));
        }
        let mut realm = Realm::get_instance(config)?;
        realm.close()
    }

    /// Open handles on the file of `config` across all threads.
    pub fn global_instance_count(config: &Configuration) -> usize {
        registry::global_count(&config.canonical_path())
    }

    /// Open handles on the file of `config` on the calling thread.
    pub fn local_instance_count(config: &Configuration) -> usize {
        registry::local_count(&config.canonical_path(), std::thread::current().id())
    }
}

fn run_transaction(
    config: &Configuration,
    dynamic: bool,
    task: &AsyncTask,
    transaction: Box<dyn FnOnce(&Realm) -> Result<()> + Send>,
) -> Result<()> {
    if task.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let mut realm = if dynamic {
        Realm::get_dynamic_instance(config)?
    } else {
        Realm::get_instance(config)?
    };
    let outcome = (|| -> Result<()> {
        realm.begin_transaction()?;
        if let Err(err) = transaction(&realm) {
            if realm.is_in_transaction()? {
                realm.cancel_transaction()?;
            }
            return Err(err);
        }
        if task.is_cancelled() {
            realm.cancel_transaction()?;
            return Err(Error::Cancelled);
        }
        realm.commit_transaction()
    })();
    let closed = realm.close();
    outcome.and(closed)
}

fn default_values(group: &Group, class: &str) -> Result<Vec<Value>> {
    Ok(group
        .require_table(class)?
        .schema()
        .properties()
        .iter()
        .map(Property::default_value)
        .collect())
}

impl Drop for Realm {
    fn drop(&mut self) {
        if self.counted && !self.released {
            warn!(path = %self.inner.path.display(), "instance dropped without close()");
            self.release();
        }
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("path", &self.inner.path)
            .field("dynamic", &self.inner.dynamic)
            .field("closed", &self.is_closed())
            .finish()
    }
}
