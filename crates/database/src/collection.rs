//! State shared by lists and sets.
//!
//! A managed list or set is a view over one collection column of one owner
//! object. Handles cloned from the same list share a `CollectionState`, so
//! an iterator observes structural changes made through any of them.

use crate::list::List;
use crate::realm::{RealmInner, RealmState};
use crate::set::RealmSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessel_core::schema::ColumnIndices;
use tessel_core::{CollectionType, ColKey, Error, ObjKey, Result, Value};
use tessel_query::{QueryBuilder, QuerySource};
use tessel_reactive::{CollectionChangeSet, ListenerId, ListenerRegistry};
use tessel_storage::{ChangeLog, Group};

/// Callback fired when a managed list changed.
pub type ListListener = dyn Fn(&List, &CollectionChangeSet) + Send + Sync;

/// Callback fired when a managed set changed.
pub type SetListener = dyn Fn(&RealmSet, &CollectionChangeSet) + Send + Sync;

pub(crate) fn check_index(index: usize, size: usize) -> Result<()> {
    if index < size {
        Ok(())
    } else {
        Err(Error::out_of_bounds(index, size))
    }
}

pub(crate) fn not_managed(operation: &str) -> Error {
    Error::unsupported(format!("{} is only available on managed collections", operation))
}

/// In-memory contents of a collection that is not backed by a file.
#[derive(Debug, Default)]
pub(crate) struct Unmanaged {
    pub items: Mutex<Vec<Value>>,
    mods: AtomicU64,
}

impl Unmanaged {
    pub fn new(items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(items),
            mods: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn mods(&self) -> u64 {
        self.mods.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bump(&self) {
        self.mods.fetch_add(1, Ordering::AcqRel);
    }
}

struct CollectionData {
    list_listeners: ListenerRegistry<ListListener>,
    set_listeners: ListenerRegistry<SetListener>,
    notified: Option<Vec<Value>>,
}

/// Listeners due for a call and what they are told.
pub(crate) enum PendingCollection {
    List(Vec<Arc<ListListener>>, CollectionChangeSet),
    Set(Vec<Arc<SetListener>>, CollectionChangeSet),
}

/// A collection column of one owner object.
pub(crate) struct CollectionState {
    pub owner_class: String,
    pub owner: ObjKey,
    pub col: ColKey,
    pub field: String,
    pub kind: CollectionType,
    pub data_type: tessel_core::DataType,
    /// Target class of a link collection.
    pub target_class: Option<String>,
    mods: AtomicU64,
    data: Mutex<CollectionData>,
}

impl CollectionState {
    /// Resolves `field` of `owner_class` as a collection of `kind`.
    pub fn resolve(
        indices: &ColumnIndices,
        owner_class: &str,
        owner: ObjKey,
        field: &str,
        kind: CollectionType,
    ) -> Result<Arc<Self>> {
        let columns = indices.require_class(owner_class)?;
        let details = columns.require(field)?;
        if details.col_type.collection != kind {
            let expected = match kind {
                CollectionType::List => "list",
                CollectionType::Set => "set",
                CollectionType::Single => "single value",
            };
            return Err(Error::type_mismatch(field, expected, details.col_type));
        }
        Ok(Arc::new(Self {
            owner_class: owner_class.to_string(),
            owner,
            col: details.key,
            field: details.name.clone(),
            kind,
            data_type: details.col_type.data_type,
            target_class: details.target_class.clone(),
            mods: AtomicU64::new(0),
            data: Mutex::new(CollectionData {
                list_listeners: ListenerRegistry::new(),
                set_listeners: ListenerRegistry::new(),
                notified: None,
            }),
        }))
    }

    #[inline]
    pub fn mods(&self) -> u64 {
        self.mods.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bump(&self) {
        self.mods.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_valid(&self, group: &Group) -> bool {
        group
            .table(&self.owner_class)
            .is_some_and(|t| t.contains(self.owner))
    }

    /// Current elements; fails once the owner was deleted.
    pub fn items(&self, group: &Group) -> Result<Vec<Value>> {
        let row = group
            .require_table(&self.owner_class)?
            .get(self.owner)
            .ok_or_else(|| Error::invalid_object(&self.owner_class))?;
        Ok(match row.get(self.col) {
            Some(Value::List(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    pub fn store(&self, group: &mut Group, log: &mut ChangeLog, items: Vec<Value>) -> Result<()> {
        group.set_value(&self.owner_class, self.owner, self.col, Value::List(items), log)
    }

    /// Target class, for operations that only make sense on links.
    pub fn require_target(&self, operation: &str) -> Result<&str> {
        self.target_class.as_deref().ok_or_else(|| {
            Error::unsupported(format!(
                "{} needs a collection of objects, '{}.{}' holds {} values",
                operation, self.owner_class, self.field, self.data_type
            ))
        })
    }

    /// Starts a query over the linked objects, in collection order.
    pub fn query(&self, indices: Arc<ColumnIndices>) -> Result<QueryBuilder> {
        let target = self.require_target("where")?.to_string();
        QueryBuilder::with_source(
            indices,
            target,
            QuerySource::List {
                owner_class: self.owner_class.clone(),
                owner: self.owner,
                col: self.col,
            },
        )
    }

    /// Linked object keys of `items`.
    pub fn keys(items: &[Value]) -> Vec<ObjKey> {
        items.iter().filter_map(Value::as_link).collect()
    }

    pub fn subscribe_list(&self, listener: Arc<ListListener>, current: Vec<Value>) -> ListenerId {
        let mut data = self.data.lock();
        data.notified.get_or_insert(current);
        data.list_listeners.subscribe(listener)
    }

    pub fn subscribe_set(&self, listener: Arc<SetListener>, current: Vec<Value>) -> ListenerId {
        let mut data = self.data.lock();
        data.notified.get_or_insert(current);
        data.set_listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut data = self.data.lock();
        data.list_listeners.unsubscribe(id) || data.set_listeners.unsubscribe(id)
    }

    pub fn clear_listeners(&self) {
        let mut data = self.data.lock();
        data.list_listeners.clear();
        data.set_listeners.clear();
        data.notified = None;
    }

    /// Diffs the collection against what listeners last saw. A deleted
    /// owner reports every previous element as deleted, once.
    pub fn pending_notification(&self, state: &RealmState, log: &ChangeLog) -> Option<PendingCollection> {
        let mut data = self.data.lock();
        if data.list_listeners.is_empty() && data.set_listeners.is_empty() {
            data.notified = None;
            return None;
        }
        let group = state.group.read();
        let current = self.items(group).ok();
        let old = data.notified.take();
        let (old, new) = match (old, current) {
            (None, None) => return None,
            (None, Some(current)) => {
                data.notified = Some(current);
                return None;
            }
            (Some(old), current) => (old, current),
        };
        let empty = Vec::new();
        let target = self.target_class.as_deref().and_then(|t| log.table(t));
        let changes = CollectionChangeSet::compute(&old, new.as_ref().unwrap_or(&empty), |value| {
            matches!((value, target), (Value::Link(key), Some(t)) if t.is_modified(*key))
        });
        data.notified = new;
        if changes.is_empty() {
            return None;
        }
        Some(match self.kind {
            CollectionType::Set => PendingCollection::Set(data.set_listeners.snapshot(), changes),
            _ => PendingCollection::List(data.list_listeners.snapshot(), changes),
        })
    }
}

/// Calls the listeners of a collection with a handle on it.
pub(crate) fn fire(inner: &Arc<RealmInner>, state: Arc<CollectionState>, pending: PendingCollection) {
    match pending {
        PendingCollection::List(listeners, changes) => {
            let list = List::managed(Arc::clone(inner), state);
            for listener in listeners {
                listener(&list, &changes);
            }
        }
        PendingCollection::Set(listeners, changes) => {
            let set = RealmSet::managed(Arc::clone(inner), state);
            for listener in listeners {
                listener(&set, &changes);
            }
        }
    }
}
