//! Ordered collections.
//!
//! A [`List`] is either managed, a live view over a list column of a stored
//! object, or unmanaged, a plain in-memory sequence of values. Both support
//! index-based editing and iteration. Queries, aggregates and deleting
//! objects from the file need a managed list of objects.

use crate::collection::{check_index, not_managed, CollectionState, ListListener, Unmanaged};
use crate::copy::copy_record;
use crate::object::Object;
use crate::query::RealmQuery;
use crate::realm::RealmInner;
use crate::record::Record;
use std::sync::Arc;
use tessel_core::{Error, ObjKey, Result, Value};
use tessel_reactive::{CollectionChangeSet, ListenerId};

#[derive(Clone)]
enum Repr {
    Managed {
        inner: Arc<RealmInner>,
        state: Arc<CollectionState>,
    },
    Unmanaged(Arc<Unmanaged>),
}

/// A list of values or of links to objects.
#[derive(Clone)]
pub struct List {
    repr: Repr,
}

impl Default for List {
    fn default() -> Self {
        List::new()
    }
}

impl List {
    /// An empty unmanaged list.
    pub fn new() -> List {
        List::from_values(Vec::new())
    }

    pub fn from_values(values: Vec<Value>) -> List {
        List {
            repr: Repr::Unmanaged(Unmanaged::new(values)),
        }
    }

    pub(crate) fn managed(inner: Arc<RealmInner>, state: Arc<CollectionState>) -> List {
        List {
            repr: Repr::Managed { inner, state },
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.repr, Repr::Managed { .. })
    }

    /// Unmanaged lists are always valid; a managed one turns invalid with
    /// its owner object or instance.
    pub fn is_valid(&self) -> Result<bool> {
        match &self.repr {
            Repr::Unmanaged(_) => Ok(true),
            Repr::Managed { inner, state } => match inner.check() {
                Ok(()) => inner.read(|group, _| Ok(state.is_valid(group))),
                Err(Error::InstanceClosed { .. }) => Ok(false),
                Err(err) => Err(err),
            },
        }
    }

    fn mods(&self) -> u64 {
        match &self.repr {
            Repr::Managed { state, .. } => state.mods(),
            Repr::Unmanaged(data) => data.mods(),
        }
    }

    /// Current elements.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        match &self.repr {
            Repr::Managed { inner, state } => inner.read(|group, _| state.items(group)),
            Repr::Unmanaged(data) => Ok(data.items.lock().clone()),
        }
    }

    /// Applies a structural edit and records it for iterators.
    fn mutate<T>(&self, edit: impl FnOnce(&mut Vec<Value>) -> Result<T>) -> Result<T> {
        match &self.repr {
            Repr::Managed { inner, state } => {
                let out = inner.write(|group, log, _| {
                    let mut items = state.items(group)?;
                    let out = edit(&mut items)?;
                    state.store(group, log, items)?;
                    Ok(out)
                })?;
                state.bump();
                Ok(out)
            }
            Repr::Unmanaged(data) => {
                let out = edit(&mut data.items.lock())?;
                data.bump();
                Ok(out)
            }
        }
    }

    /// Rejects raw links; objects go through the `*_object` methods so
    /// the instance and class can be checked.
    fn element(&self, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        match (&self.repr, &value) {
            (Repr::Managed { state, .. }, _) if state.target_class.is_some() => Err(Error::type_mismatch(
                &state.field,
                "object",
                value.type_name(),
            )),
            (Repr::Unmanaged(_), Value::Link(_) | Value::TypedLink(_)) => {
                Err(not_managed("storing links"))
            }
            _ => Ok(value),
        }
    }

    fn link(&self, object: &Object) -> Result<Value> {
        match &self.repr {
            Repr::Managed { inner, state } => {
                let target = state.require_target("adding objects")?;
                object.link_value(inner, Some(target))
            }
            Repr::Unmanaged(_) => Err(not_managed("adding objects")),
        }
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.to_vec()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Value> {
        let items = self.to_vec()?;
        check_index(index, items.len())?;
        Ok(items[index].clone())
    }

    /// The object linked at `index`.
    pub fn get_object(&self, index: usize) -> Result<Object> {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("get_object"));
        };
        let target = state.require_target("get_object")?;
        match self.get(index)? {
            Value::Link(key) => Ok(Object::attached(Arc::clone(inner), target, key)),
            other => Err(Error::type_mismatch(&state.field, "object", other.type_name())),
        }
    }

    pub fn add(&self, value: impl Into<Value>) -> Result<()> {
        let value = self.element(value)?;
        self.mutate(|items| {
            items.push(value);
            Ok(())
        })
    }

    pub fn add_object(&self, object: &Object) -> Result<()> {
        let value = self.link(object)?;
        self.mutate(|items| {
            items.push(value);
            Ok(())
        })
    }

    /// Stores `record` (and the records nested in it) and appends the new
    /// object. Records whose primary key already exists are merged into the
    /// stored object instead.
    pub fn add_record(&self, record: &Record) -> Result<Object> {
        self.store_record(None, record)
    }

    fn store_record(&self, index: Option<usize>, record: &Record) -> Result<Object> {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("add_record"));
        };
        let target = state.require_target("add_record")?;
        if record.class() != target {
            return Err(Error::type_mismatch(&state.field, target, record.class()));
        }
        let key = inner.write(|group, log, indices| {
            let mut items = state.items(group)?;
            if let Some(index) = index {
                if index > items.len() {
                    return Err(Error::out_of_bounds(index, items.len()));
                }
            }
            let key = copy_record(group, log, indices, record, true)?;
            items.insert(index.unwrap_or(items.len()), Value::Link(key));
            state.store(group, log, items)?;
            Ok(key)
        })?;
        state.bump();
        Ok(Object::attached(Arc::clone(inner), target, key))
    }

    /// Inserts at `index`; `index == size()` appends.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = self.element(value)?;
        self.mutate(|items| insert_at(items, index, value))
    }

    pub fn insert_object(&self, index: usize, object: &Object) -> Result<()> {
        let value = self.link(object)?;
        self.mutate(|items| insert_at(items, index, value))
    }

    pub fn insert_record(&self, index: usize, record: &Record) -> Result<Object> {
        self.store_record(Some(index), record)
    }

    /// Replaces the element at `index` and returns the previous one.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<Value> {
        let value = self.element(value)?;
        self.replace(index, value)
    }

    pub fn set_object(&self, index: usize, object: &Object) -> Result<Value> {
        let value = self.link(object)?;
        self.replace(index, value)
    }

    fn replace(&self, index: usize, value: Value) -> Result<Value> {
        match &self.repr {
            Repr::Managed { inner, state } => inner.write(|group, log, _| {
                let mut items = state.items(group)?;
                check_index(index, items.len())?;
                let old = std::mem::replace(&mut items[index], value);
                state.store(group, log, items)?;
                Ok(old)
            }),
            Repr::Unmanaged(data) => {
                let mut items = data.items.lock();
                check_index(index, items.len())?;
                Ok(std::mem::replace(&mut items[index], value))
            }
        }
    }

    /// Removes the element at `index` from the list. A linked object stays
    /// in the file.
    pub fn remove(&self, index: usize) -> Result<Value> {
        self.mutate(|items| {
            check_index(index, items.len())?;
            Ok(items.remove(index))
        })
    }

    /// Removes the first element equal to `value`.
    pub fn remove_value(&self, value: &Value) -> Result<bool> {
        self.mutate(|items| match items.iter().position(|v| v == value) {
            Some(index) => {
                items.remove(index);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    /// Moves the element at `from` so that it ends up at `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        self.mutate(|items| {
            check_index(from, items.len())?;
            check_index(to, items.len())?;
            let value = items.remove(from);
            items.insert(to, value);
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(|items| {
            items.clear();
            Ok(())
        })
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        Ok(self.to_vec()?.contains(value))
    }

    pub fn index_of(&self, value: &Value) -> Result<Option<usize>> {
        Ok(self.to_vec()?.iter().position(|v| v == value))
    }

    /// Returns true if every value of `values` is in the list.
    pub fn contains_all(&self, values: &[Value]) -> Result<bool> {
        let items = self.to_vec()?;
        Ok(values.iter().all(|v| items.contains(v)))
    }

    pub fn contains_object(&self, object: &Object) -> Result<bool> {
        let Ok(value) = self.link(object) else {
            return Ok(false);
        };
        self.contains(&value)
    }

    /// Iterates over the list. Structural changes made other than through
    /// [`ListIter::remove`] end the iteration with a concurrent
    /// modification error.
    pub fn iter(&self) -> Result<ListIter> {
        Ok(ListIter {
            list: self.clone(),
            cursor: 0,
            last: None,
            expected_mods: self.mods(),
            expected_len: self.size()?,
            failed: false,
        })
    }

    /// Starts a query over the linked objects, in list order.
    pub fn where_(&self) -> Result<RealmQuery> {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("where"));
        };
        let indices = Arc::clone(&inner.lock()?.indices);
        Ok(RealmQuery::new(Arc::clone(inner), state.query(indices)?))
    }

    pub fn sum(&self, field: &str) -> Result<Value> {
        self.where_()?.sum(field)
    }

    pub fn average(&self, field: &str) -> Result<f64> {
        self.where_()?.average(field)
    }

    pub fn min(&self, field: &str) -> Result<Option<Value>> {
        self.where_()?.min(field)
    }

    pub fn max(&self, field: &str) -> Result<Option<Value>> {
        self.where_()?.max(field)
    }

    /// Deletes the object linked at `index` from the file. Every list
    /// holding it drops the entry.
    pub fn delete_from_realm(&self, index: usize) -> Result<()> {
        self.delete_linked(|keys| {
            check_index(index, keys.len())?;
            Ok(vec![keys[index]])
        })
    }

    /// Deletes every linked object from the file.
    pub fn delete_all_from_realm(&self) -> Result<()> {
        self.delete_linked(|keys| Ok(keys.to_vec()))
    }

    fn delete_linked(&self, pick: impl FnOnce(&[ObjKey]) -> Result<Vec<ObjKey>>) -> Result<()> {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("delete_from_realm"));
        };
        let target = state.require_target("delete_from_realm")?;
        inner.write(|group, log, _| {
            let keys = CollectionState::keys(&state.items(group)?);
            for key in pick(&keys)? {
                if group.require_table(target)?.contains(key) {
                    group.delete_object(target, key, log)?;
                }
            }
            Ok(())
        })?;
        state.bump();
        Ok(())
    }

    /// Adds a listener told which indices were deleted, inserted or
    /// modified.
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&List, &CollectionChangeSet) + Send + Sync + 'static,
    {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("change listeners"));
        };
        let mut realm = inner.lock()?;
        let current = state.items(realm.group.read())?;
        realm.lists.register(state);
        let listener: Arc<ListListener> = Arc::new(listener);
        Ok(state.subscribe_list(listener, current))
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<bool> {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("change listeners"));
        };
        inner.check()?;
        Ok(state.unsubscribe(id))
    }

    pub fn remove_all_change_listeners(&self) -> Result<()> {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("change listeners"));
        };
        inner.check()?;
        state.clear_listeners();
        Ok(())
    }
}

fn insert_at(items: &mut Vec<Value>, index: usize, value: Value) -> Result<()> {
    if index > items.len() {
        return Err(Error::out_of_bounds(index, items.len()));
    }
    items.insert(index, value);
    Ok(())
}

impl std::fmt::Debug for List {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Managed { state, .. } => f
                .debug_struct("List")
                .field("owner", &state.owner_class)
                .field("field", &state.field)
                .finish(),
            Repr::Unmanaged(data) => f.debug_list().entries(data.items.lock().iter()).finish(),
        }
    }
}

impl From<Vec<Value>> for List {
    fn from(values: Vec<Value>) -> Self {
        List::from_values(values)
    }
}

/// Cursor over a list; see [`List::iter`].
pub struct ListIter {
    list: List,
    cursor: usize,
    last: Option<usize>,
    expected_mods: u64,
    expected_len: usize,
    failed: bool,
}

impl ListIter {
    fn check(&self) -> Result<Vec<Value>> {
        let items = self.list.to_vec()?;
        if self.list.mods() != self.expected_mods || items.len() != self.expected_len {
            return Err(Error::ConcurrentModification);
        }
        Ok(items)
    }

    /// Removes the element returned by the last call to `next`.
    pub fn remove(&mut self) -> Result<Value> {
        let index = self
            .last
            .take()
            .ok_or_else(|| Error::illegal_state("remove called before next"))?;
        self.check()?;
        let value = self.list.remove(index)?;
        self.cursor = index;
        self.expected_mods = self.list.mods();
        self.expected_len -= 1;
        Ok(value)
    }
}

impl Iterator for ListIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let items = match self.check() {
            Ok(items) => items,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        let value = items.get(self.cursor)?.clone();
        self.last = Some(self.cursor);
        self.cursor += 1;
        Some(Ok(value))
    }
}
