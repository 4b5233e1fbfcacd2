//! Unordered collections of distinct values.

use crate::collection::{not_managed, CollectionState, SetListener, Unmanaged};
use crate::object::Object;
use crate::query::RealmQuery;
use crate::realm::RealmInner;
use std::sync::Arc;
use tessel_core::{Error, Result, Value};
use tessel_reactive::{CollectionChangeSet, ListenerId};

#[derive(Clone)]
enum Repr {
    Managed {
        inner: Arc<RealmInner>,
        state: Arc<CollectionState>,
    },
    Unmanaged(Arc<Unmanaged>),
}

/// A set of values or of links to objects. Elements keep insertion order.
#[derive(Clone)]
pub struct RealmSet {
    repr: Repr,
}

impl Default for RealmSet {
    fn default() -> Self {
        RealmSet::new()
    }
}

impl RealmSet {
    pub fn new() -> RealmSet {
        RealmSet::from_values(Vec::new())
    }

    /// An unmanaged set; duplicates in `values` are dropped.
    pub fn from_values(values: Vec<Value>) -> RealmSet {
        let mut distinct: Vec<Value> = Vec::with_capacity(values.len());
        for value in values {
            if !distinct.contains(&value) {
                distinct.push(value);
            }
        }
        RealmSet {
            repr: Repr::Unmanaged(Unmanaged::new(distinct)),
        }
    }

    pub(crate) fn managed(inner: Arc<RealmInner>, state: Arc<CollectionState>) -> RealmSet {
        RealmSet {
            repr: Repr::Managed { inner, state },
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.repr, Repr::Managed { .. })
    }

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

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        match &self.repr {
            Repr::Managed { inner, state } => inner.read(|group, _| state.items(group)),
            Repr::Unmanaged(data) => Ok(data.items.lock().clone()),
        }
    }

    fn mutate<T>(&self, edit: impl FnOnce(&mut Vec<Value>) -> T) -> Result<T> {
        match &self.repr {
            Repr::Managed { inner, state } => {
                let out = inner.write(|group, log, _| {
                    let mut items = state.items(group)?;
                    let out = edit(&mut items);
                    state.store(group, log, items)?;
                    Ok(out)
                })?;
                state.bump();
                Ok(out)
            }
            Repr::Unmanaged(data) => {
                let out = edit(&mut data.items.lock());
                data.bump();
                Ok(out)
            }
        }
    }

    fn element(&self, value: Value) -> Result<Value> {
        match (&self.repr, &value) {
            (Repr::Managed { state, .. }, _) if state.target_class.is_some() => {
                Err(Error::type_mismatch(&state.field, "object", value.type_name()))
            }
            (Repr::Unmanaged(_), Value::Link(_) | Value::TypedLink(_)) => Err(not_managed("storing links")),
            _ => Ok(value),
        }
    }

    fn link(&self, object: &Object) -> Result<Value> {
        match &self.repr {
            Repr::Managed { inner, state } => object.link_value(inner, Some(state.require_target("adding objects")?)),
            Repr::Unmanaged(_) => Err(not_managed("adding objects")),
        }
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.to_vec()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Adds `value`; returns false if it was already present.
    pub fn add(&self, value: impl Into<Value>) -> Result<bool> {
        let value = self.element(value.into())?;
        self.insert_distinct(vec![value])
    }

    pub fn add_object(&self, object: &Object) -> Result<bool> {
        let value = self.link(object)?;
        self.insert_distinct(vec![value])
    }

    /// Adds every value; returns true if the set changed.
    pub fn add_all(&self, values: &[Value]) -> Result<bool> {
        let values = values
            .iter()
            .map(|v| self.element(v.clone()))
            .collect::<Result<Vec<_>>>()?;
        self.insert_distinct(values)
    }

    fn insert_distinct(&self, values: Vec<Value>) -> Result<bool> {
        let missing: Vec<Value> = {
            let current = self.to_vec()?;
            values.into_iter().filter(|v| !current.contains(v)).collect()
        };
        if missing.is_empty() {
            return Ok(false);
        }
        self.mutate(|items| {
            for value in missing {
                if !items.contains(&value) {
                    items.push(value);
                }
            }
            true
        })
    }

    /// Removes `value`; returns false if it was not present.
    pub fn remove(&self, value: &Value) -> Result<bool> {
        self.retain_where(|v| v != value)
    }

    pub fn remove_object(&self, object: &Object) -> Result<bool> {
        let value = self.link(object)?;
        self.remove(&value)
    }

    /// Removes every value of `values`; returns true if the set changed.
    pub fn remove_all(&self, values: &[Value]) -> Result<bool> {
        self.retain_where(|v| !values.contains(v))
    }

    /// Keeps only the values also in `values`; returns true if the set
    /// changed.
    pub fn retain_all(&self, values: &[Value]) -> Result<bool> {
        self.retain_where(|v| values.contains(v))
    }

    fn retain_where(&self, keep: impl Fn(&Value) -> bool) -> Result<bool> {
        if self.to_vec()?.iter().all(&keep) {
            return Ok(false);
        }
        self.mutate(|items| {
            let before = items.len();
            items.retain(|v| keep(v));
            items.len() != before
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(|items| items.clear())
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        Ok(self.to_vec()?.contains(value))
    }

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

    /// Iterates over the elements present now.
    pub fn iter(&self) -> Result<SetIter> {
        Ok(SetIter {
            set: self.clone(),
            items: self.to_vec()?.into_iter(),
            expected: self.mods(),
            failed: false,
        })
    }

    fn mods(&self) -> u64 {
        match &self.repr {
            Repr::Managed { state, .. } => state.mods(),
            Repr::Unmanaged(data) => data.mods(),
        }
    }

    /// Starts a query over the linked objects.
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

    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&RealmSet, &CollectionChangeSet) + Send + Sync + 'static,
    {
        let Repr::Managed { inner, state } = &self.repr else {
            return Err(not_managed("change listeners"));
        };
        let mut realm = inner.lock()?;
        let current = state.items(realm.group.read())?;
        realm.lists.register(state);
        let listener: Arc<SetListener> = Arc::new(listener);
        Ok(state.subscribe_set(listener, current))
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

impl std::fmt::Debug for RealmSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Managed { state, .. } => f
                .debug_struct("RealmSet")
                .field("owner", &state.owner_class)
                .field("field", &state.field)
                .finish(),
            Repr::Unmanaged(data) => f.debug_set().entries(data.items.lock().iter()).finish(),
        }
    }
}

/// Iterator over a set. Changes made while iterating end the iteration with
/// a concurrent modification error.
pub struct SetIter {
    set: RealmSet,
    items: std::vec::IntoIter<Value>,
    expected: u64,
    failed: bool,
}

impl Iterator for SetIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.set.mods() != self.expected {
            self.failed = true;
            return Some(Err(Error::ConcurrentModification));
        }
        self.items.next().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::realm::Realm;
    use tessel_core::schema::{ObjectSchemaBuilder, Property};
    use tessel_core::DataType;

    #[test]
    fn test_unmanaged_set_is_distinct() {
        let set = RealmSet::from_values(vec![Value::from(1i64), Value::from(1i64), Value::from(2i64)]);
        assert_eq!(set.size().unwrap(), 2);
        assert!(!set.add(2i64).unwrap());
        assert!(set.add(3i64).unwrap());
        assert!(set.retain_all(&[Value::from(1i64), Value::from(3i64)]).unwrap());
        assert!(set.contains_all(&[Value::from(1i64), Value::from(3i64)]).unwrap());
        assert!(!set.remove(&Value::from(9i64)).unwrap());
        assert!(matches!(set.where_(), Err(Error::UnsupportedOperation { .. })));
    }

    #[test]
    fn test_managed_set() {
        let tagged = ObjectSchemaBuilder::new("Tagged")
            .unwrap()
            .property(Property::set("codes", DataType::Int))
            .unwrap()
            .build()
            .unwrap();
        let config = Configuration::builder("set_managed").in_memory().class(tagged).build().unwrap();
        let mut realm = Realm::get_instance(&config).unwrap();
        realm.begin_transaction().unwrap();
        let object = realm.create_object("Tagged").unwrap();
        let codes = object.get_set("codes").unwrap();
        assert!(codes.add(1i64).unwrap());
        assert!(!codes.add(1i64).unwrap());
        assert!(codes.add_all(&[Value::Int(2), Value::Int(3)]).unwrap());
        assert!(codes.remove_all(&[Value::Int(2)]).unwrap());
        realm.commit_transaction().unwrap();
        assert_eq!(codes.to_vec().unwrap(), vec![Value::Int(1), Value::Int(3)]);
        assert!(matches!(codes.add(4i64), Err(Error::NotInTransaction)));
        assert!(matches!(object.get_list("codes"), Err(Error::TypeMismatch { .. })));
        realm.close().unwrap();
    }
}
