//! Live query results.
//!
//! `Results` re-runs its query whenever the instance shows different
//! contents than at the last evaluation, so `size` and `get` always reflect
//! the current version. Results from `find_all_async` are filled in by a
//! worker; reading them before that evaluates the query on the spot.
//!
//! Iteration walks a snapshot of the keys taken when the iterator was
//! created, so deleting objects while iterating is safe. Deleting through
//! the results themselves while an iterator is out is reported as a
//! concurrent modification.

use crate::query::RealmQuery;
use crate::realm::{evaluate_keys, AsyncTarget, Realm, RealmInner, RealmState, Stamp};
use crate::object::Object;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use tessel_core::schema::ColumnDetails;
use tessel_core::{DataType, Decimal128, Error, ObjKey, ObjectId, Result, Value};
use tessel_query::{aggregate, FieldDescriptor, Query, QueryBuilder, SortOrder};
use tessel_reactive::{CollectionChangeSet, ListenerId, ListenerRegistry};
use tessel_storage::ChangeLog;
use uuid::Uuid;

/// Callback fired when the contents of live results changed.
pub type ResultsListener = dyn Fn(&Results, &CollectionChangeSet) + Send + Sync;

struct ResultsData {
    keys: Vec<ObjKey>,
    loaded: bool,
    stamp: Option<Stamp>,
    request_seq: u64,
    mods: u64,
    listeners: ListenerRegistry<ResultsListener>,
    notified: Option<Vec<ObjKey>>,
}

pub(crate) struct ResultsState {
    query: Query,
    is_async: bool,
    data: Mutex<ResultsData>,
}

impl ResultsState {
    fn new(query: Query, is_async: bool) -> Arc<Self> {
        Arc::new(Self {
            query,
            is_async,
            data: Mutex::new(ResultsData {
                keys: Vec::new(),
                loaded: false,
                stamp: None,
                request_seq: 0,
                mods: 0,
                listeners: ListenerRegistry::new(),
                notified: None,
            }),
        })
    }

    #[inline]
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    #[inline]
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn is_loaded(&self) -> bool {
        self.data.lock().loaded
    }

    pub fn begin_request(&self) -> u64 {
        let mut data = self.data.lock();
        data.request_seq += 1;
        data.request_seq
    }

    pub fn request_seq(&self) -> u64 {
        self.data.lock().request_seq
    }

    /// Takes keys computed elsewhere. `stamp` is `None` when they may not
    /// match what the instance shows, which forces the next read to
    /// re-evaluate.
    pub fn adopt(&self, keys: Vec<ObjKey>, stamp: Option<Stamp>) {
        let mut data = self.data.lock();
        data.keys = keys;
        data.loaded = true;
        data.stamp = stamp;
    }

    fn refresh(&self, data: &mut ResultsData, state: &RealmState) -> Result<()> {
        let stamp = state.stamp();
        if data.loaded && data.stamp == Some(stamp) {
            return Ok(());
        }
        if !data.loaded && self.is_async {
            // Answers from workers for earlier requests are now stale.
            data.request_seq += 1;
        }
        data.keys = evaluate_keys(&self.query, state.group.read())?;
        data.loaded = true;
        data.stamp = Some(stamp);
        Ok(())
    }

    /// Keys matching the query at the version the instance shows.
    pub fn keys(&self, state: &RealmState) -> Result<Vec<ObjKey>> {
        let mut data = self.data.lock();
        self.refresh(&mut data, state)?;
        Ok(data.keys.clone())
    }

    fn mods(&self) -> u64 {
        self.data.lock().mods
    }

    fn bump(&self) {
        self.data.lock().mods += 1;
    }

    pub fn pending_notification(
        &self,
        state: &RealmState,
        log: &ChangeLog,
    ) -> Result<Option<(Vec<Arc<ResultsListener>>, CollectionChangeSet)>> {
        let mut data = self.data.lock();
        if data.listeners.is_empty() {
            data.notified = None;
            return Ok(None);
        }
        if !data.loaded {
            return Ok(None);
        }
        self.refresh(&mut data, state)?;
        let current = data.keys.clone();
        let changes = match data.notified.take() {
            None => CollectionChangeSet::initial(current.len()),
            Some(old) => {
                let table = log.table(self.query.class());
                CollectionChangeSet::compute(&old, &current, |key| table.is_some_and(|t| t.is_modified(*key)))
            }
        };
        data.notified = Some(current);
        if changes.is_empty() {
            return Ok(None);
        }
        Ok(Some((data.listeners.snapshot(), changes)))
    }
}

/// Converts text to a value of the column's type.
fn parse_value(details: &ColumnDetails, text: &str) -> Result<Value> {
    let dt = details.col_type.data_type;
    if details.col_type.collection.is_collection() {
        return Err(Error::unsupported(format!(
            "cannot set collection field '{}' from a string",
            details.name
        )));
    }
    let invalid = |reason: String| {
        Error::invalid_argument(format!(
            "'{}' is not a valid {} for '{}': {}",
            text, dt, details.name, reason
        ))
    };
    let trimmed = text.trim();
    Ok(match dt {
        DataType::String | DataType::Mixed => Value::String(text.to_string()),
        DataType::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(invalid("expected true or false".into())),
        },
        DataType::Int => Value::Int(trimmed.parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?),
        DataType::Date => Value::Date(trimmed.parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?),
        DataType::Float => Value::Float(trimmed.parse().map_err(|e: std::num::ParseFloatError| invalid(e.to_string()))?),
        DataType::Double => Value::Double(trimmed.parse().map_err(|e: std::num::ParseFloatError| invalid(e.to_string()))?),
        DataType::Decimal => Value::Decimal(Decimal128::from_str(trimmed).map_err(invalid)?),
        DataType::ObjectId => Value::ObjectId(ObjectId::from_str(trimmed).map_err(invalid)?),
        DataType::Uuid => Value::Uuid(Uuid::parse_str(trimmed).map_err(|e| invalid(e.to_string()))?),
        DataType::Binary | DataType::Link => {
            return Err(Error::unsupported(format!(
                "cannot set {} field '{}' from a string",
                dt, details.name
            )))
        }
    })
}

/// Live results of a query.
#[derive(Clone)]
pub struct Results {
    inner: Arc<RealmInner>,
    state: Arc<ResultsState>,
}

impl Results {
    pub(crate) fn from_state(inner: Arc<RealmInner>, state: Arc<ResultsState>) -> Results {
        Results { inner, state }
    }

    /// Evaluates `query` now.
    pub(crate) fn evaluated(inner: Arc<RealmInner>, query: Query) -> Result<Results> {
        let state = ResultsState::new(query, false);
        {
            let mut realm = inner.lock()?;
            state.keys(&realm)?;
            realm.results.register(&state);
        }
        Ok(Results { inner, state })
    }

    /// Hands `query` to a worker and returns unloaded results.
    pub(crate) fn asynchronous(inner: Arc<RealmInner>, query: Query) -> Result<Results> {
        inner.check()?;
        if !inner.has_looper() {
            return Err(Error::illegal_state("find_all_async needs a looper on the calling thread"));
        }
        let state = ResultsState::new(query, true);
        inner.request(AsyncTarget::Results(Arc::clone(&state)))?;
        Ok(Results { inner, state })
    }

    pub fn class_name(&self) -> Result<&str> {
        self.inner.check()?;
        Ok(self.class())
    }

    /// The query behind these results.
    pub fn query(&self) -> Result<&Query> {
        self.inner.check()?;
        Ok(&self.state.query)
    }

    fn class(&self) -> &str {
        self.state.query.class()
    }

    /// Returns false once the instance was closed or the list or object the
    /// results were derived from was deleted.
    pub fn is_valid(&self) -> Result<bool> {
        match self.inner.check() {
            Ok(()) => {}
            Err(Error::InstanceClosed { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
        self.inner.read(|group, _| Ok(self.state.query.is_source_valid(group)))
    }

    pub fn is_loaded(&self) -> Result<bool> {
        self.inner.check()?;
        Ok(self.state.is_loaded())
    }

    /// Evaluates the query now if a worker has not delivered yet.
    pub fn load(&self) -> Result<bool> {
        let state = self.inner.lock()?;
        self.state.keys(&state)?;
        Ok(true)
    }

    fn with_keys<T>(&self, f: impl FnOnce(&RealmState, Vec<ObjKey>) -> Result<T>) -> Result<T> {
        let state = self.inner.lock()?;
        let keys = self.state.keys(&state)?;
        f(&state, keys)
    }

    fn object(&self, key: ObjKey) -> Object {
        Object::attached(Arc::clone(&self.inner), self.state.query.class(), key)
    }

    /// Keys of the matching objects, in result order.
    pub fn keys(&self) -> Result<Vec<ObjKey>> {
        self.with_keys(|_, keys| Ok(keys))
    }

    pub fn size(&self) -> Result<usize> {
        self.with_keys(|_, keys| Ok(keys.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Object> {
        let key = self.with_keys(|_, keys| {
            keys.get(index)
                .copied()
                .ok_or_else(|| Error::out_of_bounds(index, keys.len()))
        })?;
        Ok(self.object(key))
    }

    pub fn first(&self) -> Result<Option<Object>> {
        let key = self.with_keys(|_, keys| Ok(keys.first().copied()))?;
        Ok(key.map(|k| self.object(k)))
    }

    pub fn last(&self) -> Result<Option<Object>> {
        let key = self.with_keys(|_, keys| Ok(keys.last().copied()))?;
        Ok(key.map(|k| self.object(k)))
    }

    pub fn contains(&self, object: &Object) -> Result<bool> {
        Ok(self.index_of(object)?.is_some())
    }

    pub fn index_of(&self, object: &Object) -> Result<Option<usize>> {
        self.inner.check()?;
        if !Arc::ptr_eq(object.inner(), &self.inner) || object.class() != self.class() {
            return Ok(None);
        }
        let Ok(key) = object.key() else {
            return Ok(None);
        };
        self.with_keys(|_, keys| Ok(keys.iter().position(|k| *k == key)))
    }

    /// Iterates over the objects matching now.
    pub fn iter(&self) -> Result<ResultsIter> {
        let keys = self.keys()?;
        Ok(ResultsIter {
            results: self.clone(),
            keys,
            index: 0,
            expected: self.state.mods(),
            failed: false,
        })
    }

    /// An immutable copy of the current contents.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            inner: Arc::clone(&self.inner),
            class: self.class().to_string(),
            keys: self.keys()?,
        })
    }

    /// Narrows these results with more conditions.
    pub fn where_(&self) -> Result<RealmQuery> {
        let state = self.inner.lock()?;
        let builder = QueryBuilder::from_query(Arc::clone(&state.indices), &self.state.query)?;
        Ok(RealmQuery::new(Arc::clone(&self.inner), builder))
    }

    fn derive(&self, shape: impl FnOnce(QueryBuilder) -> Result<QueryBuilder>) -> Result<Results> {
        let query = {
            let state = self.inner.lock()?;
            shape(QueryBuilder::from_query(Arc::clone(&state.indices), &self.state.query)?)?.build()?
        };
        Results::evaluated(Arc::clone(&self.inner), query)
    }

    /// The same objects sorted by `field`. Earlier ordering is replaced.
    pub fn sort(&self, field: &str, order: SortOrder) -> Result<Results> {
        self.derive(|b| b.sort(field, order))
    }

    pub fn sort_by(&self, fields: &[&str], orders: &[SortOrder]) -> Result<Results> {
        self.derive(|b| b.sort_by(fields, orders))
    }

    /// The objects with distinct values of `fields`, first occurrence kept.
    pub fn distinct(&self, fields: &[&str]) -> Result<Results> {
        self.derive(|b| b.distinct(fields))
    }

    fn field(&self, state: &RealmState, field: &str) -> Result<FieldDescriptor> {
        FieldDescriptor::resolve(&state.indices, self.state.query.class(), field)
    }

    /// Sum over the non-null values of `field`.
    pub fn sum(&self, field: &str) -> Result<Value> {
        self.with_keys(|state, keys| aggregate::sum(state.group.read(), &self.field(state, field)?, &keys))
    }

    /// Average over the non-null values of `field`; 0.0 when there are none.
    pub fn average(&self, field: &str) -> Result<f64> {
        self.with_keys(|state, keys| aggregate::average(state.group.read(), &self.field(state, field)?, &keys))
    }

    pub fn min(&self, field: &str) -> Result<Option<Value>> {
        self.with_keys(|state, keys| aggregate::min(state.group.read(), &self.field(state, field)?, &keys))
    }

    pub fn max(&self, field: &str) -> Result<Option<Value>> {
        self.with_keys(|state, keys| aggregate::max(state.group.read(), &self.field(state, field)?, &keys))
    }

    fn delete_keys(&self, pick: impl FnOnce(&[ObjKey]) -> Result<Vec<ObjKey>>) -> Result<bool> {
        let class = self.class().to_string();
        let deleted = {
            let mut state = self.inner.lock()?;
            let keys = self.state.keys(&state)?;
            let doomed = pick(&keys)?;
            let (group, log) = state.group.write()?;
            for key in &doomed {
                group.delete_object(&class, *key, log)?;
            }
            !doomed.is_empty()
        };
        if deleted {
            self.state.bump();
        }
        Ok(deleted)
    }

    /// Deletes the object at `index` from the file.
    pub fn delete_from_realm(&self, index: usize) -> Result<()> {
        self.delete_keys(|keys| {
            keys.get(index)
                .map(|k| vec![*k])
                .ok_or_else(|| Error::out_of_bounds(index, keys.len()))
        })?;
        Ok(())
    }

    /// Deletes the first object. Returns false if there was none.
    pub fn delete_first(&self) -> Result<bool> {
        self.delete_keys(|keys| Ok(keys.first().copied().into_iter().collect()))
    }

    /// Deletes the last object. Returns false if there was none.
    pub fn delete_last(&self) -> Result<bool> {
        self.delete_keys(|keys| Ok(keys.last().copied().into_iter().collect()))
    }

    /// Deletes every matching object. Returns false if there were none.
    pub fn delete_all_from_realm(&self) -> Result<bool> {
        self.delete_keys(|keys| Ok(keys.to_vec()))
    }

    /// Sets `field` to `value` on every matching object.
    pub fn set_value(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.update_all(field, |_| Ok(value))
    }

    /// Sets `field` on every matching object from text, parsed according to
    /// the stored type of the column.
    pub fn set_from_string(&self, field: &str, text: &str) -> Result<()> {
        self.update_all(field, |details| parse_value(details, text))
    }

    fn update_all(&self, field: &str, value: impl FnOnce(&ColumnDetails) -> Result<Value>) -> Result<()> {
        let class = self.class().to_string();
        let mut state = self.inner.lock()?;
        let columns = state.indices.require_class(&class)?;
        let details = columns.require(field)?;
        if details.primary_key {
            return Err(Error::primary_key_immutable(&class, field));
        }
        let value = value(details)?;
        let keys = self.state.keys(&state)?;
        let (group, log) = state.group.write()?;
        for key in keys {
            group.set_value(&class, key, details.key, value.clone(), log)?;
        }
        Ok(())
    }

    /// Adds a listener told about insertions, deletions and modifications.
    /// Async results fire once with every element inserted when they load.
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Results, &CollectionChangeSet) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock()?;
        state.results.register(&self.state);
        let mut data = self.state.data.lock();
        if data.loaded && data.notified.is_none() {
            self.state.refresh(&mut data, &state)?;
            data.notified = Some(data.keys.clone());
        }
        Ok(data.listeners.subscribe(Arc::new(listener)))
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<bool> {
        self.inner.check()?;
        Ok(self.state.data.lock().listeners.unsubscribe(id))
    }

    pub fn remove_all_change_listeners(&self) -> Result<()> {
        self.inner.check()?;
        let mut data = self.state.data.lock();
        data.listeners.clear();
        data.notified = None;
        Ok(())
    }

    /// A handle on the owning instance.
    pub fn realm(&self) -> Result<Realm> {
        self.inner.check()?;
        Ok(Realm::view(Arc::clone(&self.inner)))
    }
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("class", &self.class())
            .field("async", &self.state.is_async)
            .finish()
    }
}

/// Iterator over results; see the module documentation.
pub struct ResultsIter {
    results: Results,
    keys: Vec<ObjKey>,
    index: usize,
    expected: u64,
    failed: bool,
}

impl Iterator for ResultsIter {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(err) = self.results.inner.check() {
            self.failed = true;
            return Some(Err(err));
        }
        if self.results.state.mods() != self.expected {
            self.failed = true;
            return Some(Err(Error::ConcurrentModification));
        }
        let key = *self.keys.get(self.index)?;
        self.index += 1;
        Some(Ok(self.results.object(key)))
    }
}

/// Point-in-time contents of results. Objects deleted after the snapshot was
/// taken stay in it and read as invalid.
pub struct Snapshot {
    inner: Arc<RealmInner>,
    class: String,
    keys: Vec<ObjKey>,
}

impl Snapshot {
    pub fn size(&self) -> Result<usize> {
        self.inner.check()?;
        Ok(self.keys.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.inner.check()?;
        Ok(self.keys.is_empty())
    }

    pub fn get(&self, index: usize) -> Result<Object> {
        self.inner.check()?;
        let key = self
            .keys
            .get(index)
            .ok_or_else(|| Error::out_of_bounds(index, self.keys.len()))?;
        Ok(Object::attached(Arc::clone(&self.inner), &self.class, *key))
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Object> + '_> {
        self.inner.check()?;
        Ok(self
            .keys
            .iter()
            .map(|key| Object::attached(Arc::clone(&self.inner), &self.class, *key)))
    }

    /// Deletes every object of the snapshot that still exists.
    pub fn delete_all_from_realm(&self) -> Result<()> {
        self.inner.write(|group, log, _| {
            for key in &self.keys {
                if group.require_table(&self.class)?.contains(*key) {
                    group.delete_object(&self.class, *key, log)?;
                }
            }
            Ok(())
        })
    }
}
