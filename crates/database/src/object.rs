//! Live objects.
//!
//! An [`Object`] binds one stored object to the instance it was read from.
//! Every accessor checks the owning thread and that the instance is open,
//! resolves the field through the column index cache and then reads or
//! writes the row. Writes additionally need a write transaction, and a
//! primary key can never be written once the object exists.
//!
//! Objects returned by `find_first_async` start out pending: they hold the
//! query instead of a row until a worker finds the first match.

use crate::collection::CollectionState;
use crate::list::List;
use crate::realm::{AsyncTarget, Realm, RealmInner, RealmState};
use crate::results::Results;
use crate::row_ref::{Access, RowRef};
use crate::set::RealmSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tessel_core::schema::{ClassColumns, ColumnDetails};
use tessel_core::{CollectionType, DataType, Decimal128, Error, FromValue, ObjKey, ObjectId, Result, TypedLink, Value};
use tessel_query::{Query, QueryBuilder, QuerySource};
use tessel_reactive::{ListenerId, ListenerRegistry, ObjectChangeSet};
use tessel_storage::ChangeLog;
use uuid::Uuid;

/// Callback fired when a live object changed or was deleted.
pub type ObjectListener = dyn Fn(&Object, &ObjectChangeSet) + Send + Sync;

pub(crate) enum ObjectRow {
    /// Waiting for the first match of an asynchronous query.
    Pending(Query),
    Loaded(RowRef),
}

struct ObjectData {
    row: ObjectRow,
    listeners: ListenerRegistry<ObjectListener>,
    request_seq: u64,
    /// Set when a pending object was filled in and listeners were not yet
    /// told.
    just_loaded: bool,
    /// Set once listeners were told about a deletion.
    gone: bool,
}

pub(crate) struct ObjectState {
    class: String,
    data: Mutex<ObjectData>,
}

impl ObjectState {
    fn new(class: &str, row: ObjectRow) -> Arc<Self> {
        Arc::new(Self {
            class: class.to_string(),
            data: Mutex::new(ObjectData {
                row,
                listeners: ListenerRegistry::new(),
                request_seq: 0,
                just_loaded: false,
                gone: false,
            }),
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.data.lock().row, ObjectRow::Pending(_))
    }

    pub fn pending_query(&self) -> Option<Query> {
        match &self.data.lock().row {
            ObjectRow::Pending(query) => Some(query.clone()),
            ObjectRow::Loaded(_) => None,
        }
    }

    pub fn begin_request(&self) -> u64 {
        let mut data = self.data.lock();
        data.request_seq += 1;
        data.request_seq
    }

    pub fn request_seq(&self) -> u64 {
        self.data.lock().request_seq
    }

    /// Fills in a pending object. A loaded object is left alone.
    pub fn adopt(&self, key: Option<ObjKey>, access: Access) {
        let mut data = self.data.lock();
        if matches!(data.row, ObjectRow::Pending(_)) {
            data.row = ObjectRow::Loaded(key.map_or(RowRef::Invalid, |k| RowRef::attached(k, access)));
            data.just_loaded = true;
        }
    }

    /// Row reference; a pending object reads as invalid.
    fn row(&self) -> RowRef {
        match self.data.lock().row {
            ObjectRow::Pending(_) => RowRef::Invalid,
            ObjectRow::Loaded(row) => row,
        }
    }

    pub fn pending_notification(
        &self,
        state: &RealmState,
        log: &ChangeLog,
    ) -> Option<(Vec<Arc<ObjectListener>>, ObjectChangeSet)> {
        let mut data = self.data.lock();
        if data.listeners.is_empty() {
            data.just_loaded = false;
            return None;
        }
        let ObjectRow::Loaded(row) = data.row else {
            return None;
        };
        if data.just_loaded {
            data.just_loaded = false;
            return Some((data.listeners.snapshot(), ObjectChangeSet::new(false, Vec::new())));
        }
        let key = row.key()?;
        if data.gone {
            return None;
        }
        let changes = log.table(&self.class);
        if changes.is_some_and(|t| t.is_deleted(key)) || !row.is_valid(state.group.read(), &self.class) {
            data.gone = true;
            return Some((data.listeners.snapshot(), ObjectChangeSet::deleted()));
        }
        let modified = changes.and_then(|t| t.modified().get(&key))?;
        let columns = state.indices.class(&self.class)?;
        let fields: Vec<String> = modified
            .iter()
            .filter_map(|col| columns.by_key(*col).map(|c| c.name.clone()))
            .collect();
        if fields.is_empty() {
            return None;
        }
        Some((data.listeners.snapshot(), ObjectChangeSet::new(false, fields)))
    }
}

/// A live object of a stored class.
#[derive(Clone)]
pub struct Object {
    inner: Arc<RealmInner>,
    state: Arc<ObjectState>,
}

impl Object {
    pub(crate) fn attached(inner: Arc<RealmInner>, class: &str, key: ObjKey) -> Object {
        let row = RowRef::attached(key, inner.access());
        Object {
            inner,
            state: ObjectState::new(class, ObjectRow::Loaded(row)),
        }
    }

    /// A placeholder filled in by the first match of `query`.
    pub(crate) fn pending(inner: Arc<RealmInner>, query: Query) -> Object {
        let class = query.class().to_string();
        Object {
            inner,
            state: ObjectState::new(&class, ObjectRow::Pending(query)),
        }
    }

    pub(crate) fn from_state(inner: Arc<RealmInner>, state: Arc<ObjectState>) -> Object {
        Object { inner, state }
    }

    pub(crate) fn inner(&self) -> &Arc<RealmInner> {
        &self.inner
    }

    pub(crate) fn async_target(&self) -> AsyncTarget {
        AsyncTarget::Object(Arc::clone(&self.state))
    }

    pub fn class_name(&self) -> Result<&str> {
        self.inner.check()?;
        Ok(self.class())
    }

    pub(crate) fn class(&self) -> &str {
        &self.state.class
    }

    /// Key of the stored object.
    pub fn key(&self) -> Result<ObjKey> {
        self.inner.check()?;
        self.state.row().key().ok_or_else(|| Error::invalid_object(&self.state.class))
    }

    /// Returns false once the object was deleted, the query behind a pending
    /// object found nothing, or the instance was closed.
    pub fn is_valid(&self) -> Result<bool> {
        match self.inner.check() {
            Ok(()) => {}
            Err(Error::InstanceClosed { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
        let row = self.state.row();
        self.inner.read(|group, _| Ok(row.is_valid(group, &self.state.class)))
    }

    /// Returns false while an asynchronous query is still looking for the
    /// object.
    pub fn is_loaded(&self) -> Result<bool> {
        self.inner.check()?;
        Ok(!self.state.is_pending())
    }

    /// Finds the object synchronously if it is still pending. Any answer
    /// already on its way from a worker is discarded.
    pub fn load(&self) -> Result<bool> {
        self.inner.check()?;
        let Some(query) = self.state.pending_query() else {
            return Ok(true);
        };
        self.state.begin_request();
        let key = self.inner.read(|group, _| {
            if !query.is_source_valid(group) {
                return Ok(None);
            }
            query.find_first(group)
        })?;
        self.state.adopt(key, self.inner.access());
        Ok(true)
    }

    /// A handle on the owning instance.
    pub fn realm(&self) -> Result<Realm> {
        self.inner.check()?;
        Ok(Realm::view(Arc::clone(&self.inner)))
    }

    fn columns(&self, state: &RealmState) -> Result<Arc<ClassColumns>> {
        state.indices.require_class(&self.state.class)
    }

    /// Reads a field as a stored value. Link fields read as
    /// [`Value::Link`], collections as [`Value::List`].
    pub fn get(&self, field: &str) -> Result<Value> {
        let state = self.inner.lock()?;
        let columns = self.columns(&state)?;
        self.state.row().get(state.group.read(), &columns, field)
    }

    /// Reads a field converted to `T`; `None` for null. The column must
    /// store `T` (or be a mixed column currently holding a `T`).
    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<Option<T>> {
        let state = self.inner.lock()?;
        let columns = self.columns(&state)?;
        let row = self.state.row();
        let details = row.column(state.group.read(), &columns, field)?;
        let mixed = details.col_type.data_type == DataType::Mixed;
        if details.col_type.collection.is_collection() || (!mixed && details.col_type.data_type != T::DATA_TYPE) {
            return Err(Error::type_mismatch(field, T::DATA_TYPE, details.col_type));
        }
        let value = row.get(state.group.read(), &columns, field)?;
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(&value)
            .map(Some)
            .ok_or_else(|| Error::type_mismatch(field, T::DATA_TYPE, value.type_name()))
    }

    pub fn get_bool(&self, field: &str) -> Result<Option<bool>> {
        self.get_as(field)
    }

    pub fn get_int(&self, field: &str) -> Result<Option<i64>> {
        self.get_as(field)
    }

    pub fn get_float(&self, field: &str) -> Result<Option<f32>> {
        self.get_as(field)
    }

    pub fn get_double(&self, field: &str) -> Result<Option<f64>> {
        self.get_as(field)
    }

    pub fn get_string(&self, field: &str) -> Result<Option<String>> {
        self.get_as(field)
    }

    pub fn get_binary(&self, field: &str) -> Result<Option<Vec<u8>>> {
        self.get_as(field)
    }

    pub fn get_decimal(&self, field: &str) -> Result<Option<Decimal128>> {
        self.get_as(field)
    }

    pub fn get_object_id(&self, field: &str) -> Result<Option<ObjectId>> {
        self.get_as(field)
    }

    pub fn get_uuid(&self, field: &str) -> Result<Option<Uuid>> {
        self.get_as(field)
    }

    /// Reads a date field as milliseconds since the Unix epoch.
    pub fn get_date(&self, field: &str) -> Result<Option<i64>> {
        let value = self.get(field)?;
        let details = self.details(field)?;
        if details.col_type.data_type != DataType::Date && details.col_type.data_type != DataType::Mixed {
            return Err(Error::type_mismatch(field, DataType::Date, details.col_type));
        }
        match value {
            Value::Null => Ok(None),
            Value::Date(ms) => Ok(Some(ms)),
            other => Err(Error::type_mismatch(field, DataType::Date, other.type_name())),
        }
    }

    fn details(&self, field: &str) -> Result<ColumnDetails> {
        let state = self.inner.lock()?;
        let columns = self.columns(&state)?;
        self.state.row().column(state.group.read(), &columns, field).cloned()
    }

    /// Follows a single link; `None` for a null link.
    pub fn get_object(&self, field: &str) -> Result<Option<Object>> {
        let details = self.details(field)?;
        if !details.col_type.is_link() || details.col_type.collection.is_collection() {
            return Err(Error::type_mismatch(field, "object", details.col_type));
        }
        let target = details.target_class.unwrap_or_default();
        match self.get(field)? {
            Value::Link(key) => Ok(Some(Object::attached(Arc::clone(&self.inner), &target, key))),
            _ => Ok(None),
        }
    }

    /// Follows the typed link held by a mixed field.
    pub fn get_mixed_object(&self, field: &str) -> Result<Option<Object>> {
        match self.get(field)? {
            Value::TypedLink(link) => Ok(Some(Object::attached(Arc::clone(&self.inner), &link.class, link.key))),
            _ => Ok(None),
        }
    }

    fn collection(&self, field: &str, kind: CollectionType) -> Result<Arc<CollectionState>> {
        let state = self.inner.lock()?;
        let key = self.state.row().row(state.group.read(), &self.state.class)?.key();
        CollectionState::resolve(&state.indices, &self.state.class, key, field, kind)
    }

    /// The list stored in `field`.
    pub fn get_list(&self, field: &str) -> Result<List> {
        let state = self.collection(field, CollectionType::List)?;
        Ok(List::managed(Arc::clone(&self.inner), state))
    }

    /// The set stored in `field`.
    pub fn get_set(&self, field: &str) -> Result<RealmSet> {
        let state = self.collection(field, CollectionType::Set)?;
        Ok(RealmSet::managed(Arc::clone(&self.inner), state))
    }

    /// Writes a field. Needs a write transaction; primary keys are rejected
    /// whether or not one is active. Writing null to a link clears the link
    /// without touching its target.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut state = self.inner.lock()?;
        let columns = self.columns(&state)?;
        let row = self.state.row();
        let details = row.column(state.group.read(), &columns, field)?;
        if details.primary_key {
            return Err(Error::primary_key_immutable(&self.state.class, field));
        }
        let col = details.key;
        let (group, log) = state.group.write()?;
        let key = row.row(group, &self.state.class)?.key();
        group.set_value(&self.state.class, key, col, value, log)
    }

    pub fn set_null(&self, field: &str) -> Result<()> {
        self.set(field, Value::Null)
    }

    /// Points a single link at `target`, or clears it.
    pub fn set_object(&self, field: &str, target: Option<&Object>) -> Result<()> {
        let details = self.details(field)?;
        if !details.col_type.is_link() || details.col_type.collection.is_collection() {
            return Err(Error::type_mismatch(field, "object", details.col_type));
        }
        let value = match target {
            Some(target) => target.link_value(&self.inner, details.target_class.as_deref())?,
            None => Value::Null,
        };
        self.set(field, value)
    }

    /// Stores a link to `target` in a mixed field.
    pub fn set_mixed_object(&self, field: &str, target: &Object) -> Result<()> {
        let Value::Link(key) = target.link_value(&self.inner, None)? else {
            return Err(Error::invalid_object(target.class()));
        };
        self.set(
            field,
            Value::TypedLink(TypedLink {
                class: target.class().to_string(),
                key,
            }),
        )
    }

    /// Link to this object, as stored in a field of another object of
    /// `inner`. Fails for objects of another instance or of the wrong class.
    pub(crate) fn link_value(&self, inner: &Arc<RealmInner>, expected: Option<&str>) -> Result<Value> {
        if !Arc::ptr_eq(&self.inner, inner) {
            return Err(Error::cross_instance(format!(
                "'{}' object belongs to another instance",
                self.state.class
            )));
        }
        if let Some(expected) = expected {
            if expected != self.state.class {
                return Err(Error::type_mismatch("link", expected, &self.state.class));
            }
        }
        Ok(Value::Link(self.key()?))
    }

    /// Live results of the objects of `source_class` whose `source_field`
    /// links to this object.
    pub fn linking_objects(&self, source_class: &str, source_field: &str) -> Result<Results> {
        let query = {
            let state = self.inner.lock()?;
            let key = self.state.row().row(state.group.read(), &self.state.class)?.key();
            let source = state.indices.require_class(source_class)?;
            let details = source.require(source_field)?;
            if !details.col_type.is_link() || details.target_class.as_deref() != Some(&self.state.class) {
                return Err(Error::type_mismatch(
                    source_field,
                    format!("link to {}", self.state.class),
                    details.col_type,
                ));
            }
            QueryBuilder::with_source(
                Arc::clone(&state.indices),
                source_class,
                QuerySource::Backlinks {
                    col: details.key,
                    target_class: self.state.class.clone(),
                    target: key,
                },
            )?
            .build()?
        };
        Results::evaluated(Arc::clone(&self.inner), query)
    }

    /// Deletes the object. Links to it become null and link lists drop it.
    pub fn delete_from_realm(&self) -> Result<()> {
        let row = self.state.row();
        self.inner.write(|group, log, _| {
            let key = row.row(group, &self.state.class)?.key();
            group.delete_object(&self.state.class, key, log)
        })
    }

    /// Adds a listener told about changed fields and deletion.
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Object, &ObjectChangeSet) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock()?;
        state.objects.register(&self.state);
        Ok(self.state.data.lock().listeners.subscribe(Arc::new(listener)))
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> Result<bool> {
        self.inner.check()?;
        Ok(self.state.data.lock().listeners.unsubscribe(id))
    }

    pub fn remove_all_change_listeners(&self) -> Result<()> {
        self.inner.check()?;
        self.state.data.lock().listeners.clear();
        Ok(())
    }

    /// Returns true if both handles refer to the same stored object of the
    /// same instance.
    pub fn same_object(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            && self.state.class == other.state.class
            && self.state.row().key().is_some()
            && self.state.row().key() == other.state.row().key()
    }
}

impl fmt::Display for Object {
    /// Renders fields as `{name:value}`. Links print their target class and
    /// key only, so cyclic graphs stay bounded.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = &self.state.class;
        let Ok(state) = self.inner.lock() else {
            return write!(f, "{} = [invalid]", class);
        };
        let (Ok(columns), Ok(row)) = (
            self.columns(&state),
            self.state.row().row(state.group.read(), class).cloned(),
        ) else {
            return write!(f, "{} = [invalid]", class);
        };
        write!(f, "{} = [", class)?;
        for (i, details) in columns.columns().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let value = row.get(details.key).cloned().unwrap_or_default();
            let target = details.target_class.as_deref().unwrap_or("?");
            match (&value, details.col_type.collection) {
                (Value::Link(key), _) => write!(f, "{{{}:{}({})}}", details.name, target, key)?,
                (Value::List(items), _) if details.col_type.is_link() => {
                    write!(f, "{{{}:List<{}>[{}]}}", details.name, target, items.len())?
                }
                (Value::List(items), CollectionType::Set) => {
                    write!(f, "{{{}:Set<{}>[{}]}}", details.name, details.col_type.data_type, items.len())?
                }
                (Value::List(items), _) => {
                    write!(f, "{{{}:List<{}>[{}]}}", details.name, details.col_type.data_type, items.len())?
                }
                (value, _) => write!(f, "{{{}:{}}}", details.name, value)?,
            }
        }
        f.write_str("]")
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.state.class)
            .field("key", &self.state.row().key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use tessel_core::schema::{ObjectSchema, ObjectSchemaBuilder};

    fn dog() -> ObjectSchema {
        ObjectSchemaBuilder::new("Dog")
            .unwrap()
            .field("id", DataType::Int)
            .unwrap()
            .primary_key("id")
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .optional("weight", DataType::Double)
            .unwrap()
            .link("friend", "Dog")
            .unwrap()
            .build()
            .unwrap()
    }

    fn open(name: &str) -> Realm {
        let config = Configuration::builder(name).in_memory().class(dog()).build().unwrap();
        Realm::get_instance(&config).unwrap()
    }

    #[test]
    fn test_typed_access() {
        let mut realm = open("object_typed_access");
        realm.begin_transaction().unwrap();
        let rex = realm.create_object_with_primary_key("Dog", 1i64).unwrap();
        rex.set("name", "Rex").unwrap();
        realm.commit_transaction().unwrap();

        assert_eq!(rex.get_string("name").unwrap().as_deref(), Some("Rex"));
        assert_eq!(rex.get_double("weight").unwrap(), None);
        assert!(matches!(rex.get_int("name"), Err(Error::TypeMismatch { .. })));
        assert!(matches!(rex.get("color"), Err(Error::UnknownField { .. })));
        realm.close().unwrap();
    }

    #[test]
    fn test_writes_need_transaction_and_pk_is_immutable() {
        let mut realm = open("object_write_rules");
        realm.begin_transaction().unwrap();
        let rex = realm.create_object_with_primary_key("Dog", 1i64).unwrap();
        realm.commit_transaction().unwrap();

        assert!(matches!(rex.set("name", "Rex"), Err(Error::NotInTransaction)));
        assert!(matches!(rex.set("id", 2i64), Err(Error::PrimaryKeyImmutable { .. })));
        realm.begin_transaction().unwrap();
        assert!(matches!(rex.set("id", 2i64), Err(Error::PrimaryKeyImmutable { .. })));
        rex.set("name", "Rex").unwrap();
        realm.commit_transaction().unwrap();
        realm.close().unwrap();
    }

    #[test]
    fn test_null_link_keeps_target() {
        let mut realm = open("object_null_link");
        realm.begin_transaction().unwrap();
        let rex = realm.create_object_with_primary_key("Dog", 1i64).unwrap();
        let fido = realm.create_object_with_primary_key("Dog", 2i64).unwrap();
        rex.set_object("friend", Some(&fido)).unwrap();
        assert!(rex.get_object("friend").unwrap().unwrap().same_object(&fido));
        rex.set_object("friend", None).unwrap();
        realm.commit_transaction().unwrap();

        assert!(rex.get_object("friend").unwrap().is_none());
        assert!(fido.is_valid().unwrap());
        realm.close().unwrap();
    }

    #[test]
    fn test_deleted_object_is_invalid() {
        let mut realm = open("object_deleted_invalid");
        realm.begin_transaction().unwrap();
        let rex = realm.create_object_with_primary_key("Dog", 1i64).unwrap();
        rex.delete_from_realm().unwrap();
        realm.commit_transaction().unwrap();

        assert!(!rex.is_valid().unwrap());
        assert!(matches!(rex.get("name"), Err(Error::InvalidObject { .. })));
        assert_eq!(rex.to_string(), "Dog = [invalid]");
        realm.close().unwrap();
    }

    #[test]
    fn test_display_does_not_follow_links() {
        let mut realm = open("object_display");
        realm.begin_transaction().unwrap();
        let rex = realm.create_object_with_primary_key("Dog", 1i64).unwrap();
        rex.set("name", "Rex").unwrap();
        rex.set_object("friend", Some(&rex)).unwrap();
        realm.commit_transaction().unwrap();

        let text = rex.to_string();
        assert!(text.starts_with("Dog = [{id:1},{name:Rex}"));
        assert!(text.contains("{friend:Dog("));
        realm.close().unwrap();
    }
}
