//! Object storage for one class.
//!
//! This module provides `TableData`, an ordered map of objects with a
//! primary-key index, and the value checks applied on every write.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessel_core::schema::{ObjectSchema, Property};
use tessel_core::{ColKey, DataType, Error, ObjKey, Result, Row, Value};

/// Rows of one class, keyed by object key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableData {
    schema: ObjectSchema,
    rows: BTreeMap<ObjKey, Arc<Row>>,
    #[serde(skip)]
    pk_index: HashMap<Value, ObjKey>,
    next_key: i64,
}

impl TableData {
    /// Creates an empty table for the given class.
    pub fn new(schema: ObjectSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            pk_index: HashMap::new(),
            next_key: 0,
        }
    }

    /// Returns the class definition.
    #[inline]
    pub fn schema(&self) -> &ObjectSchema {
        &self.schema
    }

    /// Returns the class name.
    #[inline]
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Returns the number of objects.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no objects.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gets an object by key.
    pub fn get(&self, key: ObjKey) -> Option<&Arc<Row>> {
        self.rows.get(&key)
    }

    /// Returns true if an object with this key exists.
    pub fn contains(&self, key: ObjKey) -> bool {
        self.rows.contains_key(&key)
    }

    /// Iterates keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = ObjKey> + '_ {
        self.rows.keys().copied()
    }

    /// Iterates rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &Arc<Row>> + '_ {
        self.rows.values()
    }

    /// Finds an object by primary key value.
    pub fn find_by_primary_key(&self, value: &Value) -> Option<ObjKey> {
        self.pk_index.get(value).copied()
    }

    fn pk_col(&self) -> Option<usize> {
        self.schema.properties().iter().position(|p| p.is_primary_key())
    }

    fn property(&self, col: ColKey) -> Result<&Property> {
        self.schema
            .properties()
            .get(col.index())
            .ok_or_else(|| Error::invalid_argument(format!("{} is not a column of {}", col, self.name())))
    }

    /// Creates an object from a full row of values.
    pub fn create(&mut self, values: Vec<Value>) -> Result<ObjKey> {
        let props = self.schema.properties();
        if values.len() != props.len() {
            return Err(Error::invalid_argument(format!(
                "{} expects {} values, got {}",
                self.name(),
                props.len(),
                values.len()
            )));
        }
        for (prop, value) in props.iter().zip(values.iter()) {
            check_value(self.schema.name(), prop, value)?;
        }
        if let Some(pk) = self.pk_col() {
            if self.pk_index.contains_key(&values[pk]) {
                return Err(Error::duplicate_primary_key(self.name(), &values[pk]));
            }
        }

        let key = ObjKey(self.next_key);
        self.next_key += 1;
        if let Some(pk) = self.pk_col() {
            self.pk_index.insert(values[pk].clone(), key);
        }
        self.rows.insert(key, Arc::new(Row::new(key, values)));
        Ok(key)
    }

    /// Sets one column of an object. Returns true if the stored value changed.
    pub fn set(&mut self, key: ObjKey, col: ColKey, value: Value) -> Result<bool> {
        let prop = self.property(col)?.clone();
        check_value(self.schema.name(), &prop, &value)?;
        let name = self.schema.name().to_string();
        let row = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| Error::invalid_object(&name))?;
        if row.get(col) == Some(&value) {
            return Ok(false);
        }
        if prop.is_primary_key() {
            if self.pk_index.get(&value).is_some_and(|other| *other != key) {
                return Err(Error::duplicate_primary_key(&name, &value));
            }
            if let Some(old) = row.get(col) {
                self.pk_index.remove(old);
            }
            self.pk_index.insert(value.clone(), key);
        }
        let row = Arc::make_mut(row);
        row.set(col, value);
        row.increment_version();
        Ok(true)
    }

    /// Removes an object.
    pub fn remove(&mut self, key: ObjKey) -> Result<Arc<Row>> {
        let row = self
            .rows
            .remove(&key)
            .ok_or_else(|| Error::invalid_object(self.schema.name()))?;
        if let Some(pk) = self.pk_col() {
            if let Some(value) = row.values().get(pk) {
                self.pk_index.remove(value);
            }
        }
        Ok(row)
    }

    /// Removes every object.
    pub fn clear(&mut self) -> Vec<ObjKey> {
        let keys = self.rows.keys().copied().collect();
        self.rows.clear();
        self.pk_index.clear();
        keys
    }

    /// Rewrites values in place without validation. Used by cascading link
    /// cleanup, which only ever narrows values.
    pub(crate) fn update_unchecked(&mut self, key: ObjKey, f: impl FnOnce(&mut Row)) {
        if let Some(row) = self.rows.get_mut(&key) {
            let row = Arc::make_mut(row);
            f(row);
            row.increment_version();
        }
    }

    /// Appends a column, filling existing objects with its default value.
    pub fn add_column(&mut self, property: Property) -> Result<ColKey> {
        if property.is_primary_key() {
            return Err(Error::schema_mismatch(
                "primary keys are designated after the column exists",
            ));
        }
        let default = property.default_value();
        let idx = self.schema.push_property(property)?;
        for row in self.rows.values_mut() {
            Arc::make_mut(row).values_mut().push(default.clone());
        }
        Ok(ColKey(idx as u32))
    }

    /// Removes a column from the class and from every object.
    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        let was_pk = self.schema.property(name).is_some_and(|p| p.is_primary_key());
        let idx = self.schema.remove_property(name)?;
        for row in self.rows.values_mut() {
            Arc::make_mut(row).values_mut().remove(idx);
        }
        if was_pk {
            self.pk_index.clear();
        }
        Ok(())
    }

    /// Renames a column.
    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        self.schema.rename_property(from, to)
    }

    /// Designates (or clears) the primary key, checking existing values are unique.
    pub fn set_primary_key(&mut self, field: Option<&str>) -> Result<()> {
        let mut schema = self.schema.clone();
        schema.set_primary_key(field)?;
        let previous = std::mem::replace(&mut self.schema, schema);
        if let Err(err) = self.rebuild_index() {
            self.schema = previous;
            self.rebuild_index()?;
            return Err(err);
        }
        Ok(())
    }

    /// Rebuilds the primary key index from the stored rows.
    pub(crate) fn rebuild_index(&mut self) -> Result<()> {
        self.pk_index.clear();
        let Some(pk) = self.pk_col() else {
            return Ok(());
        };
        for row in self.rows.values() {
            let value = row.values()[pk].clone();
            if self.pk_index.insert(value.clone(), row.key()).is_some() {
                return Err(Error::duplicate_primary_key(self.schema.name(), value));
            }
        }
        Ok(())
    }
}

/// Checks a value can be stored in a property.
pub fn check_value(class: &str, prop: &Property, value: &Value) -> Result<()> {
    let dt = prop.data_type();
    if prop.collection().is_collection() {
        let Value::List(items) = value else {
            return Err(Error::type_mismatch(prop.name(), prop.col_type(), value.type_name()));
        };
        for item in items {
            check_element(class, prop, dt, item)?;
        }
        return Ok(());
    }
    check_element(class, prop, dt, value)
}

fn check_element(class: &str, prop: &Property, dt: DataType, value: &Value) -> Result<()> {
    if value.is_null() {
        if prop.is_nullable() {
            return Ok(());
        }
        return Err(Error::null_not_allowed(class, prop.name()));
    }
    if value.fits(dt) {
        Ok(())
    } else {
        Err(Error::type_mismatch(prop.name(), dt, value.type_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::schema::ObjectSchemaBuilder;

    fn person() -> ObjectSchema {
        ObjectSchemaBuilder::new("Person")
            .unwrap()
            .field("id", DataType::Int)
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .primary_key("id")
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let mut table = TableData::new(person());
        let key = table
            .create(vec![Value::Int(1), Value::from("Alice")])
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(key).unwrap().values()[1], Value::from("Alice"));
        assert_eq!(table.find_by_primary_key(&Value::Int(1)), Some(key));
    }

    #[test]
    fn test_duplicate_primary_key() {
        let mut table = TableData::new(person());
        table.create(vec![Value::Int(1), Value::Null]).unwrap();
        let err = table.create(vec![Value::Int(1), Value::Null]).unwrap_err();
        assert!(matches!(err, Error::DuplicatePrimaryKey { .. }));
    }

    #[test]
    fn test_type_checks() {
        let mut table = TableData::new(person());
        assert!(matches!(
            table.create(vec![Value::from("x"), Value::Null]),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.create(vec![Value::Null, Value::Null]),
            Err(Error::NullNotAllowed { .. })
        ));
    }

    #[test]
    fn test_keys_are_not_reused() {
        let mut table = TableData::new(person());
        let a = table.create(vec![Value::Int(1), Value::Null]).unwrap();
        table.remove(a).unwrap();
        let b = table.create(vec![Value::Int(1), Value::Null]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_reports_change() {
        let mut table = TableData::new(person());
        let key = table.create(vec![Value::Int(1), Value::Null]).unwrap();
        assert!(table.set(key, ColKey(1), Value::from("Bob")).unwrap());
        assert!(!table.set(key, ColKey(1), Value::from("Bob")).unwrap());
        assert_eq!(table.get(key).unwrap().version(), 2);
    }

    #[test]
    fn test_add_and_remove_column() {
        let mut table = TableData::new(person());
        let key = table.create(vec![Value::Int(1), Value::Null]).unwrap();
        let col = table
            .add_column(Property::scalar("age", DataType::Int))
            .unwrap();
        assert_eq!(table.get(key).unwrap().get(col), Some(&Value::Int(0)));
        table.remove_column("name").unwrap();
        assert_eq!(table.get(key).unwrap().len(), 2);
        assert_eq!(table.schema().property_index("age"), Some(1));
    }

    #[test]
    fn test_set_primary_key_rejects_duplicates() {
        let schema = ObjectSchemaBuilder::new("T")
            .unwrap()
            .field("code", DataType::String)
            .unwrap()
            .build()
            .unwrap();
        let mut table = TableData::new(schema);
        table.create(vec![Value::from("a")]).unwrap();
        table.create(vec![Value::from("a")]).unwrap();
        assert!(table.set_primary_key(Some("code")).is_err());
        assert!(table.schema().primary_key().is_none());
    }
}
