//! A complete snapshot of the stored object graph.
//!
//! `Group` holds every table plus the schema version stamp. Committed groups
//! are immutable and shared through `Arc`; a write transaction works on a
//! clone whose tables are copied on first write.

use crate::journal::ChangeLog;
use crate::table::TableData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessel_core::schema::{ObjectSchema, Property, Schema};
use tessel_core::{ColKey, DataType, Error, ObjKey, Result, Value};

/// All tables of one version.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Group {
    schema_version: Option<u64>,
    tables: BTreeMap<String, Arc<TableData>>,
}

impl Group {
    /// Creates an empty group without a schema version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the schema version stamp, unset until a schema was committed.
    #[inline]
    pub fn schema_version(&self) -> Option<u64> {
        self.schema_version
    }

    /// Stamps the schema version.
    pub fn set_schema_version(&mut self, version: u64, log: &mut ChangeLog) {
        self.schema_version = Some(version);
        log.mark_schema_changed();
    }

    /// Returns the stored schema.
    pub fn schema(&self) -> Schema {
        Schema::from_stored(self.tables.values().map(|t| t.schema().clone()).collect())
    }

    /// Gets a table by class name.
    pub fn table(&self, name: &str) -> Option<&TableData> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    /// Gets a table by class name, failing with an unknown-class error.
    pub fn require_table(&self, name: &str) -> Result<&TableData> {
        self.table(name).ok_or_else(|| Error::unknown_class(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData> {
        self.tables
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::unknown_class(name))
    }

    /// Returns the class names.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Adds a table for a class.
    pub fn add_table(&mut self, schema: ObjectSchema, log: &mut ChangeLog) -> Result<()> {
        let name = schema.name().to_string();
        if self.tables.contains_key(&name) {
            return Err(Error::schema_mismatch(format!("class already exists: {}", name)));
        }
        self.tables.insert(name, Arc::new(TableData::new(schema)));
        log.mark_schema_changed();
        Ok(())
    }

    /// Removes a table. Fails while other classes still link to it.
    pub fn remove_table(&mut self, name: &str, log: &mut ChangeLog) -> Result<()> {
        for table in self.tables.values() {
            if table.name() == name {
                continue;
            }
            if let Some(prop) = table
                .schema()
                .properties()
                .iter()
                .find(|p| p.target_class() == Some(name))
            {
                return Err(Error::schema_mismatch(format!(
                    "class '{}' is still linked from '{}.{}'",
                    name,
                    table.name(),
                    prop.name()
                )));
            }
        }
        if self.tables.remove(name).is_none() {
            return Err(Error::unknown_class(name));
        }
        log.mark_schema_changed();
        Ok(())
    }

    /// Adds a column to a class.
    pub fn add_column(&mut self, class: &str, property: Property, log: &mut ChangeLog) -> Result<ColKey> {
        if let Some(target) = property.target_class() {
            self.require_table(target)?;
        }
        let col = self.table_mut(class)?.add_column(property)?;
        log.mark_schema_changed();
        Ok(col)
    }

    /// Removes a column from a class.
    pub fn remove_column(&mut self, class: &str, field: &str, log: &mut ChangeLog) -> Result<()> {
        self.table_mut(class)?.remove_column(field)?;
        log.mark_schema_changed();
        Ok(())
    }

    /// Renames a column of a class.
    pub fn rename_column(&mut self, class: &str, from: &str, to: &str, log: &mut ChangeLog) -> Result<()> {
        self.table_mut(class)?.rename_column(from, to)?;
        log.mark_schema_changed();
        Ok(())
    }

    /// Designates the primary key of a class.
    pub fn set_primary_key(&mut self, class: &str, field: Option<&str>, log: &mut ChangeLog) -> Result<()> {
        self.table_mut(class)?.set_primary_key(field)?;
        log.mark_schema_changed();
        Ok(())
    }

    /// Creates an object.
    pub fn create_object(&mut self, class: &str, values: Vec<Value>, log: &mut ChangeLog) -> Result<ObjKey> {
        self.check_links(class, None, &values)?;
        let key = self.table_mut(class)?.create(values)?;
        log.table_mut(class).insert(key);
        Ok(key)
    }

    /// Sets one column of an object.
    pub fn set_value(
        &mut self,
        class: &str,
        key: ObjKey,
        col: ColKey,
        value: Value,
        log: &mut ChangeLog,
    ) -> Result<()> {
        self.check_links(class, Some(col), std::slice::from_ref(&value))?;
        if self.table_mut(class)?.set(key, col, value)? {
            log.table_mut(class).modify(key, col);
        }
        Ok(())
    }

    /// Checks that every link in `values` points at an existing object.
    /// `col` selects a single column; `None` means `values` is a full row.
    fn check_links(&self, class: &str, col: Option<ColKey>, values: &[Value]) -> Result<()> {
        let table = self.require_table(class)?;
        let props = table.schema().properties();
        let pairs: Vec<(&Property, &Value)> = match col {
            Some(col) => match props.get(col.index()) {
                Some(prop) => values.iter().map(|v| (prop, v)).collect(),
                None => return Ok(()),
            },
            None => props.iter().zip(values.iter()).collect(),
        };
        for (prop, value) in pairs {
            match (prop.data_type(), prop.target_class()) {
                (DataType::Link, Some(target)) => {
                    let targets: Vec<&Value> = match value {
                        Value::List(items) => items.iter().collect(),
                        other => vec![other],
                    };
                    for link in targets {
                        if let Value::Link(key) = link {
                            if !self.require_table(target)?.contains(*key) {
                                return Err(Error::invalid_object(target));
                            }
                        }
                    }
                }
                (DataType::Mixed, _) => {
                    if let Value::TypedLink(link) = value {
                        if !self.require_table(&link.class)?.contains(link.key) {
                            return Err(Error::invalid_object(&link.class));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Deletes an object and removes every link pointing at it: single links
    /// become null, link lists drop the entry.
    pub fn delete_object(&mut self, class: &str, key: ObjKey, log: &mut ChangeLog) -> Result<()> {
        self.table_mut(class)?.remove(key)?;
        log.table_mut(class).delete(key);
        self.unlink(class, &[key], log);
        Ok(())
    }

    /// Deletes every object of a class.
    pub fn clear_table(&mut self, class: &str, log: &mut ChangeLog) -> Result<()> {
        let keys = self.table_mut(class)?.clear();
        for key in &keys {
            log.table_mut(class).delete(*key);
        }
        self.unlink(class, &keys, log);
        Ok(())
    }

    fn unlink(&mut self, class: &str, removed: &[ObjKey], log: &mut ChangeLog) {
        if removed.is_empty() {
            return;
        }
        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            let Some(table) = self.tables.get(&name) else {
                continue;
            };
            let cols: Vec<(ColKey, DataType)> = table
                .schema()
                .properties()
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    p.target_class() == Some(class) || p.data_type() == DataType::Mixed
                })
                .map(|(i, p)| (ColKey(i as u32), p.data_type()))
                .collect();
            if cols.is_empty() {
                continue;
            }
            let affected: Vec<(ObjKey, ColKey)> = table
                .rows()
                .flat_map(|row| {
                    cols.iter().filter_map(move |(col, dt)| {
                        let value = row.get(*col)?;
                        points_at(value, *dt, class, removed).then_some((row.key(), *col))
                    })
                })
                .collect();
            if affected.is_empty() {
                continue;
            }
            let table = Arc::make_mut(match self.tables.get_mut(&name) {
                Some(t) => t,
                None => continue,
            });
            for (obj, col) in affected {
                table.update_unchecked(obj, |row| {
                    if let Some(value) = row.get_mut(col) {
                        match value {
                            Value::List(items) => items.retain(|item| {
                                !matches!(item, Value::Link(k) if removed.contains(k))
                            }),
                            other => *other = Value::Null,
                        }
                    }
                });
                log.table_mut(&name).modify(obj, col);
            }
        }
    }

    /// Returns the objects of `source_class` whose `col` links to `target`.
    pub fn backlinks(&self, source_class: &str, col: ColKey, target: ObjKey) -> Result<Vec<ObjKey>> {
        let table = self.require_table(source_class)?;
        Ok(table
            .rows()
            .filter(|row| match row.get(col) {
                Some(Value::Link(k)) => *k == target,
                Some(Value::List(items)) => items.contains(&Value::Link(target)),
                _ => false,
            })
            .map(|row| row.key())
            .collect())
    }

    /// Rebuilds derived indexes after loading from disk.
    pub(crate) fn rebuild_indexes(&mut self) -> Result<()> {
        for table in self.tables.values_mut() {
            Arc::make_mut(table).rebuild_index()?;
        }
        Ok(())
    }
}

fn points_at(value: &Value, dt: DataType, class: &str, removed: &[ObjKey]) -> bool {
    match (dt, value) {
        (DataType::Link, Value::Link(k)) => removed.contains(k),
        (DataType::Link, Value::List(items)) => items
            .iter()
            .any(|item| matches!(item, Value::Link(k) if removed.contains(k))),
        (DataType::Mixed, Value::TypedLink(link)) => {
            link.class == class && removed.contains(&link.key)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::schema::ObjectSchemaBuilder;

    fn setup() -> (Group, ChangeLog) {
        let mut group = Group::new();
        let mut log = ChangeLog::new();
        let dog = ObjectSchemaBuilder::new("Dog")
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .build()
            .unwrap();
        let person = ObjectSchemaBuilder::new("Person")
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .link("favorite", "Dog")
            .unwrap()
            .link_list("dogs", "Dog")
            .unwrap()
            .build()
            .unwrap();
        group.add_table(dog, &mut log).unwrap();
        group.add_table(person, &mut log).unwrap();
        (group, log)
    }

    #[test]
    fn test_delete_nullifies_links() {
        let (mut group, mut log) = setup();
        let rex = group
            .create_object("Dog", vec![Value::from("Rex")], &mut log)
            .unwrap();
        let fido = group
            .create_object("Dog", vec![Value::from("Fido")], &mut log)
            .unwrap();
        let jane = group
            .create_object(
                "Person",
                vec![
                    Value::from("Jane"),
                    Value::Link(rex),
                    Value::List(vec![Value::Link(rex), Value::Link(fido)]),
                ],
                &mut log,
            )
            .unwrap();

        let mut log = ChangeLog::new();
        group.delete_object("Dog", rex, &mut log).unwrap();
        let row = group.table("Person").unwrap().get(jane).unwrap();
        assert_eq!(row.values()[1], Value::Null);
        assert_eq!(row.values()[2], Value::List(vec![Value::Link(fido)]));
        assert!(log.table("Person").unwrap().is_modified(jane));
        assert!(log.table("Dog").unwrap().is_deleted(rex));
    }

    #[test]
    fn test_dangling_link_rejected() {
        let (mut group, mut log) = setup();
        let result = group.create_object(
            "Person",
            vec![Value::from("Jane"), Value::Link(ObjKey(42)), Value::List(vec![])],
            &mut log,
        );
        assert!(matches!(result, Err(Error::InvalidObject { .. })));
    }

    #[test]
    fn test_backlinks() {
        let (mut group, mut log) = setup();
        let rex = group
            .create_object("Dog", vec![Value::from("Rex")], &mut log)
            .unwrap();
        let jane = group
            .create_object(
                "Person",
                vec![Value::from("Jane"), Value::Null, Value::List(vec![Value::Link(rex)])],
                &mut log,
            )
            .unwrap();
        assert_eq!(group.backlinks("Person", ColKey(2), rex).unwrap(), vec![jane]);
        assert!(group.backlinks("Person", ColKey(1), rex).unwrap().is_empty());
    }

    #[test]
    fn test_remove_linked_table_fails() {
        let (mut group, mut log) = setup();
        assert!(group.remove_table("Dog", &mut log).is_err());
        group.remove_table("Person", &mut log).unwrap();
        group.remove_table("Dog", &mut log).unwrap();
    }

    #[test]
    fn test_copy_on_write_snapshots() {
        let (mut group, mut log) = setup();
        group
            .create_object("Dog", vec![Value::from("Rex")], &mut log)
            .unwrap();
        let snapshot = Arc::new(group.clone());
        group
            .create_object("Dog", vec![Value::from("Fido")], &mut log)
            .unwrap();
        assert_eq!(snapshot.table("Dog").unwrap().len(), 1);
        assert_eq!(group.table("Dog").unwrap().len(), 2);
    }
}
