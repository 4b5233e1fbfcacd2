//! Schema migrations.
//!
//! A migration runs inside the write transaction that opens a file whose
//! stored schema version is lower than the configured one. It edits the
//! stored schema and data through a [`MigrationContext`]; when it returns,
//! the stored schema must match the declared one or the whole transaction is
//! rolled back and the stored version stays where it was.

use tessel_core::schema::{ObjectSchema, Property, Schema};
use tessel_core::{ColKey, Error, ObjKey, Result, Value};
use tessel_storage::{ChangeLog, Group};

/// Upgrades stored data from one schema version to another.
pub trait Migration: Send + Sync {
    fn migrate(&self, ctx: &mut MigrationContext<'_>, old_version: u64, new_version: u64) -> Result<()>;
}

impl<F> Migration for F
where
    F: Fn(&mut MigrationContext<'_>, u64, u64) -> Result<()> + Send + Sync,
{
    fn migrate(&self, ctx: &mut MigrationContext<'_>, old_version: u64, new_version: u64) -> Result<()> {
        self(ctx, old_version, new_version)
    }
}

/// Schema-level access to the file being migrated.
pub struct MigrationContext<'a> {
    group: &'a mut Group,
    log: &'a mut ChangeLog,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(group: &'a mut Group, log: &'a mut ChangeLog) -> Self {
        Self { group, log }
    }

    /// Returns the stored schema as it currently is.
    pub fn schema(&self) -> Schema {
        self.group.schema()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.group.table_names().map(str::to_string).collect()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.group.table(class).is_some()
    }

    pub fn create_class(&mut self, schema: ObjectSchema) -> Result<()> {
        self.group.add_table(schema, self.log)
    }

    pub fn remove_class(&mut self, class: &str) -> Result<()> {
        self.group.remove_table(class, self.log)
    }

    /// Adds a field; existing objects get the field's default value.
    pub fn add_field(&mut self, class: &str, property: Property) -> Result<()> {
        self.group.add_column(class, property, self.log).map(|_| ())
    }

    pub fn remove_field(&mut self, class: &str, field: &str) -> Result<()> {
        self.group.remove_column(class, field, self.log)
    }

    pub fn rename_field(&mut self, class: &str, from: &str, to: &str) -> Result<()> {
        self.group.rename_column(class, from, to, self.log)
    }

    /// Makes `field` the primary key. Fails if stored values are not unique.
    pub fn add_primary_key(&mut self, class: &str, field: &str) -> Result<()> {
        self.group.set_primary_key(class, Some(field), self.log)
    }

    pub fn remove_primary_key(&mut self, class: &str) -> Result<()> {
        self.group.set_primary_key(class, None, self.log)
    }

    /// Visits every object of `class`.
    pub fn enumerate<F>(&mut self, class: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&mut MigrationObject<'_>) -> Result<()>,
    {
        let keys: Vec<ObjKey> = self.group.require_table(class)?.keys().collect();
        for key in keys {
            let mut object = MigrationObject {
                group: &mut *self.group,
                log: &mut *self.log,
                class,
                key,
            };
            f(&mut object)?;
        }
        Ok(())
    }

    /// Creates an object; fields not listed get their default value.
    pub fn create_object(&mut self, class: &str, fields: &[(&str, Value)]) -> Result<ObjKey> {
        let table = self.group.require_table(class)?;
        let schema = table.schema();
        let mut values: Vec<Value> = schema.properties().iter().map(Property::default_value).collect();
        for (name, value) in fields {
            let index = schema
                .property_index(name)
                .ok_or_else(|| Error::unknown_field(class, *name))?;
            values[index] = value.clone();
        }
        self.group.create_object(class, values, self.log)
    }

    pub fn delete_object(&mut self, class: &str, key: ObjKey) -> Result<()> {
        self.group.delete_object(class, key, self.log)
    }

    /// Deletes every object of `class`.
    pub fn delete_all(&mut self, class: &str) -> Result<()> {
        self.group.clear_table(class, self.log)
    }
}

/// One object visited by [`MigrationContext::enumerate`]. Fields are
/// addressed by their stored names, so renamed fields use the new name.
pub struct MigrationObject<'a> {
    group: &'a mut Group,
    log: &'a mut ChangeLog,
    class: &'a str,
    key: ObjKey,
}

impl MigrationObject<'_> {
    #[inline]
    pub fn key(&self) -> ObjKey {
        self.key
    }

    fn column(&self, field: &str) -> Result<ColKey> {
        self.group
            .require_table(self.class)?
            .schema()
            .property_index(field)
            .map(|i| ColKey(i as u32))
            .ok_or_else(|| Error::unknown_field(self.class, field))
    }

    pub fn get(&self, field: &str) -> Result<Value> {
        let col = self.column(field)?;
        let row = self
            .group
            .require_table(self.class)?
            .get(self.key)
            .ok_or_else(|| Error::invalid_object(self.class))?;
        Ok(row.get(col).cloned().unwrap_or(Value::Null))
    }

    /// Sets a field. Primary keys may be rewritten during a migration.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let col = self.column(field)?;
        self.group
            .set_value(self.class, self.key, col, value.into(), self.log)
    }
}
