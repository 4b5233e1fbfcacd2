//! Copying between records and stored objects.

use crate::record::{FieldValue, Record};
use tessel_core::schema::{ColumnDetails, ColumnIndices, Property};
use tessel_core::{CollectionType, ColKey, Error, ObjKey, Result, Value};
use tessel_storage::{ChangeLog, Group};

fn check_link(details: &ColumnDetails, collection: bool, nested: &Record) -> Result<()> {
    let is_list = details.col_type.collection != CollectionType::Single;
    if !details.col_type.is_link() || is_list != collection {
        return Err(Error::type_mismatch(
            &details.name,
            details.col_type,
            if collection { "object list" } else { "object" },
        ));
    }
    if details.target_class.as_deref() != Some(nested.class()) {
        return Err(Error::type_mismatch(
            &details.name,
            details.target_class.as_deref().unwrap_or("object"),
            nested.class(),
        ));
    }
    Ok(())
}

/// Stores `record` and every record nested in it. A record whose primary key
/// already exists is merged into the stored object when `update` is set and
/// rejected otherwise; nested records with an existing primary key are
/// always merged.
pub(crate) fn copy_record(
    group: &mut Group,
    log: &mut ChangeLog,
    indices: &ColumnIndices,
    record: &Record,
    update: bool,
) -> Result<ObjKey> {
    let class = record.class();
    let columns = indices.require_class(class)?;
    let mut resolved: Vec<(ColKey, Value)> = Vec::with_capacity(record.len());
    for (name, field) in record.fields() {
        let details = columns.require(name)?;
        let value = match field {
            FieldValue::Value(v) => v.clone(),
            FieldValue::Object(None) => Value::Null,
            FieldValue::Object(Some(nested)) => {
                check_link(details, false, nested)?;
                Value::Link(copy_record(group, log, indices, nested, true)?)
            }
            FieldValue::Objects(list) => {
                let mut links = Vec::with_capacity(list.len());
                for nested in list {
                    check_link(details, true, nested)?;
                    links.push(Value::Link(copy_record(group, log, indices, nested, true)?));
                }
                Value::List(links)
            }
        };
        resolved.push((details.key, value));
    }

    let table = group.require_table(class)?;
    let pk = columns.primary_key().map(|pk| {
        resolved
            .iter()
            .find(|(col, _)| *col == pk.key)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| table.schema().properties()[pk.key.index()].default_value())
    });
    let existing = pk.as_ref().and_then(|v| table.find_by_primary_key(v));
    let pk_col = columns.primary_key().map(|pk| pk.key);

    match (existing, pk) {
        (Some(key), _) if update => {
            for (col, value) in resolved {
                if Some(col) != pk_col {
                    group.set_value(class, key, col, value, log)?;
                }
            }
            Ok(key)
        }
        (Some(_), Some(pk)) => Err(Error::duplicate_primary_key(class, pk)),
        _ => {
            let mut values: Vec<Value> = table
                .schema()
                .properties()
                .iter()
                .map(Property::default_value)
                .collect();
            for (col, value) in resolved {
                if let Some(slot) = values.get_mut(col.index()) {
                    *slot = value;
                }
            }
            group.create_object(class, values, log)
        }
    }
}

/// Produces a detached copy of a stored object. Links are followed `depth`
/// levels deep; deeper single links become null and deeper link lists empty.
pub(crate) fn copy_object(
    group: &Group,
    indices: &ColumnIndices,
    class: &str,
    key: ObjKey,
    depth: usize,
) -> Result<Record> {
    let columns = indices.require_class(class)?;
    let row = group
        .require_table(class)?
        .get(key)
        .ok_or_else(|| Error::invalid_object(class))?;
    let mut record = Record::new(class);
    for details in columns.columns() {
        let value = row.get(details.key).cloned().unwrap_or(Value::Null);
        let target = details.target_class.as_deref();
        match (details.col_type.is_link(), details.col_type.collection, target) {
            (true, CollectionType::Single, Some(target)) => {
                let nested = match value {
                    Value::Link(k) if depth > 0 => Some(copy_object(group, indices, target, k, depth - 1)?),
                    _ => None,
                };
                record.set_object(details.name.as_str(), nested);
            }
            (true, _, Some(target)) => {
                let mut nested = Vec::new();
                if depth > 0 {
                    for k in value.as_list().unwrap_or(&[]).iter().filter_map(Value::as_link) {
                        nested.push(copy_object(group, indices, target, k, depth - 1)?);
                    }
                }
                record.set_objects(details.name.as_str(), nested);
            }
            _ => record.set(details.name.as_str(), value),
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::schema::{ObjectSchemaBuilder, Schema};
    use tessel_core::DataType;

    fn setup() -> (Group, ChangeLog, ColumnIndices) {
        let dog = ObjectSchemaBuilder::new("Dog")
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .primary_key("name")
            .unwrap()
            .field("age", DataType::Int)
            .unwrap()
            .build()
            .unwrap();
        let person = ObjectSchemaBuilder::new("Person")
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .link("dog", "Dog")
            .unwrap()
            .link_list("friends", "Person")
            .unwrap()
            .build()
            .unwrap();
        let mut group = Group::new();
        let mut log = ChangeLog::new();
        group.add_table(dog.clone(), &mut log).unwrap();
        group.add_table(person.clone(), &mut log).unwrap();
        let indices = ColumnIndices::build(&Schema::new(vec![dog, person]).unwrap(), 0);
        (group, log, indices)
    }

    fn jane() -> Record {
        Record::new("Person")
            .with("name", "Jane")
            .with_object("dog", Some(Record::new("Dog").with("name", "Rex").with("age", 3i64)))
            .with_objects("friends", vec![Record::new("Person").with("name", "Ann")])
    }

    #[test]
    fn test_deep_copy() {
        let (mut group, mut log, indices) = setup();
        let key = copy_record(&mut group, &mut log, &indices, &jane(), false).unwrap();
        assert_eq!(group.table("Person").unwrap().len(), 2);
        assert_eq!(group.table("Dog").unwrap().len(), 1);

        let copy = copy_object(&group, &indices, "Person", key, 2).unwrap();
        assert_eq!(copy.get_as::<String>("name").unwrap().as_deref(), Some("Jane"));
        assert_eq!(copy.object("dog").and_then(|d| d.get_as::<i64>("age").unwrap()), Some(3));
        assert_eq!(copy.objects("friends").len(), 1);
    }

    #[test]
    fn test_nested_primary_key_is_merged() {
        let (mut group, mut log, indices) = setup();
        copy_record(&mut group, &mut log, &indices, &jane(), false).unwrap();
        let older_rex = Record::new("Person")
            .with("name", "Bob")
            .with_object("dog", Some(Record::new("Dog").with("name", "Rex").with("age", 4i64)));
        copy_record(&mut group, &mut log, &indices, &older_rex, false).unwrap();

        let dogs = group.table("Dog").unwrap();
        assert_eq!(dogs.len(), 1);
        let rex = dogs.rows().next().unwrap();
        assert_eq!(rex.get(ColKey(1)), Some(&Value::Int(4)));
    }

    #[test]
    fn test_top_level_duplicate_needs_update() {
        let (mut group, mut log, indices) = setup();
        let rex = Record::new("Dog").with("name", "Rex").with("age", 1i64);
        let key = copy_record(&mut group, &mut log, &indices, &rex, false).unwrap();
        let err = copy_record(&mut group, &mut log, &indices, &rex, false).unwrap_err();
        assert!(matches!(err, Error::DuplicatePrimaryKey { .. }));

        let older = Record::new("Dog").with("name", "Rex").with("age", 2i64);
        assert_eq!(copy_record(&mut group, &mut log, &indices, &older, true).unwrap(), key);
    }

    #[test]
    fn test_depth_limit_drops_links() {
        let (mut group, mut log, indices) = setup();
        let key = copy_record(&mut group, &mut log, &indices, &jane(), false).unwrap();
        let shallow = copy_object(&group, &indices, "Person", key, 0).unwrap();
        assert!(shallow.object("dog").is_none());
        assert_eq!(shallow.get("dog"), Some(&FieldValue::Object(None)));
        assert!(shallow.objects("friends").is_empty());
    }

    #[test]
    fn test_wrong_nested_class() {
        let (mut group, mut log, indices) = setup();
        let bad = Record::new("Person").with_object("dog", Some(Record::new("Person")));
        let err = copy_record(&mut group, &mut log, &indices, &bad, false).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }
}
