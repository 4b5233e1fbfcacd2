//! Unmanaged objects.
//!
//! A `Record` is a plain value that is not bound to any instance: it can be
//! built freely on any thread, copied into an instance with
//! `Realm::copy_to_realm`, and produced from a live object with
//! `Realm::copy_from_realm`. Nested objects are owned records, so a record
//! is always a tree.

use std::collections::BTreeMap;
use std::fmt;
use tessel_core::schema::ObjectSchema;
use tessel_core::{Error, FromValue, Result, Value};

/// Value of one field of a record.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Scalar, mixed or primitive collection value.
    Value(Value),
    /// Single link; `None` is a null link.
    Object(Option<Box<Record>>),
    /// Link list.
    Objects(Vec<Record>),
}

/// An unmanaged object of a named class.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    class: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Sets a scalar field, builder style.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Sets a single link, builder style.
    pub fn with_object(mut self, field: impl Into<String>, object: Option<Record>) -> Self {
        self.set_object(field, object);
        self
    }

    /// Sets a link list, builder style.
    pub fn with_objects(mut self, field: impl Into<String>, objects: Vec<Record>) -> Self {
        self.set_objects(field, objects);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), FieldValue::Value(value.into()));
    }

    pub fn set_object(&mut self, field: impl Into<String>, object: Option<Record>) {
        self.fields
            .insert(field.into(), FieldValue::Object(object.map(Box::new)));
    }

    pub fn set_objects(&mut self, field: impl Into<String>, objects: Vec<Record>) {
        self.fields.insert(field.into(), FieldValue::Objects(objects));
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Returns a scalar field.
    pub fn value(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            Some(FieldValue::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns a scalar field converted to `T`. A missing or null field is
    /// `None`; a value of another type is a type mismatch.
    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<Option<T>> {
        match self.fields.get(field) {
            None | Some(FieldValue::Value(Value::Null)) => Ok(None),
            Some(FieldValue::Value(v)) => T::from_value(v)
                .map(Some)
                .ok_or_else(|| Error::type_mismatch(field, T::DATA_TYPE, v.type_name())),
            Some(FieldValue::Object(_)) | Some(FieldValue::Objects(_)) => {
                Err(Error::type_mismatch(field, T::DATA_TYPE, "object"))
            }
        }
    }

    /// Returns a single link.
    pub fn object(&self, field: &str) -> Option<&Record> {
        match self.fields.get(field) {
            Some(FieldValue::Object(Some(r))) => Some(r),
            _ => None,
        }
    }

    /// Returns a link list; empty if unset.
    pub fn objects(&self, field: &str) -> &[Record] {
        match self.fields.get(field) {
            Some(FieldValue::Objects(list)) => list,
            _ => &[],
        }
    }

    /// Iterates over the set fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Number of set fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = [", self.class)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match value {
                FieldValue::Value(v) => write!(f, "{{{}:{}}}", name, v)?,
                FieldValue::Object(None) => write!(f, "{{{}:null}}", name)?,
                FieldValue::Object(Some(r)) => write!(f, "{{{}:{}}}", name, r.class)?,
                FieldValue::Objects(list) => {
                    write!(f, "{{{}:List<{}>[{}]}}", name, list.first().map_or("?", |r| r.class.as_str()), list.len())?
                }
            }
        }
        write!(f, "]")
    }
}

/// A Rust type stored as objects of one class.
///
/// ```rust
/// use tessel_core::schema::{ObjectSchema, ObjectSchemaBuilder};
/// use tessel_core::{DataType, Result};
/// use tessel_database::{RealmModel, Record};
///
/// struct Dog {
///     name: String,
/// }
///
/// impl RealmModel for Dog {
///     fn schema() -> Result<ObjectSchema> {
///         ObjectSchemaBuilder::new("Dog")?.field("name", DataType::String)?.build()
///     }
///
///     fn to_record(&self) -> Record {
///         Record::new("Dog").with("name", self.name.as_str())
///     }
///
///     fn from_record(record: &Record) -> Result<Self> {
///         Ok(Dog {
///             name: record.get_as::<String>("name")?.unwrap_or_default(),
///         })
///     }
/// }
///
/// let dog = Dog::from_record(&Dog { name: "Rex".into() }.to_record()).unwrap();
/// assert_eq!(dog.name, "Rex");
/// ```
pub trait RealmModel: Sized {
    fn schema() -> Result<ObjectSchema>;

    fn to_record(&self) -> Record;

    fn from_record(record: &Record) -> Result<Self>;

    /// Name of the class the type is stored in.
    fn class_name() -> Result<String> {
        Ok(Self::schema()?.name().to_string())
    }
}
