//! Class definitions for the tessel schema.

use super::property::Property;
use crate::error::{Error, Result};
use crate::types::DataType;
use serde::{Deserialize, Serialize};

/// Validates a class or field name follows naming rules.
pub fn check_naming_rules(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::schema_mismatch("name cannot be empty"));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(Error::schema_mismatch(format!(
            "name must start with a letter or underscore: {}",
            name
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::schema_mismatch(format!(
            "name contains invalid characters: {}",
            name
        )));
    }
    Ok(())
}

/// A class definition: its name, ordered properties and primary key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    name: String,
    properties: Vec<Property>,
}

impl ObjectSchema {
    /// Returns the class name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the properties in column order.
    #[inline]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Gets a property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// Gets a property's column position by name.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name() == name)
    }

    /// Returns the primary key property if defined.
    pub fn primary_key(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.is_primary_key())
    }

    /// Appends a property. Used by schema editing during migrations.
    pub fn push_property(&mut self, property: Property) -> Result<usize> {
        check_naming_rules(property.name())?;
        if self.property(property.name()).is_some() {
            return Err(Error::schema_mismatch(format!(
                "field already exists: {}.{}",
                self.name,
                property.name()
            )));
        }
        self.properties.push(property);
        Ok(self.properties.len() - 1)
    }

    /// Removes a property and returns its former column position.
    pub fn remove_property(&mut self, name: &str) -> Result<usize> {
        let idx = self
            .property_index(name)
            .ok_or_else(|| Error::unknown_field(&self.name, name))?;
        self.properties.remove(idx);
        Ok(idx)
    }

    /// Renames a property in place.
    pub fn rename_property(&mut self, from: &str, to: &str) -> Result<()> {
        check_naming_rules(to)?;
        if self.property(to).is_some() {
            return Err(Error::schema_mismatch(format!("field already exists: {}.{}", self.name, to)));
        }
        let idx = self
            .property_index(from)
            .ok_or_else(|| Error::unknown_field(&self.name, from))?;
        self.properties[idx].rename(to);
        Ok(())
    }

    /// Designates the primary key, or clears it with `None`.
    pub fn set_primary_key(&mut self, field: Option<&str>) -> Result<()> {
        if let Some(field) = field {
            let prop = self
                .property(field)
                .ok_or_else(|| Error::unknown_field(&self.name, field))?;
            check_primary_key_property(&self.name, prop)?;
        }
        for prop in &mut self.properties {
            let is_pk = Some(prop.name()) == field;
            prop.set_primary_key(is_pk);
        }
        Ok(())
    }

    /// Lists the differences between this class and `expected`, ignoring
    /// column order.
    pub fn differences(&self, expected: &ObjectSchema) -> Vec<String> {
        let mut diffs = Vec::new();
        for prop in expected.properties() {
            match self.property(prop.name()) {
                None => diffs.push(format!("field '{}.{}' was added", self.name, prop.name())),
                Some(actual) if actual != prop => diffs.push(format!(
                    "field '{}.{}' changed from {} to {}",
                    self.name,
                    prop.name(),
                    describe(actual),
                    describe(prop)
                )),
                Some(_) => {}
            }
        }
        for prop in self.properties() {
            if expected.property(prop.name()).is_none() {
                diffs.push(format!("field '{}.{}' was removed", self.name, prop.name()));
            }
        }
        diffs
    }
}

fn describe(prop: &Property) -> String {
    let mut out = prop.col_type().to_string();
    if let Some(target) = prop.target_class() {
        out.push_str(&format!("<{}>", target));
    }
    if prop.is_nullable() {
        out.push('?');
    }
    if prop.is_primary_key() {
        out.push_str(" primary key");
    }
    out
}

fn check_primary_key_property(class: &str, prop: &Property) -> Result<()> {
    if prop.collection().is_collection() || !prop.data_type().is_primary_key_capable() {
        return Err(Error::schema_mismatch(format!(
            "field '{}.{}' of type {} cannot be a primary key",
            class,
            prop.name(),
            prop.col_type()
        )));
    }
    Ok(())
}

/// Builder for creating class definitions.
pub struct ObjectSchemaBuilder {
    name: String,
    properties: Vec<Property>,
    primary_key: Option<String>,
}

impl ObjectSchemaBuilder {
    /// Creates a new class builder.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        check_naming_rules(&name)?;
        Ok(Self {
            name,
            properties: Vec::new(),
            primary_key: None,
        })
    }

    /// Adds a property to the class.
    pub fn property(mut self, property: Property) -> Result<Self> {
        check_naming_rules(property.name())?;
        if self.properties.iter().any(|p| p.name() == property.name()) {
            return Err(Error::schema_mismatch(format!(
                "field already exists: {}",
                property.name()
            )));
        }
        if property.data_type() == DataType::Link && property.target_class().is_none() {
            return Err(Error::schema_mismatch(format!(
                "link field '{}' has no target class",
                property.name()
            )));
        }
        self.properties.push(property);
        Ok(self)
    }

    /// Adds a single-value field.
    pub fn field(self, name: impl Into<String>, data_type: DataType) -> Result<Self> {
        self.property(Property::scalar(name, data_type))
    }

    /// Adds a nullable single-value field.
    pub fn optional(self, name: impl Into<String>, data_type: DataType) -> Result<Self> {
        self.property(Property::scalar(name, data_type).nullable(true))
    }

    /// Adds a single link field.
    pub fn link(self, name: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        self.property(Property::link(name, target))
    }

    /// Adds a link list field.
    pub fn link_list(self, name: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        self.property(Property::link_list(name, target))
    }

    /// Sets the primary key.
    pub fn primary_key(mut self, field: impl Into<String>) -> Result<Self> {
        let field = field.into();
        let prop = self
            .properties
            .iter()
            .find(|p| p.name() == field)
            .ok_or_else(|| Error::unknown_field(&self.name, &field))?;
        check_primary_key_property(&self.name, prop)?;
        self.primary_key = Some(field);
        Ok(self)
    }

    /// Builds the class definition.
    pub fn build(self) -> Result<ObjectSchema> {
        let mut schema = ObjectSchema {
            name: self.name,
            properties: self.properties,
        };
        schema.set_primary_key(self.primary_key.as_deref())?;
        Ok(schema)
    }
}

/// A set of classes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    classes: Vec<ObjectSchema>,
}

impl Schema {
    /// Creates a schema, checking class names are unique and every link
    /// targets a class of the schema.
    pub fn new(classes: Vec<ObjectSchema>) -> Result<Self> {
        let schema = Self { classes };
        schema.validate()?;
        Ok(schema)
    }

    /// Creates a schema from classes read back from storage, which were
    /// validated when they were written.
    pub fn from_stored(classes: Vec<ObjectSchema>) -> Self {
        Self { classes }
    }

    /// Checks class names are unique and every link targets a class of the schema.
    pub fn validate(&self) -> Result<()> {
        for (i, class) in self.classes.iter().enumerate() {
            if self.classes[..i].iter().any(|c| c.name() == class.name()) {
                return Err(Error::schema_mismatch(format!(
                    "class defined twice: {}",
                    class.name()
                )));
            }
            for prop in class.properties() {
                if let Some(target) = prop.target_class() {
                    if self.find(target).is_none() {
                        return Err(Error::schema_mismatch(format!(
                            "field '{}.{}' links to unknown class '{}'",
                            class.name(),
                            prop.name(),
                            target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Gets a class by name.
    pub fn find(&self, name: &str) -> Option<&ObjectSchema> {
        self.classes.iter().find(|c| c.name() == name)
    }

    /// Returns the classes.
    #[inline]
    pub fn classes(&self) -> &[ObjectSchema] {
        &self.classes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
