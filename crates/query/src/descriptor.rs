//! Field paths resolved to column keys.
//!
//! A path such as `"owner.address.city"` is split on `.` and resolved hop by
//! hop against the column index cache. Every hop but the last must be a link
//! (single or collection); the last hop names the compared column.

use tessel_core::schema::{ColumnDetails, ColumnIndices};
use tessel_core::{CollectionType, ColKey, ColumnType, DataType, Error, Result, Row, TypeFamily, Value};
use tessel_storage::Group;

/// One link traversal of a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkHop {
    /// Class owning the link column.
    pub class: String,
    /// The link column.
    pub col: ColKey,
    /// Whether the link column is a collection of links.
    pub many: bool,
    /// Class the link points at.
    pub target: String,
}

/// A resolved field path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    path: String,
    root_class: String,
    hops: Vec<LinkHop>,
    terminal_class: String,
    terminal: ColumnDetails,
}

impl FieldDescriptor {
    /// Resolves `path` starting at `class`.
    pub fn resolve(indices: &ColumnIndices, class: &str, path: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::invalid_argument(format!(
                "invalid field path '{}'",
                path
            )));
        }

        let mut current = indices.require_class(class)?;
        let mut hops = Vec::with_capacity(segments.len() - 1);
        let (last, links) = match segments.split_last() {
            Some(split) => split,
            None => return Err(Error::invalid_argument("empty field path")),
        };

        for segment in links {
            let column = current.require(segment)?;
            if !column.col_type.is_link() {
                return Err(Error::type_mismatch(
                    path,
                    format!("link at '{}'", segment),
                    column.col_type,
                ));
            }
            let target = column.target_class.clone().ok_or_else(|| {
                Error::schema_mismatch(format!(
                    "link '{}.{}' has no target class",
                    current.class(),
                    segment
                ))
            })?;
            hops.push(LinkHop {
                class: current.class().to_string(),
                col: column.key,
                many: column.col_type.collection.is_collection(),
                target: target.clone(),
            });
            current = indices.require_class(&target)?;
        }

        let terminal = current.require(last)?.clone();
        Ok(Self {
            path: path.to_string(),
            root_class: class.to_string(),
            hops,
            terminal_class: current.class().to_string(),
            terminal,
        })
    }

    /// Returns the path as written.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the class the path starts at.
    #[inline]
    pub fn root_class(&self) -> &str {
        &self.root_class
    }

    /// Returns the class owning the terminal column.
    #[inline]
    pub fn terminal_class(&self) -> &str {
        &self.terminal_class
    }

    /// Returns the link hops before the terminal column.
    #[inline]
    pub fn hops(&self) -> &[LinkHop] {
        &self.hops
    }

    /// Returns the terminal column.
    #[inline]
    pub fn terminal(&self) -> &ColumnDetails {
        &self.terminal
    }

    #[inline]
    pub fn col_type(&self) -> ColumnType {
        self.terminal.col_type
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.terminal.col_type.data_type
    }

    /// Returns true if the path crosses at least one link.
    #[inline]
    pub fn is_link_path(&self) -> bool {
        !self.hops.is_empty()
    }

    /// Returns true if every hop is a single link and the terminal column is
    /// not a collection, so the path yields at most one value per object.
    pub fn is_single_valued(&self) -> bool {
        self.terminal.col_type.collection == CollectionType::Single
            && self.hops.iter().all(|h| !h.many)
    }

    /// Checks that `value` can be compared against the terminal column.
    pub fn check_comparable(&self, value: &Value) -> Result<()> {
        let col_type = self.terminal.col_type;
        match value {
            Value::Null => {
                if self.terminal.nullable || self.is_link_path() || col_type.collection.is_collection() {
                    Ok(())
                } else {
                    Err(Error::type_mismatch(&self.path, col_type, "null"))
                }
            }
            Value::List(_) => Err(Error::type_mismatch(&self.path, col_type.data_type, "list")),
            Value::TypedLink(_) if col_type.data_type == DataType::Mixed => Ok(()),
            Value::Link(_) if col_type.data_type == DataType::Link => Ok(()),
            _ if col_type.data_type == DataType::Mixed => Ok(()),
            other => match other.family() {
                Some(family) if family == col_type.data_type.family() && family != TypeFamily::Link => {
                    Ok(())
                }
                _ => Err(Error::type_mismatch(
                    &self.path,
                    col_type.data_type,
                    other.type_name(),
                )),
            },
        }
    }

    /// Checks the terminal column belongs to one of `families`.
    pub fn check_family(&self, operation: &str, families: &[TypeFamily]) -> Result<()> {
        let dt = self.data_type();
        if dt == DataType::Mixed || families.contains(&dt.family()) {
            return Ok(());
        }
        let expected: Vec<&str> = families.iter().map(family_name).collect();
        Err(Error::type_mismatch(
            &self.path,
            format!("{} for {}", expected.join(" or "), operation),
            dt,
        ))
    }

    /// Collects the terminal values reachable from `row`.
    ///
    /// `None` marks a broken path: a null single link somewhere along the
    /// way. Link collections fan out, so an object can yield many values.
    pub fn values<'g>(&self, group: &'g Group, row: &'g Row) -> Vec<Option<&'g Value>> {
        let mut frontier: Vec<&'g Row> = vec![row];
        let mut broken = false;
        for hop in &self.hops {
            let Some(target) = group.table(&hop.target) else {
                return vec![None];
            };
            let mut next = Vec::with_capacity(frontier.len());
            for current in frontier {
                match current.get(hop.col) {
                    Some(Value::Link(key)) => match target.get(*key) {
                        Some(linked) => next.push(linked.as_ref()),
                        None => broken = true,
                    },
                    Some(Value::List(items)) => {
                        next.extend(
                            items
                                .iter()
                                .filter_map(Value::as_link)
                                .filter_map(|key| target.get(key))
                                .map(|linked| linked.as_ref()),
                        );
                    }
                    _ => broken = true,
                }
            }
            frontier = next;
        }

        let mut out: Vec<Option<&'g Value>> = frontier
            .into_iter()
            .map(|r| r.get(self.terminal.key))
            .collect();
        if broken {
            out.push(None);
        }
        out
    }

    /// Returns the first terminal value, `Null` for a broken path.
    pub fn first_value<'g>(&self, group: &'g Group, row: &'g Row) -> &'g Value {
        static NULL: Value = Value::Null;
        self.values(group, row)
            .into_iter()
            .next()
            .flatten()
            .unwrap_or(&NULL)
    }
}

fn family_name(family: &TypeFamily) -> &'static str {
    match family {
        TypeFamily::Bool => "bool",
        TypeFamily::Numeric => "numeric",
        TypeFamily::Text => "string",
        TypeFamily::Binary => "binary",
        TypeFamily::Temporal => "date",
        TypeFamily::ObjectId => "object_id",
        TypeFamily::Uuid => "uuid",
        TypeFamily::Link => "object",
        TypeFamily::Mixed => "mixed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_resolve_simple_field() {
        let (_, indices) = fixtures::people();
        let desc = FieldDescriptor::resolve(&indices, "Person", "age").unwrap();
        assert_eq!(desc.data_type(), DataType::Int);
        assert!(!desc.is_link_path());
        assert!(desc.is_single_valued());
    }

    #[test]
    fn test_resolve_link_path() {
        let (_, indices) = fixtures::people();
        let desc = FieldDescriptor::resolve(&indices, "Person", "dog.name").unwrap();
        assert_eq!(desc.hops().len(), 1);
        assert_eq!(desc.terminal_class(), "Dog");
        assert_eq!(desc.data_type(), DataType::String);

        let many = FieldDescriptor::resolve(&indices, "Person", "dogs.age").unwrap();
        assert!(many.hops()[0].many);
        assert!(!many.is_single_valued());
    }

    #[test]
    fn test_non_link_hop_is_type_mismatch() {
        let (_, indices) = fixtures::people();
        let err = FieldDescriptor::resolve(&indices, "Person", "name.length").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_field() {
        let (_, indices) = fixtures::people();
        let err = FieldDescriptor::resolve(&indices, "Person", "dog.color").unwrap_err();
        assert!(matches!(err, Error::UnknownField { ref class, .. } if class == "Dog"));
        assert!(FieldDescriptor::resolve(&indices, "Person", "dog.").is_err());
    }

    #[test]
    fn test_check_comparable() {
        let (_, indices) = fixtures::people();
        let age = FieldDescriptor::resolve(&indices, "Person", "age").unwrap();
        assert!(age.check_comparable(&Value::Int(3)).is_ok());
        assert!(age.check_comparable(&Value::Double(3.5)).is_ok());
        assert!(age.check_comparable(&Value::from("3")).is_err());
        assert!(age.check_comparable(&Value::Null).is_err());

        let dog_name = FieldDescriptor::resolve(&indices, "Person", "dog.name").unwrap();
        assert!(dog_name.check_comparable(&Value::Null).is_ok());
    }

    #[test]
    fn test_values_follow_links() {
        let (group, indices) = fixtures::people();
        let desc = FieldDescriptor::resolve(&indices, "Person", "dog.name").unwrap();
        let people = group.table("Person").unwrap();

        let jane = people.get(fixtures::JANE).unwrap();
        assert_eq!(desc.values(&group, jane), vec![Some(&Value::from("Rex"))]);

        let bob = people.get(fixtures::BOB).unwrap();
        assert_eq!(desc.values(&group, bob), vec![None]);
        assert!(desc.first_value(&group, bob).is_null());
    }
}
