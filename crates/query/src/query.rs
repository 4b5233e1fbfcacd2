//! Built queries.
//!
//! A `Query` is immutable once built and can be executed against any
//! snapshot; live results re-execute the same query after every version
//! advance.

use crate::descriptor::FieldDescriptor;
use crate::ordering::DescriptorOrdering;
use crate::predicate::Predicate;
use tessel_core::{ColKey, Error, ObjKey, Result, Value};
use tessel_storage::Group;

/// Where the candidate objects of a query come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuerySource {
    /// Every object of the queried class.
    Table,
    /// The objects of a link list, in list order.
    List {
        owner_class: String,
        owner: ObjKey,
        col: ColKey,
    },
    /// The objects of the queried class whose link column `col` points at
    /// `target`, an object of `target_class`.
    Backlinks {
        col: ColKey,
        target_class: String,
        target: ObjKey,
    },
}

/// A built, re-executable query.
#[derive(Clone, Debug)]
pub struct Query {
    class: String,
    source: QuerySource,
    predicate: Predicate,
    ordering: DescriptorOrdering,
}

impl Query {
    pub fn new(
        class: impl Into<String>,
        source: QuerySource,
        predicate: Predicate,
        ordering: DescriptorOrdering,
    ) -> Self {
        Self {
            class: class.into(),
            source,
            predicate,
            ordering,
        }
    }

    /// Returns a query matching every object of `class`.
    pub fn all(class: impl Into<String>) -> Self {
        Self::new(class, QuerySource::Table, Predicate::True, DescriptorOrdering::new())
    }

    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    #[inline]
    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    #[inline]
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    #[inline]
    pub fn ordering(&self) -> &DescriptorOrdering {
        &self.ordering
    }

    /// Returns true if the source still exists in `group`. A list source
    /// disappears with its owner object.
    pub fn is_source_valid(&self, group: &Group) -> bool {
        if group.table(&self.class).is_none() {
            return false;
        }
        match &self.source {
            QuerySource::Table => true,
            QuerySource::List {
                owner_class, owner, ..
            } => group.table(owner_class).is_some_and(|t| t.contains(*owner)),
            QuerySource::Backlinks {
                target_class,
                target,
                ..
            } => group.table(target_class).is_some_and(|t| t.contains(*target)),
        }
    }

    fn candidates(&self, group: &Group) -> Result<Vec<ObjKey>> {
        let table = group.require_table(&self.class)?;
        match &self.source {
            QuerySource::Table => Ok(table.keys().collect()),
            QuerySource::List {
                owner_class,
                owner,
                col,
            } => {
                let owner_row = group
                    .require_table(owner_class)?
                    .get(*owner)
                    .ok_or_else(|| Error::invalid_object(owner_class))?;
                match owner_row.get(*col) {
                    Some(Value::List(items)) => Ok(items
                        .iter()
                        .filter_map(Value::as_link)
                        .filter(|key| table.contains(*key))
                        .collect()),
                    _ => Ok(Vec::new()),
                }
            }
            QuerySource::Backlinks { col, target, .. } => {
                group.backlinks(&self.class, *col, *target)
            }
        }
    }

    /// Runs the query and returns the matching objects in result order.
    pub fn execute(&self, group: &Group) -> Result<Vec<ObjKey>> {
        let table = group.require_table(&self.class)?;
        let keys: Vec<ObjKey> = self
            .candidates(group)?
            .into_iter()
            .filter(|key| match table.get(*key) {
                Some(row) => self.predicate.eval(group, row),
                None => false,
            })
            .collect();
        self.ordering.apply(group, &self.class, keys)
    }

    /// Counts the matching objects.
    pub fn count(&self, group: &Group) -> Result<usize> {
        if self.ordering.is_empty() {
            let table = group.require_table(&self.class)?;
            return Ok(self
                .candidates(group)?
                .into_iter()
                .filter(|key| table.get(*key).is_some_and(|row| self.predicate.eval(group, row)))
                .count());
        }
        Ok(self.execute(group)?.len())
    }

    /// Returns the first matching object.
    pub fn find_first(&self, group: &Group) -> Result<Option<ObjKey>> {
        if self.ordering.is_empty() {
            let table = group.require_table(&self.class)?;
            return Ok(self
                .candidates(group)?
                .into_iter()
                .find(|key| table.get(*key).is_some_and(|row| self.predicate.eval(group, row))));
        }
        Ok(self.execute(group)?.into_iter().next())
    }

    /// Returns true if `key` matches the predicate. Ordering directives are
    /// not considered.
    pub fn matches(&self, group: &Group, key: ObjKey) -> bool {
        group
            .table(&self.class)
            .and_then(|t| t.get(key))
            .is_some_and(|row| self.predicate.eval(group, row))
    }

    /// Returns a query over the same source narrowed by `predicate`.
    pub fn and(&self, predicate: Predicate) -> Query {
        Query {
            class: self.class.clone(),
            source: self.source.clone(),
            predicate: Predicate::and(vec![self.predicate.clone(), predicate]),
            ordering: DescriptorOrdering::new(),
        }
    }

    /// Returns the same query with new ordering directives.
    pub fn with_ordering(&self, ordering: DescriptorOrdering) -> Query {
        Query {
            ordering,
            ..self.clone()
        }
    }

    /// Returns the fields referenced by the predicate.
    pub fn fields(&self) -> Vec<&FieldDescriptor> {
        self.predicate.fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ANN, BOB, FIDO, JANE, REX, ZED};
    use crate::ordering::{Directive, SortOrder};
    use crate::predicate::CompareOp;

    #[test]
    fn test_execute_table() {
        let (group, indices) = fixtures::people();
        let age = FieldDescriptor::resolve(&indices, "Person", "age").unwrap();
        let query = Query::new(
            "Person",
            QuerySource::Table,
            Predicate::Compare {
                field: age,
                op: CompareOp::Ge,
                value: Value::Int(20),
            },
            DescriptorOrdering::new(),
        );
        assert_eq!(query.execute(&group).unwrap(), vec![JANE, ANN, ZED]);
        assert_eq!(query.count(&group).unwrap(), 3);
        assert_eq!(query.find_first(&group).unwrap(), Some(JANE));
        assert!(query.matches(&group, ZED));
        assert!(!query.matches(&group, BOB));
    }

    #[test]
    fn test_list_source_keeps_list_order() {
        let (mut group, indices) = fixtures::people();
        let dogs_col = indices.class("Person").unwrap().require("dogs").unwrap().key;
        let mut log = tessel_storage::ChangeLog::new();
        group
            .set_value(
                "Person",
                JANE,
                dogs_col,
                Value::List(vec![Value::Link(FIDO), Value::Link(REX)]),
                &mut log,
            )
            .unwrap();

        let query = Query::new(
            "Dog",
            QuerySource::List {
                owner_class: "Person".into(),
                owner: JANE,
                col: dogs_col,
            },
            Predicate::True,
            DescriptorOrdering::new(),
        );
        assert_eq!(query.execute(&group).unwrap(), vec![FIDO, REX]);
        assert!(query.is_source_valid(&group));

        group.delete_object("Person", JANE, &mut log).unwrap();
        assert!(!query.is_source_valid(&group));
        assert!(matches!(query.execute(&group), Err(Error::InvalidObject { .. })));
    }

    #[test]
    fn test_backlinks_source() {
        let (group, indices) = fixtures::people();
        let dogs_col = indices.class("Person").unwrap().require("dogs").unwrap().key;
        let query = Query::new(
            "Person",
            QuerySource::Backlinks {
                col: dogs_col,
                target_class: "Dog".into(),
                target: FIDO,
            },
            Predicate::True,
            DescriptorOrdering::new(),
        );
        assert_eq!(query.execute(&group).unwrap(), vec![JANE, ANN]);
    }

    #[test]
    fn test_and_narrows_without_ordering() {
        let (group, indices) = fixtures::people();
        let age = FieldDescriptor::resolve(&indices, "Person", "age").unwrap();
        let mut ordering = DescriptorOrdering::new();
        ordering
            .push(Directive::Sort(vec![(age.clone(), SortOrder::Descending)]))
            .unwrap();
        let sorted = Query::all("Person").with_ordering(ordering);
        assert_eq!(sorted.execute(&group).unwrap(), vec![ZED, ANN, JANE, BOB]);

        let narrowed = sorted.and(Predicate::Compare {
            field: age,
            op: CompareOp::Lt,
            value: Value::Int(30),
        });
        assert_eq!(narrowed.execute(&group).unwrap(), vec![JANE, BOB]);
    }

    #[test]
    fn test_unknown_class() {
        let (group, _) = fixtures::people();
        assert!(matches!(
            Query::all("Cat").execute(&group),
            Err(Error::UnknownClass { .. })
        ));
    }
}
