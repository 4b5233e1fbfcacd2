//! Sort, distinct and limit directives.
//!
//! Directives apply in the order they were declared: `distinct` then `sort`
//! is not the same as `sort` then `distinct` once a `limit` follows.

use crate::descriptor::FieldDescriptor;
use hashbrown::HashSet;
use std::cmp::Ordering;
use tessel_core::{DataType, Error, ObjKey, Result, Value};
use tessel_storage::Group;

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// One result-shaping directive.
#[derive(Clone, Debug)]
pub enum Directive {
    Sort(Vec<(FieldDescriptor, SortOrder)>),
    Distinct(Vec<FieldDescriptor>),
    Limit(usize),
}

impl Directive {
    fn name(&self) -> &'static str {
        match self {
            Directive::Sort(_) => "sort order",
            Directive::Distinct(_) => "distinct",
            Directive::Limit(_) => "limit",
        }
    }
}

/// Ordered list of directives, each kind declared at most once.
#[derive(Clone, Debug, Default)]
pub struct DescriptorOrdering {
    directives: Vec<Directive>,
}

impl DescriptorOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the directives in declaration order.
    #[inline]
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Adds a directive, rejecting a second directive of the same kind.
    pub fn push(&mut self, directive: Directive) -> Result<()> {
        let kind = std::mem::discriminant(&directive);
        if self
            .directives
            .iter()
            .any(|d| std::mem::discriminant(d) == kind)
        {
            return Err(Error::malformed_query(format!(
                "{} already defined",
                directive.name()
            )));
        }
        match &directive {
            Directive::Sort(fields) if fields.is_empty() => {
                return Err(Error::invalid_argument("sort needs at least one field"));
            }
            Directive::Distinct(fields) if fields.is_empty() => {
                return Err(Error::invalid_argument("distinct needs at least one field"));
            }
            Directive::Limit(0) => {
                return Err(Error::invalid_argument("limit must be greater than zero"));
            }
            Directive::Sort(fields) => {
                for (field, _) in fields {
                    check_sortable(field)?;
                }
            }
            Directive::Distinct(fields) => {
                for field in fields {
                    check_sortable(field)?;
                }
            }
            Directive::Limit(_) => {}
        }
        self.directives.push(directive);
        Ok(())
    }

    /// Applies every directive to `keys`, objects of `class`.
    pub fn apply(&self, group: &Group, class: &str, mut keys: Vec<ObjKey>) -> Result<Vec<ObjKey>> {
        if self.directives.is_empty() {
            return Ok(keys);
        }
        let table = group.require_table(class)?;
        for directive in &self.directives {
            match directive {
                Directive::Sort(fields) => {
                    let mut entries: Vec<(Vec<&Value>, ObjKey)> = keys
                        .iter()
                        .filter_map(|key| table.get(*key))
                        .map(|row| {
                            let values = fields
                                .iter()
                                .map(|(f, _)| f.first_value(group, row))
                                .collect();
                            (values, row.key())
                        })
                        .collect();
                    entries.sort_by(|a, b| compare_entries(fields, &a.0, &b.0));
                    keys = entries.into_iter().map(|(_, key)| key).collect();
                }
                Directive::Distinct(fields) => {
                    let mut seen: HashSet<Vec<&Value>> = HashSet::with_capacity(keys.len());
                    keys.retain(|key| match table.get(*key) {
                        Some(row) => seen.insert(
                            fields
                                .iter()
                                .map(|f| f.first_value(group, row))
                                .collect(),
                        ),
                        None => false,
                    });
                }
                Directive::Limit(n) => keys.truncate(*n),
            }
        }
        Ok(keys)
    }
}

/// Nulls sort first in ascending order; ties keep their previous order.
fn compare_entries(fields: &[(FieldDescriptor, SortOrder)], a: &[&Value], b: &[&Value]) -> Ordering {
    for ((_, order), (av, bv)) in fields.iter().zip(a.iter().zip(b.iter())) {
        let cmp = av.cmp(bv);
        if cmp != Ordering::Equal {
            return match order {
                SortOrder::Ascending => cmp,
                SortOrder::Descending => cmp.reverse(),
            };
        }
    }
    Ordering::Equal
}

fn check_sortable(field: &FieldDescriptor) -> Result<()> {
    if !field.is_single_valued() {
        return Err(Error::invalid_argument(format!(
            "'{}' is a collection or crosses a link list and cannot be sorted or made distinct",
            field.path()
        )));
    }
    if matches!(field.data_type(), DataType::Link | DataType::Binary) {
        return Err(Error::type_mismatch(
            field.path(),
            "sortable type",
            field.data_type(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ANN, BOB, JANE, ZED};
    use tessel_core::schema::ColumnIndices;

    fn field(indices: &ColumnIndices, path: &str) -> FieldDescriptor {
        FieldDescriptor::resolve(indices, "Person", path).unwrap()
    }

    fn all() -> Vec<ObjKey> {
        vec![JANE, BOB, ANN, ZED]
    }

    #[test]
    fn test_sort_descending() {
        let (group, indices) = fixtures::people();
        let mut ordering = DescriptorOrdering::new();
        ordering
            .push(Directive::Sort(vec![(field(&indices, "age"), SortOrder::Descending)]))
            .unwrap();
        let keys = ordering.apply(&group, "Person", all()).unwrap();
        assert_eq!(keys, vec![ZED, ANN, JANE, BOB]);
    }

    #[test]
    fn test_sort_nulls_first_through_link() {
        let (group, indices) = fixtures::people();
        let mut ordering = DescriptorOrdering::new();
        ordering
            .push(Directive::Sort(vec![(field(&indices, "dog.age"), SortOrder::Ascending)]))
            .unwrap();
        let keys = ordering.apply(&group, "Person", all()).unwrap();
        assert_eq!(keys, vec![BOB, ZED, JANE, ANN]);
    }

    #[test]
    fn test_directive_declared_twice() {
        let (_, indices) = fixtures::people();
        let mut ordering = DescriptorOrdering::new();
        ordering
            .push(Directive::Sort(vec![(field(&indices, "age"), SortOrder::Ascending)]))
            .unwrap();
        let err = ordering
            .push(Directive::Sort(vec![(field(&indices, "name"), SortOrder::Ascending)]))
            .unwrap_err();
        assert!(err.to_string().contains("sort order already defined"));
        ordering.push(Directive::Limit(1)).unwrap();
        assert!(ordering.push(Directive::Limit(2)).is_err());
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let (group, indices) = fixtures::people();

        let mut limit_first = DescriptorOrdering::new();
        limit_first.push(Directive::Limit(2)).unwrap();
        limit_first
            .push(Directive::Sort(vec![(field(&indices, "age"), SortOrder::Descending)]))
            .unwrap();
        assert_eq!(limit_first.apply(&group, "Person", all()).unwrap(), vec![JANE, BOB]);

        let mut sort_first = DescriptorOrdering::new();
        sort_first
            .push(Directive::Sort(vec![(field(&indices, "age"), SortOrder::Descending)]))
            .unwrap();
        sort_first.push(Directive::Limit(2)).unwrap();
        assert_eq!(sort_first.apply(&group, "Person", all()).unwrap(), vec![ZED, ANN]);
    }

    #[test]
    fn test_distinct_keeps_first() {
        let (group, indices) = fixtures::people();
        let mut ordering = DescriptorOrdering::new();
        ordering
            .push(Directive::Distinct(vec![field(&indices, "nickname")]))
            .unwrap();
        let keys = ordering.apply(&group, "Person", all()).unwrap();
        assert_eq!(keys, vec![JANE, BOB, ZED]);
    }

    #[test]
    fn test_collections_are_not_sortable() {
        let (_, indices) = fixtures::people();
        let mut ordering = DescriptorOrdering::new();
        assert!(ordering
            .push(Directive::Sort(vec![(field(&indices, "tags"), SortOrder::Ascending)]))
            .is_err());
        assert!(ordering
            .push(Directive::Distinct(vec![field(&indices, "dogs.name")]))
            .is_err());
        assert!(ordering.push(Directive::Limit(0)).is_err());
    }
}
