//! Fluent query builder.
//!
//! Conditions are AND-ed together until `or()` starts a new conjunction.
//! `begin_group()`/`end_group()` nest, and `not()` negates the next
//! condition or group. Every method resolves its field path right away, so
//! errors surface from the call that introduced them.
//!
//! # Example
//!
//! ```rust,ignore
//! let query = QueryBuilder::new(indices, "Person")?
//!     .equal_to("name", "Jane")?
//!     .or()?
//!     .begin_group()?
//!     .between("age", 18, 30)?
//!     .is_not_null("dog")?
//!     .end_group()?
//!     .sort("age", SortOrder::Descending)?
//!     .build()?;
//! ```

use crate::descriptor::FieldDescriptor;
use crate::ordering::{DescriptorOrdering, Directive, SortOrder};
use crate::predicate::{CompareOp, Predicate, StringOp};
use crate::query::{Query, QuerySource};
use std::sync::Arc;
use tessel_core::pattern_match::Case;
use tessel_core::schema::ColumnIndices;
use tessel_core::{DataType, Error, Result, TypeFamily, Value};

/// One `begin_group()` level.
#[derive(Debug)]
struct GroupFrame {
    /// Conjunctions joined by OR; never empty.
    disjuncts: Vec<Vec<Predicate>>,
    pending_not: bool,
}

impl GroupFrame {
    fn new() -> Self {
        Self {
            disjuncts: vec![Vec::new()],
            pending_not: false,
        }
    }

    fn push(&mut self, mut predicate: Predicate) {
        if self.pending_not {
            predicate = Predicate::not(predicate);
            self.pending_not = false;
        }
        if let Some(conjunction) = self.disjuncts.last_mut() {
            conjunction.push(predicate);
        }
    }

    fn is_empty(&self) -> bool {
        self.disjuncts.iter().all(Vec::is_empty)
    }

    fn finish(self) -> Result<Predicate> {
        if self.pending_not {
            return Err(Error::malformed_query("not() must be followed by a condition"));
        }
        if self.disjuncts.len() > 1 && self.disjuncts.iter().any(Vec::is_empty) {
            return Err(Error::malformed_query("or() must be placed between two conditions"));
        }
        Ok(Predicate::or(
            self.disjuncts.into_iter().map(Predicate::and).collect(),
        ))
    }
}

/// Builds a `Query` from typed conditions.
pub struct QueryBuilder {
    indices: Arc<ColumnIndices>,
    class: String,
    source: QuerySource,
    base: Option<Predicate>,
    frames: Vec<GroupFrame>,
    ordering: DescriptorOrdering,
}

impl QueryBuilder {
    /// Starts a query over every object of `class`.
    pub fn new(indices: Arc<ColumnIndices>, class: impl Into<String>) -> Result<Self> {
        Self::with_source(indices, class, QuerySource::Table)
    }

    /// Starts a query over a list or a backlink set.
    pub fn with_source(
        indices: Arc<ColumnIndices>,
        class: impl Into<String>,
        source: QuerySource,
    ) -> Result<Self> {
        let class = class.into();
        indices.require_class(&class)?;
        Ok(Self {
            indices,
            class,
            source,
            base: None,
            frames: vec![GroupFrame::new()],
            ordering: DescriptorOrdering::new(),
        })
    }

    /// Starts a query narrowing the results of `base`.
    pub fn from_query(indices: Arc<ColumnIndices>, base: &Query) -> Result<Self> {
        let mut builder = Self::with_source(indices, base.class(), base.source().clone())?;
        builder.base = Some(base.predicate().clone());
        Ok(builder)
    }

    /// Returns the queried class.
    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns the column index cache the builder resolves against.
    #[inline]
    pub fn indices(&self) -> &Arc<ColumnIndices> {
        &self.indices
    }

    fn field(&self, path: &str) -> Result<FieldDescriptor> {
        FieldDescriptor::resolve(&self.indices, &self.class, path)
    }

    fn push(mut self, predicate: Predicate) -> Result<Self> {
        match self.frames.last_mut() {
            Some(frame) => frame.push(predicate),
            None => return Err(Error::malformed_query("query has no open group")),
        }
        Ok(self)
    }

    fn compare(self, path: &str, op: CompareOp, value: Value) -> Result<Self> {
        let field = self.field(path)?;
        field.check_comparable(&value)?;
        if !matches!(op, CompareOp::Eq | CompareOp::Ne) {
            field.check_family(
                "range comparison",
                &[
                    TypeFamily::Numeric,
                    TypeFamily::Temporal,
                    TypeFamily::ObjectId,
                    TypeFamily::Uuid,
                ],
            )?;
            if value.is_null() {
                return Err(Error::invalid_argument(format!(
                    "'{}' cannot be range-compared with null",
                    path
                )));
            }
        }
        self.push(Predicate::Compare { field, op, value })
    }

    fn string_match(self, path: &str, op: StringOp, pattern: &str, case: Case) -> Result<Self> {
        let field = self.field(path)?;
        field.check_family("string matching", &[TypeFamily::Text])?;
        self.push(Predicate::StringMatch {
            field,
            op,
            pattern: pattern.to_string(),
            case,
        })
    }

    pub fn equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.compare(path, CompareOp::Eq, value.into())
    }

    /// String equality with an explicit case mode.
    pub fn equal_to_case(self, path: &str, value: &str, case: Case) -> Result<Self> {
        match case {
            Case::Sensitive => self.equal_to(path, value),
            Case::Insensitive => self.string_match(path, StringOp::Equals, value, case),
        }
    }

    pub fn not_equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.compare(path, CompareOp::Ne, value.into())
    }

    /// String inequality with an explicit case mode.
    pub fn not_equal_to_case(self, path: &str, value: &str, case: Case) -> Result<Self> {
        match case {
            Case::Sensitive => self.not_equal_to(path, value),
            Case::Insensitive => self.not()?.string_match(path, StringOp::Equals, value, case),
        }
    }

    pub fn greater_than(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.compare(path, CompareOp::Gt, value.into())
    }

    pub fn greater_than_or_equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.compare(path, CompareOp::Ge, value.into())
    }

    pub fn less_than(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.compare(path, CompareOp::Lt, value.into())
    }

    pub fn less_than_or_equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.compare(path, CompareOp::Le, value.into())
    }

    /// Inclusive range.
    pub fn between(self, path: &str, low: impl Into<Value>, high: impl Into<Value>) -> Result<Self> {
        let (low, high) = (low.into(), high.into());
        let field = self.field(path)?;
        field.check_family("between", &[TypeFamily::Numeric, TypeFamily::Temporal])?;
        for bound in [&low, &high] {
            if bound.is_null() {
                return Err(Error::invalid_argument(format!(
                    "between on '{}' needs non-null bounds",
                    path
                )));
            }
            field.check_comparable(bound)?;
        }
        self.push(Predicate::Between { field, low, high })
    }

    /// Membership test. An empty or absent list matches nothing.
    pub fn in_values(self, path: &str, values: Option<&[Value]>) -> Result<Self> {
        let field = self.field(path)?;
        let values = values.unwrap_or_default();
        if values.is_empty() {
            return self.push(Predicate::False);
        }
        for value in values {
            field.check_comparable(value)?;
        }
        self.push(Predicate::In {
            field,
            values: values.to_vec(),
        })
    }

    pub fn contains(self, path: &str, value: &str, case: Case) -> Result<Self> {
        self.string_match(path, StringOp::Contains, value, case)
    }

    pub fn begins_with(self, path: &str, value: &str, case: Case) -> Result<Self> {
        self.string_match(path, StringOp::BeginsWith, value, case)
    }

    pub fn ends_with(self, path: &str, value: &str, case: Case) -> Result<Self> {
        self.string_match(path, StringOp::EndsWith, value, case)
    }

    /// Wildcard match: `*` for any run of characters, `?` for one character.
    pub fn like(self, path: &str, pattern: &str, case: Case) -> Result<Self> {
        self.string_match(path, StringOp::Like, pattern, case)
    }

    /// Null value, or a null link anywhere along a link path.
    pub fn is_null(self, path: &str) -> Result<Self> {
        let field = self.field(path)?;
        if !field.terminal().nullable && !field.is_link_path() {
            return Err(Error::invalid_argument(format!(
                "'{}' is not nullable",
                path
            )));
        }
        self.push(Predicate::IsNull { field })
    }

    pub fn is_not_null(self, path: &str) -> Result<Self> {
        self.not()?.is_null(path)
    }

    /// Empty string, binary or collection.
    pub fn is_empty(self, path: &str) -> Result<Self> {
        let field = self.field(path)?;
        let col_type = field.col_type();
        if !col_type.collection.is_collection()
            && !matches!(col_type.data_type, DataType::String | DataType::Binary)
        {
            return Err(Error::type_mismatch(
                path,
                "string, binary or collection",
                col_type,
            ));
        }
        self.push(Predicate::IsEmpty { field })
    }

    pub fn is_not_empty(self, path: &str) -> Result<Self> {
        self.not()?.is_empty(path)
    }

    /// Opens a parenthesized group.
    pub fn begin_group(mut self) -> Result<Self> {
        self.frames.push(GroupFrame::new());
        Ok(self)
    }

    /// Closes the innermost group.
    pub fn end_group(mut self) -> Result<Self> {
        if self.frames.len() < 2 {
            return Err(Error::malformed_query("end_group() without matching begin_group()"));
        }
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return Err(Error::malformed_query("end_group() without matching begin_group()")),
        };
        if frame.is_empty() {
            return Err(Error::malformed_query("groups must contain at least one condition"));
        }
        let predicate = frame.finish()?;
        self.push(predicate)
    }

    /// Starts a new alternative: `a.b.or().c` means `(a AND b) OR c`.
    pub fn or(mut self) -> Result<Self> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| Error::malformed_query("query has no open group"))?;
        if frame.pending_not || frame.disjuncts.last().map_or(true, Vec::is_empty) {
            return Err(Error::malformed_query("or() must be placed between two conditions"));
        }
        frame.disjuncts.push(Vec::new());
        Ok(self)
    }

    /// Negates the next condition or group.
    #[allow(clippy::should_implement_trait)]
    pub fn not(mut self) -> Result<Self> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| Error::malformed_query("query has no open group"))?;
        frame.pending_not = !frame.pending_not;
        Ok(self)
    }

    /// Sorts by one field.
    pub fn sort(self, path: &str, order: SortOrder) -> Result<Self> {
        self.sort_by(&[path], &[order])
    }

    /// Sorts by several fields, earlier fields taking precedence.
    pub fn sort_by(mut self, paths: &[&str], orders: &[SortOrder]) -> Result<Self> {
        if paths.len() != orders.len() {
            return Err(Error::invalid_argument(format!(
                "{} sort fields but {} sort orders",
                paths.len(),
                orders.len()
            )));
        }
        let fields = paths
            .iter()
            .zip(orders.iter())
            .map(|(path, order)| Ok((self.field(path)?, *order)))
            .collect::<Result<Vec<_>>>()?;
        self.ordering.push(Directive::Sort(fields))?;
        Ok(self)
    }

    /// Keeps the first object of every distinct combination of `paths`.
    pub fn distinct(mut self, paths: &[&str]) -> Result<Self> {
        let fields = paths
            .iter()
            .map(|path| self.field(path))
            .collect::<Result<Vec<_>>>()?;
        self.ordering.push(Directive::Distinct(fields))?;
        Ok(self)
    }

    /// Keeps at most `limit` objects.
    pub fn limit(mut self, limit: usize) -> Result<Self> {
        self.ordering.push(Directive::Limit(limit))?;
        Ok(self)
    }

    /// Finishes the builder.
    pub fn build(mut self) -> Result<Query> {
        if self.frames.len() != 1 {
            return Err(Error::malformed_query(format!(
                "{} group(s) left open",
                self.frames.len() - 1
            )));
        }
        let root = match self.frames.pop() {
            Some(frame) => frame,
            None => return Err(Error::malformed_query("query has no open group")),
        };
        let predicate = root.finish()?;
        let predicate = match self.base.take() {
            Some(base) => Predicate::and(vec![base, predicate]),
            None => predicate,
        };
        Ok(Query::new(self.class, self.source, predicate, self.ordering))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ANN, BOB, JANE, ZED};
    use tessel_core::ObjKey;
    use tessel_storage::Group;

    fn builder() -> (Group, QueryBuilder) {
        let (group, indices) = fixtures::people();
        let builder = QueryBuilder::new(Arc::new(indices), "Person").unwrap();
        (group, builder)
    }

    fn run(group: &Group, builder: QueryBuilder) -> Vec<ObjKey> {
        builder.build().unwrap().execute(group).unwrap()
    }

    #[test]
    fn test_equal_to() {
        let (group, b) = builder();
        assert_eq!(run(&group, b.equal_to("name", "Jane").unwrap()), vec![JANE]);
    }

    #[test]
    fn test_implicit_and_then_or() {
        let (group, b) = builder();
        let b = b
            .greater_than("age", 15)
            .unwrap()
            .less_than("age", 35)
            .unwrap()
            .or()
            .unwrap()
            .equal_to("name", "Bob")
            .unwrap();
        assert_eq!(run(&group, b), vec![JANE, BOB, ANN]);
    }

    #[test]
    fn test_not_group() {
        let (group, b) = builder();
        let b = b
            .not()
            .unwrap()
            .begin_group()
            .unwrap()
            .equal_to("name", "Jane")
            .unwrap()
            .or()
            .unwrap()
            .equal_to("name", "Bob")
            .unwrap()
            .end_group()
            .unwrap();
        assert_eq!(run(&group, b), vec![ANN, ZED]);
    }

    #[test]
    fn test_in_empty_or_absent_matches_nothing() {
        let (group, b) = builder();
        assert!(run(&group, b.in_values("name", Some(&[])).unwrap()).is_empty());
        let (group, b) = builder();
        assert!(run(&group, b.in_values("name", None).unwrap()).is_empty());
    }

    #[test]
    fn test_is_null_on_broken_link_path() {
        let (group, b) = builder();
        assert_eq!(run(&group, b.is_null("dog.name").unwrap()), vec![BOB, ZED]);
        let (group, b) = builder();
        assert_eq!(run(&group, b.is_not_null("dog.name").unwrap()), vec![JANE, ANN]);
    }

    #[test]
    fn test_is_not_empty() {
        let (group, b) = builder();
        assert_eq!(run(&group, b.is_not_empty("tags").unwrap()), vec![JANE, ANN]);
    }

    #[test]
    fn test_case_insensitive_equality() {
        let (group, b) = builder();
        let b = b.equal_to_case("name", "ZED", Case::Insensitive).unwrap();
        assert_eq!(run(&group, b), vec![ZED]);
        let (group, b) = builder();
        let b = b.not_equal_to_case("name", "JANE", Case::Insensitive).unwrap();
        assert_eq!(run(&group, b), vec![BOB, ANN, ZED]);
    }

    #[test]
    fn test_type_errors_fail_at_build_step() {
        let (_, b) = builder();
        assert!(matches!(b.equal_to("age", "twenty"), Err(Error::TypeMismatch { .. })));
        let (_, b) = builder();
        assert!(matches!(b.contains("age", "2", Case::Sensitive), Err(Error::TypeMismatch { .. })));
        let (_, b) = builder();
        assert!(matches!(b.greater_than("name", "A"), Err(Error::TypeMismatch { .. })));
        let (_, b) = builder();
        assert!(matches!(b.equal_to("missing", 1), Err(Error::UnknownField { .. })));
        let (_, b) = builder();
        assert!(matches!(b.between("dog", 1, 2), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_unbalanced_groups() {
        let (_, b) = builder();
        let open = b.begin_group().unwrap().equal_to("age", 10).unwrap();
        assert!(matches!(open.build(), Err(Error::MalformedQuery { .. })));

        let (_, b) = builder();
        assert!(matches!(b.end_group(), Err(Error::MalformedQuery { .. })));

        let (_, b) = builder();
        let empty = b.begin_group().unwrap();
        assert!(matches!(empty.end_group(), Err(Error::MalformedQuery { .. })));
    }

    #[test]
    fn test_dangling_combinators() {
        let (_, b) = builder();
        assert!(matches!(b.or(), Err(Error::MalformedQuery { .. })));

        let (_, b) = builder();
        let trailing_or = b.equal_to("age", 10).unwrap().or().unwrap();
        assert!(matches!(trailing_or.build(), Err(Error::MalformedQuery { .. })));

        let (_, b) = builder();
        let trailing_not = b.equal_to("age", 10).unwrap().not().unwrap();
        assert!(matches!(trailing_not.build(), Err(Error::MalformedQuery { .. })));
    }

    #[test]
    fn test_sort_defined_twice() {
        let (_, b) = builder();
        let b = b.sort("age", SortOrder::Ascending).unwrap();
        let err = b.sort("name", SortOrder::Ascending).err().unwrap();
        assert!(err.to_string().contains("sort order already defined"));
    }

    #[test]
    fn test_sort_distinct_limit() {
        let (group, b) = builder();
        let b = b
            .sort("age", SortOrder::Descending)
            .unwrap()
            .limit(2)
            .unwrap();
        assert_eq!(run(&group, b), vec![ZED, ANN]);
    }

    #[test]
    fn test_from_query_narrows_base() {
        let (group, b) = builder();
        let indices = b.indices().clone();
        let base = b.greater_than("age", 15).unwrap().build().unwrap();
        let narrowed = QueryBuilder::from_query(indices, &base)
            .unwrap()
            .less_than("age", 35)
            .unwrap();
        assert_eq!(run(&group, narrowed), vec![JANE, ANN]);
    }

    #[test]
    fn test_empty_builder_matches_everything() {
        let (group, b) = builder();
        assert_eq!(run(&group, b), vec![JANE, BOB, ANN, ZED]);
    }
}
