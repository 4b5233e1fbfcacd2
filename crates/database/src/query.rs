//! Query entry point bound to an instance.
//!
//! [`RealmQuery`] wraps a [`QueryBuilder`] and checks the owning thread on
//! every call, so a query started on one thread cannot be extended or run
//! on another. Field paths, value types and group balance are validated by
//! the builder as each condition is added.

use crate::object::Object;
use crate::realm::{evaluate_keys, RealmInner};
use crate::results::Results;
use std::sync::Arc;
use tessel_core::pattern_match::Case;
use tessel_core::{Result, Value};
use tessel_query::{aggregate, FieldDescriptor, Query, QueryBuilder, SortOrder};

/// A query under construction against one instance.
pub struct RealmQuery {
    inner: Arc<RealmInner>,
    builder: QueryBuilder,
}

macro_rules! condition {
    ($(#[$doc:meta])* $name:ident($($arg:ident: $ty:ty),*)) => {
        $(#[$doc])*
        pub fn $name(self, $($arg: $ty),*) -> Result<Self> {
            self.step(|b| b.$name($($arg),*))
        }
    };
}

impl RealmQuery {
    pub(crate) fn new(inner: Arc<RealmInner>, builder: QueryBuilder) -> RealmQuery {
        RealmQuery { inner, builder }
    }

    fn step(self, f: impl FnOnce(QueryBuilder) -> Result<QueryBuilder>) -> Result<Self> {
        self.inner.check()?;
        let RealmQuery { inner, builder } = self;
        Ok(RealmQuery {
            builder: f(builder)?,
            inner,
        })
    }

    pub fn class_name(&self) -> Result<&str> {
        self.inner.check()?;
        Ok(self.builder.class())
    }

    /// Matches objects whose `path` equals `value`.
    pub fn equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.equal_to(path, value))
    }

    condition!(
        /// String equality with an explicit case mode.
        equal_to_case(path: &str, value: &str, case: Case)
    );

    pub fn not_equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.not_equal_to(path, value))
    }

    condition!(not_equal_to_case(path: &str, value: &str, case: Case));

    pub fn greater_than(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.greater_than(path, value))
    }

    pub fn greater_than_or_equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.greater_than_or_equal_to(path, value))
    }

    pub fn less_than(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.less_than(path, value))
    }

    pub fn less_than_or_equal_to(self, path: &str, value: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.less_than_or_equal_to(path, value))
    }

    /// Inclusive range on both ends.
    pub fn between(self, path: &str, low: impl Into<Value>, high: impl Into<Value>) -> Result<Self> {
        self.step(|b| b.between(path, low, high))
    }

    condition!(
        /// Matches any of `values`. `None` or an empty slice matches nothing.
        in_values(path: &str, values: Option<&[Value]>)
    );
    condition!(contains(path: &str, value: &str, case: Case));
    condition!(begins_with(path: &str, value: &str, case: Case));
    condition!(ends_with(path: &str, value: &str, case: Case));
    condition!(
        /// `?` matches one character and `*` any run of characters.
        like(path: &str, pattern: &str, case: Case)
    );
    condition!(
        /// A null link anywhere along `path` makes the whole path null.
        is_null(path: &str)
    );
    condition!(is_not_null(path: &str));
    condition!(
        /// Empty strings, binaries and collections.
        is_empty(path: &str)
    );
    condition!(is_not_empty(path: &str));

    pub fn begin_group(self) -> Result<Self> {
        self.step(QueryBuilder::begin_group)
    }

    pub fn end_group(self) -> Result<Self> {
        self.step(QueryBuilder::end_group)
    }

    pub fn or(self) -> Result<Self> {
        self.step(QueryBuilder::or)
    }

    pub fn not(self) -> Result<Self> {
        self.step(QueryBuilder::not)
    }

    condition!(sort(path: &str, order: SortOrder));
    condition!(sort_by(paths: &[&str], orders: &[SortOrder]));
    condition!(distinct(paths: &[&str]));
    condition!(limit(limit: usize));

    fn build(self) -> Result<(Arc<RealmInner>, Query)> {
        self.inner.check()?;
        let query = self.builder.build()?;
        Ok((self.inner, query))
    }

    /// Runs the query now.
    pub fn find_all(self) -> Result<Results> {
        let (inner, query) = self.build()?;
        Results::evaluated(inner, query)
    }

    /// Runs the query on a worker. Needs a looper on the calling thread;
    /// the results read as unloaded until the worker delivers.
    pub fn find_all_async(self) -> Result<Results> {
        let (inner, query) = self.build()?;
        Results::asynchronous(inner, query)
    }

    /// The first match, after sorting.
    pub fn find_first(self) -> Result<Option<Object>> {
        let (inner, query) = self.build()?;
        let key = inner.read(|group, _| {
            if !query.is_source_valid(group) {
                return Ok(None);
            }
            query.find_first(group)
        })?;
        Ok(key.map(|key| Object::attached(Arc::clone(&inner), query.class(), key)))
    }

    /// Returns a placeholder filled in by a worker. If nothing matches the
    /// object loads as invalid.
    pub fn find_first_async(self) -> Result<Object> {
        let (inner, query) = self.build()?;
        if !inner.has_looper() {
            return Err(tessel_core::Error::illegal_state(
                "find_first_async needs a looper on the calling thread",
            ));
        }
        let object = Object::pending(Arc::clone(&inner), query);
        inner.request(object.async_target())?;
        Ok(object)
    }

    /// Number of matches. Limit and distinct apply.
    pub fn count(self) -> Result<usize> {
        let (inner, query) = self.build()?;
        inner.read(|group, _| {
            if !query.is_source_valid(group) {
                return Ok(0);
            }
            query.count(group)
        })
    }

    fn aggregate<T>(
        self,
        field: &str,
        f: impl FnOnce(&tessel_storage::Group, &FieldDescriptor, &[tessel_core::ObjKey]) -> Result<T>,
    ) -> Result<T> {
        let (inner, query) = self.build()?;
        inner.read(|group, indices| {
            let descriptor = FieldDescriptor::resolve(indices, query.class(), field)?;
            let keys = evaluate_keys(&query, group)?;
            f(group, &descriptor, &keys)
        })
    }

    pub fn sum(self, field: &str) -> Result<Value> {
        self.aggregate(field, aggregate::sum)
    }

    pub fn average(self, field: &str) -> Result<f64> {
        self.aggregate(field, aggregate::average)
    }

    pub fn min(self, field: &str) -> Result<Option<Value>> {
        self.aggregate(field, aggregate::min)
    }

    pub fn max(self, field: &str) -> Result<Option<Value>> {
        self.aggregate(field, aggregate::max)
    }
}

impl std::fmt::Debug for RealmQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmQuery").field("class", &self.builder.class()).finish()
    }
}
