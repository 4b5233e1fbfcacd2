//! Tessel Query - Query builder and predicate evaluation for tessel.
//!
//! This crate translates a fluent sequence of typed conditions into a
//! predicate tree and evaluates it against a storage snapshot:
//!
//! - `descriptor`: field paths (including dotted link paths) resolved to column keys
//! - `predicate`: the predicate tree and its evaluation against rows
//! - `builder`: the chainable `QueryBuilder` with grouping, `or` and `not`
//! - `ordering`: sort, distinct and limit directives in declaration order
//! - `aggregate`: sum, average, min and max over a resolved field
//! - `query`: an immutable, re-executable query over a table, list or backlinks
//!
//! Every field reference is resolved when the condition is added, so a
//! misspelled field or a value of the wrong type fails while building and
//! never during execution.

pub mod aggregate;
pub mod builder;
pub mod descriptor;
pub mod ordering;
pub mod predicate;
pub mod query;

#[cfg(test)]
mod fixtures;

pub use aggregate::AggregateKind;
pub use builder::QueryBuilder;
pub use descriptor::{FieldDescriptor, LinkHop};
pub use ordering::{DescriptorOrdering, Directive, SortOrder};
pub use predicate::{CompareOp, Predicate, StringOp};
pub use query::{Query, QuerySource};
pub use tessel_core::pattern_match::Case;
