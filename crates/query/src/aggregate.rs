//! Aggregates over a resolved field.
//!
//! Objects whose aggregated value is null are skipped. Over an empty (or
//! all-null) input `sum` yields the zero of the column type, `average`
//! yields `0.0`, `min` and `max` yield `None`.

use crate::descriptor::FieldDescriptor;
use std::cmp::Ordering;
use tessel_core::{DataType, Decimal128, Error, ObjKey, Result, Value};
use tessel_storage::Group;

/// Aggregate function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateKind::Sum => "sum",
            AggregateKind::Average => "average",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
        }
    }

    /// Checks the field can be aggregated with this function.
    pub fn check(&self, field: &FieldDescriptor) -> Result<()> {
        if !field.is_single_valued() {
            return Err(Error::invalid_argument(format!(
                "cannot {} over '{}': it yields more than one value per object",
                self.name(),
                field.path()
            )));
        }
        let dt = field.data_type();
        let ok = match self {
            AggregateKind::Sum | AggregateKind::Average => dt.is_numeric(),
            AggregateKind::Min | AggregateKind::Max => dt.is_ordered(),
        };
        if ok {
            return Ok(());
        }
        let expected = match self {
            AggregateKind::Sum | AggregateKind::Average => "numeric",
            AggregateKind::Min | AggregateKind::Max => "numeric or date",
        };
        Err(Error::type_mismatch(field.path(), expected, dt))
    }
}

fn non_null_values<'g>(
    group: &'g Group,
    field: &FieldDescriptor,
    keys: &[ObjKey],
) -> Result<Vec<&'g Value>> {
    let table = group.require_table(field.root_class())?;
    Ok(keys
        .iter()
        .filter_map(|key| table.get(*key))
        .map(|row| field.first_value(group, row))
        .filter(|v| !v.is_null())
        .collect())
}

/// Sums the field over `keys`.
pub fn sum(group: &Group, field: &FieldDescriptor, keys: &[ObjKey]) -> Result<Value> {
    AggregateKind::Sum.check(field)?;
    let values = non_null_values(group, field, keys)?;
    Ok(match field.data_type() {
        DataType::Int => Value::Int(
            values
                .iter()
                .filter_map(|v| v.as_int())
                .fold(0i64, i64::wrapping_add),
        ),
        DataType::Decimal => Value::Decimal(
            values
                .iter()
                .filter_map(|v| v.as_decimal())
                .fold(Decimal128::ZERO, |acc, d| acc.add(&d)),
        ),
        _ => Value::Double(values.iter().filter_map(|v| v.as_f64_lossy()).sum()),
    })
}

/// Averages the field over `keys`.
pub fn average(group: &Group, field: &FieldDescriptor, keys: &[ObjKey]) -> Result<f64> {
    AggregateKind::Average.check(field)?;
    let values: Vec<f64> = non_null_values(group, field, keys)?
        .iter()
        .filter_map(|v| v.as_f64_lossy())
        .collect();
    if values.is_empty() {
        return Ok(0.0);
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Returns the smallest value of the field over `keys`.
pub fn min(group: &Group, field: &FieldDescriptor, keys: &[ObjKey]) -> Result<Option<Value>> {
    extreme(AggregateKind::Min, group, field, keys, Ordering::Less)
}

/// Returns the largest value of the field over `keys`.
pub fn max(group: &Group, field: &FieldDescriptor, keys: &[ObjKey]) -> Result<Option<Value>> {
    extreme(AggregateKind::Max, group, field, keys, Ordering::Greater)
}

fn extreme(
    kind: AggregateKind,
    group: &Group,
    field: &FieldDescriptor,
    keys: &[ObjKey],
    wanted: Ordering,
) -> Result<Option<Value>> {
    kind.check(field)?;
    let values = non_null_values(group, field, keys)?;
    let mut best: Option<&Value> = None;
    for value in values {
        best = match best {
            Some(current) if value.compare(current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }
    Ok(best.cloned())
}
