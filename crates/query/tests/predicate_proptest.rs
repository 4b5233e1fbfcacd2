//! Property-based tests for query building and evaluation.
//!
//! These tests compare query results against straightforward filters over
//! randomly generated objects.

use proptest::prelude::*;
use std::sync::Arc;
use tessel_core::schema::{ColumnIndices, ObjectSchemaBuilder};
use tessel_core::{DataType, ObjKey, Value};
use tessel_query::{QueryBuilder, SortOrder};
use tessel_storage::{ChangeLog, Group};

/// Strategy for generating (age, optional score) pairs.
fn people_strategy(max_rows: usize) -> impl Strategy<Value = Vec<(i64, Option<f64>)>> {
    prop::collection::vec((-50i64..150, prop::option::of(-100.0f64..100.0)), 0..max_rows)
}

fn build_group(people: &[(i64, Option<f64>)]) -> (Group, Arc<ColumnIndices>) {
    let mut group = Group::new();
    let mut log = ChangeLog::new();
    let schema = ObjectSchemaBuilder::new("Person")
        .unwrap()
        .field("age", DataType::Int)
        .unwrap()
        .optional("score", DataType::Double)
        .unwrap()
        .build()
        .unwrap();
    group.add_table(schema, &mut log).unwrap();
    for (age, score) in people {
        group
            .create_object("Person", vec![Value::Int(*age), Value::from(*score)], &mut log)
            .unwrap();
    }
    let indices = Arc::new(ColumnIndices::build(&group.schema(), 1));
    (group, indices)
}

proptest! {
    #[test]
    fn prop_between_matches_manual_filter(
        people in people_strategy(60),
        a in -60i64..160,
        b in -60i64..160,
    ) {
        let (low, high) = (a.min(b), a.max(b));
        let (group, indices) = build_group(&people);
        let keys = QueryBuilder::new(indices, "Person")
            .unwrap()
            .between("age", low, high)
            .unwrap()
            .build()
            .unwrap()
            .execute(&group)
            .unwrap();
        let expected: Vec<ObjKey> = people
            .iter()
            .enumerate()
            .filter(|(_, (age, _))| *age >= low && *age <= high)
            .map(|(i, _)| ObjKey(i as i64))
            .collect();
        prop_assert_eq!(keys, expected);
    }

    #[test]
    fn prop_empty_in_matches_nothing(people in people_strategy(40)) {
        let (group, indices) = build_group(&people);
        let query = QueryBuilder::new(indices, "Person")
            .unwrap()
            .in_values("age", Some(&[]))
            .unwrap()
            .build()
            .unwrap();
        prop_assert_eq!(query.count(&group).unwrap(), 0);
    }

    #[test]
    fn prop_not_is_complement(people in people_strategy(40), pivot in -60i64..160) {
        let (group, indices) = build_group(&people);
        let matched = QueryBuilder::new(indices.clone(), "Person")
            .unwrap()
            .greater_than("age", pivot)
            .unwrap()
            .build()
            .unwrap()
            .count(&group)
            .unwrap();
        let negated = QueryBuilder::new(indices, "Person")
            .unwrap()
            .not()
            .unwrap()
            .greater_than("age", pivot)
            .unwrap()
            .build()
            .unwrap()
            .count(&group)
            .unwrap();
        prop_assert_eq!(matched + negated, people.len());
    }

    #[test]
    fn prop_sort_is_ordered_and_complete(people in people_strategy(60)) {
        let (group, indices) = build_group(&people);
        let keys = QueryBuilder::new(indices, "Person")
            .unwrap()
            .sort("age", SortOrder::Ascending)
            .unwrap()
            .build()
            .unwrap()
            .execute(&group)
            .unwrap();
        prop_assert_eq!(keys.len(), people.len());
        let ages: Vec<i64> = keys.iter().map(|k| people[k.0 as usize].0).collect();
        prop_assert!(ages.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn prop_average_skips_nulls(people in people_strategy(40)) {
        let (group, indices) = build_group(&people);
        let keys: Vec<ObjKey> = (0..people.len() as i64).map(ObjKey).collect();
        let field = tessel_query::FieldDescriptor::resolve(&indices, "Person", "score").unwrap();
        let avg = tessel_query::aggregate::average(&group, &field, &keys).unwrap();
        let present: Vec<f64> = people.iter().filter_map(|(_, s)| *s).collect();
        let expected = if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        };
        prop_assert!((avg - expected).abs() < 1e-9);
    }
}
