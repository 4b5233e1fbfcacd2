//! Predicate tree and its evaluation.

use crate::descriptor::FieldDescriptor;
use std::cmp::Ordering;
use tessel_core::pattern_match::{self, Case};
use tessel_core::{Row, Value};
use tessel_storage::Group;

/// Comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn matches(self, stored: &Value, operand: &Value) -> bool {
        match self {
            CompareOp::Eq => values_equal(stored, operand),
            CompareOp::Ne => !values_equal(stored, operand),
            CompareOp::Lt => stored.compare(operand) == Some(Ordering::Less),
            CompareOp::Le => matches!(stored.compare(operand), Some(Ordering::Less | Ordering::Equal)),
            CompareOp::Gt => stored.compare(operand) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(
                stored.compare(operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// String matching operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringOp {
    Equals,
    Contains,
    BeginsWith,
    EndsWith,
    /// `*` matches any run of characters, `?` matches one character.
    Like,
}

impl StringOp {
    fn matches(self, value: &str, pattern: &str, case: Case) -> bool {
        match self {
            StringOp::Equals => pattern_match::equals(value, pattern, case),
            StringOp::Contains => pattern_match::contains(value, pattern, case),
            StringOp::BeginsWith => pattern_match::begins_with(value, pattern, case),
            StringOp::EndsWith => pattern_match::ends_with(value, pattern, case),
            StringOp::Like => pattern_match::like(value, pattern, case),
        }
    }
}

/// A node of the predicate tree.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// Matches every object.
    True,
    /// Matches no object.
    False,
    Compare {
        field: FieldDescriptor,
        op: CompareOp,
        value: Value,
    },
    /// Inclusive range.
    Between {
        field: FieldDescriptor,
        low: Value,
        high: Value,
    },
    /// Equal to any of `values`; never empty.
    In {
        field: FieldDescriptor,
        values: Vec<Value>,
    },
    StringMatch {
        field: FieldDescriptor,
        op: StringOp,
        pattern: String,
        case: Case,
    },
    /// Null value, or a null link anywhere along the path.
    IsNull { field: FieldDescriptor },
    /// Empty string, binary or collection.
    IsEmpty { field: FieldDescriptor },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Combines predicates with AND, flattening trivial cases.
    pub fn and(mut predicates: Vec<Predicate>) -> Predicate {
        predicates.retain(|p| !matches!(p, Predicate::True));
        match predicates.len() {
            0 => Predicate::True,
            1 => predicates.remove(0),
            _ => Predicate::And(predicates),
        }
    }

    /// Combines predicates with OR, flattening trivial cases.
    pub fn or(mut predicates: Vec<Predicate>) -> Predicate {
        predicates.retain(|p| !matches!(p, Predicate::False));
        match predicates.len() {
            0 => Predicate::False,
            1 => predicates.remove(0),
            _ => Predicate::Or(predicates),
        }
    }

    /// Negates a predicate.
    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Predicate {
        match predicate {
            Predicate::True => Predicate::False,
            Predicate::False => Predicate::True,
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    /// Evaluates the predicate against one object of the queried class.
    pub fn eval(&self, group: &Group, row: &Row) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::Compare { field, op, value } => {
                any_element(field, group, row, |stored| op.matches(stored, value))
            }
            Predicate::Between { field, low, high } => any_element(field, group, row, |stored| {
                CompareOp::Ge.matches(stored, low) && CompareOp::Le.matches(stored, high)
            }),
            Predicate::In { field, values } => any_element(field, group, row, |stored| {
                values.iter().any(|v| values_equal(stored, v))
            }),
            Predicate::StringMatch {
                field,
                op,
                pattern,
                case,
            } => any_element(field, group, row, |stored| match stored.as_str() {
                Some(s) => op.matches(s, pattern, *case),
                None => false,
            }),
            Predicate::IsNull { field } => field
                .values(group, row)
                .into_iter()
                .any(|v| v.map_or(true, Value::is_null)),
            Predicate::IsEmpty { field } => {
                field
                    .values(group, row)
                    .into_iter()
                    .flatten()
                    .any(|v| match v {
                        Value::String(s) => s.is_empty(),
                        Value::Binary(b) => b.is_empty(),
                        Value::List(items) => items.is_empty(),
                        _ => false,
                    })
            }
            Predicate::And(children) => children.iter().all(|p| p.eval(group, row)),
            Predicate::Or(children) => children.iter().any(|p| p.eval(group, row)),
            Predicate::Not(inner) => !inner.eval(group, row),
        }
    }

    /// Returns the field descriptors referenced by this predicate.
    pub fn fields(&self) -> Vec<&FieldDescriptor> {
        match self {
            Predicate::True | Predicate::False => Vec::new(),
            Predicate::Compare { field, .. }
            | Predicate::Between { field, .. }
            | Predicate::In { field, .. }
            | Predicate::StringMatch { field, .. }
            | Predicate::IsNull { field }
            | Predicate::IsEmpty { field } => vec![field],
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().flat_map(Predicate::fields).collect()
            }
            Predicate::Not(inner) => inner.fields(),
        }
    }
}

/// Equality where null only equals null; numeric values compare across types.
fn values_equal(stored: &Value, operand: &Value) -> bool {
    match (stored, operand) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => stored.compare(operand) == Some(Ordering::Equal),
    }
}

/// Applies `test` to every value reachable through `field`, expanding
/// collection cells into their elements. A broken link path tests as null.
fn any_element(
    field: &FieldDescriptor,
    group: &Group,
    row: &Row,
    test: impl Fn(&Value) -> bool,
) -> bool {
    field.values(group, row).into_iter().any(|v| match v {
        None => test(&Value::Null),
        Some(Value::List(items)) => items.iter().any(&test),
        Some(value) => test(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ANN, BOB, JANE, ZED};
    use tessel_core::ObjKey;

    fn field(path: &str) -> FieldDescriptor {
        let (_, indices) = fixtures::people();
        FieldDescriptor::resolve(&indices, "Person", path).unwrap()
    }

    fn matching(predicate: &Predicate) -> Vec<ObjKey> {
        let (group, _) = fixtures::people();
        let table = group.table("Person").unwrap();
        table
            .rows()
            .filter(|row| predicate.eval(&group, row))
            .map(|row| row.key())
            .collect()
    }

    #[test]
    fn test_compare() {
        let p = Predicate::Compare {
            field: field("age"),
            op: CompareOp::Gt,
            value: Value::Int(20),
        };
        assert_eq!(matching(&p), vec![ANN, ZED]);

        let p = Predicate::Compare {
            field: field("age"),
            op: CompareOp::Eq,
            value: Value::Double(10.0),
        };
        assert_eq!(matching(&p), vec![BOB]);
    }

    #[test]
    fn test_between_is_inclusive() {
        let p = Predicate::Between {
            field: field("age"),
            low: Value::Int(20),
            high: Value::Int(30),
        };
        assert_eq!(matching(&p), vec![JANE, ANN]);
    }

    #[test]
    fn test_null_equality() {
        let p = Predicate::Compare {
            field: field("nickname"),
            op: CompareOp::Eq,
            value: Value::Null,
        };
        assert_eq!(matching(&p), vec![BOB, ANN]);

        let p = Predicate::Compare {
            field: field("nickname"),
            op: CompareOp::Ne,
            value: Value::Null,
        };
        assert_eq!(matching(&p), vec![JANE, ZED]);
    }

    #[test]
    fn test_link_path_null_short_circuits() {
        let p = Predicate::IsNull {
            field: field("dog.age"),
        };
        assert_eq!(matching(&p), vec![BOB, ZED]);

        let p = Predicate::not(Predicate::IsNull {
            field: field("dog.name"),
        });
        assert_eq!(matching(&p), vec![JANE, ANN]);
    }

    #[test]
    fn test_link_list_any_semantics() {
        let p = Predicate::Compare {
            field: field("dogs.age"),
            op: CompareOp::Gt,
            value: Value::Int(5),
        };
        assert_eq!(matching(&p), vec![JANE, ANN]);
    }

    #[test]
    fn test_scalar_list_elements() {
        let p = Predicate::Compare {
            field: field("tags"),
            op: CompareOp::Eq,
            value: Value::from("b"),
        };
        assert_eq!(matching(&p), vec![JANE, ANN]);
    }

    #[test]
    fn test_string_match_case() {
        let p = Predicate::StringMatch {
            field: field("name"),
            op: StringOp::BeginsWith,
            pattern: "Z".into(),
            case: Case::Sensitive,
        };
        assert!(matching(&p).is_empty());

        let p = Predicate::StringMatch {
            field: field("name"),
            op: StringOp::BeginsWith,
            pattern: "Z".into(),
            case: Case::Insensitive,
        };
        assert_eq!(matching(&p), vec![ZED]);

        let p = Predicate::StringMatch {
            field: field("name"),
            op: StringOp::Like,
            pattern: "?a*".into(),
            case: Case::Sensitive,
        };
        assert_eq!(matching(&p), vec![JANE]);
    }

    #[test]
    fn test_is_empty() {
        let p = Predicate::IsEmpty {
            field: field("dogs"),
        };
        assert_eq!(matching(&p), vec![BOB, ZED]);
    }

    #[test]
    fn test_in() {
        let p = Predicate::In {
            field: field("name"),
            values: vec![Value::from("Bob"), Value::from("Ann")],
        };
        assert_eq!(matching(&p), vec![BOB, ANN]);
    }

    #[test]
    fn test_combinators() {
        let young = Predicate::Compare {
            field: field("age"),
            op: CompareOp::Lt,
            value: Value::Int(25),
        };
        let has_dog = Predicate::not(Predicate::IsNull {
            field: field("dog"),
        });
        assert_eq!(matching(&Predicate::and(vec![young.clone(), has_dog.clone()])), vec![JANE]);
        assert_eq!(matching(&Predicate::or(vec![young, has_dog])), vec![JANE, BOB, ANN]);
        assert!(matches!(Predicate::and(vec![]), Predicate::True));
        assert!(matches!(Predicate::or(vec![]), Predicate::False));
        assert!(matches!(Predicate::not(Predicate::False), Predicate::True));
    }
}
