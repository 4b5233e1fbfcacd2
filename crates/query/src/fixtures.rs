//! Shared test data: people with dogs.

use tessel_core::schema::{ColumnIndices, ObjectSchemaBuilder, Property};
use tessel_core::{DataType, ObjKey, Value};
use tessel_storage::{ChangeLog, Group};

pub const REX: ObjKey = ObjKey(0);
pub const FIDO: ObjKey = ObjKey(1);

pub const JANE: ObjKey = ObjKey(0);
pub const BOB: ObjKey = ObjKey(1);
pub const ANN: ObjKey = ObjKey(2);
pub const ZED: ObjKey = ObjKey(3);

/// Dog { name, age }, Person { name, age, dog, dogs, tags, nickname, score }.
pub fn people() -> (Group, ColumnIndices) {
    let mut group = Group::new();
    let mut log = ChangeLog::new();

    let dog = ObjectSchemaBuilder::new("Dog")
        .unwrap()
        .field("name", DataType::String)
        .unwrap()
        .field("age", DataType::Int)
        .unwrap()
        .build()
        .unwrap();
    let person = ObjectSchemaBuilder::new("Person")
        .unwrap()
        .field("name", DataType::String)
        .unwrap()
        .field("age", DataType::Int)
        .unwrap()
        .link("dog", "Dog")
        .unwrap()
        .link_list("dogs", "Dog")
        .unwrap()
        .property(Property::list("tags", DataType::String))
        .unwrap()
        .optional("nickname", DataType::String)
        .unwrap()
        .optional("score", DataType::Double)
        .unwrap()
        .build()
        .unwrap();
    group.add_table(dog, &mut log).unwrap();
    group.add_table(person, &mut log).unwrap();

    for (name, age) in [("Rex", 3), ("Fido", 7)] {
        group
            .create_object("Dog", vec![Value::from(name), Value::Int(age)], &mut log)
            .unwrap();
    }

    let rows = [
        ("Jane", 20, Value::Link(REX), vec![REX, FIDO], vec!["a", "b"], Some("jj"), Some(4.5)),
        ("Bob", 10, Value::Null, vec![], vec![], None, None),
        ("Ann", 30, Value::Link(FIDO), vec![FIDO], vec!["b"], None, Some(1.5)),
        ("zed", 40, Value::Null, vec![], vec![], Some("Zed"), None),
    ];
    for (name, age, dog, dogs, tags, nickname, score) in rows {
        group
            .create_object(
                "Person",
                vec![
                    Value::from(name),
                    Value::Int(age),
                    dog,
                    Value::List(dogs.into_iter().map(Value::Link).collect()),
                    Value::List(tags.into_iter().map(Value::from).collect()),
                    Value::from(nickname),
                    Value::from(score),
                ],
                &mut log,
            )
            .unwrap();
    }

    let indices = ColumnIndices::build(&group.schema(), 1);
    (group, indices)
}
