//! Change listeners fired by local commits.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessel_core::schema::{ObjectSchemaBuilder, Property};
use tessel_core::DataType;
use tessel_database::{Configuration, ObjectChangeSet, Realm, RealmListener, Value};

fn open(name: &str) -> Realm {
    let person = ObjectSchemaBuilder::new("Person")
        .unwrap()
        .field("name", DataType::String)
        .unwrap()
        .field("age", DataType::Int)
        .unwrap()
        .property(Property::list("tags", DataType::String))
        .unwrap()
        .build()
        .unwrap();
    let config = Configuration::builder(name).in_memory().class(person).build().unwrap();
    Realm::get_instance(&config).unwrap()
}

#[test]
fn test_object_listener_reports_fields_then_deletion() {
    let mut realm = open("listeners_object");
    realm.begin_transaction().unwrap();
    let jane = realm.create_object("Person").unwrap();
    jane.set("name", "Jane").unwrap();
    realm.commit_transaction().unwrap();

    let seen: Arc<Mutex<Vec<ObjectChangeSet>>> = Arc::default();
    let sink = Arc::clone(&seen);
    jane.add_change_listener(move |_, changes| sink.lock().push(changes.clone()))
        .unwrap();

    realm.execute_transaction(|_| jane.set("age", 30i64)).unwrap();
    // A commit that leaves the object alone is not reported.
    realm.execute_transaction(|r| r.create_object("Person").map(drop)).unwrap();
    realm.execute_transaction(|_| jane.delete_from_realm()).unwrap();
    realm.execute_transaction(|r| r.create_object("Person").map(drop)).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_field_changed("age"));
    assert!(!seen[0].is_field_changed("name"));
    assert!(!seen[0].is_deleted());
    assert!(seen[1].is_deleted());
    realm.close().unwrap();
}

#[test]
fn test_list_listener_sees_insertions() {
    let mut realm = open("listeners_list");
    realm.begin_transaction().unwrap();
    let jane = realm.create_object("Person").unwrap();
    realm.commit_transaction().unwrap();
    let tags = jane.get_list("tags").unwrap();

    let inserted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inserted);
    tags.add_change_listener(move |list, changes| {
        assert_eq!(list.size().unwrap(), changes.insertions().len());
        sink.lock().extend_from_slice(changes.insertions());
    })
    .unwrap();

    realm
        .execute_transaction(|_| {
            tags.add("a")?;
            tags.add("b")
        })
        .unwrap();
    assert_eq!(*inserted.lock(), vec![0, 1]);
    assert_eq!(tags.to_vec().unwrap(), vec![Value::from("a"), Value::from("b")]);
    realm.close().unwrap();
}

#[test]
fn test_removed_and_weak_listeners_stop_firing() {
    let mut realm = open("listeners_removal");
    let strong = Arc::new(AtomicUsize::new(0));
    let weak = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&strong);
    let id = realm
        .add_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let counter = Arc::clone(&weak);
    let held: Arc<RealmListener> = Arc::new(move |_: &Realm| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    realm.add_weak_change_listener(&held).unwrap();

    realm.execute_transaction(|r| r.create_object("Person").map(drop)).unwrap();
    assert_eq!((strong.load(Ordering::SeqCst), weak.load(Ordering::SeqCst)), (1, 1));

    drop(held);
    assert!(realm.remove_change_listener(id).unwrap());
    assert!(!realm.remove_change_listener(id).unwrap());
    realm.execute_transaction(|r| r.create_object("Person").map(drop)).unwrap();
    assert_eq!((strong.load(Ordering::SeqCst), weak.load(Ordering::SeqCst)), (1, 1));
    realm.close().unwrap();
}

#[test]
fn test_listener_can_read_the_instance() {
    let mut realm = open("listeners_reentrant");
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    realm
        .add_change_listener(move |r| {
            let people = r.all_objects("Person").and_then(|p| p.size()).unwrap_or(0);
            sink.store(people, Ordering::SeqCst);
        })
        .unwrap();
    realm
        .execute_transaction(|r| {
            r.create_object("Person")?;
            r.create_object("Person").map(drop)
        })
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    realm.close().unwrap();
}
