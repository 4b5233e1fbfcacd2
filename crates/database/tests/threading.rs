//! Cross-thread behaviour: confinement, remote commits, loopers and
//! asynchronous work.

use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tessel_core::schema::{ObjectSchemaBuilder, Property};
use tessel_core::DataType;
use tessel_database::{Configuration, Error, List, Looper, Object, Realm, Results};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(name: &str) -> Configuration {
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
    Configuration::builder(name).in_memory().class(person).build().unwrap()
}

/// Inserts through a short-lived handle. In-memory files only live while an
/// instance is open, so callers keep one open around this.
fn insert_people(config: &Configuration, count: usize) {
    let mut realm = Realm::get_instance(config).unwrap();
    realm
        .execute_transaction(|r| {
            for i in 0..count {
                let p = r.create_object("Person")?;
                p.set("name", format!("p{}", i))?;
                p.set("age", i as i64)?;
            }
            Ok(())
        })
        .unwrap();
    realm.close().unwrap();
}

type Op = fn(&Realm, &Object, &Results, &List) -> Result<(), Error>;

fn confined_ops() -> Vec<Op> {
    let ops: &[Op] = &[
        |r, _, _, _| r.version().map(drop),
        |r, _, _, _| r.begin_transaction(),
        |r, _, _, _| r.commit_transaction(),
        |r, _, _, _| r.is_in_transaction().map(drop),
        |r, _, _, _| r.refresh().map(drop),
        |r, _, _, _| r.schema().map(drop),
        |r, _, _, _| r.where_("Person").map(drop),
        |r, _, _, _| r.all_objects("Person").map(drop),
        |r, _, _, _| r.create_object("Person").map(drop),
        |r, _, _, _| r.add_change_listener(|_| {}).map(drop),
        |r, _, _, _| r.delete_all(),
        |_, o, _, _| o.get("name").map(drop),
        |_, o, _, _| o.get_int("age").map(drop),
        |_, o, _, _| o.set("age", 1i64),
        |_, o, _, _| o.key().map(drop),
        |_, o, _, _| o.is_valid().map(drop),
        |_, o, _, _| o.get_list("tags").map(drop),
        |_, o, _, _| o.delete_from_realm(),
        |_, o, _, _| o.add_change_listener(|_, _| {}).map(drop),
        |_, _, res, _| res.size().map(drop),
        |_, _, res, _| res.get(0).map(drop),
        |_, _, res, _| res.sum("age").map(drop),
        |_, _, res, _| res.where_().map(drop),
        |_, _, res, _| res.delete_all_from_realm().map(drop),
        |_, _, res, _| res.class_name().map(drop),
        |_, _, res, _| res.query().map(drop),
        |_, o, _, _| o.class_name().map(drop),
        |_, _, res, _| res.snapshot().map(drop),
        |_, _, _, l| l.size().map(drop),
        |_, _, _, l| l.add("x"),
        |_, _, _, l| l.iter().map(drop),
    ];
    ops.to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_other_threads_are_rejected(index in 0usize..31) {
        let config = config("threading_confinement");
        let mut realm = Realm::get_instance(&config).unwrap();
        insert_people(&config, 1);
        let object = realm.all_objects("Person").unwrap().first().unwrap().unwrap();
        let results = realm.all_objects("Person").unwrap();
        let list = object.get_list("tags").unwrap();
        let ops = confined_ops();
        let op = ops[index % ops.len()];

        let outcome = thread::scope(|s| s.spawn(|| op(&realm, &object, &results, &list)).join().unwrap());
        prop_assert!(matches!(outcome, Err(Error::WrongThread { .. })), "op {} gave {:?}", index, outcome);
        realm.close().unwrap();
    }
}

#[test]
fn test_snapshots_and_queries_stay_on_their_thread() {
    let config = config("threading_snapshot_confinement");
    let mut realm = Realm::get_instance(&config).unwrap();
    insert_people(&config, 2);
    let snapshot = realm.all_objects("Person").unwrap().snapshot().unwrap();
    let query = realm.where_("Person").unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            assert!(matches!(snapshot.size(), Err(Error::WrongThread { .. })));
            assert!(matches!(snapshot.is_empty(), Err(Error::WrongThread { .. })));
            assert!(matches!(snapshot.iter().map(|i| i.count()), Err(Error::WrongThread { .. })));
            assert!(matches!(snapshot.get(0), Err(Error::WrongThread { .. })));
            assert!(matches!(query.class_name(), Err(Error::WrongThread { .. })));
        })
        .join()
        .unwrap()
    });
    assert_eq!(snapshot.size().unwrap(), 2);
    assert_eq!(query.class_name().unwrap(), "Person");
    // Metadata stays readable from anywhere.
    let path = realm.path().to_path_buf();
    let closed = thread::scope(|s| s.spawn(|| (realm.path().to_path_buf(), realm.is_closed())).join().unwrap());
    assert_eq!(closed, (path, false));
    realm.close().unwrap();
}

#[test]
fn test_wait_for_change_sees_remote_insert() {
    let config = config("threading_wait_for_change");
    let mut realm = Realm::get_instance(&config).unwrap();
    assert_eq!(realm.where_("Person").unwrap().count().unwrap(), 0);

    let writer = config.clone();
    thread::spawn(move || insert_people(&writer, 3)).join().unwrap();

    assert!(realm.wait_for_change().unwrap());
    assert_eq!(realm.where_("Person").unwrap().count().unwrap(), 3);
    realm.close().unwrap();
}

#[test]
fn test_stop_wait_for_change() {
    let config = config("threading_stop_wait");
    let mut keeper = Realm::get_instance(&config).unwrap();
    let (tx, rx) = flume::bounded(1);
    let waiter_config = config.clone();
    let waiter = thread::spawn(move || {
        let mut realm = Realm::get_instance(&waiter_config).unwrap();
        tx.send(realm.stopper()).unwrap();
        let changed = realm.wait_for_change().unwrap();
        realm.close().unwrap();
        changed
    });
    let stopper = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    stopper.stop();
    assert!(!waiter.join().unwrap());
    keeper.close().unwrap();
}

#[test]
fn test_versions_never_go_backwards() {
    let config = config("threading_monotonic");
    let mut realm = Realm::get_instance(&config).unwrap();
    let writer_config = config.clone();
    let writer = thread::spawn(move || {
        for _ in 0..20 {
            insert_people(&writer_config, 1);
        }
    });

    let mut versions = vec![realm.version().unwrap()];
    while realm.where_("Person").unwrap().count().unwrap() < 20 {
        realm.refresh().unwrap();
        versions.push(realm.version().unwrap());
    }
    writer.join().unwrap();
    assert!(versions.windows(2).all(|w| w[0] <= w[1]));
    realm.close().unwrap();
}

#[test]
fn test_looper_refreshes_and_notifies() {
    thread::spawn(|| {
        Looper::prepare().unwrap();
        let config = config("threading_looper_notifies");
        let mut realm = Realm::get_instance(&config).unwrap();
        let all = realm.all_objects("Person").unwrap();
        let inserted = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&inserted);
        all.add_change_listener(move |_, changes| {
            sink.fetch_add(changes.insertions().len(), Ordering::SeqCst);
        })
        .unwrap();

        let writer = config.clone();
        thread::spawn(move || insert_people(&writer, 2)).join().unwrap();

        assert!(Looper::run_until(|| inserted.load(Ordering::SeqCst) == 2, TIMEOUT).unwrap());
        assert_eq!(all.size().unwrap(), 2);
        realm.close().unwrap();
        Looper::release();
    })
    .join()
    .unwrap();
}

#[test]
fn test_async_queries_load_through_looper() {
    thread::spawn(|| {
        Looper::prepare().unwrap();
        let config = config("threading_async_queries");
        let mut realm = Realm::get_instance(&config).unwrap();
        insert_people(&config, 3);

        let results = realm
            .where_("Person")
            .unwrap()
            .greater_than("age", 0i64)
            .unwrap()
            .find_all_async()
            .unwrap();
        let first = realm
            .where_("Person")
            .unwrap()
            .equal_to("name", "p2")
            .unwrap()
            .find_first_async()
            .unwrap();
        assert!(!results.is_loaded().unwrap());
        assert!(!first.is_loaded().unwrap());

        let loaded = Looper::run_until(
            || results.is_loaded().unwrap_or(false) && first.is_loaded().unwrap_or(false),
            TIMEOUT,
        )
        .unwrap();
        assert!(loaded);
        assert_eq!(results.size().unwrap(), 2);
        assert_eq!(first.get_int("age").unwrap(), Some(2));

        // Remote commits re-run async results before the instance advances.
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        results
            .add_change_listener(move |r, _| {
                sink.store(r.size().unwrap_or(0), Ordering::SeqCst);
            })
            .unwrap();
        let writer = config.clone();
        thread::spawn(move || insert_people(&writer, 1)).join().unwrap();
        // The new object has age 0 and does not match; a modification of an
        // existing one does.
        let editor = config.clone();
        thread::spawn(move || {
            let mut realm = Realm::get_instance(&editor).unwrap();
            realm
                .execute_transaction(|r| {
                    let p = r.where_("Person")?.equal_to("name", "p0")?.find_first()?;
                    p.map_or(Ok(()), |p| p.set("age", 10i64))
                })
                .unwrap();
            realm.close().unwrap();
        })
        .join()
        .unwrap();
        assert!(Looper::run_until(|| count.load(Ordering::SeqCst) == 3, TIMEOUT).unwrap());
        realm.close().unwrap();
        Looper::release();
    })
    .join()
    .unwrap();
}

#[test]
fn test_load_forces_async_results() {
    thread::spawn(|| {
        Looper::prepare().unwrap();
        let config = config("threading_async_load");
        let mut realm = Realm::get_instance(&config).unwrap();
        insert_people(&config, 4);
        let results = realm.where_("Person").unwrap().find_all_async().unwrap();
        assert!(results.load().unwrap());
        assert!(results.is_loaded().unwrap());
        assert_eq!(results.size().unwrap(), 4);
        // The worker's answer arrives later and is discarded.
        Looper::poll_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(results.size().unwrap(), 4);
        realm.close().unwrap();
        Looper::release();
    })
    .join()
    .unwrap();
}

#[test]
fn test_async_transaction_callbacks() {
    thread::spawn(|| {
        Looper::prepare().unwrap();
        let config = config("threading_async_tx");
        let mut realm = Realm::get_instance(&config).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        realm
            .execute_transaction_async_with(
                |r| r.create_object("Person").map(drop),
                move || flag.store(true, Ordering::SeqCst),
                |err| panic!("transaction failed: {}", err),
            )
            .unwrap();
        assert!(Looper::run_until(|| done.load(Ordering::SeqCst), TIMEOUT).unwrap());
        // The instance has already moved past the commit.
        assert_eq!(realm.where_("Person").unwrap().count().unwrap(), 1);

        realm
            .execute_transaction_async(|_| Err(Error::illegal_state("boom")))
            .unwrap();
        let raised = Looper::run_until(|| false, TIMEOUT);
        assert!(matches!(raised, Err(Error::Background(_))), "{:?}", raised);
        assert_eq!(realm.where_("Person").unwrap().count().unwrap(), 1);
        realm.close().unwrap();
        Looper::release();
    })
    .join()
    .unwrap();
}

#[test]
fn test_instances_are_per_thread() {
    let config = config("threading_instance_counts");
    let mut realm = Realm::get_instance(&config).unwrap();
    let other = config.clone();
    let (opened, close) = (flume::bounded::<()>(0), flume::bounded::<()>(0));
    let (opened_tx, opened_rx) = opened;
    let (close_tx, close_rx) = close;
    let handle = thread::spawn(move || {
        let mut a = Realm::get_instance(&other).unwrap();
        let mut b = Realm::get_instance(&other).unwrap();
        assert_eq!(Realm::local_instance_count(&other), 2);
        opened_tx.send(()).unwrap();
        close_rx.recv().unwrap();
        a.close().unwrap();
        b.close().unwrap();
    });
    opened_rx.recv().unwrap();
    assert_eq!(Realm::local_instance_count(&config), 1);
    assert_eq!(Realm::global_instance_count(&config), 3);
    close_tx.send(()).unwrap();
    handle.join().unwrap();
    assert_eq!(Realm::global_instance_count(&config), 1);
    realm.close().unwrap();
}
