//! On-disk files: persistence, migrations, encryption and file management.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tessel_core::schema::{ObjectSchema, ObjectSchemaBuilder, Property};
use tessel_core::DataType;
use tessel_database::{
    Configuration, ConfigurationBuilder, Error, MigrationContext, Realm, Result, Value, ENCRYPTION_KEY_LEN,
};

fn person_v0() -> ObjectSchema {
    ObjectSchemaBuilder::new("Person")
        .unwrap()
        .field("name", DataType::String)
        .unwrap()
        .build()
        .unwrap()
}

fn person_v1() -> ObjectSchema {
    ObjectSchemaBuilder::new("Person")
        .unwrap()
        .field("name", DataType::String)
        .unwrap()
        .property(Property::scalar("email", DataType::String).nullable(true))
        .unwrap()
        .build()
        .unwrap()
}

fn builder(path: &Path) -> ConfigurationBuilder {
    Configuration::builder(path).class(person_v0())
}

fn seed(config: &Configuration, names: &[&str]) {
    let mut realm = Realm::get_instance(config).unwrap();
    realm
        .execute_transaction(|r| {
            for name in names {
                r.create_object("Person")?.set("name", *name)?;
            }
            Ok(())
        })
        .unwrap();
    realm.close().unwrap();
}

fn count(config: &Configuration) -> usize {
    let mut realm = Realm::get_instance(config).unwrap();
    let n = realm.all_objects("Person").unwrap().size().unwrap();
    realm.close().unwrap();
    n
}

#[test]
fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = builder(&dir.path().join("people.tessel")).build().unwrap();
    seed(&config, &["Ann", "Bob"]);
    assert_eq!(Realm::global_instance_count(&config), 0);
    assert_eq!(count(&config), 2);
}

#[test]
fn test_version_bump_runs_migration() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("migrate.tessel");
    seed(&builder(&path).build().unwrap(), &["Ann", "Bob"]);

    let unmigrated = Configuration::builder(&path).class(person_v1()).schema_version(1).build().unwrap();
    assert!(matches!(
        Realm::get_instance(&unmigrated),
        Err(Error::MigrationRequired { stored: Some(0), required: 1, .. })
    ));

    let migrated = Configuration::builder(&path)
        .class(person_v1())
        .schema_version(1)
        .migration(|ctx: &mut MigrationContext<'_>, old: u64, new: u64| -> Result<()> {
            assert_eq!((old, new), (0, 1));
            ctx.add_field("Person", Property::scalar("email", DataType::String).nullable(true))?;
            ctx.enumerate("Person", |person| {
                let name = person.get("name")?;
                let email = format!("{}@example.com", name.as_str().unwrap_or("nobody").to_lowercase());
                person.set("email", email)
            })
        })
        .build()
        .unwrap();
    let mut realm = Realm::get_instance(&migrated).unwrap();
    let ann = realm
        .where_("Person")
        .unwrap()
        .equal_to("name", "Ann")
        .unwrap()
        .find_first()
        .unwrap()
        .unwrap();
    assert_eq!(ann.get_string("email").unwrap().as_deref(), Some("ann@example.com"));
    realm.close().unwrap();
}

#[test]
fn test_failed_migration_leaves_file_alone() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("failed.tessel");
    seed(&builder(&path).build().unwrap(), &["Ann"]);

    // Returns without adding the declared field.
    let incomplete = Configuration::builder(&path)
        .class(person_v1())
        .schema_version(1)
        .migration(|_: &mut MigrationContext<'_>, _: u64, _: u64| -> Result<()> { Ok(()) })
        .build()
        .unwrap();
    assert!(Realm::get_instance(&incomplete).is_err());
    assert_eq!(count(&builder(&path).build().unwrap()), 1);
}

#[test]
fn test_delete_if_migration_needed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reset.tessel");
    seed(&builder(&path).build().unwrap(), &["Ann"]);

    let reset = Configuration::builder(&path)
        .class(person_v1())
        .schema_version(1)
        .delete_if_migration_needed()
        .build()
        .unwrap();
    assert_eq!(count(&reset), 0);
}

#[test]
fn test_initial_data_runs_once() {
    let dir = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let config = builder(&dir.path().join("seeded.tessel"))
        .initial_data(move |realm| {
            counter.fetch_add(1, Ordering::SeqCst);
            realm.create_object("Person")?.set("name", "Root")
        })
        .build()
        .unwrap();
    assert_eq!(count(&config), 1);
    assert_eq!(count(&config), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_encryption_key_must_match() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("secret.tessel");
    let key = vec![7u8; ENCRYPTION_KEY_LEN];
    let encrypted = builder(&path).encryption_key(key.clone()).build().unwrap();
    seed(&encrypted, &["Ann"]);

    let wrong = builder(&path).encryption_key(vec![8u8; ENCRYPTION_KEY_LEN]).build().unwrap();
    assert!(matches!(Realm::get_instance(&wrong), Err(Error::Encryption { .. })));
    let missing = builder(&path).build().unwrap();
    assert!(matches!(Realm::get_instance(&missing), Err(Error::Encryption { .. })));
    assert_eq!(count(&encrypted), 1);

    assert!(builder(&path).encryption_key(vec![1u8; 16]).build().is_err());
}

#[test]
fn test_dynamic_instance_edits_schema() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dynamic.tessel");
    seed(&builder(&path).build().unwrap(), &["Ann"]);

    let config = Configuration::builder(&path).build().unwrap();
    let mut realm = Realm::get_dynamic_instance(&config).unwrap();
    assert!(realm.is_dynamic());
    realm.begin_transaction().unwrap();
    realm
        .update_schema(|ctx| {
            let tag = ObjectSchemaBuilder::new("Tag")?.field("label", DataType::String)?.build()?;
            ctx.create_class(tag)?;
            ctx.add_field("Person", Property::scalar("nick", DataType::String).nullable(true))
        })
        .unwrap();
    realm.create_object("Tag").unwrap().set("label", "new").unwrap();
    realm.commit_transaction().unwrap();

    let schema = realm.schema().unwrap();
    assert!(schema.find("Tag").is_some());
    let ann = realm.all_objects("Person").unwrap().first().unwrap().unwrap();
    assert_eq!(ann.get("nick").unwrap(), Value::Null);
    realm.close().unwrap();

    let mut typed = Realm::get_instance(&builder(&dir.path().join("typed.tessel")).build().unwrap()).unwrap();
    assert!(matches!(typed.update_schema(|_| Ok(())), Err(Error::UnsupportedOperation { .. })));
    typed.close().unwrap();
}

#[test]
fn test_file_management_needs_closed_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("managed.tessel");
    let config = builder(&path).build().unwrap();
    seed(&config, &["Ann", "Bob", "Cid"]);

    let mut realm = Realm::get_instance(&config).unwrap();
    assert_eq!(Realm::local_instance_count(&config), 1);
    assert!(matches!(Realm::delete_realm(&config), Err(Error::IllegalState { .. })));
    assert!(!Realm::compact_realm(&config).unwrap());
    assert!(matches!(Realm::migrate_realm(&config), Err(Error::IllegalState { .. })));

    let copy_path = dir.path().join("copy.tessel");
    realm.write_copy_to(&copy_path, None).unwrap();
    assert!(realm.write_copy_to(&copy_path, None).is_err());
    realm.close().unwrap();

    assert!(Realm::compact_realm(&config).unwrap());
    assert_eq!(count(&config), 3);
    assert_eq!(count(&builder(&copy_path).build().unwrap()), 3);

    assert!(Realm::delete_realm(&config).unwrap());
    assert!(!path.exists());
    assert_eq!(count(&config), 0);
}

#[test]
fn test_closed_handles_do_not_keep_file_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lingering.tessel");
    let config = builder(&path).build().unwrap();
    seed(&config, &["Ann", "Bob"]);

    let mut realm = Realm::get_instance(&config).unwrap();
    let people = realm.all_objects("Person").unwrap();
    let ann = people.first().unwrap().unwrap();
    realm.close().unwrap();
    assert_eq!(Realm::global_instance_count(&config), 0);

    // The handle, results and object are still alive but closed.
    assert!(realm.is_closed());
    assert!(!ann.is_valid().unwrap());
    assert!(Realm::compact_realm(&config).unwrap());
    assert_eq!(count(&config), 2);
    assert!(Realm::delete_realm(&config).unwrap());
    assert!(!path.exists());
    assert_eq!(count(&config), 0);
    drop((people, ann));
}

#[test]
fn test_migrate_realm_on_closed_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("offline.tessel");
    seed(&builder(&path).build().unwrap(), &["Ann"]);

    let config = Configuration::builder(&path)
        .class(person_v1())
        .schema_version(2)
        .migration(|ctx: &mut MigrationContext<'_>, _: u64, _: u64| -> Result<()> {
            ctx.add_field("Person", Property::scalar("email", DataType::String).nullable(true))
        })
        .build()
        .unwrap();
    Realm::migrate_realm(&config).unwrap();
    assert_eq!(Realm::global_instance_count(&config), 0);

    // Reopening needs no migration any more.
    let plain = Configuration::builder(&path).class(person_v1()).schema_version(2).build().unwrap();
    assert_eq!(count(&plain), 1);
}
