//! Instance configuration.
//!
//! A `Configuration` names the file to open and everything needed to bring
//! its stored schema in line with the declared one. Every instance opened on
//! the same file must use an equivalent configuration.

use crate::migration::Migration;
use crate::realm::Realm;
use crate::record::RealmModel;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessel_core::schema::{ObjectSchema, Schema};
use tessel_core::{Error, Result};
use tessel_storage::shared_file::canonical_path;
use tessel_storage::FileOptions;

/// Length in bytes of an encryption key.
pub const ENCRYPTION_KEY_LEN: usize = 64;

/// Callback that fills a newly created file, run inside the transaction that
/// creates the schema.
pub type InitialData = Arc<dyn Fn(&Realm) -> Result<()> + Send + Sync>;

/// Immutable description of how to open a file.
#[derive(Clone)]
pub struct Configuration {
    path: PathBuf,
    in_memory: bool,
    schema: Vec<ObjectSchema>,
    schema_version: u64,
    migration: Option<Arc<dyn Migration>>,
    delete_if_migration_needed: bool,
    encryption_key: Option<Vec<u8>>,
    initial_data: Option<InitialData>,
    read_only: bool,
    max_async_workers: usize,
}

impl Configuration {
    /// Starts a configuration for the file at `path`.
    pub fn builder(path: impl AsRef<Path>) -> ConfigurationBuilder {
        ConfigurationBuilder::new(path)
    }

    /// Path as given to the builder.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity of the file: the canonical path, or `mem:<name>` for
    /// in-memory files.
    pub fn canonical_path(&self) -> PathBuf {
        canonical_path(&self.path, self.in_memory)
    }

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Declared classes.
    #[inline]
    pub fn schema(&self) -> &[ObjectSchema] {
        &self.schema
    }

    #[inline]
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    pub fn migration(&self) -> Option<&Arc<dyn Migration>> {
        self.migration.as_ref()
    }

    #[inline]
    pub fn delete_if_migration_needed(&self) -> bool {
        self.delete_if_migration_needed
    }

    pub fn encryption_key(&self) -> Option<&[u8]> {
        self.encryption_key.as_deref()
    }

    pub fn initial_data(&self) -> Option<&InitialData> {
        self.initial_data.as_ref()
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Size of the worker pool that runs asynchronous queries and
    /// transactions for this file.
    #[inline]
    pub fn max_async_workers(&self) -> usize {
        self.max_async_workers
    }

    pub(crate) fn file_options(&self) -> FileOptions {
        FileOptions {
            in_memory: self.in_memory,
            key: self.encryption_key.clone(),
            read_only: self.read_only,
        }
    }

    /// Checks that an instance opened with `other` may share the file with
    /// instances opened with `self`. Dynamic instances do not declare a
    /// schema, so the version is only compared when both sides are typed.
    pub(crate) fn check_compatible(&self, other: &Configuration, typed: bool) -> Result<()> {
        let mismatch = |what: &str| {
            Err(Error::illegal_state(format!(
                "'{}' is already open with a different {}",
                self.path.display(),
                what
            )))
        };
        if self.in_memory != other.in_memory {
            return mismatch("storage mode");
        }
        if self.encryption_key != other.encryption_key {
            return mismatch("encryption key");
        }
        if self.read_only != other.read_only {
            return mismatch("read-only setting");
        }
        if typed && self.schema_version != other.schema_version {
            return mismatch("schema version");
        }
        Ok(())
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("path", &self.path)
            .field("in_memory", &self.in_memory)
            .field("classes", &self.schema.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("schema_version", &self.schema_version)
            .field("migration", &self.migration.is_some())
            .field("delete_if_migration_needed", &self.delete_if_migration_needed)
            .field("encrypted", &self.encryption_key.is_some())
            .field("read_only", &self.read_only)
            .field("max_async_workers", &self.max_async_workers)
            .finish()
    }
}

/// Builder for [`Configuration`].
pub struct ConfigurationBuilder {
    config: Configuration,
}

impl ConfigurationBuilder {
    fn new(path: impl AsRef<Path>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);
        Self {
            config: Configuration {
                path: path.as_ref().to_path_buf(),
                in_memory: false,
                schema: Vec::new(),
                schema_version: 0,
                migration: None,
                delete_if_migration_needed: false,
                encryption_key: None,
                initial_data: None,
                read_only: false,
                max_async_workers: workers,
            },
        }
    }

    /// Keeps the file in memory. The path only identifies it; the contents
    /// are gone once the last instance closes.
    pub fn in_memory(mut self) -> Self {
        self.config.in_memory = true;
        self
    }

    /// Declares the classes of the file, replacing earlier declarations.
    pub fn schema(mut self, classes: Vec<ObjectSchema>) -> Self {
        self.config.schema = classes;
        self
    }

    /// Declares one more class.
    pub fn class(mut self, class: ObjectSchema) -> Self {
        self.config.schema.push(class);
        self
    }

    /// Declares the class of a model type.
    pub fn model<T: RealmModel>(self) -> Result<Self> {
        Ok(self.class(T::schema()?))
    }

    pub fn schema_version(mut self, version: u64) -> Self {
        self.config.schema_version = version;
        self
    }

    /// Sets the migration run when the stored schema version is lower than
    /// the declared one.
    pub fn migration(mut self, migration: impl Migration + 'static) -> Self {
        self.config.migration = Some(Arc::new(migration));
        self
    }

    /// Discards the stored contents instead of failing when a migration is
    /// needed and none is configured.
    pub fn delete_if_migration_needed(mut self) -> Self {
        self.config.delete_if_migration_needed = true;
        self
    }

    /// Sets the encryption key; it must be exactly 64 bytes.
    pub fn encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.config.encryption_key = Some(key.into());
        self
    }

    /// Sets a callback that populates a newly created file.
    pub fn initial_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Realm) -> Result<()> + Send + Sync + 'static,
    {
        self.config.initial_data = Some(Arc::new(f));
        self
    }

    pub fn read_only(mut self) -> Self {
        self.config.read_only = true;
        self
    }

    pub fn max_async_workers(mut self, workers: usize) -> Self {
        self.config.max_async_workers = workers;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<Configuration> {
        let config = self.config;
        if config.path.as_os_str().is_empty() {
            return Err(Error::invalid_argument("a path or in-memory name is required"));
        }
        if let Some(key) = &config.encryption_key {
            if key.len() != ENCRYPTION_KEY_LEN {
                return Err(Error::invalid_argument(format!(
                    "encryption key must be {} bytes, got {}",
                    ENCRYPTION_KEY_LEN,
                    key.len()
                )));
            }
        }
        if config.read_only && config.delete_if_migration_needed {
            return Err(Error::invalid_argument(
                "a read-only file cannot be deleted when a migration is needed",
            ));
        }
        if config.read_only && config.initial_data.is_some() {
            return Err(Error::invalid_argument(
                "initial data cannot be written to a read-only file",
            ));
        }
        if config.max_async_workers == 0 {
            return Err(Error::invalid_argument("max_async_workers must be at least 1"));
        }
        Schema::new(config.schema.clone())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_core::schema::ObjectSchemaBuilder;
    use tessel_core::{DataType, ErrorCategory};

    fn person() -> ObjectSchema {
        ObjectSchemaBuilder::new("Person")
            .unwrap()
            .field("name", DataType::String)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Configuration::builder("people.tessel").build().unwrap();
        assert_eq!(config.schema_version(), 0);
        assert!(!config.is_in_memory());
        assert!(config.max_async_workers() >= 1);
        assert!(config.encryption_key().is_none());
    }

    #[test]
    fn test_key_length_is_checked() {
        let err = Configuration::builder("k.tessel")
            .encryption_key(vec![7u8; 32])
            .build()
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Usage);

        let config = Configuration::builder("k.tessel")
            .encryption_key(vec![7u8; ENCRYPTION_KEY_LEN])
            .build()
            .unwrap();
        assert_eq!(config.encryption_key().map(<[u8]>::len), Some(64));
    }

    #[test]
    fn test_duplicate_classes_rejected() {
        let result = Configuration::builder("dup.tessel")
            .class(person())
            .class(person())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_in_memory_identity() {
        let config = Configuration::builder("scratch").in_memory().build().unwrap();
        assert_eq!(config.canonical_path(), PathBuf::from("mem:scratch"));
    }

    #[test]
    fn test_compatibility() {
        let a = Configuration::builder("c").in_memory().schema_version(1).build().unwrap();
        let b = Configuration::builder("c").in_memory().schema_version(2).build().unwrap();
        assert!(a.check_compatible(&b, true).is_err());
        assert!(a.check_compatible(&b, false).is_ok());

        let keyed = Configuration::builder("c")
            .in_memory()
            .schema_version(1)
            .encryption_key(vec![1u8; 64])
            .build()
            .unwrap();
        assert!(a.check_compatible(&keyed, false).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let config = Configuration::builder("secret")
            .encryption_key(vec![42u8; 64])
            .build()
            .unwrap();
        let text = format!("{:?}", config);
        assert!(text.contains("encrypted: true"));
        assert!(!text.contains("42, 42"));
    }
}
