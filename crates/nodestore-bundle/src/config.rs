//! Persistence manager configuration and init-time context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nodestore_core::{EnvConfig, KvError, KvResult};

use crate::fs::{FileSystem, FsResult, LocalFileSystem};
use crate::id::NODE_ID_LEN;
use crate::string_index::StringIndex;

/// Where blob values live. Fixed for the life of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStoreMode {
    /// Own local directory `<home>/blobs`
    Local,
    /// The shared item file system; blob ids are its resource paths
    ItemFileSystem,
}

impl BlobStoreMode {
    /// Legacy setting: a blob file system block size of 0 selected the
    /// local blob directory.
    pub fn from_block_size(block_size: u32) -> Self {
        if block_size == 0 {
            BlobStoreMode::Local
        } else {
            BlobStoreMode::ItemFileSystem
        }
    }
}

/// Persistence manager configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub blob_mode: BlobStoreMode,
    /// Binary values at least this long go to the blob store
    pub min_blob_size: usize,
    pub bundle_database: String,
    pub references_database: String,
    /// Engine settings for `<home>/bdb`
    pub env: EnvConfig,
}

impl PersistenceConfig {
    /// Validate before anything is opened.
    pub fn validate(&self) -> KvResult<()> {
        let fail = |msg: &str| -> KvResult<()> { Err(KvError::InvalidConfig(msg.to_string())) };

        self.env.validate()?;
        if self.env.max_key_size < NODE_ID_LEN {
            return fail("max_key_size must hold a node id");
        }
        if self.min_blob_size == 0 {
            return fail("min_blob_size must be > 0");
        }
        if self.min_blob_size > self.env.max_value_size / 2 {
            return fail("min_blob_size must be <= half of max_value_size");
        }
        if self.bundle_database.is_empty() || self.references_database.is_empty() {
            return fail("database names must not be empty");
        }
        if self.bundle_database == self.references_database {
            return fail("bundle and references databases must differ");
        }
        Ok(())
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            blob_mode: BlobStoreMode::Local,
            min_blob_size: 16 * 1024,
            bundle_database: "bundles".to_string(),
            references_database: "references".to_string(),
            env: EnvConfig::default(),
        }
    }
}

/// What the runtime hands the manager at init.
#[derive(Clone)]
pub struct PmContext {
    pub home_dir: PathBuf,
    /// Shared file system the item file system is based on
    pub file_system: Arc<dyn FileSystem>,
    /// Fallback for the namespace index when no index file exists yet
    pub namespace_registry: Option<Arc<dyn StringIndex>>,
}

impl PmContext {
    /// Context whose file system is a local one rooted at `home_dir`.
    pub fn new<P: AsRef<Path>>(home_dir: P) -> FsResult<Self> {
        let home_dir = home_dir.as_ref().to_path_buf();
        let file_system: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(&home_dir)?);
        Ok(Self { home_dir, file_system, namespace_registry: None })
    }

    pub fn with_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = file_system;
        self
    }

    pub fn with_namespace_registry(mut self, registry: Arc<dyn StringIndex>) -> Self {
        self.namespace_registry = Some(registry);
        self
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }
}

impl std::fmt::Debug for PmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmContext")
            .field("home_dir", &self.home_dir)
            .field("namespace_registry", &self.namespace_registry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PersistenceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_block_size_selects_mode() {
        assert_eq!(BlobStoreMode::from_block_size(0), BlobStoreMode::Local);
        assert_eq!(BlobStoreMode::from_block_size(4096), BlobStoreMode::ItemFileSystem);
    }

    #[test]
    fn test_rejects_shared_database_name() {
        let mut config = PersistenceConfig::default();
        config.references_database = config.bundle_database.clone();
        assert!(matches!(config.validate(), Err(KvError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_blob_threshold_above_value_limit() {
        let mut config = PersistenceConfig::default();
        config.min_blob_size = config.env.max_value_size;
        assert!(config.validate().is_err());
        config.min_blob_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_checked_too() {
        let mut config = PersistenceConfig::default();
        config.env.max_key_size = 0;
        assert!(config.validate().is_err());
    }
}
