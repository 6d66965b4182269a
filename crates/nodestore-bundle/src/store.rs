//! Raw byte storage underneath the persistence manager.
//!
//! [`RawBundleStore`] knows node ids and byte images, nothing about their
//! contents. [`KvBundleStore`] keeps them in two databases of one engine
//! environment; [`crate::memory::MemoryBundleStore`] keeps them in RAM.

use std::path::Path;

use tracing::info;

use nodestore_core::{Database, EnvConfig, Environment, KvError, KvResult};

use crate::id::NodeId;

/// Byte-level strategy for bundle and reference records.
///
/// Every call is atomic for its key; a stored image is either fully
/// visible or not at all.
pub trait RawBundleStore: Send + Sync {
    fn load_bundle(&self, id: &NodeId) -> KvResult<Option<Vec<u8>>>;

    /// Replace the image stored for `id`.
    fn store_bundle(&self, id: &NodeId, image: &[u8]) -> KvResult<()>;

    /// Remove the image for `id`; `false` if there was none.
    fn destroy_bundle(&self, id: &NodeId) -> KvResult<bool>;

    /// Up to `limit` bundle ids strictly after `after`, in key order
    /// (`limit` 0 means no limit).
    fn bundle_ids_after(&self, after: Option<&NodeId>, limit: usize) -> KvResult<Vec<NodeId>>;

    fn load_references(&self, target: &NodeId) -> KvResult<Option<Vec<u8>>>;

    fn store_references(&self, target: &NodeId, image: &[u8]) -> KvResult<()>;

    fn destroy_references(&self, target: &NodeId) -> KvResult<bool>;

    /// Make every completed write durable.
    fn sync(&self) -> KvResult<()>;

    /// Flush and release; later calls fail with [`KvError::Closed`].
    fn close(&self) -> KvResult<()>;
}

/// Raw store over the embedded engine.
#[derive(Clone)]
pub struct KvBundleStore {
    env: Environment,
    bundles: Database,
    references: Database,
}

impl KvBundleStore {
    /// Open the environment at `path` and the two named databases in it.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: EnvConfig,
        bundle_database: &str,
        references_database: &str,
    ) -> KvResult<Self> {
        let env = Environment::open(path, config)?;
        Self::with_environment(env, bundle_database, references_database)
    }

    /// Use an already open environment.
    pub fn with_environment(env: Environment, bundle_database: &str, references_database: &str) -> KvResult<Self> {
        let bundles = env.open_database(bundle_database)?;
        let references = env.open_database(references_database)?;
        info!(
            path = %env.path().display(),
            bundles = bundle_database,
            references = references_database,
            "bundle store opened"
        );
        Ok(Self { env, bundles, references })
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn bundle_database(&self) -> &Database {
        &self.bundles
    }

    pub fn references_database(&self) -> &Database {
        &self.references
    }
}

/// Turn engine keys back into node ids; a key of another width is a
/// record this layer never wrote.
fn keys_to_ids(db: &Database, keys: Vec<Vec<u8>>) -> KvResult<Vec<NodeId>> {
    keys.into_iter()
        .map(|key| {
            NodeId::from_slice(&key).ok_or_else(|| KvError::InvalidRecord {
                database: db.name().to_string(),
                reason: format!("key of {} bytes is not a node id", key.len()),
            })
        })
        .collect()
}

impl RawBundleStore for KvBundleStore {
    fn load_bundle(&self, id: &NodeId) -> KvResult<Option<Vec<u8>>> {
        self.bundles.get(id.raw_bytes())
    }

    fn store_bundle(&self, id: &NodeId, image: &[u8]) -> KvResult<()> {
        self.bundles.put(id.raw_bytes(), image)
    }

    fn destroy_bundle(&self, id: &NodeId) -> KvResult<bool> {
        self.bundles.delete(id.raw_bytes())
    }

    fn bundle_ids_after(&self, after: Option<&NodeId>, limit: usize) -> KvResult<Vec<NodeId>> {
        let keys = self
            .bundles
            .keys_after(after.map(|id| id.raw_bytes().as_slice()), limit)?;
        keys_to_ids(&self.bundles, keys)
    }

    fn load_references(&self, target: &NodeId) -> KvResult<Option<Vec<u8>>> {
        self.references.get(target.raw_bytes())
    }

    fn store_references(&self, target: &NodeId, image: &[u8]) -> KvResult<()> {
        self.references.put(target.raw_bytes(), image)
    }

    fn destroy_references(&self, target: &NodeId) -> KvResult<bool> {
        self.references.delete(target.raw_bytes())
    }

    fn sync(&self) -> KvResult<()> {
        self.env.sync()
    }

    fn close(&self) -> KvResult<()> {
        self.env.close()
    }
}

impl std::fmt::Debug for KvBundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvBundleStore")
            .field("path", &self.env.path())
            .field("bundles", &self.bundles.name())
            .field("references", &self.references.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> KvBundleStore {
        KvBundleStore::open(dir.path(), EnvConfig::small(), "bundles", "references").unwrap()
    }

    #[test]
    fn test_bundle_and_reference_keyspaces_are_separate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = NodeId::from_bytes([5; 16]);
        store.store_bundle(&id, b"bundle").unwrap();
        store.store_references(&id, b"refs").unwrap();

        assert_eq!(store.load_bundle(&id).unwrap(), Some(b"bundle".to_vec()));
        assert_eq!(store.load_references(&id).unwrap(), Some(b"refs".to_vec()));
        assert_eq!(store.bundle_ids_after(None, 0).unwrap(), vec![id]);

        assert!(store.destroy_references(&id).unwrap());
        assert_eq!(store.load_bundle(&id).unwrap(), Some(b"bundle".to_vec()));
    }

    #[test]
    fn test_ids_after_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let ids: Vec<NodeId> = (1..=5u8).map(|b| NodeId::from_bytes([b; 16])).collect();
        for id in ids.iter().rev() {
            store.store_bundle(id, b"x").unwrap();
        }
        assert_eq!(store.bundle_ids_after(Some(&ids[1]), 2).unwrap(), vec![ids[2], ids[3]]);
        assert_eq!(store.bundle_ids_after(Some(&ids[4]), 0).unwrap(), Vec::<NodeId>::new());
    }

    #[test]
    fn test_foreign_key_reported_as_invalid_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.bundle_database().put(b"short", b"x").unwrap();
        assert!(matches!(
            store.bundle_ids_after(None, 0),
            Err(KvError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn test_close_then_reopen() {
        let dir = TempDir::new().unwrap();
        let id = NodeId::ROOT;
        {
            let store = open_store(&dir);
            store.store_bundle(&id, b"root").unwrap();
            store.close().unwrap();
            store.close().unwrap();
            assert!(matches!(store.load_bundle(&id), Err(KvError::Closed)));
        }
        let store = open_store(&dir);
        assert_eq!(store.load_bundle(&id).unwrap(), Some(b"root".to_vec()));
    }
}
