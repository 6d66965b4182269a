//! Volatile [`RawBundleStore`] for tests and embedders without a disk.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use nodestore_core::{KvError, KvResult};

use crate::id::NodeId;
use crate::store::RawBundleStore;

#[derive(Default)]
pub struct MemoryBundleStore {
    bundles: RwLock<BTreeMap<NodeId, Vec<u8>>>,
    references: RwLock<BTreeMap<NodeId, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> KvResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }
}

impl RawBundleStore for MemoryBundleStore {
    fn load_bundle(&self, id: &NodeId) -> KvResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.bundles.read().get(id).cloned())
    }

    fn store_bundle(&self, id: &NodeId, image: &[u8]) -> KvResult<()> {
        self.ensure_open()?;
        self.bundles.write().insert(*id, image.to_vec());
        Ok(())
    }

    fn destroy_bundle(&self, id: &NodeId) -> KvResult<bool> {
        self.ensure_open()?;
        Ok(self.bundles.write().remove(id).is_some())
    }

    fn bundle_ids_after(&self, after: Option<&NodeId>, limit: usize) -> KvResult<Vec<NodeId>> {
        self.ensure_open()?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(self
            .bundles
            .read()
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, _)| *id)
            .collect())
    }

    fn load_references(&self, target: &NodeId) -> KvResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.references.read().get(target).cloned())
    }

    fn store_references(&self, target: &NodeId, image: &[u8]) -> KvResult<()> {
        self.ensure_open()?;
        self.references.write().insert(*target, image.to_vec());
        Ok(())
    }

    fn destroy_references(&self, target: &NodeId) -> KvResult<bool> {
        self.ensure_open()?;
        Ok(self.references.write().remove(target).is_some())
    }

    fn sync(&self) -> KvResult<()> {
        self.ensure_open()
    }

    fn close(&self) -> KvResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBundleStore")
            .field("bundles", &self.bundles.read().len())
            .field("references", &self.references.read().len())
            .finish()
    }
}
