//! Lazy, resumable iteration over stored node ids.
//!
//! The iterator pulls ids from the raw store in batches, each batch
//! starting strictly after the last id handed out. Ids stored behind the
//! cursor during the scan are not seen; ids stored ahead of it are, as
//! long as the store has not already come up short on a batch.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Op, PersistenceError, PersistenceResult};
use crate::id::{NodeId, NODE_ID_LEN};
use crate::store::RawBundleStore;

/// Ids fetched per round trip to the store.
pub const SCAN_BATCH_SIZE: usize = 256;

/// Iterator returned by
/// [`BundlePersistenceManager::all_node_ids`](crate::BundlePersistenceManager::all_node_ids).
///
/// A failed batch yields one `Err` and ends the iteration. The error's
/// node id is the exclusive lower bound of that batch (all zeros at the
/// start), so the caller can resume from it.
pub struct NodeIdIter<S: RawBundleStore> {
    store: Arc<S>,
    after: Option<NodeId>,
    /// `None` means unlimited
    remaining: Option<usize>,
    buffer: VecDeque<NodeId>,
    exhausted: bool,
}

impl<S: RawBundleStore> NodeIdIter<S> {
    pub(crate) fn new(store: Arc<S>, after: Option<NodeId>, max_count: usize) -> Self {
        Self {
            store,
            after,
            remaining: (max_count > 0).then_some(max_count),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Last id returned, i.e. where a follow-up scan resumes.
    pub fn position(&self) -> Option<NodeId> {
        self.after
    }

    fn fill(&mut self) -> PersistenceResult<()> {
        let want = match self.remaining {
            Some(left) => left.min(SCAN_BATCH_SIZE),
            None => SCAN_BATCH_SIZE,
        };
        let batch = self
            .store
            .bundle_ids_after(self.after.as_ref(), want)
            .map_err(|e| {
                let bound = self.after.unwrap_or(NodeId::from_bytes([0; NODE_ID_LEN]));
                PersistenceError::engine(Op::Scan, bound, e)
            })?;
        if batch.len() < want {
            self.exhausted = true;
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl<S: RawBundleStore> Iterator for NodeIdIter<S> {
    type Item = PersistenceResult<NodeId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let id = self.buffer.pop_front()?;
        self.after = Some(id);
        if let Some(left) = self.remaining.as_mut() {
            *left -= 1;
        }
        Some(Ok(id))
    }
}

impl<S: RawBundleStore> std::fmt::Debug for NodeIdIter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdIter")
            .field("after", &self.after)
            .field("remaining", &self.remaining)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
