//! Full-store structural check.
//!
//! Walks every stored id through the lazy scan and verifies that each
//! bundle decodes, that each child entry points at a stored bundle and
//! that the child names this node as parent (or shares it).

use tracing::{info, warn};

use crate::codec::BundleCodec;
use crate::error::{PersistenceError, PersistenceResult};
use crate::id::NodeId;
use crate::manager::BundlePersistenceManager;
use crate::store::RawBundleStore;

/// One problem found by [`BundlePersistenceManager::check_consistency`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// Stored bytes do not decode
    Undecodable { id: NodeId, reason: String },
    /// A child entry names a node that is not stored
    MissingChild { parent: NodeId, child: NodeId },
    /// The child is stored but claims a different parent
    ParentMismatch {
        parent: NodeId,
        child: NodeId,
        recorded: Option<NodeId>,
    },
    /// A non-root bundle's parent is not stored
    MissingParent { id: NodeId, parent: NodeId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub bundles_checked: usize,
    pub problems: Vec<Inconsistency>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }
}

impl<S: RawBundleStore, C: BundleCodec> BundlePersistenceManager<S, C> {
    /// Check every stored bundle. Storage failures abort the check;
    /// undecodable bundles are reported and the walk goes on.
    pub fn check_consistency(&self) -> PersistenceResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        for id in self.all_node_ids(None, 0)? {
            let id = id?;
            report.bundles_checked += 1;

            let bundle = match self.load(&id) {
                Ok(Some(bundle)) => bundle,
                // Destroyed since the scan listed it
                Ok(None) => continue,
                Err(PersistenceError::ItemStateCorrupt { source, .. }) => {
                    report.problems.push(Inconsistency::Undecodable { id, reason: source.to_string() });
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(parent) = bundle.parent_id {
                if !self.exists(&parent)? {
                    report.problems.push(Inconsistency::MissingParent { id, parent });
                }
            }

            for child in &bundle.child_nodes {
                match self.load(&child.id) {
                    Ok(Some(stored)) => {
                        let owned = stored.parent_id == Some(id) || stored.shared_set.contains(&id);
                        if !owned {
                            report.problems.push(Inconsistency::ParentMismatch {
                                parent: id,
                                child: child.id,
                                recorded: stored.parent_id,
                            });
                        }
                    }
                    Ok(None) => report.problems.push(Inconsistency::MissingChild { parent: id, child: child.id }),
                    // Reported when the scan reaches the child itself
                    Err(PersistenceError::ItemStateCorrupt { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if report.is_consistent() {
            info!(bundles = report.bundles_checked, "consistency check passed");
        } else {
            warn!(
                bundles = report.bundles_checked,
                problems = report.problems.len(),
                "consistency check found problems"
            );
        }
        Ok(report)
    }
}
