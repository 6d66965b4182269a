//! Bundle persistence manager
//!
//! Orchestrates one store: raw bytes come from a [`RawBundleStore`], the
//! [`BundleCodec`] turns them into bundles using the two string indexes and
//! the blob store. Nothing below this layer knows about the content tree.
//!
//! # Layout under the home directory
//!
//! - `bdb/` engine environment
//! - `blobs/` blob files, in [`BlobStoreMode::Local`]
//! - `items/` item file system, holding `ns_idx.dat` and `name_idx.dat`
//!   (and the blobs in [`BlobStoreMode::ItemFileSystem`])
//!
//! # Concurrency
//!
//! Loads run in parallel. Stores and destroys of the same node id are
//! serialized by a striped lock so blob cleanup never races a newer image;
//! different ids proceed independently. `close` takes every stripe, so it
//! returns only after in-flight writes finished and were flushed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::blob_store::{BlobStore, FileSystemBlobStore};
use crate::bundle::{NodeBundle, NodeReferences};
use crate::codec::{BundleBinding, BundleCodec, CodecContext};
use crate::config::{BlobStoreMode, PersistenceConfig, PmContext};
use crate::error::{Fault, Op, PersistenceError, PersistenceResult};
use crate::fs::{BasedFileSystem, FileSystem, LocalFileSystem};
use crate::id::NodeId;
use crate::scan::NodeIdIter;
use crate::store::{KvBundleStore, RawBundleStore};
use crate::string_index::{FileBasedIndex, StringIndex};

/// Resource path of the namespace index in the item file system.
pub const NS_INDEX_RESOURCE: &str = "/ns_idx.dat";
/// Resource path of the local-name index in the item file system.
pub const NAME_INDEX_RESOURCE: &str = "/name_idx.dat";

const ENV_DIR: &str = "bdb";
const BLOB_DIR: &str = "blobs";
const ITEMS_FOLDER: &str = "items";

const WRITE_STRIPES: usize = 64;

type IndexSlot = Mutex<Option<Arc<dyn StringIndex>>>;

/// Persistence manager for node bundles.
pub struct BundlePersistenceManager<S: RawBundleStore = KvBundleStore, C: BundleCodec = BundleBinding> {
    store: Arc<S>,
    codec: C,
    context: PmContext,
    item_fs: Arc<dyn FileSystem>,
    blob_store: Arc<dyn BlobStore>,
    ns_index: IndexSlot,
    name_index: IndexSlot,
    write_locks: Box<[Mutex<()>]>,
    closed: AtomicBool,
}

impl BundlePersistenceManager {
    /// Open the store under `context.home_dir`: engine environment in
    /// `bdb/`, both databases, item file system and blob store.
    ///
    /// The string indexes are created on first use.
    pub fn init(context: PmContext, config: PersistenceConfig) -> PersistenceResult<Self> {
        config.validate().map_err(|e| PersistenceError::init("configuration", e))?;
        let env_dir = context.home_dir.join(ENV_DIR);
        let store = KvBundleStore::open(
            &env_dir,
            config.env.clone(),
            &config.bundle_database,
            &config.references_database,
        )
        .map_err(|e| PersistenceError::init("environment", e))?;
        let codec = BundleBinding::new(config.min_blob_size);
        Self::with_store(context, &config, store, codec)
    }
}

impl<S: RawBundleStore, C: BundleCodec> BundlePersistenceManager<S, C> {
    /// Assemble a manager over an already opened raw store and codec.
    pub fn with_store(context: PmContext, config: &PersistenceConfig, store: S, codec: C) -> PersistenceResult<Self> {
        config.validate().map_err(|e| PersistenceError::init("configuration", e))?;

        let item_fs: Arc<dyn FileSystem> = Arc::new(
            BasedFileSystem::new(Arc::clone(&context.file_system), ITEMS_FOLDER)
                .map_err(|e| PersistenceError::init("item file system", e))?,
        );

        let blob_fs: Arc<dyn FileSystem> = match config.blob_mode {
            BlobStoreMode::Local => Arc::new(
                LocalFileSystem::new(context.home_dir.join(BLOB_DIR))
                    .map_err(|e| PersistenceError::init("blob store", e))?,
            ),
            BlobStoreMode::ItemFileSystem => Arc::clone(&item_fs),
        };
        let blob_store: Arc<dyn BlobStore> = Arc::new(FileSystemBlobStore::new(blob_fs));

        info!(
            home = %context.home_dir.display(),
            blob_mode = ?config.blob_mode,
            min_blob_size = config.min_blob_size,
            "bundle persistence manager initialized"
        );
        Ok(Self {
            store: Arc::new(store),
            codec,
            context,
            item_fs,
            blob_store,
            ns_index: Mutex::new(None),
            name_index: Mutex::new(None),
            write_locks: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> PersistenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }

    fn write_lock(&self, id: &NodeId) -> MutexGuard<'_, ()> {
        let stripe = id.raw_bytes().iter().fold(0usize, |acc, b| acc.wrapping_mul(31) ^ *b as usize);
        self.write_locks[stripe % self.write_locks.len()].lock()
    }

    /// Namespace index, created on first call.
    ///
    /// Backed by `ns_idx.dat` when that file exists; otherwise by the
    /// context's namespace registry if one was supplied.
    pub fn namespace_index(&self) -> PersistenceResult<Arc<dyn StringIndex>> {
        self.ensure_open()?;
        let mut slot = self.ns_index.lock();
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }
        let file_exists = self
            .item_fs
            .exists(NS_INDEX_RESOURCE)
            .map_err(|e| PersistenceError::init("namespace index", e))?;
        let index: Arc<dyn StringIndex> = match &self.context.namespace_registry {
            Some(registry) if !file_exists => {
                debug!("namespace index backed by registry");
                Arc::clone(registry)
            }
            _ => Arc::new(FileBasedIndex::new(Arc::clone(&self.item_fs), NS_INDEX_RESOURCE)),
        };
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Local-name index, created on first call.
    pub fn name_index(&self) -> PersistenceResult<Arc<dyn StringIndex>> {
        self.ensure_open()?;
        let mut slot = self.name_index.lock();
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }
        let index: Arc<dyn StringIndex> = Arc::new(FileBasedIndex::new(Arc::clone(&self.item_fs), NAME_INDEX_RESOURCE));
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Run `f` with a codec context over both indexes and the blob store.
    fn with_codec<T>(&self, f: impl FnOnce(&C, &CodecContext<'_>) -> PersistenceResult<T>) -> PersistenceResult<T> {
        let namespaces = self.namespace_index()?;
        let names = self.name_index()?;
        let ctx = CodecContext {
            namespaces: namespaces.as_ref(),
            names: names.as_ref(),
            blobs: self.blob_store.as_ref(),
        };
        f(&self.codec, &ctx)
    }

    /// Bundle stored for `id`; `None` if there is none.
    ///
    /// Bytes that do not decode are reported as
    /// [`PersistenceError::ItemStateCorrupt`], never as absent.
    pub fn load(&self, id: &NodeId) -> PersistenceResult<Option<NodeBundle>> {
        self.ensure_open()?;
        let image = self
            .store
            .load_bundle(id)
            .map_err(|e| PersistenceError::engine(Op::Load, *id, e))?;
        let Some(image) = image else {
            debug!(node = %id, "bundle not found");
            return Ok(None);
        };
        let bundle = self.with_codec(|codec, ctx| {
            codec.decode(&image, *id, ctx).map_err(|e| PersistenceError::corrupt(*id, e))
        })?;
        debug!(node = %id, bytes = image.len(), "bundle loaded");
        Ok(Some(bundle))
    }

    /// Whether a bundle is stored for `id`.
    pub fn exists(&self, id: &NodeId) -> PersistenceResult<bool> {
        self.ensure_open()?;
        let image = self
            .store
            .load_bundle(id)
            .map_err(|e| PersistenceError::engine(Op::Load, *id, e))?;
        Ok(image.is_some())
    }

    /// Write `bundle`, replacing whatever was stored under its id.
    ///
    /// Large binaries are moved to the blob store first, each under a
    /// fresh id, and `bundle` is updated to refer to them. The previous
    /// image keeps its own blobs until the new image is written; those it
    /// no longer shares are removed afterwards. A failed write leaves the
    /// new blobs as orphans and the stored bundle untouched.
    pub fn store(&self, bundle: &mut NodeBundle) -> PersistenceResult<()> {
        self.ensure_open()?;
        let id = bundle.id;
        let _guard = self.write_lock(&id);

        let previous = self
            .store
            .load_bundle(&id)
            .map_err(|e| PersistenceError::engine(Op::Store, id, e))?;
        let image = self.with_codec(|codec, ctx| {
            codec.encode(bundle, ctx).map_err(|e| PersistenceError::corrupt(id, e))
        })?;
        self.store
            .store_bundle(&id, &image)
            .map_err(|e| PersistenceError::engine(Op::Store, id, e))?;
        debug!(node = %id, bytes = image.len(), "bundle stored");

        if let Some(previous) = previous {
            self.remove_stale_blobs(&id, &previous, &bundle.blob_ids());
        }
        Ok(())
    }

    /// Best effort: a blob left behind is an orphan, never a dangling ref.
    fn remove_stale_blobs(&self, id: &NodeId, previous: &[u8], keep: &BTreeSet<String>) {
        let old = match self.with_codec(|codec, ctx| {
            codec.decode(previous, *id, ctx).map_err(|e| PersistenceError::corrupt(*id, e))
        }) {
            Ok(old) => old,
            Err(e) => {
                warn!(node = %id, error = %e, "previous image unreadable, skipping blob cleanup");
                return;
            }
        };
        for blob_id in old.blob_ids().difference(keep) {
            if let Err(e) = self.blob_store.remove(blob_id) {
                warn!(node = %id, blob = %blob_id, error = %e, "failed to remove stale blob");
            }
        }
    }

    /// Remove `bundle` and its blobs. Destroying a bundle that is not
    /// stored is not an error.
    ///
    /// Blobs are taken from the stored image as well as from `bundle`, so a
    /// caller holding an older copy still releases what is on disk.
    pub fn destroy(&self, bundle: &NodeBundle) -> PersistenceResult<()> {
        self.ensure_open()?;
        self.destroy_stored(&bundle.id, bundle.blob_ids())?;
        Ok(())
    }

    /// Remove whatever is stored for `id`, including its blobs.
    ///
    /// Returns `false` if nothing was stored. An image that no longer
    /// decodes is still removed; its blobs are then left behind.
    pub fn destroy_id(&self, id: &NodeId) -> PersistenceResult<bool> {
        self.ensure_open()?;
        self.destroy_stored(id, BTreeSet::new())
    }

    /// Delete the image, then every blob in `blobs` or referenced by it.
    fn destroy_stored(&self, id: &NodeId, mut blobs: BTreeSet<String>) -> PersistenceResult<bool> {
        let _guard = self.write_lock(id);

        let image = self
            .store
            .load_bundle(id)
            .map_err(|e| PersistenceError::engine(Op::Destroy, *id, e))?;
        if let Some(image) = &image {
            let decoded = self.with_codec(|codec, ctx| {
                codec.decode(image, *id, ctx).map_err(|e| PersistenceError::corrupt(*id, e))
            });
            match decoded {
                Ok(stored) => blobs.extend(stored.blob_ids()),
                Err(PersistenceError::ItemStateCorrupt { source, .. }) => {
                    warn!(node = %id, error = %source, "destroying undecodable bundle");
                }
                Err(e) => return Err(e),
            }
        }

        let existed = self
            .store
            .destroy_bundle(id)
            .map_err(|e| PersistenceError::engine(Op::Destroy, *id, e))?;
        for blob_id in &blobs {
            self.blob_store
                .remove(blob_id)
                .map_err(|e| PersistenceError::corrupt(*id, e))?;
        }
        debug!(node = %id, existed, blobs = blobs.len(), "bundle destroyed");
        Ok(existed)
    }

    /// Persist the references to `refs.target`. An empty set removes the
    /// record.
    pub fn store_references(&self, refs: &NodeReferences) -> PersistenceResult<()> {
        self.ensure_open()?;
        let target = refs.target;
        if !refs.has_references() {
            return self.destroy_references(&target);
        }
        let _guard = self.write_lock(&target);
        let image = self.with_codec(|codec, ctx| {
            codec.encode_references(refs, ctx).map_err(|e| PersistenceError::corrupt(target, e))
        })?;
        self.store
            .store_references(&target, &image)
            .map_err(|e| PersistenceError::engine(Op::StoreReferences, target, e))?;
        debug!(node = %target, count = refs.references.len(), "references stored");
        Ok(())
    }

    /// Drop the reference record for `target`. Idempotent.
    pub fn destroy_references(&self, target: &NodeId) -> PersistenceResult<()> {
        self.ensure_open()?;
        let _guard = self.write_lock(target);
        let existed = self
            .store
            .destroy_references(target)
            .map_err(|e| PersistenceError::engine(Op::DestroyReferences, *target, e))?;
        debug!(node = %target, existed, "references destroyed");
        Ok(())
    }

    /// References to `target`; `None` when nothing refers to it.
    pub fn load_references_to(&self, target: &NodeId) -> PersistenceResult<Option<NodeReferences>> {
        self.ensure_open()?;
        let image = self
            .store
            .load_references(target)
            .map_err(|e| PersistenceError::engine(Op::LoadReferences, *target, e))?;
        let Some(image) = image else {
            return Ok(None);
        };
        let refs = self.with_codec(|codec, ctx| {
            codec
                .decode_references(&image, *target, ctx)
                .map_err(|e| PersistenceError::corrupt(*target, e))
        })?;
        Ok(Some(refs))
    }

    pub fn exists_references_to(&self, target: &NodeId) -> PersistenceResult<bool> {
        self.ensure_open()?;
        let image = self
            .store
            .load_references(target)
            .map_err(|e| PersistenceError::engine(Op::LoadReferences, *target, e))?;
        Ok(image.is_some())
    }

    /// Stored node ids in key order, strictly after `after`, at most
    /// `max_count` of them (0 means no limit).
    ///
    /// Ids are fetched lazily. Passing the last id seen as `after` to the
    /// next call continues the scan without gaps or repeats.
    pub fn all_node_ids(&self, after: Option<NodeId>, max_count: usize) -> PersistenceResult<NodeIdIter<S>> {
        self.ensure_open()?;
        Ok(NodeIdIter::new(Arc::clone(&self.store), after, max_count))
    }

    /// Flush everything durably and release the store, blob store and item
    /// file system. Idempotent; every later call fails with
    /// [`PersistenceError::Closed`].
    pub fn close(&self) -> PersistenceResult<()> {
        let _stripes: Vec<MutexGuard<'_, ()>> = self.write_locks.iter().map(|m| m.lock()).collect();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = self.store.sync().and_then(|()| self.store.close());
        self.blob_store.close();
        if let Err(e) = self.item_fs.close() {
            warn!(error = %e, "closing item file system failed");
        }
        flushed.map_err(|e| PersistenceError::Shutdown { source: Fault::Engine(e) })?;
        info!(home = %self.context.home_dir.display(), "bundle persistence manager closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &PmContext {
        &self.context
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The byte-level store, for tooling that bypasses the codec.
    pub fn raw_store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blob_store
    }

    pub fn item_file_system(&self) -> &Arc<dyn FileSystem> {
        &self.item_fs
    }
}

impl<S: RawBundleStore, C: BundleCodec> Drop for BundlePersistenceManager<S, C> {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!(error = %e, "close on drop failed");
            }
        }
    }
}

impl<S: RawBundleStore, C: BundleCodec> std::fmt::Debug for BundlePersistenceManager<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlePersistenceManager")
            .field("home", &self.context.home_dir)
            .field("closed", &self.is_closed())
            .finish()
    }
}
