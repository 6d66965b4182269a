//! Nodestore Bundle: content-tree persistence over the nodestore engine
//!
//! Stores one binary *bundle* per node (type, properties, child entries)
//! under the node's id in an embedded ordered key-value environment.
//! Large binary values go to a separate blob store; namespace URIs and
//! local names are interned through two append-only string indexes.
//!
//! # Architecture
//!
//! - [`BundlePersistenceManager`]: load/store/destroy, references, scans
//! - [`RawBundleStore`]: byte-level strategy ([`KvBundleStore`],
//!   [`MemoryBundleStore`])
//! - [`BundleCodec`]: bundle ↔ bytes ([`BundleBinding`])
//! - [`StringIndex`], [`BlobStore`], [`FileSystem`]: the codec's helpers
//!
//! # Guarantees
//!
//! Each store or destroy is atomic for its node id. A missing node loads
//! as `Ok(None)`; bytes that fail to decode are an
//! [`PersistenceError::ItemStateCorrupt`] error.

pub mod blob_store;
pub mod bundle;
pub mod codec;
pub mod config;
pub mod consistency;
pub mod error;
pub mod fs;
pub mod id;
pub mod manager;
pub mod memory;
pub mod scan;
pub mod store;
pub mod string_index;

pub use blob_store::{BlobStore, FileSystemBlobStore};
pub use bundle::{BinaryValue, ChildNodeEntry, NodeBundle, NodeReferences, PropertyEntry, PropertyType, PropertyValue};
pub use codec::{BundleBinding, BundleCodec, CodecContext};
pub use config::{BlobStoreMode, PersistenceConfig, PmContext};
pub use consistency::{ConsistencyReport, Inconsistency};
pub use error::{CodecError, Fault, FsError, IndexError, Op, PersistenceError, PersistenceResult};
pub use fs::{BasedFileSystem, FileSystem, LocalFileSystem};
pub use id::{Name, NodeId, PropertyId};
pub use manager::BundlePersistenceManager;
pub use memory::MemoryBundleStore;
pub use scan::NodeIdIter;
pub use store::{KvBundleStore, RawBundleStore};
pub use string_index::{FileBasedIndex, MemoryIndex, StringIndex};
