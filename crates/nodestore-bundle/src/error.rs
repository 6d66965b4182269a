//! Error types for the persistence layer
//!
//! Each component has its own error enum. The manager wraps whichever one
//! failed in a [`Fault`] and tags it with the phase and node involved, so
//! callers branch on [`PersistenceError`] variants instead of messages.

use std::fmt;

use nodestore_core::KvError;

use crate::id::NodeId;

/// File system abstraction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("I/O error on '{path}' during {context}: {message}")]
    Io {
        path: String,
        context: &'static str,
        kind: std::io::ErrorKind,
        message: String,
    },

    /// Resource path is malformed or escapes the root
    #[error("invalid resource path '{0}'")]
    InvalidPath(String),

    #[error("no such file '{0}'")]
    NotFound(String),

    #[error("file system is closed")]
    Closed,
}

impl FsError {
    pub fn io(path: &str, context: &'static str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return FsError::NotFound(path.to_string());
        }
        FsError::Io {
            path: path.to_string(),
            context,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// String index failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Backing file is damaged before its tail
    #[error("index file '{resource}' corrupted at offset {offset}: {reason}")]
    Corrupt {
        resource: String,
        offset: u64,
        reason: String,
    },

    #[error("string of {0} bytes is too long for an index entry")]
    StringTooLong(usize),
}

/// Bundle encoding or decoding failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("bad magic {found:02x?}")]
    BadMagic { found: [u8; 2] },

    #[error("unsupported bundle format version {0}")]
    UnsupportedVersion(u8),

    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("truncated image: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("invalid {what} tag {value}")]
    InvalidTag { what: &'static str, value: u8 },

    #[error("{table} index has no entry for code {code}")]
    UnknownCode { table: &'static str, code: u32 },

    #[error("{0} unexpected bytes after the image body")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 at offset {0}")]
    InvalidUtf8(usize),

    #[error("{0} does not fit the bundle format")]
    Oversized(&'static str),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("blob store: {0}")]
    Blob(#[from] FsError),
}

/// Lower-level cause carried by a [`PersistenceError`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fault {
    #[error("engine: {0}")]
    Engine(#[from] KvError),

    #[error("file system: {0}")]
    Fs(#[from] FsError),

    #[error("string index: {0}")]
    Index(#[from] IndexError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// The operation a [`PersistenceError::ItemState`] occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Load,
    Store,
    Destroy,
    LoadReferences,
    StoreReferences,
    DestroyReferences,
    Scan,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Load => "load",
            Op::Store => "store",
            Op::Destroy => "destroy",
            Op::LoadReferences => "load references",
            Op::StoreReferences => "store references",
            Op::DestroyReferences => "destroy references",
            Op::Scan => "scan",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the bundle persistence manager
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    /// Environment, database, file system or index could not be set up
    #[error("failed to initialize {component}: {source}")]
    Init {
        component: &'static str,
        #[source]
        source: Fault,
    },

    /// Stored bytes for a node could not be turned back into a bundle
    #[error("item state of {id} is corrupt: {source}")]
    ItemStateCorrupt {
        id: NodeId,
        #[source]
        source: Fault,
    },

    /// Storage failed while serving an operation
    #[error("{op} failed for {id}: {source}")]
    ItemState {
        op: Op,
        id: NodeId,
        #[source]
        source: Fault,
    },

    /// Pending writes could not be flushed on close
    #[error("failed to shut down: {source}")]
    Shutdown {
        #[source]
        source: Fault,
    },

    #[error("persistence manager is closed")]
    Closed,
}

impl PersistenceError {
    pub(crate) fn init(component: &'static str, source: impl Into<Fault>) -> Self {
        PersistenceError::Init { component, source: source.into() }
    }

    pub(crate) fn corrupt(id: NodeId, source: impl Into<Fault>) -> Self {
        PersistenceError::ItemStateCorrupt { id, source: source.into() }
    }

    /// Engine failures during an operation; `Closed` keeps its own variant.
    pub(crate) fn engine(op: Op, id: NodeId, err: KvError) -> Self {
        match err {
            KvError::Closed => PersistenceError::Closed,
            other => PersistenceError::ItemState { op, id, source: Fault::Engine(other) },
        }
    }

    /// The node this error is about, when there is one.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            PersistenceError::ItemStateCorrupt { id, .. } | PersistenceError::ItemState { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, PersistenceError::ItemStateCorrupt { .. })
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
