//! Error types for engine operations
//!
//! Every failure of the engine is a [`KvError`]. Variants carry the file
//! and offset involved so the persistence layer above can report them
//! without re-deriving context.

use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// File system call failed. `path` is absent when the failure has no
    /// single file (thread spawn, conversions from bare `io::Error`).
    #[error("I/O error{}: {detail} ({kind})", at_path(path))]
    Io {
        path: Option<PathBuf>,
        kind: io::ErrorKind,
        detail: String,
    },

    /// Log segment or snapshot damaged somewhere other than the tail
    #[error("corrupted {} at offset {offset}: {reason}", path.display())]
    Corrupted { path: PathBuf, offset: u64, reason: String },

    #[error("checksum mismatch in {} at offset {offset}: stored 0x{stored:08x}, computed 0x{computed:08x}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        offset: u64,
        stored: u32,
        computed: u32,
    },

    /// Fewer bytes remain than the record header announces
    #[error("truncated record in {} at offset {offset}: need {needed} bytes, have {have}", path.display())]
    Truncated {
        path: PathBuf,
        offset: u64,
        needed: u64,
        have: u64,
    },

    /// Key or value over the configured limit
    #[error("{what} of {len} bytes exceeds limit of {limit}")]
    TooLarge { what: &'static str, len: u64, limit: u64 },

    #[error("bad magic in {} at offset {offset}: {}", path.display(), hex(found))]
    BadMagic { path: PathBuf, offset: u64, found: [u8; 4] },

    /// Named database does not exist and creation was not allowed
    #[error("database '{0}' does not exist")]
    UnknownDatabase(String),

    /// The catalog ran out of database ids
    #[error("too many databases in environment (limit {0})")]
    TooManyDatabases(usize),

    /// Rejected by `EnvConfig::validate`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stored record does not have the shape its owner expects
    #[error("invalid record in database '{database}': {reason}")]
    InvalidRecord { database: String, reason: String },

    #[error("environment is closed")]
    Closed,
}

fn at_path(path: &Option<PathBuf>) -> String {
    path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default()
}

fn hex(bytes: &[u8; 4]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl KvError {
    /// `Io` error for `path`, prefixed with what the engine was doing.
    pub fn io(path: impl Into<PathBuf>, context: &str, err: io::Error) -> Self {
        KvError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            detail: format!("{}: {}", context, err),
        }
    }
}

impl From<io::Error> for KvError {
    fn from(err: io::Error) -> Self {
        let detail = err.to_string();
        KvError::Io { path: None, kind: err.kind(), detail }
    }
}

pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_message_names_both_values() {
        let err = KvError::ChecksumMismatch {
            path: PathBuf::from("/env/log-0000000000000001.nskv"),
            offset: 96,
            stored: 0xdeadbeef,
            computed: 0x0badf00d,
        };
        let text = err.to_string();
        assert!(text.contains("log-0000000000000001.nskv"));
        assert!(text.contains("0xdeadbeef"));
        assert!(text.contains("0x0badf00d"));
    }

    #[test]
    fn test_bare_io_error_has_no_path() {
        let err = KvError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        assert!(matches!(err, KvError::Io { path: None, kind: io::ErrorKind::UnexpectedEof, .. }));
        assert_eq!(err.to_string(), "I/O error: short read (unexpected end of file)");
    }

    #[test]
    fn test_io_helper_keeps_path_and_context() {
        let err = KvError::io(
            "/data/bdb",
            "Failed to create environment directory",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.starts_with("I/O error in /data/bdb: Failed to create environment directory"));
    }

    #[test]
    fn test_bad_magic_renders_hex() {
        let err = KvError::BadMagic { path: PathBuf::from("s"), offset: 0, found: [0x4e, 0x53, 0x00, 0xff] };
        assert!(err.to_string().ends_with("4e5300ff"));
    }
}
