//! Out-of-line storage for large binary property values.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::FsError;
use crate::fs::{FileSystem, FsResult};
use crate::id::PropertyId;

/// Store for binary values that do not travel inside their bundle.
///
/// Identifiers are only meaningful to the store that issued them.
pub trait BlobStore: Send + Sync {
    /// Fresh identifier for the `index`-th value of `property`.
    ///
    /// The identifier names no blob that exists yet, so writing under it
    /// never changes the content behind an id a stored bundle still holds.
    fn create_id(&self, property: &PropertyId, index: usize) -> FsResult<String>;

    fn get(&self, id: &str) -> FsResult<Box<dyn Read + Send>>;

    fn put(&self, id: &str, data: &[u8]) -> FsResult<()>;

    /// Remove a blob; `false` if it did not exist.
    fn remove(&self, id: &str) -> FsResult<bool>;

    /// Release the underlying file system. Safe to call more than once.
    fn close(&self);

    /// Whole contents of a blob.
    fn read_all(&self, id: &str) -> FsResult<Vec<u8>> {
        let mut out = Vec::new();
        self.get(id)?
            .read_to_end(&mut out)
            .map_err(|e| FsError::io(id, "read blob", e))?;
        Ok(out)
    }
}

/// Blob store whose identifiers are resource paths of a [`FileSystem`].
///
/// Identifiers spread the owning node's id over three folder levels, then
/// name the escaped property, value index and a generation, e.g.
/// `/01/02/03/01020304-0506-0708-090a-0b0c0d0e0f10/{}data.0.0.bin`. The
/// generation is the lowest one with no file behind it; callers serialize
/// writes per node, so two writers never pick the same one.
pub struct FileSystemBlobStore {
    fs: Arc<dyn FileSystem>,
    closed: AtomicBool,
}

impl FileSystemBlobStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs, closed: AtomicBool::new(false) }
    }

    fn check_open(&self) -> FsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::Closed);
        }
        Ok(())
    }
}

/// Keep `[A-Za-z0-9._-]`, percent-encode every other byte.
fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02x}", byte));
        }
    }
    out
}

impl BlobStore for FileSystemBlobStore {
    fn create_id(&self, property: &PropertyId, index: usize) -> FsResult<String> {
        self.check_open()?;
        let raw = property.parent.raw_bytes();
        let stem = format!(
            "/{:02x}/{:02x}/{:02x}/{}/{}.{}",
            raw[0],
            raw[1],
            raw[2],
            property.parent,
            escape_name(&property.name.to_string()),
            index
        );
        let mut generation = 0u64;
        loop {
            let id = format!("{}.{}.bin", stem, generation);
            if !self.fs.exists(&id)? {
                return Ok(id);
            }
            generation += 1;
        }
    }

    fn get(&self, id: &str) -> FsResult<Box<dyn Read + Send>> {
        self.check_open()?;
        self.fs.open(id)
    }

    fn put(&self, id: &str, data: &[u8]) -> FsResult<()> {
        self.check_open()?;
        self.fs.write(id, data)?;
        debug!(blob = id, size = data.len(), "blob stored");
        Ok(())
    }

    fn remove(&self, id: &str) -> FsResult<bool> {
        self.check_open()?;
        match self.fs.delete_file(id) {
            Ok(()) => {
                debug!(blob = id, "blob removed");
                Ok(true)
            }
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.fs.close() {
            debug!(error = %e, "closing blob file system failed");
        }
    }
}

impl std::fmt::Debug for FileSystemBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemBlobStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
