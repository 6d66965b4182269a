//! Hierarchical file abstraction shared by the blob store and the indexes.
//!
//! Resource paths are absolute and `/`-separated (`/items/ns_idx.dat`).
//! [`LocalFileSystem`] maps them below a root directory; [`BasedFileSystem`]
//! prefixes them with a folder of another file system.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use nodestore_core::{durable_sync, sync_directory};

use crate::error::FsError;

pub type FsResult<T> = Result<T, FsError>;

/// Separator of resource paths.
pub const SEPARATOR: char = '/';

/// Operations the persistence layer needs from a file system.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &str) -> FsResult<bool>;

    fn is_file(&self, path: &str) -> FsResult<bool>;

    /// Create a folder and any missing parents.
    fn create_folder(&self, path: &str) -> FsResult<()>;

    /// Whole contents of a file.
    fn read(&self, path: &str) -> FsResult<Vec<u8>>;

    /// Stream over a file's contents.
    fn open(&self, path: &str) -> FsResult<Box<dyn Read + Send>>;

    /// Replace a file's contents atomically, creating parent folders.
    fn write(&self, path: &str, data: &[u8]) -> FsResult<()>;

    /// Append to a file and make the new bytes durable before returning.
    fn append(&self, path: &str, data: &[u8]) -> FsResult<()>;

    /// Cut a file back to `len` bytes.
    fn truncate(&self, path: &str, len: u64) -> FsResult<()>;

    fn length(&self, path: &str) -> FsResult<u64>;

    fn delete_file(&self, path: &str) -> FsResult<()>;

    /// Names of the files directly inside a folder, sorted.
    fn list_files(&self, folder: &str) -> FsResult<Vec<String>>;

    /// Release the file system; later calls fail with [`FsError::Closed`].
    fn close(&self) -> FsResult<()>;
}

/// Split a resource path into its segments, rejecting anything that could
/// leave the root.
pub fn path_segments(path: &str) -> FsResult<Vec<&str>> {
    let rest = path
        .strip_prefix(SEPARATOR)
        .ok_or_else(|| FsError::InvalidPath(path.to_string()))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let rest = rest.strip_suffix(SEPARATOR).unwrap_or(rest);
    let mut segments = Vec::new();
    for segment in rest.split(SEPARATOR) {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// File system over a local directory.
pub struct LocalFileSystem {
    root: PathBuf,
    closed: AtomicBool,
}

impl LocalFileSystem {
    /// Open a file system rooted at `root`, creating the directory.
    pub fn new<P: AsRef<Path>>(root: P) -> FsResult<Self> {
        let root = root.as_ref().to_path_buf();
        let root_display = root.display().to_string();
        fs::create_dir_all(&root).map_err(|e| FsError::io(&root_display, "create root", e))?;
        debug!(root = %root_display, "local file system opened");
        Ok(Self { root, closed: AtomicBool::new(false) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> FsResult<PathBuf> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::Closed);
        }
        let mut resolved = self.root.clone();
        for segment in path_segments(path)? {
            resolved.push(segment);
        }
        Ok(resolved)
    }

    /// Create the missing folders above `file` and sync each new entry
    /// into the folder holding it.
    fn ensure_parent(&self, path: &str, file: &Path) -> FsResult<()> {
        let Some(parent) = file.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        let mut cursor = parent;
        while !cursor.exists() {
            missing.push(cursor);
            match cursor.parent() {
                Some(up) => cursor = up,
                None => break,
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(parent).map_err(|e| FsError::io(path, "create parent", e))?;
        for created in missing.iter().rev() {
            if let Some(holder) = created.parent() {
                sync_directory(holder).map_err(|e| FsError::io(path, "sync folder", e))?;
            }
        }
        Ok(())
    }
}

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &str) -> FsResult<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn is_file(&self, path: &str) -> FsResult<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn create_folder(&self, path: &str) -> FsResult<()> {
        let dir = self.resolve(path)?;
        fs::create_dir_all(&dir).map_err(|e| FsError::io(path, "create folder", e))
    }

    fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        let file = self.resolve(path)?;
        fs::read(&file).map_err(|e| FsError::io(path, "read", e))
    }

    fn open(&self, path: &str) -> FsResult<Box<dyn Read + Send>> {
        let file = self.resolve(path)?;
        let handle = File::open(&file).map_err(|e| FsError::io(path, "open", e))?;
        Ok(Box::new(handle))
    }

    fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let target = self.resolve(path)?;
        self.ensure_parent(path, &target)?;
        let file_name = target
            .file_name()
            .ok_or_else(|| FsError::InvalidPath(path.to_string()))?
            .to_string_lossy()
            .into_owned();
        let tmp = target.with_file_name(format!(".{}.tmp", file_name));

        let mut file = File::create(&tmp).map_err(|e| FsError::io(path, "create temp", e))?;
        file.write_all(data).map_err(|e| FsError::io(path, "write", e))?;
        durable_sync(&file).map_err(|e| FsError::io(path, "sync", e))?;
        drop(file);
        fs::rename(&tmp, &target).map_err(|e| FsError::io(path, "rename", e))?;
        if let Some(parent) = target.parent() {
            sync_directory(parent).map_err(|e| FsError::io(path, "sync folder", e))?;
        }
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let target = self.resolve(path)?;
        self.ensure_parent(path, &target)?;
        let created = !target.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .map_err(|e| FsError::io(path, "open for append", e))?;
        file.write_all(data).map_err(|e| FsError::io(path, "append", e))?;
        durable_sync(&file).map_err(|e| FsError::io(path, "sync", e))?;
        if created {
            if let Some(parent) = target.parent() {
                sync_directory(parent).map_err(|e| FsError::io(path, "sync folder", e))?;
            }
        }
        Ok(())
    }

    fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        let target = self.resolve(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&target)
            .map_err(|e| FsError::io(path, "open for truncate", e))?;
        file.set_len(len).map_err(|e| FsError::io(path, "truncate", e))?;
        durable_sync(&file).map_err(|e| FsError::io(path, "sync", e))
    }

    fn length(&self, path: &str) -> FsResult<u64> {
        let target = self.resolve(path)?;
        let meta = fs::metadata(&target).map_err(|e| FsError::io(path, "stat", e))?;
        Ok(meta.len())
    }

    fn delete_file(&self, path: &str) -> FsResult<()> {
        let target = self.resolve(path)?;
        fs::remove_file(&target).map_err(|e| FsError::io(path, "delete", e))
    }

    fn list_files(&self, folder: &str) -> FsResult<Vec<String>> {
        let dir = self.resolve(folder)?;
        let mut names = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| FsError::io(folder, "list", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(folder, "list", e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn close(&self) -> FsResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(root = %self.root.display(), "local file system closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileSystem")
            .field("root", &self.root)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// View of another file system below a base folder.
///
/// Closing the view does not close the file system it is based on.
pub struct BasedFileSystem {
    inner: Arc<dyn FileSystem>,
    base: String,
    closed: AtomicBool,
}

impl BasedFileSystem {
    /// `base` is a folder of `inner`, with or without the leading `/`.
    pub fn new(inner: Arc<dyn FileSystem>, base: &str) -> FsResult<Self> {
        let base = if base.starts_with(SEPARATOR) {
            base.trim_end_matches(SEPARATOR).to_string()
        } else {
            format!("{}{}", SEPARATOR, base.trim_end_matches(SEPARATOR))
        };
        path_segments(&base)?;
        inner.create_folder(&base)?;
        Ok(Self { inner, base, closed: AtomicBool::new(false) })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn map(&self, path: &str) -> FsResult<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::Closed);
        }
        if path_segments(path)?.is_empty() {
            return Ok(self.base.clone());
        }
        Ok(format!("{}{}", self.base, path))
    }
}

impl FileSystem for BasedFileSystem {
    fn exists(&self, path: &str) -> FsResult<bool> {
        self.inner.exists(&self.map(path)?)
    }

    fn is_file(&self, path: &str) -> FsResult<bool> {
        self.inner.is_file(&self.map(path)?)
    }

    fn create_folder(&self, path: &str) -> FsResult<()> {
        self.inner.create_folder(&self.map(path)?)
    }

    fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        self.inner.read(&self.map(path)?).map_err(|e| unmap_not_found(e, path))
    }

    fn open(&self, path: &str) -> FsResult<Box<dyn Read + Send>> {
        self.inner.open(&self.map(path)?).map_err(|e| unmap_not_found(e, path))
    }

    fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.inner.write(&self.map(path)?, data)
    }

    fn append(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.inner.append(&self.map(path)?, data)
    }

    fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        self.inner.truncate(&self.map(path)?, len)
    }

    fn length(&self, path: &str) -> FsResult<u64> {
        self.inner.length(&self.map(path)?).map_err(|e| unmap_not_found(e, path))
    }

    fn delete_file(&self, path: &str) -> FsResult<()> {
        self.inner.delete_file(&self.map(path)?).map_err(|e| unmap_not_found(e, path))
    }

    fn list_files(&self, folder: &str) -> FsResult<Vec<String>> {
        self.inner.list_files(&self.map(folder)?)
    }

    fn close(&self) -> FsResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Report missing files by the caller's path, not the inner one.
fn unmap_not_found(err: FsError, path: &str) -> FsError {
    match err {
        FsError::NotFound(_) => FsError::NotFound(path.to_string()),
        other => other,
    }
}

impl std::fmt::Debug for BasedFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasedFileSystem").field("base", &self.base).finish()
    }
}
