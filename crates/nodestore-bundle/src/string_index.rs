//! Append-only string dictionaries for namespace URIs and local names.
//!
//! Codes are handed out in insertion order starting at zero and are never
//! reused. [`FileBasedIndex`] makes a new entry durable before its code is
//! returned, so no bundle can embed a code the index might forget.
//!
//! # Index file format
//!
//! A sequence of records, the code being the record's ordinal:
//!
//! ```text
//! ┌──────────┬─────────────────┬────────────────────────────┐
//! │ len: u16 │ utf-8 bytes     │ crc32c(len ‖ bytes): u32   │
//! └──────────┴─────────────────┴────────────────────────────┘
//! ```
//!
//! All integers little-endian. A last record that runs past the end of the
//! file, with no intact record after its start, is a torn append and is cut
//! off on load. Any other damage fails the load: the codes after it are
//! already embedded in bundles and must not be handed out again.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FsError, IndexError};
use crate::fs::FileSystem;

/// Per-record overhead: length prefix plus checksum.
const RECORD_OVERHEAD: usize = 2 + 4;

/// Bidirectional string ↔ code dictionary.
pub trait StringIndex: Send + Sync {
    /// Code for `s`, inserting it if it is new.
    fn string_to_code(&self, s: &str) -> Result<u32, IndexError>;

    /// String for `code`; `None` if the code was never issued.
    fn code_to_string(&self, code: u32) -> Result<Option<String>, IndexError>;
}

#[derive(Default)]
struct Entries {
    by_string: HashMap<String, u32>,
    by_code: Vec<String>,
    /// Length of the intact part of the backing file
    file_len: u64,
}

impl Entries {
    fn insert(&mut self, s: String) -> u32 {
        let code = self.by_code.len() as u32;
        self.by_string.insert(s.clone(), code);
        self.by_code.push(s);
        code
    }
}

/// Dictionary persisted in one file of a [`FileSystem`].
pub struct FileBasedIndex {
    fs: Arc<dyn FileSystem>,
    resource: String,
    /// `None` until the first call loads the file
    entries: Mutex<Option<Entries>>,
}

impl FileBasedIndex {
    pub fn new(fs: Arc<dyn FileSystem>, resource: impl Into<String>) -> Self {
        Self { fs, resource: resource.into(), entries: Mutex::new(None) }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Number of issued codes.
    pub fn len(&self) -> Result<usize, IndexError> {
        let mut guard = self.entries.lock();
        Ok(self.loaded(&mut guard)?.by_code.len())
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    fn loaded<'a>(&self, slot: &'a mut Option<Entries>) -> Result<&'a mut Entries, IndexError> {
        if slot.is_none() {
            *slot = Some(self.load()?);
        }
        Ok(slot.get_or_insert_with(Entries::default))
    }

    fn load(&self) -> Result<Entries, IndexError> {
        let data = match self.fs.read(&self.resource) {
            Ok(data) => data,
            Err(FsError::NotFound(_)) => return Ok(Entries::default()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Entries::default();
        let mut offset = 0usize;
        while offset < data.len() {
            match parse_record(&data, offset) {
                Ok((s, next)) => {
                    entries.insert(s);
                    offset = next;
                }
                Err(reason) => {
                    if is_torn_tail(&data, offset) {
                        warn!(
                            resource = %self.resource,
                            offset,
                            reason,
                            "truncating torn index tail"
                        );
                        self.fs.truncate(&self.resource, offset as u64)?;
                        break;
                    }
                    return Err(IndexError::Corrupt {
                        resource: self.resource.clone(),
                        offset: offset as u64,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        entries.file_len = offset.min(data.len()) as u64;
        debug!(resource = %self.resource, entries = entries.by_code.len(), "string index loaded");
        Ok(entries)
    }
}

/// Whether the record failing to parse at `offset` can be a torn append.
///
/// A torn append is shorter than its declared length and is the last thing
/// in the file. A complete record with bad contents, or one followed by an
/// intact record, means the damage is elsewhere (possibly in the length).
fn is_torn_tail(data: &[u8], offset: usize) -> bool {
    let Some(len_bytes) = data.get(offset..offset + 2) else {
        return true;
    };
    let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    if offset + RECORD_OVERHEAD + len <= data.len() {
        return false;
    }
    !(offset + 1..data.len()).any(|at| parse_record(data, at).is_ok())
}

fn parse_record(data: &[u8], offset: usize) -> Result<(String, usize), &'static str> {
    let len_bytes = data.get(offset..offset + 2).ok_or("truncated length")?;
    let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let body_end = offset + 2 + len;
    let record_end = body_end + 4;
    if record_end > data.len() {
        return Err("truncated record");
    }
    let stored = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    if crc32c::crc32c(&data[offset..body_end]) != stored {
        return Err("checksum mismatch");
    }
    let s = std::str::from_utf8(&data[offset + 2..body_end]).map_err(|_| "invalid utf-8")?;
    Ok((s.to_string(), record_end))
}

fn encode_record(s: &str) -> Result<Vec<u8>, IndexError> {
    let len = u16::try_from(s.len()).map_err(|_| IndexError::StringTooLong(s.len()))?;
    let mut record = Vec::with_capacity(s.len() + RECORD_OVERHEAD);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(s.as_bytes());
    let crc = crc32c::crc32c(&record);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

impl StringIndex for FileBasedIndex {
    fn string_to_code(&self, s: &str) -> Result<u32, IndexError> {
        let mut guard = self.entries.lock();
        let entries = self.loaded(&mut guard)?;
        if let Some(code) = entries.by_string.get(s) {
            return Ok(*code);
        }
        // Durable before the code escapes; the lock keeps codes gap-free.
        let record = encode_record(s)?;
        if let Err(e) = self.fs.append(&self.resource, &record) {
            // A later record must not land behind a partial one.
            match self.fs.truncate(&self.resource, entries.file_len) {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(cut) => {
                    warn!(resource = %self.resource, len = entries.file_len, error = %cut, "could not cut back failed index append");
                }
            }
            return Err(e.into());
        }
        entries.file_len += record.len() as u64;
        let code = entries.insert(s.to_string());
        debug!(resource = %self.resource, code, value = s, "string index entry added");
        Ok(code)
    }

    fn code_to_string(&self, code: u32) -> Result<Option<String>, IndexError> {
        let mut guard = self.entries.lock();
        let entries = self.loaded(&mut guard)?;
        Ok(entries.by_code.get(code as usize).cloned())
    }
}

impl std::fmt::Debug for FileBasedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded = self.entries.lock().as_ref().map(|e| e.by_code.len());
        f.debug_struct("FileBasedIndex")
            .field("resource", &self.resource)
            .field("entries", &loaded)
            .finish()
    }
}

/// Volatile dictionary, e.g. a namespace registry preloaded at startup.
#[derive(Default)]
pub struct MemoryIndex {
    entries: Mutex<Entries>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index whose codes follow the order of `strings`.
    pub fn preloaded<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = Entries::default();
        for s in strings {
            let s = s.into();
            if !entries.by_string.contains_key(&s) {
                entries.insert(s);
            }
        }
        Self { entries: Mutex::new(entries) }
    }
}

impl StringIndex for MemoryIndex {
    fn string_to_code(&self, s: &str) -> Result<u32, IndexError> {
        let mut entries = self.entries.lock();
        if let Some(code) = entries.by_string.get(s) {
            return Ok(*code);
        }
        Ok(entries.insert(s.to_string()))
    }

    fn code_to_string(&self, code: u32) -> Result<Option<String>, IndexError> {
        Ok(self.entries.lock().by_code.get(code as usize).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FsResult, LocalFileSystem};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn index_fs() -> (Arc<dyn FileSystem>, TempDir) {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()).unwrap());
        (fs, dir)
    }

    #[test]
    fn test_codes_are_sequential_and_stable() {
        let (fs, _dir) = index_fs();
        let index = FileBasedIndex::new(fs, "/name_idx.dat");
        assert_eq!(index.string_to_code("primaryType").unwrap(), 0);
        assert_eq!(index.string_to_code("mixinTypes").unwrap(), 1);
        assert_eq!(index.string_to_code("primaryType").unwrap(), 0);
        assert_eq!(index.code_to_string(1).unwrap(), Some("mixinTypes".to_string()));
        assert_eq!(index.code_to_string(2).unwrap(), None);
        assert_eq!(index.len().unwrap(), 2);
    }

    #[test]
    fn test_reload_from_file() {
        let (fs, _dir) = index_fs();
        {
            let index = FileBasedIndex::new(Arc::clone(&fs), "/ns_idx.dat");
            index.string_to_code("").unwrap();
            index.string_to_code("http://www.jcp.org/jcr/1.0").unwrap();
        }
        let index = FileBasedIndex::new(fs, "/ns_idx.dat");
        assert_eq!(index.code_to_string(1).unwrap(), Some("http://www.jcp.org/jcr/1.0".to_string()));
        assert_eq!(index.string_to_code("").unwrap(), 0);
        assert_eq!(index.string_to_code("urn:new").unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let (fs, _dir) = index_fs();
        {
            let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
            index.string_to_code("a").unwrap();
            index.string_to_code("bb").unwrap();
        }
        let full = fs.length("/idx").unwrap();
        fs.truncate("/idx", full - 3).unwrap();

        let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(fs.length("/idx").unwrap(), (RECORD_OVERHEAD + 1) as u64);
        assert_eq!(index.string_to_code("cc").unwrap(), 1);
    }

    #[test]
    fn test_damaged_middle_record_fails() {
        let (fs, _dir) = index_fs();
        {
            let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
            for s in ["one", "two", "three"] {
                index.string_to_code(s).unwrap();
            }
        }
        let mut data = fs.read("/idx").unwrap();
        data[3] ^= 0xFF;
        fs.write("/idx", &data).unwrap();

        let index = FileBasedIndex::new(fs, "/idx");
        assert!(matches!(index.code_to_string(0), Err(IndexError::Corrupt { offset: 0, .. })));
    }

    #[test]
    fn test_damaged_first_length_fails_instead_of_truncating() {
        let (fs, _dir) = index_fs();
        {
            let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
            for s in ["one", "two", "three"] {
                index.string_to_code(s).unwrap();
            }
        }
        let mut data = fs.read("/idx").unwrap();
        let before = data.len() as u64;
        data[1] = 0xFF;
        fs.write("/idx", &data).unwrap();

        let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
        assert!(matches!(index.string_to_code("other"), Err(IndexError::Corrupt { offset: 0, .. })));
        assert_eq!(fs.length("/idx").unwrap(), before);
    }

    #[test]
    fn test_complete_last_record_with_bad_checksum_fails() {
        let (fs, _dir) = index_fs();
        {
            let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
            index.string_to_code("a").unwrap();
            index.string_to_code("bb").unwrap();
        }
        let mut data = fs.read("/idx").unwrap();
        *data.last_mut().unwrap() ^= 0x01;
        fs.write("/idx", &data).unwrap();

        let index = FileBasedIndex::new(Arc::clone(&fs), "/idx");
        let offset = (RECORD_OVERHEAD + 1) as u64;
        assert!(matches!(index.len(), Err(IndexError::Corrupt { offset: o, .. }) if o == offset));
        assert_eq!(fs.length("/idx").unwrap(), data.len() as u64);
    }

    #[test]
    fn test_failed_append_is_cut_back() {
        let (inner, _dir) = index_fs();
        let fs = Arc::new(HalfAppend { inner, fail: AtomicBool::new(false) });
        let index = FileBasedIndex::new(Arc::clone(&fs) as Arc<dyn FileSystem>, "/idx");
        index.string_to_code("first").unwrap();
        let intact = fs.length("/idx").unwrap();

        fs.fail.store(true, Ordering::SeqCst);
        assert!(index.string_to_code("lost").is_err());
        assert_eq!(fs.length("/idx").unwrap(), intact);

        fs.fail.store(false, Ordering::SeqCst);
        assert_eq!(index.string_to_code("second").unwrap(), 1);
        drop(index);

        let reopened = FileBasedIndex::new(fs, "/idx");
        assert_eq!(reopened.code_to_string(1).unwrap(), Some("second".to_string()));
        assert_eq!(reopened.len().unwrap(), 2);
    }

    /// Writes half of each append, then fails, while `fail` is set.
    struct HalfAppend {
        inner: Arc<dyn FileSystem>,
        fail: AtomicBool,
    }

    impl FileSystem for HalfAppend {
        fn exists(&self, path: &str) -> FsResult<bool> {
            self.inner.exists(path)
        }
        fn is_file(&self, path: &str) -> FsResult<bool> {
            self.inner.is_file(path)
        }
        fn create_folder(&self, path: &str) -> FsResult<()> {
            self.inner.create_folder(path)
        }
        fn read(&self, path: &str) -> FsResult<Vec<u8>> {
            self.inner.read(path)
        }
        fn open(&self, path: &str) -> FsResult<Box<dyn std::io::Read + Send>> {
            self.inner.open(path)
        }
        fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
            self.inner.write(path, data)
        }
        fn append(&self, path: &str, data: &[u8]) -> FsResult<()> {
            if !self.fail.load(Ordering::SeqCst) {
                return self.inner.append(path, data);
            }
            self.inner.append(path, &data[..data.len() / 2])?;
            let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
            Err(FsError::io(path, "append", err))
        }
        fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
            self.inner.truncate(path, len)
        }
        fn length(&self, path: &str) -> FsResult<u64> {
            self.inner.length(path)
        }
        fn delete_file(&self, path: &str) -> FsResult<()> {
            self.inner.delete_file(path)
        }
        fn list_files(&self, folder: &str) -> FsResult<Vec<String>> {
            self.inner.list_files(folder)
        }
        fn close(&self) -> FsResult<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_too_long_string_rejected() {
        let (fs, _dir) = index_fs();
        let index = FileBasedIndex::new(fs, "/idx");
        let long = "x".repeat(u16::MAX as usize + 1);
        assert_eq!(index.string_to_code(&long), Err(IndexError::StringTooLong(long.len())));
        assert_eq!(index.len().unwrap(), 0);
    }

    #[test]
    fn test_memory_index_preloaded() {
        let index = MemoryIndex::preloaded(["", "urn:a", "urn:a", "urn:b"]);
        assert_eq!(index.string_to_code("urn:b").unwrap(), 2);
        assert_eq!(index.string_to_code("urn:c").unwrap(), 3);
        assert_eq!(index.code_to_string(0).unwrap(), Some(String::new()));
    }
}
