//! Write-ahead log
//!
//! Every mutation is appended here before it becomes visible in memory.
//! The log is a sequence of segment files `log-{seq:016x}.nskv`; a new
//! segment is started on every open and whenever the active one grows past
//! the rotation threshold. Segments covered by a snapshot are deleted by
//! the checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::durability::{durable_sync, sync_directory};
use crate::error::{KvError, KvResult};
use crate::format::{decode_record, encode_record, LogRecord, Operation, HEADER_SIZE, MAGIC_ARRAY};

const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".nskv";

/// File name of log segment `sequence`.
pub fn segment_name(sequence: u64) -> String {
    format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX)
}

/// Parse the sequence out of a segment file name.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// All log segments in `dir`, ordered by sequence.
pub fn list_segments(dir: &Path) -> KvResult<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| KvError::io(dir, "Failed to read log directory", e))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KvError::io(dir, "Failed to read directory entry", e))?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_name) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Appends records to the active segment.
///
/// Callers hold the writer's lock across `append` and the in-memory
/// update so same-key writes are applied in log order.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    size: u64,
    dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
    /// Bytes appended since the last `reset_checkpoint_counter`
    since_checkpoint: u64,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl LogWriter {
    /// Start a fresh segment numbered `sequence` in `dir`.
    pub fn create(dir: &Path, sequence: u64, rotation_size: u64) -> KvResult<Self> {
        let path = dir.join(segment_name(sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvError::io(&path, "Failed to open log segment", e))?;
        let size = file
            .metadata()
            .map_err(|e| KvError::io(&path, "Failed to stat log segment", e))?
            .len();
        // The segment's directory entry must survive before any record in it
        // is acknowledged.
        sync_directory(dir).map_err(|e| KvError::io(dir, "Failed to sync log directory", e))?;

        Ok(Self {
            file,
            path,
            size,
            dir: dir.to_path_buf(),
            sequence,
            rotation_size,
            since_checkpoint: 0,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Append one record; with `sync` the call returns only after the
    /// bytes are on stable storage.
    ///
    /// A failed write or sync is cut back off the segment: the caller sees
    /// an error, so replay must not apply the record, and a later append
    /// never lands behind a half-written one.
    pub fn append(&mut self, db: u16, key: &[u8], value: &[u8], op: Operation, sync: bool) -> KvResult<()> {
        let bytes = encode_record(db, key, value, op)?;

        if self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        if let Err(e) = self.file.write_all(&bytes) {
            self.discard_unacknowledged();
            return Err(KvError::io(&self.path, "Log write failed", e));
        }
        if sync {
            if let Err(e) = self.sync_file() {
                self.discard_unacknowledged();
                return Err(KvError::io(&self.path, "Log durable_sync failed", e));
            }
        }

        self.size += bytes.len() as u64;
        self.since_checkpoint += bytes.len() as u64;
        Ok(())
    }

    fn discard_unacknowledged(&mut self) {
        if let Err(e) = self.file.set_len(self.size) {
            warn!(path = %self.path.display(), size = self.size, error = %e, "could not cut back failed log append");
        }
    }

    fn sync_file(&mut self) -> std::io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure"));
        }
        durable_sync(&self.file)
    }

    /// Sync the active segment, then continue in a new one.
    ///
    /// Returns the sequence of the segment that was closed.
    pub fn rotate(&mut self) -> KvResult<u64> {
        self.sync()?;
        let closed = self.sequence;
        let next = LogWriter::create(&self.dir, closed + 1, self.rotation_size)?;
        let since_checkpoint = self.since_checkpoint;
        *self = next;
        self.since_checkpoint = since_checkpoint;
        Ok(closed)
    }

    /// Force everything appended so far to stable storage.
    pub fn sync(&self) -> KvResult<()> {
        durable_sync(&self.file).map_err(|e| KvError::io(&self.path, "Log sync failed", e))
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.since_checkpoint
    }

    pub fn reset_checkpoint_counter(&mut self) {
        self.since_checkpoint = 0;
    }
}

/// Replays log segments during open.
pub struct LogReader {
    dir: PathBuf,
}

impl LogReader {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    /// Records from every segment newer than `covered` (all segments when
    /// `None`), in log order.
    ///
    /// Per segment: a torn record ends that segment (it was the crash
    /// point); a record failing its checksum is skipped by scanning ahead
    /// for the next magic.
    pub fn recover_after(&self, covered: Option<u64>) -> KvResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        for (seq, path) in list_segments(&self.dir)? {
            if covered.map_or(false, |c| seq <= c) {
                continue;
            }
            records.extend(self.recover_segment(&path)?);
        }
        Ok(records)
    }

    fn recover_segment(&self, path: &Path) -> KvResult<Vec<LogRecord>> {
        let mut file = File::open(path)
            .map_err(|e| KvError::io(path, "Failed to open log segment for recovery", e))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| KvError::io(path, "Failed to read log segment", e))?;

        let mut records = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            let damage = match decode_record(&buffer[offset..]) {
                Ok((header, record)) => {
                    records.push(record);
                    offset += HEADER_SIZE + header.length as usize;
                    continue;
                }
                Err(KvError::Truncated { needed, have, .. }) => {
                    warn!(path = %path.display(), offset, needed, have, "torn record at end of log segment");
                    break;
                }
                Err(e) => e,
            };
            warn!(path = %path.display(), offset, error = %damage, "skipping damaged log bytes");
            match resync(&buffer, offset + 1) {
                Some(next) => offset = next,
                None => break,
            }
        }

        Ok(records)
    }
}

/// First offset at or after `from` holding the record magic.
fn resync(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|i| from + i)
}
