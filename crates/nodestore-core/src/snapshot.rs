//! Checkpoint snapshots
//!
//! A snapshot is the complete table set as of the end of log segment
//! `covered`. Opening an environment loads the newest snapshot and then
//! replays only segments numbered above `covered`.
//!
//! File `snapshot-{covered:016x}.nssp`:
//!
//! ```text
//! magic "NSSP" | version u32 | covered u64
//! db_count u32  | { db_id u16 | name_len u16 | name }*
//! entry_count u64 | { db_id u16 | key_len u16 | value_len u32 | key | value }*
//! crc32c u32 over everything above
//! ```
//!
//! Snapshots are written to a `.tmp` file, synced, renamed into place and
//! the directory synced, so a crash leaves either the old or the new
//! snapshot, never a half-written one under the final name.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::durability::{durable_sync, sync_directory};
use crate::error::{KvError, KvResult};
use crate::log::list_segments;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"NSSP";
pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".nssp";

/// Named ordered keyspaces held in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableSet {
    /// Database name -> id
    pub catalog: HashMap<String, u16>,
    /// Database id -> ordered contents
    pub tables: HashMap<u16, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl TableSet {
    /// Register `name` under `id`; idempotent for a repeated identical pair.
    pub fn register(&mut self, name: &str, id: u16) {
        self.catalog.insert(name.to_string(), id);
        self.tables.entry(id).or_default();
    }

    /// Smallest id not yet in use.
    pub fn next_id(&self) -> Option<u16> {
        match self.catalog.values().max() {
            None => Some(0),
            Some(max) => max.checked_add(1),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.tables.values().map(|t| t.len() as u64).sum()
    }
}

/// Outcome of a checkpoint.
#[derive(Debug)]
pub struct CheckpointResult {
    /// Path of the snapshot written
    pub snapshot_path: PathBuf,
    /// Last log segment folded into the snapshot
    pub covered_sequence: u64,
    /// Live entries across all databases
    pub entries: u64,
    /// Log segments deleted because the snapshot supersedes them
    pub segments_removed: usize,
    /// Older snapshots deleted
    pub snapshots_removed: usize,
}

pub fn snapshot_name(covered: u64) -> String {
    format!("{}{:016x}{}", SNAPSHOT_PREFIX, covered, SNAPSHOT_SUFFIX)
}

pub fn parse_snapshot_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// All snapshots in `dir`, ordered by covered sequence.
pub fn list_snapshots(dir: &Path) -> KvResult<Vec<(u64, PathBuf)>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| KvError::io(dir, "Failed to read environment directory", e))?;
    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KvError::io(dir, "Failed to read directory entry", e))?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_snapshot_name) {
            snapshots.push((seq, entry.path()));
        }
    }
    snapshots.sort_by_key(|(seq, _)| *seq);
    Ok(snapshots)
}

/// Writer that checksums everything passing through it.
struct ChecksumWriter<W: Write> {
    inner: W,
    crc: u32,
}

impl<W: Write> ChecksumWriter<W> {
    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.crc = crc32c::crc32c_append(self.crc, bytes);
        self.inner.write_all(bytes)
    }
}

/// Serialize `tables` as the snapshot covering segment `covered`.
pub fn write_snapshot(dir: &Path, covered: u64, tables: &TableSet) -> KvResult<PathBuf> {
    let final_path = dir.join(snapshot_name(covered));
    let tmp_path = final_path.with_extension("nssp.tmp");

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| KvError::io(&tmp_path, "Failed to create snapshot file", e))?;

    let io_err = |e| KvError::io(&tmp_path, "Snapshot write failed", e);
    let mut out = ChecksumWriter { inner: BufWriter::new(file), crc: 0 };

    out.put(&SNAPSHOT_MAGIC).map_err(io_err)?;
    out.put(&SNAPSHOT_VERSION.to_le_bytes()).map_err(io_err)?;
    out.put(&covered.to_le_bytes()).map_err(io_err)?;

    let mut catalog: Vec<(&String, &u16)> = tables.catalog.iter().collect();
    catalog.sort_by_key(|(_, id)| **id);
    out.put(&(catalog.len() as u32).to_le_bytes()).map_err(io_err)?;
    for (name, id) in &catalog {
        out.put(&id.to_le_bytes()).map_err(io_err)?;
        out.put(&(name.len() as u16).to_le_bytes()).map_err(io_err)?;
        out.put(name.as_bytes()).map_err(io_err)?;
    }

    out.put(&tables.entry_count().to_le_bytes()).map_err(io_err)?;
    for (_, id) in &catalog {
        let Some(table) = tables.tables.get(*id) else { continue };
        for (key, value) in table {
            out.put(&id.to_le_bytes()).map_err(io_err)?;
            out.put(&(key.len() as u16).to_le_bytes()).map_err(io_err)?;
            out.put(&(value.len() as u32).to_le_bytes()).map_err(io_err)?;
            out.put(key).map_err(io_err)?;
            out.put(value).map_err(io_err)?;
        }
    }

    let crc = out.crc;
    let mut inner = out.inner;
    inner.write_all(&crc.to_le_bytes()).map_err(io_err)?;
    let file = inner
        .into_inner()
        .map_err(|e| KvError::io(&tmp_path, "Snapshot flush failed", e.into_error()))?;
    durable_sync(&file).map_err(|e| KvError::io(&tmp_path, "Snapshot sync failed", e))?;
    drop(file);

    fs::rename(&tmp_path, &final_path)
        .map_err(|e| KvError::io(&final_path, "Failed to install snapshot", e))?;
    sync_directory(dir).map_err(|e| KvError::io(dir, "Directory sync failed", e))?;

    Ok(final_path)
}

/// Cursor over snapshot bytes that reports truncation as corruption.
struct SnapshotCursor<'a> {
    data: &'a [u8],
    offset: usize,
    path: &'a Path,
}

impl<'a> SnapshotCursor<'a> {
    fn take(&mut self, len: usize) -> KvResult<&'a [u8]> {
        if self.offset + len > self.data.len() {
            return Err(KvError::Corrupted {
                path: self.path.to_path_buf(),
                offset: self.offset as u64,
                reason: format!("snapshot truncated: need {} bytes", len),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u16(&mut self) -> KvResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> KvResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> KvResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Load a snapshot, verifying its checksum before trusting any field.
///
/// Returns the covered sequence and the table set.
pub fn read_snapshot(path: &Path) -> KvResult<(u64, TableSet)> {
    let mut file = File::open(path).map_err(|e| KvError::io(path, "Failed to open snapshot", e))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| KvError::io(path, "Failed to read snapshot", e))?;

    if data.len() < 4 + 4 + 8 + 4 + 8 + 4 {
        return Err(KvError::Corrupted {
            path: path.to_path_buf(),
            offset: 0,
            reason: format!("snapshot too short: {} bytes", data.len()),
        });
    }

    let body_len = data.len() - 4;
    let stored = u32::from_le_bytes([data[body_len], data[body_len + 1], data[body_len + 2], data[body_len + 3]]);
    let computed = crc32c::crc32c(&data[..body_len]);
    if stored != computed {
        return Err(KvError::ChecksumMismatch {
            path: path.to_path_buf(),
            stored,
            computed,
            offset: body_len as u64,
        });
    }

    let mut cur = SnapshotCursor { data: &data[..body_len], offset: 0, path };
    let magic = cur.take(4)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(KvError::BadMagic {
            path: path.to_path_buf(),
            offset: 0,
            found: [magic[0], magic[1], magic[2], magic[3]],
        });
    }
    let version = cur.u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(KvError::Corrupted {
            path: path.to_path_buf(),
            offset: 4,
            reason: format!("unsupported snapshot version {}", version),
        });
    }
    let covered = cur.u64()?;

    let mut tables = TableSet::default();
    let db_count = cur.u32()?;
    for _ in 0..db_count {
        let id = cur.u16()?;
        let name_len = cur.u16()? as usize;
        let name = std::str::from_utf8(cur.take(name_len)?).map_err(|_| KvError::Corrupted {
            path: path.to_path_buf(),
            offset: cur.offset as u64,
            reason: "database name is not UTF-8".to_string(),
        })?;
        tables.register(name, id);
    }

    let entry_count = cur.u64()?;
    for _ in 0..entry_count {
        let id = cur.u16()?;
        let key_len = cur.u16()? as usize;
        let value_len = cur.u32()? as usize;
        let key = cur.take(key_len)?.to_vec();
        let value = cur.take(value_len)?.to_vec();
        let table = tables.tables.get_mut(&id).ok_or_else(|| KvError::Corrupted {
            path: path.to_path_buf(),
            offset: cur.offset as u64,
            reason: format!("entry for unregistered database id {}", id),
        })?;
        table.insert(key, value);
    }

    Ok((covered, tables))
}

/// Delete log segments `<= covered` and snapshots older than `covered`.
///
/// Returns (segments removed, snapshots removed).
pub fn prune(dir: &Path, covered: u64) -> KvResult<(usize, usize)> {
    let mut segments_removed = 0;
    for (seq, path) in list_segments(dir)? {
        if seq <= covered {
            fs::remove_file(&path).map_err(|e| KvError::io(&path, "Failed to remove log segment", e))?;
            segments_removed += 1;
        }
    }

    let mut snapshots_removed = 0;
    for (seq, path) in list_snapshots(dir)? {
        if seq < covered {
            fs::remove_file(&path).map_err(|e| KvError::io(&path, "Failed to remove snapshot", e))?;
            snapshots_removed += 1;
        }
    }

    sync_directory(dir).map_err(|e| KvError::io(dir, "Directory sync failed", e))?;
    Ok((segments_removed, snapshots_removed))
}
