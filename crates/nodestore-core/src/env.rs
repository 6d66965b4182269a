//! Environment and database handles: the heart of the engine.
//!
//! An [`Environment`] is one directory holding log segments and snapshots.
//! It contains any number of named [`Database`]s, each an ordered map from
//! raw key bytes to raw value bytes.
//!
//! **Read path**: shared lock on the in-memory tables, never touches disk.
//! **Write path**: log append (synced per [`Durability`]), then the in-memory
//! update, both under the log mutex so same-key writes apply in log order.
//! **Checkpoint**: rotate the log, snapshot the tables, drop covered segments.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpointer::{start_checkpointer, CheckpointHandle, CheckpointStats};
use crate::config::{Durability, EnvConfig};
use crate::error::{KvError, KvResult};
use crate::format::Operation;
use crate::log::{list_segments, LogReader, LogWriter};
use crate::snapshot::{list_snapshots, prune, read_snapshot, write_snapshot, CheckpointResult, TableSet};

/// State shared by an environment, its databases and its checkpointer.
pub(crate) struct EnvShared {
    path: PathBuf,
    config: EnvConfig,
    tables: RwLock<TableSet>,
    /// Active log writer; `None` once closed
    log: Mutex<Option<LogWriter>>,
    closed: AtomicBool,
    checkpointer: Mutex<Option<CheckpointHandle>>,
    stats: CheckpointStats,
}

impl EnvShared {
    fn ensure_open(&self) -> KvResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(KvError::Closed)
        } else {
            Ok(())
        }
    }

    fn sync_writes(&self) -> bool {
        self.config.durability == Durability::Sync
    }

    pub(crate) fn stats(&self) -> &CheckpointStats {
        &self.stats
    }

    /// Checkpoint while the caller holds the log mutex.
    fn checkpoint_locked(&self, writer: &mut LogWriter) -> KvResult<CheckpointResult> {
        let covered = writer.rotate()?;
        let (snapshot_path, entries) = {
            let tables = self.tables.read();
            (write_snapshot(&self.path, covered, &tables)?, tables.entry_count())
        };
        writer.reset_checkpoint_counter();
        let (segments_removed, snapshots_removed) = prune(&self.path, covered)?;
        self.stats.record_checkpoint();

        info!(
            path = %snapshot_path.display(),
            covered,
            entries,
            segments_removed,
            "checkpoint written"
        );

        Ok(CheckpointResult {
            snapshot_path,
            covered_sequence: covered,
            entries,
            segments_removed,
            snapshots_removed,
        })
    }

    pub(crate) fn checkpoint(&self) -> KvResult<CheckpointResult> {
        let mut log = self.log.lock();
        let writer = log.as_mut().ok_or(KvError::Closed)?;
        self.checkpoint_locked(writer)
    }

    /// Checkpoint only when the log grew past the configured threshold.
    pub(crate) fn checkpoint_if_due(&self) -> KvResult<Option<CheckpointResult>> {
        let mut log = self.log.lock();
        let writer = log.as_mut().ok_or(KvError::Closed)?;
        if writer.bytes_since_checkpoint() < self.config.checkpoint_log_bytes {
            return Ok(None);
        }
        self.checkpoint_locked(writer).map(Some)
    }
}

impl Drop for EnvShared {
    fn drop(&mut self) {
        if let Some(writer) = self.log.get_mut().as_ref() {
            if let Err(e) = writer.sync() {
                warn!(path = %self.path.display(), error = %e, "log sync on drop failed");
            }
        }
    }
}

/// Handle to an open environment. Clones share the same environment.
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl Environment {
    /// Open or create the environment in `path`.
    ///
    /// Loads the newest snapshot, replays newer log segments and starts a
    /// fresh segment for this session.
    pub fn open<P: AsRef<Path>>(path: P, config: EnvConfig) -> KvResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        if !path.is_dir() {
            if !config.allow_create {
                return Err(KvError::Io {
                    path: Some(path),
                    kind: std::io::ErrorKind::NotFound,
                    detail: "environment directory does not exist".to_string(),
                });
            }
            info!(path = %path.display(), "creating environment");
            std::fs::create_dir_all(&path)
                .map_err(|e| KvError::io(&path, "Failed to create environment directory", e))?;
        }

        let (covered, mut tables) = match list_snapshots(&path)?.pop() {
            Some((_, snapshot)) => {
                let (covered, tables) = read_snapshot(&snapshot)?;
                (Some(covered), tables)
            }
            None => (None, TableSet::default()),
        };

        let records = LogReader::new(&path).recover_after(covered)?;
        let replayed = records.len();
        for record in records {
            match record.operation {
                Operation::CreateDatabase => {
                    let name = String::from_utf8_lossy(&record.key);
                    tables.register(&name, record.db);
                }
                Operation::Put | Operation::Delete => {
                    let Some(table) = tables.tables.get_mut(&record.db) else {
                        warn!(db = record.db, "log record for unknown database skipped");
                        continue;
                    };
                    if record.operation == Operation::Put {
                        table.insert(record.key, record.value);
                    } else {
                        table.remove(&record.key);
                    }
                }
            }
        }

        let last_segment = list_segments(&path)?.last().map(|(seq, _)| *seq);
        let next_sequence = match (last_segment, covered) {
            (None, None) => 0,
            (a, b) => a.unwrap_or(0).max(b.unwrap_or(0)) + 1,
        };
        let writer = LogWriter::create(&path, next_sequence, config.log_rotation_size_bytes)?;

        info!(
            path = %path.display(),
            databases = tables.catalog.len(),
            entries = tables.entry_count(),
            replayed,
            "environment opened"
        );

        let cadence = config.checkpoint_cadence;
        let shared = Arc::new(EnvShared {
            path,
            config,
            tables: RwLock::new(tables),
            log: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            checkpointer: Mutex::new(None),
            stats: CheckpointStats::default(),
        });

        if let Some(cadence) = cadence {
            let handle = start_checkpointer(Arc::downgrade(&shared), cadence)?;
            *shared.checkpointer.lock() = Some(handle);
        }

        Ok(Self { shared })
    }

    /// Open the database `name`, creating it when the configuration allows.
    pub fn open_database(&self, name: &str) -> KvResult<Database> {
        self.shared.ensure_open()?;

        if let Some(id) = self.shared.tables.read().catalog.get(name) {
            return Ok(self.database_handle(name, *id));
        }
        if !self.shared.config.allow_create {
            return Err(KvError::UnknownDatabase(name.to_string()));
        }

        let mut log = self.shared.log.lock();
        let writer = log.as_mut().ok_or(KvError::Closed)?;

        if let Some(id) = self.shared.tables.read().catalog.get(name) {
            return Ok(self.database_handle(name, *id));
        }
        let id = self
            .shared
            .tables
            .read()
            .next_id()
            .ok_or(KvError::TooManyDatabases(u16::MAX as usize + 1))?;

        writer.append(id, name.as_bytes(), &[], Operation::CreateDatabase, true)?;
        self.shared.tables.write().register(name, id);
        info!(database = name, id, "database created");

        Ok(self.database_handle(name, id))
    }

    fn database_handle(&self, name: &str, id: u16) -> Database {
        Database {
            shared: Arc::clone(&self.shared),
            id,
            name: Arc::from(name),
        }
    }

    /// Names of all databases in the environment.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.tables.read().catalog.keys().cloned().collect();
        names.sort();
        names
    }

    /// Force all logged writes to stable storage.
    pub fn sync(&self) -> KvResult<()> {
        let log = self.shared.log.lock();
        log.as_ref().ok_or(KvError::Closed)?.sync()
    }

    /// Write a snapshot now and drop the log it supersedes.
    pub fn checkpoint(&self) -> KvResult<CheckpointResult> {
        self.shared.checkpoint()
    }

    /// Stop the checkpointer, make every write durable, checkpoint and
    /// release the log. Later operations fail with `Closed`. Idempotent.
    pub fn close(&self) -> KvResult<()> {
        if let Some(handle) = self.shared.checkpointer.lock().take() {
            handle.shutdown();
        }

        let mut log = self.shared.log.lock();
        let Some(writer) = log.as_mut() else {
            return Ok(());
        };
        writer.sync()?;
        self.shared.checkpoint_locked(writer)?;
        *log = None;
        self.shared.closed.store(true, Ordering::Release);

        info!(path = %self.shared.path.display(), "environment closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &CheckpointStats {
        &self.shared.stats
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.shared.path)
            .field("databases", &self.shared.tables.read().catalog.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to one named, ordered keyspace.
///
/// All methods take `&self`; handles are cheap to clone and safe to share
/// across threads.
#[derive(Clone)]
pub struct Database {
    shared: Arc<EnvShared>,
    id: u16,
    name: Arc<str>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let config = &self.shared.config;
        if key.len() > config.max_key_size {
            return Err(KvError::TooLarge {
                len: key.len() as u64,
                limit: config.max_key_size as u64,
                what: "key",
            });
        }
        if value.len() > config.max_value_size {
            return Err(KvError::TooLarge {
                len: value.len() as u64,
                limit: config.max_value_size as u64,
                what: "value",
            });
        }
        Ok(())
    }

    /// Current value for `key`.
    pub fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        self.shared.ensure_open()?;
        let tables = self.shared.tables.read();
        Ok(tables.tables.get(&self.id).and_then(|t| t.get(key)).cloned())
    }

    /// Insert or replace the value for `key`.
    ///
    /// The whole value becomes visible at once; a concurrent `get` sees
    /// either the previous or the new value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.shared.ensure_open()?;
        self.check_sizes(key, value)?;

        let mut log = self.shared.log.lock();
        let writer = log.as_mut().ok_or(KvError::Closed)?;
        writer.append(self.id, key, value, Operation::Put, self.shared.sync_writes())?;

        self.shared
            .tables
            .write()
            .tables
            .entry(self.id)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        debug!(database = %self.name, key_len = key.len(), value_len = value.len(), "put");
        Ok(())
    }

    /// Remove `key`. Returns whether it existed; an absent key is not
    /// logged and not an error.
    pub fn delete(&self, key: &[u8]) -> KvResult<bool> {
        self.shared.ensure_open()?;

        let mut log = self.shared.log.lock();
        let writer = log.as_mut().ok_or(KvError::Closed)?;

        let present = self
            .shared
            .tables
            .read()
            .tables
            .get(&self.id)
            .map_or(false, |t| t.contains_key(key));
        if !present {
            return Ok(false);
        }

        writer.append(self.id, key, &[], Operation::Delete, self.shared.sync_writes())?;
        if let Some(table) = self.shared.tables.write().tables.get_mut(&self.id) {
            table.remove(key);
        }
        debug!(database = %self.name, key_len = key.len(), "delete");
        Ok(true)
    }

    pub fn contains_key(&self, key: &[u8]) -> KvResult<bool> {
        self.shared.ensure_open()?;
        let tables = self.shared.tables.read();
        Ok(tables.tables.get(&self.id).map_or(false, |t| t.contains_key(key)))
    }

    /// Number of keys in the database.
    pub fn len(&self) -> KvResult<usize> {
        self.shared.ensure_open()?;
        let tables = self.shared.tables.read();
        Ok(tables.tables.get(&self.id).map_or(0, |t| t.len()))
    }

    pub fn is_empty(&self) -> KvResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys strictly greater than `after` (all keys when `None`), in key
    /// order, at most `limit` of them (`0` = no limit).
    pub fn keys_after(&self, after: Option<&[u8]>, limit: usize) -> KvResult<Vec<Vec<u8>>> {
        self.shared.ensure_open()?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let tables = self.shared.tables.read();
        let Some(table) = tables.tables.get(&self.id) else {
            return Ok(Vec::new());
        };
        Ok(table
            .range::<[u8], _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_env() -> (Environment, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path().join("bdb"), EnvConfig::small()).unwrap();
        (env, dir)
    }

    #[test]
    fn test_open_creates_directory() {
        let (env, dir) = test_env();
        assert!(dir.path().join("bdb").is_dir());
        assert!(env.database_names().is_empty());
    }

    #[test]
    fn test_open_without_allow_create_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = EnvConfig::small();
        config.allow_create = false;
        let result = Environment::open(dir.path().join("missing"), config);
        assert!(matches!(result, Err(KvError::Io { kind: std::io::ErrorKind::NotFound, .. })));
    }

    #[test]
    fn test_unknown_database_without_allow_create() {
        let dir = TempDir::new().unwrap();
        Environment::open(dir.path(), EnvConfig::small()).unwrap().close().unwrap();

        let mut config = EnvConfig::small();
        config.allow_create = false;
        let env = Environment::open(dir.path(), config).unwrap();
        assert!(matches!(env.open_database("bundles"), Err(KvError::UnknownDatabase(_))));
    }

    #[test]
    fn test_put_get_overwrite() {
        let (env, _dir) = test_env();
        let db = env.open_database("bundles").unwrap();
        db.put(b"k", b"v1").unwrap();
        db.put(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_reports_presence() {
        let (env, _dir) = test_env();
        let db = env.open_database("bundles").unwrap();
        db.put(b"k", b"v").unwrap();
        assert!(db.delete(b"k").unwrap());
        assert!(!db.delete(b"k").unwrap());
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_databases_are_isolated() {
        let (env, _dir) = test_env();
        let bundles = env.open_database("bundles").unwrap();
        let refs = env.open_database("refs").unwrap();

        bundles.put(b"same", b"bundle").unwrap();
        refs.put(b"same", b"refs").unwrap();

        assert_eq!(bundles.get(b"same").unwrap(), Some(b"bundle".to_vec()));
        assert_eq!(refs.get(b"same").unwrap(), Some(b"refs".to_vec()));
        refs.delete(b"same").unwrap();
        assert!(bundles.contains_key(b"same").unwrap());
    }

    #[test]
    fn test_reopen_database_keeps_id() {
        let (env, _dir) = test_env();
        let a = env.open_database("bundles").unwrap();
        let b = env.open_database("bundles").unwrap();
        a.put(b"k", b"v").unwrap();
        assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_keys_after_is_ordered_and_exclusive() {
        let (env, _dir) = test_env();
        let db = env.open_database("bundles").unwrap();
        for key in [&b"c"[..], b"a", b"d", b"b"] {
            db.put(key, b"v").unwrap();
        }

        let all = db.keys_after(None, 0).unwrap();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let page = db.keys_after(Some(b"a"), 2).unwrap();
        assert_eq!(page, vec![b"b".to_vec(), b"c".to_vec()]);

        let rest = db.keys_after(Some(b"c"), 10).unwrap();
        assert_eq!(rest, vec![b"d".to_vec()]);
        assert!(db.keys_after(Some(b"d"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_value_rejected() {
        let (env, _dir) = test_env();
        let db = env.open_database("bundles").unwrap();
        let value = vec![0u8; env.config().max_value_size + 1];
        assert!(matches!(
            db.put(b"k", &value),
            Err(KvError::TooLarge { what: "value", .. })
        ));
        assert_eq!(db.len().unwrap(), 0);
    }

    #[test]
    fn test_crash_recovery_from_log() {
        let dir = TempDir::new().unwrap();
        {
            let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
            let db = env.open_database("bundles").unwrap();
            db.put(b"survive1", b"yes").unwrap();
            db.put(b"survive2", b"also_yes").unwrap();
            db.put(b"doomed", b"temp").unwrap();
            db.delete(b"doomed").unwrap();
            // dropped without close: only the log has the data
        }
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        let db = env.open_database("bundles").unwrap();
        assert_eq!(db.get(b"survive1").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(db.get(b"survive2").unwrap(), Some(b"also_yes".to_vec()));
        assert_eq!(db.get(b"doomed").unwrap(), None);
        assert_eq!(db.len().unwrap(), 2);
    }

    #[test]
    fn test_checkpoint_then_more_writes_recover() {
        let dir = TempDir::new().unwrap();
        {
            let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
            let db = env.open_database("bundles").unwrap();
            db.put(b"before", b"1").unwrap();
            let result = env.checkpoint().unwrap();
            assert_eq!(result.entries, 1);
            db.put(b"after", b"2").unwrap();
            db.delete(b"before").unwrap();
        }
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        let db = env.open_database("bundles").unwrap();
        assert_eq!(db.get(b"before").unwrap(), None);
        assert_eq!(db.get(b"after").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (env, _dir) = test_env();
        let db = env.open_database("bundles").unwrap();
        db.put(b"k", b"v").unwrap();

        env.close().unwrap();
        env.close().unwrap();
        assert!(env.is_closed());
        assert!(matches!(db.get(b"k"), Err(KvError::Closed)));
        assert!(matches!(db.put(b"k", b"v"), Err(KvError::Closed)));
        assert!(matches!(env.open_database("other"), Err(KvError::Closed)));
    }

    #[test]
    fn test_close_leaves_single_snapshot() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        env.open_database("bundles").unwrap().put(b"k", b"v").unwrap();
        env.close().unwrap();

        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 1);
        assert!(list_segments(dir.path()).unwrap().iter().all(|(seq, _)| *seq > 0));

        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        let db = env.open_database("bundles").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_background_checkpointer_runs() {
        let dir = TempDir::new().unwrap();
        let mut config = EnvConfig::small();
        config.checkpoint_cadence = Some(Duration::from_millis(20));
        config.log_rotation_size_bytes = 64 * 1024;
        config.checkpoint_log_bytes = 64 * 1024;

        let env = Environment::open(dir.path(), config).unwrap();
        let db = env.open_database("bundles").unwrap();
        let value = vec![7u8; 1024];
        for i in 0..100u32 {
            db.put(&i.to_be_bytes(), &value).unwrap();
        }

        std::thread::sleep(Duration::from_millis(300));
        assert!(env.stats().cycles() >= 1);
        assert!(env.stats().checkpoints() >= 1);
        env.close().unwrap();
    }

    #[test]
    fn test_concurrent_writers_distinct_keys() {
        let (env, _dir) = test_env();
        let db = env.open_database("bundles").unwrap();

        let mut handles = vec![];
        for t in 0..8u8 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50u8 {
                    db.put(&[t, i], &[t, i, 0xAA]).unwrap();
                }
            }));
        }
        for h in handles { h.join().unwrap(); }

        assert_eq!(db.len().unwrap(), 400);
        assert_eq!(db.get(&[3, 7]).unwrap(), Some(vec![3, 7, 0xAA]));
    }
}
