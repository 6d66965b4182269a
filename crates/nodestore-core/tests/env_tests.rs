//! Integration tests: environment lifecycle, recovery and ordered scans.

use std::collections::BTreeSet;

use proptest::prelude::*;
use tempfile::TempDir;

use nodestore_core::{Durability, EnvConfig, Environment, KvError};

fn small_env() -> (Environment, TempDir) {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
    (env, dir)
}

#[test]
fn test_reopen_after_close_restores_all_databases() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        let bundles = env.open_database("bundles").unwrap();
        let refs = env.open_database("references").unwrap();
        for i in 0..200u32 {
            bundles.put(&i.to_be_bytes(), format!("bundle{}", i).as_bytes()).unwrap();
        }
        refs.put(&7u32.to_be_bytes(), b"refs").unwrap();
        env.close().unwrap();
    }

    let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
    assert_eq!(env.database_names(), vec!["bundles".to_string(), "references".to_string()]);
    let bundles = env.open_database("bundles").unwrap();
    assert_eq!(bundles.len().unwrap(), 200);
    assert_eq!(bundles.get(&42u32.to_be_bytes()).unwrap(), Some(b"bundle42".to_vec()));
    let refs = env.open_database("references").unwrap();
    assert_eq!(refs.get(&7u32.to_be_bytes()).unwrap(), Some(b"refs".to_vec()));
}

#[test]
fn test_nosync_writes_survive_clean_close() {
    let dir = TempDir::new().unwrap();
    let mut config = EnvConfig::small();
    config.durability = Durability::NoSync;
    {
        let env = Environment::open(dir.path(), config.clone()).unwrap();
        let db = env.open_database("bundles").unwrap();
        db.put(b"fast", b"lane").unwrap();
        env.close().unwrap();
    }
    let env = Environment::open(dir.path(), config).unwrap();
    let db = env.open_database("bundles").unwrap();
    assert_eq!(db.get(b"fast").unwrap(), Some(b"lane".to_vec()));
}

#[test]
fn test_many_sessions_without_close() {
    let dir = TempDir::new().unwrap();
    for session in 0..5u8 {
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        let db = env.open_database("bundles").unwrap();
        db.put(&[session], &[session; 4]).unwrap();
        if session == 2 {
            env.checkpoint().unwrap();
        }
    }
    let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
    let db = env.open_database("bundles").unwrap();
    assert_eq!(db.len().unwrap(), 5);
    for session in 0..5u8 {
        assert_eq!(db.get(&[session]).unwrap(), Some(vec![session; 4]));
    }
}

#[test]
fn test_corrupt_snapshot_fails_open() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        env.open_database("bundles").unwrap().put(b"k", b"v").unwrap();
        env.close().unwrap();
    }
    let snapshot = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().map_or(false, |ext| ext == "nssp"))
        .unwrap();
    let mut data = std::fs::read(&snapshot).unwrap();
    data[18] ^= 0xFF;
    std::fs::write(&snapshot, data).unwrap();

    let result = Environment::open(dir.path(), EnvConfig::small());
    assert!(matches!(result, Err(KvError::ChecksumMismatch { .. })));
}

#[test]
fn test_same_key_concurrent_writes_last_write_wins_after_reopen() {
    let dir = TempDir::new().unwrap();
    let final_value = {
        let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
        let db = env.open_database("bundles").unwrap();
        let mut handles = vec![];
        for t in 0..4u8 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25u8 {
                    db.put(b"hot", &[t, i]).unwrap();
                }
            }));
        }
        for h in handles { h.join().unwrap(); }
        db.get(b"hot").unwrap().unwrap()
    };

    // Whatever value won in memory must be the one the log replays.
    let env = Environment::open(dir.path(), EnvConfig::small()).unwrap();
    let db = env.open_database("bundles").unwrap();
    assert_eq!(db.get(b"hot").unwrap(), Some(final_value));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_paged_scan_visits_every_key_once(
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 1..8), 0..60),
        page in 1usize..9,
    ) {
        let (env, _dir) = small_env();
        let db = env.open_database("bundles").unwrap();
        for key in &keys {
            db.put(key, b"v").unwrap();
        }

        let mut seen = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let batch = db.keys_after(after.as_deref(), page).unwrap();
            prop_assert!(batch.len() <= page);
            if batch.is_empty() {
                break;
            }
            after = batch.last().cloned();
            seen.extend(batch);
        }

        let expected: Vec<Vec<u8>> = keys.iter().cloned().collect();
        prop_assert_eq!(&seen, &expected);
        let unique: BTreeSet<Vec<u8>> = seen.iter().cloned().collect();
        prop_assert_eq!(unique.len(), seen.len());
    }
}
