//! Embedded key-value backend over LMDB.
//!
//! One [`KvStore`] owns one LMDB environment (a directory) and a fixed set of
//! named tables opened at startup. Multi-key writes go through [`KvStore::write`]
//! so they commit in a single LMDB transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, RoTransaction, RwTransaction, Transaction,
    WriteFlags,
};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, Result};

pub struct KvStore {
    env: Environment,
    tables: HashMap<&'static str, Database>,
    path: PathBuf,
}

impl KvStore {
    /// Opens (creating if needed) the environment at `path` with the given tables.
    pub fn open(path: &Path, tables: &[&'static str], map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        // NO_TLS lets one thread hold a read transaction while opening another.
        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_TLS)
            .set_max_dbs(tables.len() as u32 + 1)
            .set_map_size(map_size)
            .open(path)?;

        let mut opened = HashMap::with_capacity(tables.len());
        for name in tables {
            let db = env.create_db(Some(name), DatabaseFlags::empty())?;
            opened.insert(*name, db);
        }

        info!("opened kv store at {} with {} tables", path.display(), opened.len());
        Ok(Self {
            env,
            tables: opened,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table(&self, name: &str) -> Result<Database> {
        self.tables
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::Internal(format!("unknown table '{name}' in {}", self.path.display())))
    }

    pub fn read<R>(&self, f: impl FnOnce(&ReadTxn<'_>) -> Result<R>) -> Result<R> {
        let txn = self.env.begin_ro_txn()?;
        let reader = ReadTxn { txn, store: self };
        f(&reader)
    }

    /// Runs `f` in a write transaction; commits only when `f` succeeds.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<R>) -> Result<R> {
        let txn = self.env.begin_rw_txn()?;
        let mut writer = WriteTxn { txn, store: self };
        let out = f(&mut writer)?;
        writer.txn.commit()?;
        Ok(out)
    }

    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(|r| r.get(table, key))
    }

    pub fn get_json<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>> {
        self.read(|r| r.get_json(table, key))
    }

    pub fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|w| w.put(table, key, value))
    }

    pub fn put_json<T: Serialize>(&self, table: &str, key: &[u8], value: &T) -> Result<()> {
        self.write(|w| w.put_json(table, key, value))
    }

    pub fn delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        self.write(|w| w.delete(table, key))
    }

    pub fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.read(|r| r.scan_prefix(table, prefix))
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        self.read(|r| Ok(r.scan_prefix(table, b"")?.len()))
    }

    pub fn clear(&self, table: &str) -> Result<()> {
        self.write(|w| w.clear(table))
    }
}

pub struct ReadTxn<'env> {
    txn: RoTransaction<'env>,
    store: &'env KvStore,
}

impl ReadTxn<'_> {
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn_get(&self.txn, self.store.table(table)?, key)
    }

    pub fn get_json<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>> {
        decode_json(self.get(table, key)?)
    }

    pub fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        txn_scan(&self.txn, self.store.table(table)?, prefix)
    }
}

pub struct WriteTxn<'env> {
    txn: RwTransaction<'env>,
    store: &'env KvStore,
}

impl WriteTxn<'_> {
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn_get(&self.txn, self.store.table(table)?, key)
    }

    pub fn get_json<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>> {
        decode_json(self.get(table, key)?)
    }

    pub fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.store.table(table)?;
        self.txn.put(db, &key, &value, WriteFlags::empty())?;
        Ok(())
    }

    pub fn put_json<T: Serialize>(&mut self, table: &str, key: &[u8], value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.put(table, key, &encoded)
    }

    /// Returns whether the key existed.
    pub fn delete(&mut self, table: &str, key: &[u8]) -> Result<bool> {
        let db = self.store.table(table)?;
        match self.txn.del(db, &key, None) {
            Ok(()) => Ok(true),
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn scan_prefix(&self, table: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        txn_scan(&self.txn, self.store.table(table)?, prefix)
    }

    /// Deletes every key starting with `prefix`, returning how many were removed.
    pub fn delete_prefix(&mut self, table: &str, prefix: &[u8]) -> Result<usize> {
        let keys: Vec<Vec<u8>> = self
            .scan_prefix(table, prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.delete(table, key)?;
        }
        if !keys.is_empty() {
            debug!("deleted {} keys with shared prefix from {table}", keys.len());
        }
        Ok(keys.len())
    }

    pub fn clear(&mut self, table: &str) -> Result<()> {
        let db = self.store.table(table)?;
        self.txn.clear_db(db)?;
        Ok(())
    }
}

fn txn_get<T: Transaction>(txn: &T, db: Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match txn.get(db, &key) {
        Ok(bytes) => Ok(Some(bytes.to_vec())),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn txn_scan<T: Transaction>(txn: &T, db: Database, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = txn.open_ro_cursor(db)?;
    // Position by hand: MDB_FIRST and MDB_SET_RANGE report NotFound on an
    // empty table or a prefix past the last key.
    let positioned = if prefix.is_empty() {
        cursor.get(None, None, lmdb_sys::MDB_FIRST)
    } else {
        cursor.get(Some(prefix), None, lmdb_sys::MDB_SET_RANGE)
    };
    match positioned {
        Ok(_) => {}
        Err(lmdb::Error::NotFound) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut out = Vec::new();
    let (first_key, first_value) = match cursor.get(None, None, lmdb_sys::MDB_GET_CURRENT)? {
        (Some(key), value) => (key, value),
        (None, _) => return Ok(out),
    };
    if !first_key.starts_with(prefix) {
        return Ok(out);
    }
    out.push((first_key.to_vec(), first_value.to_vec()));

    for (key, value) in cursor.iter() {
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.to_vec(), value.to_vec()));
    }
    Ok(out)
}

fn decode_json<T: DeserializeOwned>(raw: Option<Vec<u8>>) -> Result<Option<T>> {
    match raw {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> KvStore {
        KvStore::open(&dir.path().join("kv"), &["alpha", "beta"], 16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.get("alpha", b"k").unwrap(), None);
        store.put("alpha", b"k", b"v").unwrap();
        assert_eq!(store.get("alpha", b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get("beta", b"k").unwrap(), None);

        assert!(store.delete("alpha", b"k").unwrap());
        assert!(!store.delete("alpha", b"k").unwrap());
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store
            .write(|w| {
                w.put("alpha", b"a\0x", b"1")?;
                w.put("alpha", b"a\0y", b"2")?;
                w.put("alpha", b"ab\0z", b"3")?;
                w.put("alpha", b"b", b"4")
            })
            .unwrap();

        let hits = store.scan_prefix("alpha", b"a\0").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(store.scan_prefix("alpha", b"zzz").unwrap().len(), 0);
        assert_eq!(store.count("alpha").unwrap(), 4);
    }

    #[test]
    fn test_scan_of_empty_or_exhausted_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.scan_prefix("alpha", b"").unwrap().is_empty());
        assert!(store.scan_prefix("alpha", b"p/").unwrap().is_empty());
        assert_eq!(store.count("beta").unwrap(), 0);
        assert_eq!(store.write(|w| w.delete_prefix("beta", b"")).unwrap(), 0);

        store.put("alpha", b"a", b"1").unwrap();
        assert!(store.scan_prefix("alpha", b"b").unwrap().is_empty());
        assert_eq!(store.scan_prefix("alpha", b"").unwrap(), vec![(b"a".to_vec(), b"1".to_vec())]);
        assert_eq!(store.scan_prefix("alpha", b"a").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let res: Result<()> = store.write(|w| {
            w.put("alpha", b"k", b"v")?;
            Err(EngineError::Cancelled)
        });
        assert!(res.is_err());
        assert_eq!(store.get("alpha", b"k").unwrap(), None);
    }

    #[test]
    fn test_json_and_delete_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.put_json("beta", b"p/1", &vec![1, 2]).unwrap();
        store.put_json("beta", b"p/2", &vec![3]).unwrap();
        let v: Option<Vec<i32>> = store.get_json("beta", b"p/1").unwrap();
        assert_eq!(v, Some(vec![1, 2]));

        let removed = store.write(|w| w.delete_prefix("beta", b"p/")).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("beta").unwrap(), 0);
    }

    #[test]
    fn test_unknown_table_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.get("gamma", b"k"), Err(EngineError::Internal(_))));
    }
}
