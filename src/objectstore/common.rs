//! Cross-space records kept in the common environment.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::change::FileKeys;
use crate::config::EngineConfig;
use crate::domain::SmartBlockType;
use crate::error::{EngineError, Result};
use crate::kv_store::KvStore;

pub(crate) const FULLTEXT_QUEUE: &str = "fulltext_queue";
pub(crate) const CHECKSUMS: &str = "indexer_checksums";
pub(crate) const VIRTUAL_SPACES: &str = "virtual_spaces";
pub(crate) const FILE_KEYS: &str = "file_keys";
pub(crate) const SMARTBLOCK_TYPES: &str = "smartblock_types";
pub(crate) const SYSTEM: &str = "system";
pub(crate) const SPACE_ALIAS_BY_ID: &str = "space_alias_by_id";
pub(crate) const SPACE_ID_BY_ALIAS: &str = "space_id_by_alias";
pub(crate) const OBJECT_SPACE: &str = "object_space";

const TABLES: &[&str] = &[
    FULLTEXT_QUEUE,
    CHECKSUMS,
    VIRTUAL_SPACES,
    FILE_KEYS,
    SMARTBLOCK_TYPES,
    SYSTEM,
    SPACE_ALIAS_BY_ID,
    SPACE_ID_BY_ALIAS,
    OBJECT_SPACE,
];

const ACCOUNT_STATUS_KEY: &str = "account_status";

/// Per-space counters of forced reindex passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Checksums {
    pub objects_force_reindex_counter: i32,
    pub files_force_reindex_counter: i32,
    pub bundled_templates: i32,
    pub bundled_objects: i32,
    pub bundled_relations: i32,
    pub bundled_types: i32,
    pub bundled_layouts: i32,
    pub filestore_keys_force_reindex_counter: i32,
    pub fulltext_rebuild: i32,
    pub idx_rebuild_counter: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountStatus {
    pub status: String,
    pub deletion_date: i64,
}

/// Full-text queue entry. `seq` changes on every re-add so a drain only
/// removes entries it actually processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStamp {
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
    #[serde(rename = "seq")]
    pub seq: u64,
}

pub struct CommonStore {
    pub(crate) kv: KvStore,
    pub(crate) queue_seq: AtomicU64,
    /// object id -> space id
    pub(crate) space_cache: RwLock<std::collections::HashMap<String, String>>,
    /// Serialises alias allocation.
    pub(crate) alias_lock: Mutex<()>,
}

impl CommonStore {
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let kv = KvStore::open(&config.common_store_path(), TABLES, config.map_size)?;
        let max_seq = kv
            .scan_prefix(FULLTEXT_QUEUE, b"")?
            .iter()
            .filter_map(|(_, v)| serde_json::from_slice::<QueueStamp>(v).ok())
            .map(|s| s.seq)
            .max()
            .unwrap_or(0);
        info!("common store opened at {}", kv.path().display());
        Ok(Self {
            kv,
            queue_seq: AtomicU64::new(max_seq),
            space_cache: RwLock::new(Default::default()),
            alias_lock: Mutex::new(()),
        })
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.queue_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // Checksums

    pub fn get_checksums(&self, space_id: &str) -> Result<Option<Checksums>> {
        self.kv.get_json(CHECKSUMS, space_id.as_bytes())
    }

    pub fn save_checksums(&self, space_id: &str, checksums: &Checksums) -> Result<()> {
        self.kv.put_json(CHECKSUMS, space_id.as_bytes(), checksums)
    }

    // File keys

    /// Merges keys into whatever is stored for each file.
    pub fn add_file_keys(&self, keys: &[FileKeys]) -> Result<()> {
        self.kv.write(|w| {
            for fk in keys {
                let mut stored: BTreeMap<String, String> =
                    w.get_json(FILE_KEYS, fk.hash.as_bytes())?.unwrap_or_default();
                stored.extend(fk.keys.iter().map(|(k, v)| (k.clone(), v.clone())));
                w.put_json(FILE_KEYS, fk.hash.as_bytes(), &stored)?;
            }
            Ok(())
        })
    }

    pub fn get_file_keys(&self, file_id: &str) -> Result<BTreeMap<String, String>> {
        self.kv
            .get_json(FILE_KEYS, file_id.as_bytes())?
            .ok_or_else(|| EngineError::not_found(format!("file keys for {file_id}")))
    }

    pub fn delete_file_keys(&self, file_id: &str) -> Result<()> {
        self.kv.delete(FILE_KEYS, file_id.as_bytes()).map(|_| ())
    }

    // Smart-block types

    pub fn set_smartblock_type(&self, id: &str, sb_type: SmartBlockType) -> Result<()> {
        self.kv.put_json(SMARTBLOCK_TYPES, id.as_bytes(), &sb_type)
    }

    pub fn get_smartblock_type(&self, id: &str) -> Result<Option<SmartBlockType>> {
        self.kv.get_json(SMARTBLOCK_TYPES, id.as_bytes())
    }

    // Virtual spaces

    pub fn add_virtual_space(&self, space_id: &str) -> Result<()> {
        self.kv.put(VIRTUAL_SPACES, space_id.as_bytes(), b"")
    }

    pub fn remove_virtual_space(&self, space_id: &str) -> Result<()> {
        self.kv.delete(VIRTUAL_SPACES, space_id.as_bytes()).map(|_| ())
    }

    pub fn list_virtual_spaces(&self) -> Result<Vec<String>> {
        Ok(self
            .kv
            .scan_prefix(VIRTUAL_SPACES, b"")?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    // System key-value

    pub fn put_system<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.put_json(SYSTEM, key.as_bytes(), value)
    }

    pub fn get_system<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.kv.get_json(SYSTEM, key.as_bytes())
    }

    pub fn save_account_status(&self, status: &AccountStatus) -> Result<()> {
        self.put_system(ACCOUNT_STATUS_KEY, status)
    }

    pub fn get_account_status(&self) -> Result<AccountStatus> {
        self.get_system(ACCOUNT_STATUS_KEY)?
            .ok_or_else(|| EngineError::not_found("account status"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn open_common(dir: &tempfile::TempDir) -> CommonStore {
        let config = EngineConfig {
            map_size: 16 * 1024 * 1024,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path());
        CommonStore::open(&config).unwrap()
    }

    #[test]
    fn test_file_keys_merge_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_common(&dir);
        let first = FileKeys {
            hash: "file1".into(),
            keys: [("/0".to_string(), "k0".to_string())].into_iter().collect(),
        };
        let second = FileKeys {
            hash: "file1".into(),
            keys: [("/1".to_string(), "k1".to_string())].into_iter().collect(),
        };
        store.add_file_keys(&[first]).unwrap();
        store.add_file_keys(&[second]).unwrap();
        assert_eq!(store.get_file_keys("file1").unwrap().len(), 2);

        store.delete_file_keys("file1").unwrap();
        assert!(store.get_file_keys("file1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_account_status_and_virtual_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_common(&dir);
        assert!(store.get_account_status().unwrap_err().is_not_found());
        let status = AccountStatus {
            status: "pendingDeletion".into(),
            deletion_date: 1_700_000_000,
        };
        store.save_account_status(&status).unwrap();
        assert_eq!(store.get_account_status().unwrap(), status);

        store.add_virtual_space("v1").unwrap();
        store.add_virtual_space("v2").unwrap();
        store.remove_virtual_space("v1").unwrap();
        assert_eq!(store.list_virtual_spaces().unwrap(), vec!["v2".to_string()]);
    }

    #[test]
    fn test_checksums_and_types_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_common(&dir);
        assert_eq!(store.get_checksums("s1").unwrap(), None);
        let sums = Checksums {
            bundled_relations: 3,
            ..Default::default()
        };
        store.save_checksums("s1", &sums).unwrap();
        assert_eq!(store.get_checksums("s1").unwrap(), Some(sums));

        store.set_smartblock_type("obj", SmartBlockType::Page).unwrap();
        assert_eq!(store.get_smartblock_type("obj").unwrap(), Some(SmartBlockType::Page));
    }
}
