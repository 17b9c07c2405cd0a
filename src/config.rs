//! Engine configuration, loaded from JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory holding the common, per-space and full-text environments.
    pub repo_path: PathBuf,
    /// Space that stores per-space view objects.
    pub tech_space_id: String,
    pub backlinks_aggregation_ms: u64,
    pub fulltext_batch_size: usize,
    pub fulltext_interval_ms: u64,
    pub fts_max_docs: usize,
    pub fts_max_bytes: usize,
    /// LMDB map size for every environment.
    pub map_size: usize,
    /// Attempts for optimistic read-modify-write loops before `ObjectStoreConflict`.
    pub conflict_retry_budget: usize,
    /// When set, bootstrap records injection edges and writes a Graphviz file here.
    pub dependency_graph_path: Option<PathBuf>,
    /// Write bundled relations and types into the marketplace space at startup.
    pub index_bundled_objects: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("anytype_repo"),
            tech_space_id: String::from("tech"),
            backlinks_aggregation_ms: 500,
            fulltext_batch_size: 100,
            fulltext_interval_ms: 1000,
            fts_max_docs: 100,
            fts_max_bytes: 4 * 1024 * 1024,
            map_size: 1024 * 1024 * 1024,
            conflict_retry_budget: 8,
            dependency_graph_path: None,
            index_bundled_objects: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_repo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_path = path.into();
        self
    }

    pub fn backlinks_interval(&self) -> Duration {
        Duration::from_millis(self.backlinks_aggregation_ms)
    }

    pub fn fulltext_interval(&self) -> Duration {
        Duration::from_millis(self.fulltext_interval_ms)
    }

    pub fn common_store_path(&self) -> PathBuf {
        self.repo_path.join("objectstore")
    }

    pub fn spaces_path(&self) -> PathBuf {
        self.repo_path.join("spaces")
    }

    pub fn fts_root_path(&self) -> PathBuf {
        self.repo_path.join("fts")
    }

    pub fn fts_legacy_path(&self) -> PathBuf {
        self.repo_path.join("fts_legacy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"repo_path":"/tmp/x","backlinks_aggregation_ms":1000}"#)
            .unwrap();
        assert_eq!(cfg.repo_path, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.backlinks_interval(), Duration::from_secs(1));
        assert_eq!(cfg.fulltext_batch_size, 100);
        assert!(cfg.dependency_graph_path.is_none());
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Serialization(_)));
    }

    #[test]
    fn test_paths_are_under_repo() {
        let cfg = EngineConfig::default().with_repo_path("/data");
        assert_eq!(cfg.common_store_path(), PathBuf::from("/data/objectstore"));
        assert_eq!(cfg.spaces_path(), PathBuf::from("/data/spaces"));
        assert_eq!(cfg.fts_root_path(), PathBuf::from("/data/fts"));
    }
}
