use log::debug;

use super::{BatchOp, FtSearch, SearchDoc};
use crate::error::Result;

/// Accumulates writes and commits whenever the doc count or byte size
/// reaches its threshold. Deletes are queued without size checks.
pub struct AutoBatcher<'a> {
    fts: &'a FtSearch,
    max_docs: usize,
    max_bytes: usize,
    ops: Vec<BatchOp>,
    docs: usize,
    bytes: usize,
}

impl<'a> AutoBatcher<'a> {
    pub(super) fn new(fts: &'a FtSearch, max_docs: usize, max_bytes: usize) -> Self {
        Self {
            fts,
            max_docs: max_docs.max(1),
            max_bytes: max_bytes.max(1),
            ops: Vec::new(),
            docs: 0,
            bytes: 0,
        }
    }

    pub fn update_doc(&mut self, doc: SearchDoc) -> Result<()> {
        self.bytes += doc.size();
        self.docs += 1;
        self.ops.push(BatchOp::Index(doc));
        if self.docs >= self.max_docs || self.bytes >= self.max_bytes {
            self.flush()?;
        }
        Ok(())
    }

    pub fn delete_doc(&mut self, object_id: &str) {
        self.ops.push(BatchOp::DeleteObject(object_id.to_string()));
    }

    /// Commits whatever is left.
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        debug!("auto batcher committing {} ops ({} bytes)", self.ops.len(), self.bytes);
        let ops = std::mem::take(&mut self.ops);
        self.docs = 0;
        self.bytes = 0;
        self.fts.commit(ops)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::ftsearch::{FtSearch, SearchDoc};

    #[test]
    fn test_commits_on_doc_threshold_and_finish() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            map_size: 16 * 1024 * 1024,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path());
        let fts = FtSearch::open(&config).unwrap();

        let mut batcher = fts.new_auto_batcher(2, 1 << 20);
        batcher.update_doc(SearchDoc::new("a/r/name", "s", "one", "")).unwrap();
        assert_eq!(fts.doc_count(), 0);
        batcher.update_doc(SearchDoc::new("b/r/name", "s", "two", "")).unwrap();
        assert_eq!(fts.doc_count(), 2);
        batcher.update_doc(SearchDoc::new("c/r/name", "s", "three", "")).unwrap();
        batcher.delete_doc("a");
        assert_eq!(fts.doc_count(), 2);
        batcher.finish().unwrap();
        assert_eq!(fts.doc_count(), 2);
        assert!(!fts.has_doc("a/r/name"));
        assert!(fts.has_doc("c/r/name"));
    }

    #[test]
    fn test_commits_on_byte_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            map_size: 16 * 1024 * 1024,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path());
        let fts = FtSearch::open(&config).unwrap();

        let mut batcher = fts.new_auto_batcher(100, 64);
        batcher.update_doc(SearchDoc::new("a/b/1", "s", "", &"x".repeat(80))).unwrap();
        assert_eq!(fts.doc_count(), 1);
    }
}
