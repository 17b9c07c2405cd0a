//! Full-text index.
//!
//! Documents persist in an LMDB environment under `fts/{FTS_VERSION}`; the
//! tokenized copies are rebuilt in memory when the index opens. A document id
//! is an object path: `{objectId}/b/{blockId}` for text blocks and
//! `{objectId}/r/{relationKey}` for relations, so one object owns many docs.

mod batcher;
mod search;

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use batcher::AutoBatcher;
pub use search::{HighlightFormat, SearchHit};

use crate::app::Component;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::Result;
use crate::kv_store::{KvStore, WriteTxn};

/// Bumped when the document layout changes; older directories are removed on open.
pub const FTS_VERSION: &str = "3";
/// Maximum hits returned by one search.
pub const SEARCH_LIMIT: usize = 100;

const DOCS: &str = "docs";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDoc {
    pub id: String,
    #[serde(default)]
    pub space_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
}

impl SearchDoc {
    pub fn new(id: &str, space_id: &str, title: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            space_id: space_id.to_string(),
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    fn size(&self) -> usize {
        self.id.len() + self.space_id.len() + self.title.len() + self.text.len()
    }
}

/// Which part of an object a document was cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocPath {
    Block { object_id: String, block_id: String },
    Relation { object_id: String, key: String },
    Object { object_id: String },
}

impl DocPath {
    pub fn block(object_id: &str, block_id: &str) -> String {
        format!("{object_id}/b/{block_id}")
    }

    pub fn relation(object_id: &str, key: &str) -> String {
        format!("{object_id}/r/{key}")
    }

    pub fn parse(doc_id: &str) -> Self {
        let mut parts = doc_id.splitn(3, '/');
        let object_id = parts.next().unwrap_or_default().to_string();
        match (parts.next(), parts.next()) {
            (Some("b"), Some(block_id)) => DocPath::Block {
                object_id,
                block_id: block_id.to_string(),
            },
            (Some("r"), Some(key)) => DocPath::Relation {
                object_id,
                key: key.to_string(),
            },
            _ => DocPath::Object { object_id },
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            DocPath::Block { object_id, .. } | DocPath::Relation { object_id, .. } | DocPath::Object { object_id } => {
                object_id
            }
        }
    }
}

/// Lowercases and splits on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    doc: SearchDoc,
    title_lower: String,
    text_lower: String,
    title_tokens: Vec<String>,
    text_tokens: Vec<String>,
}

impl IndexedDoc {
    fn new(doc: SearchDoc) -> Self {
        Self {
            title_lower: doc.title.to_lowercase(),
            text_lower: doc.text.to_lowercase(),
            title_tokens: tokenize(&doc.title),
            text_tokens: tokenize(&doc.text),
            doc,
        }
    }
}

#[derive(Default)]
struct MemoryIndex {
    docs: BTreeMap<String, IndexedDoc>,
}

impl MemoryIndex {
    fn insert(&mut self, doc: SearchDoc) {
        let indexed = IndexedDoc::new(doc);
        self.docs.insert(indexed.doc.id.clone(), indexed);
    }

    fn remove(&mut self, id: &str) -> bool {
        self.docs.remove(id).is_some()
    }

    /// Ids of docs owned by `object_id`: the bare id and everything under `{object_id}/`.
    fn object_doc_ids(&self, object_id: &str) -> Vec<String> {
        let prefix = format!("{object_id}/");
        let mut ids: Vec<String> = self
            .docs
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .map(|(id, _)| id.clone())
            .collect();
        if self.docs.contains_key(object_id) {
            ids.push(object_id.to_string());
        }
        ids
    }
}

pub(crate) enum BatchOp {
    Index(SearchDoc),
    DeleteObject(String),
}

pub struct FtSearch {
    store: KvStore,
    index: RwLock<MemoryIndex>,
}

impl FtSearch {
    /// Opens the current index version and removes stale versions and the legacy directory.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let root = config.fts_root_path();
        cleanup_old_versions(&root, &config.fts_legacy_path())?;
        let store = KvStore::open(&root.join(FTS_VERSION), &[DOCS], config.map_size)?;

        let mut index = MemoryIndex::default();
        for (_, raw) in store.scan_prefix(DOCS, b"")? {
            match serde_json::from_slice::<SearchDoc>(&raw) {
                Ok(doc) => index.insert(doc),
                Err(e) => warn!("skipping undecodable full-text doc: {e}"),
            }
        }
        info!("full-text index v{FTS_VERSION} loaded with {} docs", index.docs.len());
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    pub fn index(&self, doc: SearchDoc) -> Result<()> {
        self.commit(vec![BatchOp::Index(doc)])
    }

    /// Writes every doc in one commit. Fails only when `ctx` is cancelled first.
    pub fn batch_index(&self, ctx: &Context, docs: Vec<SearchDoc>) -> Result<()> {
        ctx.check()?;
        self.commit(docs.into_iter().map(BatchOp::Index).collect())
    }

    pub fn delete_object(&self, object_id: &str) -> Result<()> {
        self.commit(vec![BatchOp::DeleteObject(object_id.to_string())])
    }

    pub fn batch_delete_objects(&self, object_ids: &[String]) -> Result<()> {
        self.commit(object_ids.iter().cloned().map(BatchOp::DeleteObject).collect())
    }

    /// Visits the docs of one object until `f` returns false.
    pub fn iterate(&self, object_id: &str, mut f: impl FnMut(&SearchDoc) -> bool) {
        let index = self.index.read();
        for id in index.object_doc_ids(object_id) {
            if let Some(d) = index.docs.get(&id) {
                if !f(&d.doc) {
                    break;
                }
            }
        }
    }

    pub fn doc_count(&self) -> usize {
        self.index.read().docs.len()
    }

    pub fn has_doc(&self, doc_id: &str) -> bool {
        self.index.read().docs.contains_key(doc_id)
    }

    pub fn new_auto_batcher(&self, max_docs: usize, max_bytes: usize) -> AutoBatcher<'_> {
        AutoBatcher::new(self, max_docs, max_bytes)
    }

    /// Runs `text` against the index. An empty query returns no hits.
    pub fn search(&self, space_ids: &[String], format: HighlightFormat, text: &str) -> Result<Vec<SearchHit>> {
        let index = self.index.read();
        search::run(&index, space_ids, format, text)
    }

    /// Persists `ops` in one transaction, then mirrors them in memory.
    pub(crate) fn commit(&self, ops: Vec<BatchOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut index = self.index.write();
        self.store.write(|w| {
            for op in &ops {
                match op {
                    BatchOp::Index(doc) => w.put_json(DOCS, doc.id.as_bytes(), doc)?,
                    BatchOp::DeleteObject(object_id) => delete_object_docs(w, object_id)?,
                }
            }
            Ok(())
        })?;
        for op in ops {
            match op {
                BatchOp::Index(doc) => index.insert(doc),
                BatchOp::DeleteObject(object_id) => {
                    for id in index.object_doc_ids(&object_id) {
                        index.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }
}

fn delete_object_docs(w: &mut WriteTxn<'_>, object_id: &str) -> Result<()> {
    w.delete_prefix(DOCS, format!("{object_id}/").as_bytes())?;
    w.delete(DOCS, object_id.as_bytes())?;
    Ok(())
}

fn cleanup_old_versions(root: &Path, legacy: &Path) -> Result<()> {
    if legacy.exists() {
        std::fs::remove_dir_all(legacy)?;
        info!("removed legacy full-text directory {}", legacy.display());
    }
    if !root.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy() != FTS_VERSION && entry.path().is_dir() {
            std::fs::remove_dir_all(entry.path())?;
            info!("removed stale full-text index {}", entry.path().display());
        }
    }
    Ok(())
}

impl Component for FtSearch {
    fn name(&self) -> &'static str {
        "ftsearch"
    }
}
