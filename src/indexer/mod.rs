//! Glue between sources and the object store.
//!
//! [`ObjectIndexer`] turns a source's document into details, links and a
//! snippet in the owning space index. [`FulltextIndexer`] drains the full-text
//! queue in the background, and [`ReindexDriver`] replays whole spaces when
//! their stored checksums lag behind the engine's.

mod fulltext;
mod reindex;

use std::sync::Arc;

use log::debug;
use sha2::{Digest, Sha256};

pub use fulltext::FulltextIndexer;
pub use reindex::{target_checksums, ReindexDriver, ReindexReport, MARKETPLACE_SPACE_ID};

use crate::app::{App, Component};
use crate::context::Context;
use crate::domain::relation::LOCAL_ONLY_KEYS;
use crate::domain::{keys, Details};
use crate::error::{EngineError, Result};
use crate::objectstore::ObjectStore;
use crate::source::Source;
use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    /// Heads hash matched the last indexed one.
    Unchanged,
}

impl IndexOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexOutcome::Indexed => "indexed",
            IndexOutcome::Unchanged => "unchanged",
        }
    }
}

/// Hex sha256 over the sorted heads.
pub fn heads_hash(heads: &[String]) -> String {
    let mut sorted: Vec<&str> = heads.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for head in sorted {
        hasher.update(head.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub struct ObjectIndexer {
    store: Arc<ObjectStore>,
}

impl ObjectIndexer {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }

    /// Indexes `source` unless its heads did not move since the last run.
    pub fn index(&self, ctx: &Context, source: &dyn Source) -> Result<IndexOutcome> {
        self.index_with(ctx, source, false)
    }

    /// Indexes `source` even when its heads are unchanged.
    pub fn reindex(&self, ctx: &Context, source: &dyn Source) -> Result<IndexOutcome> {
        self.index_with(ctx, source, true)
    }

    fn index_with(&self, ctx: &Context, source: &dyn Source, force: bool) -> Result<IndexOutcome> {
        ctx.check()?;
        let id = source.id();
        let space = self.store.space_index(source.space_id())?;
        let hash = heads_hash(&source.heads());
        if !force && space.get_last_indexed_heads_hash(id)?.as_deref() == Some(hash.as_str()) {
            debug!("{id} is indexed at its current heads");
            return Ok(IndexOutcome::Unchanged);
        }

        let state = source.read_doc(None)?;
        let links = state.links();
        let snippet = state.snippet();
        let mut details = derive_details(&state, &links, &snippet);
        if !details.contains(keys::CREATED_DATE) {
            let info = source.creation_info()?;
            if info.created_date > 0 {
                details.set(keys::CREATED_DATE, info.created_date);
            }
            if !info.creator.is_empty() {
                details.set(keys::CREATOR, info.creator);
            }
        }
        let stored = space.get_details(id)?;
        keep_local_only(&mut details, &stored);

        match space.update_object_details(ctx, id, details) {
            Ok(()) | Err(EngineError::DetailsNotChanged) => {}
            Err(err) => return Err(err),
        }
        space.update_object_links(id, &links)?;
        space.update_object_snippet(id, &snippet)?;
        space.save_last_indexed_heads_hash(id, &hash)?;
        debug!("indexed {id} in {} with {} links", source.space_id(), links.len());
        Ok(IndexOutcome::Indexed)
    }
}

/// Details of `state` plus the derived `links` and `snippet` relations.
fn derive_details(state: &State, links: &[String], snippet: &str) -> Details {
    let mut details = state.details().clone();
    details.set(keys::ID, state.root_id());
    details.set(keys::LINKS, links.to_vec());
    if !snippet.is_empty() {
        details.set(keys::SNIPPET, snippet);
    }
    details
}

/// Local-only keys live in the store, not in the tree; reindexing keeps them.
fn keep_local_only(details: &mut Details, stored: &Details) {
    for key in LOCAL_ONLY_KEYS.iter().filter(|k| **k != keys::LINKS) {
        if details.contains(key) {
            continue;
        }
        if let Some(value) = stored.get(key) {
            details.set(key, value.clone());
        }
    }
}

impl Component for ObjectIndexer {
    fn name(&self) -> &'static str {
        "indexer"
    }

    fn init(&self, app: &App) -> Result<()> {
        app.component::<ObjectStore>()?;
        Ok(())
    }
}
