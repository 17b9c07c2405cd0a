//! Process-wide object store.
//!
//! Owns the common environment (queue, checksums, id mapping, system records)
//! and a map of per-space indices opened on demand. The map is the only shared
//! mutable state here and is guarded by a short mutex; everything else lives
//! inside the individual [`SpaceIndex`] values.

pub(crate) mod common;
mod queue;
mod resolver;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use log::{info, warn};
use parking_lot::Mutex;

pub use common::{AccountStatus, Checksums, CommonStore, QueueStamp};
pub use queue::QueueEntry;

use crate::app::{App, Component};
use crate::config::EngineConfig;
use crate::database::{Filter, Query, QueryResult, Record};
use crate::domain::smartblock::layout;
use crate::domain::{keys, Details};
use crate::error::{EngineError, Result};
use crate::ftsearch::FtSearch;
use crate::spaceindex::query::{insert_bounded, keep_for, text_matches, TextMatches};
use crate::spaceindex::{LinksHub, LinksUpdateInfo, SpaceIndex};

pub struct ObjectStore {
    config: EngineConfig,
    common: Arc<CommonStore>,
    fts: Option<Arc<FtSearch>>,
    links_hub: Arc<LinksHub>,
    spaces: Mutex<HashMap<String, Arc<SpaceIndex>>>,
}

impl ObjectStore {
    pub fn open(config: &EngineConfig, fts: Option<Arc<FtSearch>>) -> Result<Self> {
        let common = Arc::new(CommonStore::open(config)?);
        Ok(Self {
            config: config.clone(),
            common,
            fts,
            links_hub: Arc::new(LinksHub::default()),
            spaces: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn common(&self) -> &Arc<CommonStore> {
        &self.common
    }

    pub fn fts(&self) -> Option<&Arc<FtSearch>> {
        self.fts.as_ref()
    }

    /// Index of `space_id`, opening (and creating) it on first use.
    pub fn space_index(&self, space_id: &str) -> Result<Arc<SpaceIndex>> {
        if space_id.is_empty() {
            return Err(EngineError::Validation("empty space id".into()));
        }
        let mut spaces = self.spaces.lock();
        if let Some(index) = spaces.get(space_id) {
            return Ok(index.clone());
        }
        let index = Arc::new(SpaceIndex::open(
            &self.config,
            space_id,
            self.common.clone(),
            self.fts.clone(),
            self.links_hub.clone(),
        )?);
        spaces.insert(space_id.to_string(), index.clone());
        Ok(index)
    }

    /// Index of `space_id` only if it is open or exists on disk.
    pub fn existing_space_index(&self, space_id: &str) -> Result<Option<Arc<SpaceIndex>>> {
        if let Some(index) = self.spaces.lock().get(space_id) {
            return Ok(Some(index.clone()));
        }
        if space_id.is_empty() || !self.config.spaces_path().join(space_id).is_dir() {
            return Ok(None);
        }
        self.space_index(space_id).map(Some)
    }

    /// Opens every space directory found on disk.
    pub fn preload_spaces(&self) -> Result<usize> {
        let root = self.config.spaces_path();
        if !root.is_dir() {
            return Ok(0);
        }
        let mut opened = 0;
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.space_index(&name) {
                Ok(_) => opened += 1,
                Err(err) => warn!("failed to open space index {name}: {err}"),
            }
        }
        info!("preloaded {opened} space indices");
        Ok(opened)
    }

    /// Ids of every space index open right now.
    pub fn space_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.spaces.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Details of `id` in whatever space it is bound to.
    pub fn get_details(&self, id: &str) -> Result<Details> {
        let space_id = self.common.resolve_space_id(id)?;
        self.space_index(&space_id)?.get_details(id)
    }

    /// Evaluates `query` across its target spaces, or every open space when it
    /// names none. Unknown spaces contribute nothing.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        let targets = match query.target_spaces() {
            Some(ids) => ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            None => self.space_ids(),
        };
        let matches: Option<TextMatches> = if query.full_text.trim().is_empty() {
            None
        } else {
            match &self.fts {
                Some(fts) => Some(text_matches(fts, &targets, &query.full_text)?),
                None => Some(TextMatches::new()),
            }
        };

        let keep = keep_for(query);
        let mut merged = BTreeMap::new();
        let mut total = 0;
        for space_id in &targets {
            let Some(index) = self.existing_space_index(space_id)? else {
                continue;
            };
            let collected = index.collect(query, matches.as_ref(), keep)?;
            total += collected.total;
            for (key, record) in collected.entries {
                insert_bounded(&mut merged, key, record, keep);
            }
        }
        let records: Vec<Record> = merged.into_values().collect();
        let mut result = QueryResult::paginate(records, query.offset, query.limit);
        result.total = total;
        Ok(result)
    }

    /// Space-view objects of the tech space, narrowed by `filters`.
    pub fn query_space_views(&self, filters: Vec<Filter>) -> Result<QueryResult> {
        let mut query = Query {
            filters,
            space_ids: vec![self.config.tech_space_id.clone()],
            ..Query::default()
        };
        query.filters.push(Filter::eq(keys::LAYOUT, layout::SPACE_VIEW));
        self.query(&query)
    }

    /// Every link diff produced by any space index from now on.
    pub fn subscribe_links_update(&self) -> Receiver<LinksUpdateInfo> {
        self.links_hub.subscribe()
    }

    /// Drops every open space index. Handles held elsewhere stay valid.
    pub fn close(&self) {
        let mut spaces = self.spaces.lock();
        info!("closing object store with {} open spaces", spaces.len());
        spaces.clear();
    }
}

impl Component for ObjectStore {
    fn name(&self) -> &'static str {
        "objectstore"
    }

    fn init(&self, app: &App) -> Result<()> {
        if self.fts.is_some() {
            app.component::<FtSearch>()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        ObjectStore::close(self);
        Ok(())
    }
}
