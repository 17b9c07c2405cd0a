//! # Engine
//!
//! Process-wide entry point that owns every component of the local object
//! engine and drives their lifecycle through [`App`].
//!
//! Components are registered in dependency order:
//!
//! 1. full-text index
//! 2. object store
//! 3. type provider
//! 4. source registry
//! 5. object indexer
//! 6. reindex driver, which brings every space on disk up to date
//! 7. full-text worker
//! 8. backlinks watcher
//!
//! [`Engine::close`] stops them in reverse order.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::app::{App, DependencyGraph};
use crate::backlinks::{BacklinksWatcher, EditorBoundary, RegistryEditor};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::database::{Filter, QueryResult};
use crate::domain::Details;
use crate::error::Result;
use crate::ftsearch::{FtSearch, HighlightFormat, SearchHit};
use crate::indexer::{FulltextIndexer, IndexOutcome, ObjectIndexer, ReindexDriver};
use crate::objectstore::ObjectStore;
use crate::objecttree::memory::MemorySpaceService;
use crate::objecttree::SpaceService;
use crate::source::SourceRegistry;
use crate::typeprovider::TypeProvider;

pub struct Engine {
    config: EngineConfig,
    ctx: Context,
    app: App,
    spaces: Arc<dyn SpaceService>,
    store: Arc<ObjectStore>,
    fts: Arc<FtSearch>,
    registry: Arc<SourceRegistry>,
    indexer: Arc<ObjectIndexer>,
    fulltext: Arc<FulltextIndexer>,
    backlinks: Arc<BacklinksWatcher>,
    closed: Mutex<bool>,
}

impl Engine {
    /// Opens the engine with no remote spaces attached. Objects written
    /// straight into the store are still indexed, queried and searched.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, Arc::new(MemorySpaceService::default()), None)
    }

    /// Opens the engine over `spaces`. Without an `editor`, objects leased
    /// from the source registry count as open for the backlinks watcher.
    pub fn open_with(
        config: EngineConfig,
        spaces: Arc<dyn SpaceService>,
        editor: Option<Arc<dyn EditorBoundary>>,
    ) -> Result<Self> {
        info!("opening engine at {}", config.repo_path.display());
        let fts = Arc::new(FtSearch::open(&config)?);
        let store = Arc::new(ObjectStore::open(&config, Some(fts.clone()))?);
        let types = Arc::new(TypeProvider::new(store.common().clone(), spaces.clone()));
        let registry = Arc::new(SourceRegistry::new(
            store.common().clone(),
            spaces.clone(),
            types.clone(),
            &config.tech_space_id,
        ));
        let indexer = Arc::new(ObjectIndexer::new(store.clone()));
        let reindexer = Arc::new(ReindexDriver::new(
            store.clone(),
            registry.clone(),
            indexer.clone(),
            spaces.clone(),
        ));
        let fulltext = Arc::new(FulltextIndexer::new(
            &config,
            store.clone(),
            fts.clone(),
            Some(registry.clone()),
        ));
        let editor = editor.unwrap_or_else(|| Arc::new(RegistryEditor::new(registry.clone())));
        let backlinks = Arc::new(BacklinksWatcher::new(&config, store.clone(), editor));

        let mut app = match &config.dependency_graph_path {
            Some(path) => App::new().with_dependency_graph(path.clone()),
            None => App::new(),
        };
        app.register(fts.clone())
            .register(store.clone())
            .register(types)
            .register(registry.clone())
            .register(indexer.clone())
            .register(reindexer)
            .register(fulltext.clone())
            .register(backlinks.clone());

        let ctx = Context::new();
        app.start(&ctx)?;
        info!("engine started with components {:?}", app.names());

        Ok(Self {
            config,
            ctx,
            app,
            spaces,
            store,
            fts,
            registry,
            indexer,
            fulltext,
            backlinks,
            closed: Mutex::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn spaces(&self) -> &Arc<dyn SpaceService> {
        &self.spaces
    }

    pub fn object_store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn full_text(&self) -> &Arc<FtSearch> {
        &self.fts
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn indexer(&self) -> &Arc<ObjectIndexer> {
        &self.indexer
    }

    pub fn fulltext_indexer(&self) -> &Arc<FulltextIndexer> {
        &self.fulltext
    }

    pub fn backlinks(&self) -> &Arc<BacklinksWatcher> {
        &self.backlinks
    }

    /// Recorded when `dependency_graph_path` is configured.
    pub fn dependency_graph(&self) -> Option<DependencyGraph> {
        self.app.dependency_graph()
    }

    /// Details of `id` from whichever space it is bound to.
    pub fn get_details(&self, id: &str) -> Result<Details> {
        self.store.get_details(id)
    }

    pub fn query_space_views(&self, filters: Vec<Filter>) -> Result<QueryResult> {
        self.store.query_space_views(filters)
    }

    pub fn search(&self, space_ids: &[String], text: &str, format: HighlightFormat) -> Result<Vec<SearchHit>> {
        self.fts.search(space_ids, format, text)
    }

    /// Opens `id` through the registry and indexes its current state.
    pub fn index_object(&self, space_id: &str, id: &str) -> Result<IndexOutcome> {
        let lease = self.registry.acquire(space_id, id)?;
        self.indexer.index(&self.ctx, &*lease)
    }

    /// Applies pending backlink diffs and drains the full-text queue now.
    pub fn flush(&self) -> Result<()> {
        self.backlinks.flush_updates();
        self.fulltext.drain(&self.ctx)?;
        Ok(())
    }

    /// Stops every component in reverse start order. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.ctx.cancel();
        let result = self.app.close();
        info!("engine closed");
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("engine close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Block, ChangeContent, ChangePayload};
    use crate::domain::{keys, SmartBlockType};
    use crate::indexer::MARKETPLACE_SPACE_ID;
    use crate::objecttree::memory::{MemorySpace, MemoryTreeBuilder};
    use crate::objecttree::ReadableObjectTree;
    use crate::source::PushChangeParams;

    fn config(dir: &tempfile::TempDir) -> EngineConfig {
        EngineConfig {
            map_size: 16 * 1024 * 1024,
            backlinks_aggregation_ms: 20,
            fulltext_interval_ms: 60_000,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path())
    }

    #[test]
    fn test_open_registers_components_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.dependency_graph_path = Some(dir.path().join("deps.dot"));
        let engine = Engine::open(cfg).unwrap();

        let graph = engine.dependency_graph().unwrap();
        assert!(graph.cycles().is_empty());
        let (order, stuck) = graph.start_order();
        assert!(stuck.is_empty());
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("objectstore") < pos("backlinks"));
        assert!(pos("source") < pos("reindexer"));
        assert!(pos("ftsearch") < pos("fulltext"));
        assert!(dir.path().join("deps.dot").exists());

        assert!(engine.object_store().space_ids().contains(&MARKETPLACE_SPACE_ID.to_string()));
        engine.close().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_tree_object_flows_to_store_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MemoryTreeBuilder::new("alice"));
        let spaces = Arc::new(MemorySpaceService::default());
        spaces.add(Arc::new(MemorySpace::new("space1", builder.clone())));
        let engine = Engine::open_with(config(&dir), spaces, None).unwrap();

        let tree = builder
            .create_memory_tree(
                ChangePayload {
                    smartblock_type: SmartBlockType::Page,
                    key: String::new(),
                },
                1_700_000_000,
            )
            .unwrap();
        let id = tree.id();
        {
            let lease = engine.sources().acquire("space1", &id).unwrap();
            lease
                .push_change(PushChangeParams::with_content(vec![
                    ChangeContent::details_set(keys::NAME, "Weekly plan"),
                    ChangeContent::BlockCreate {
                        target_id: String::new(),
                        blocks: vec![Block::text("t1", "water the ficus")],
                    },
                ]))
                .unwrap();
        }

        assert_eq!(engine.index_object("space1", &id).unwrap(), IndexOutcome::Indexed);
        engine.flush().unwrap();

        assert_eq!(engine.get_details(&id).unwrap().get_str(keys::NAME), Some("Weekly plan"));
        let hits = engine
            .search(&["space1".to_string()], "ficus", HighlightFormat::Text)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, format!("{id}/b/t1"));
        engine.close().unwrap();
    }
}
