use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::app::{App, Component};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::domain::relation::FULLTEXT_KEYS;
use crate::domain::{keys, Details};
use crate::error::{EngineError, Result};
use crate::ftsearch::{AutoBatcher, DocPath, FtSearch, SearchDoc};
use crate::objectstore::ObjectStore;
use crate::source::SourceRegistry;
use crate::spaceindex::SpaceIndex;

struct Worker {
    store: Arc<ObjectStore>,
    fts: Arc<FtSearch>,
    registry: Option<Arc<SourceRegistry>>,
    batch_size: usize,
    max_docs: usize,
    max_bytes: usize,
}

/// Background drain of the full-text queue into the search index.
pub struct FulltextIndexer {
    worker: Arc<Worker>,
    interval: Duration,
    ctx: Context,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FulltextIndexer {
    /// `registry` lets the worker split documents into per-block entries;
    /// without it only relation values are indexed.
    pub fn new(
        config: &EngineConfig,
        store: Arc<ObjectStore>,
        fts: Arc<FtSearch>,
        registry: Option<Arc<SourceRegistry>>,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                fts,
                registry,
                batch_size: config.fulltext_batch_size.max(1),
                max_docs: config.fts_max_docs,
                max_bytes: config.fts_max_bytes,
            }),
            interval: config.fulltext_interval(),
            ctx: Context::new(),
            handle: Mutex::new(None),
        }
    }

    /// Starts the periodic drain. Calling it twice is a no-op.
    pub fn run(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        let worker = self.worker.clone();
        let ctx = self.ctx.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("fulltext-indexer".into())
            .spawn(move || {
                while !ctx.wait(interval) {
                    match worker.drain(&ctx) {
                        Ok(0) | Err(EngineError::Cancelled) => {}
                        Ok(n) => debug!("full-text indexer processed {n} ids"),
                        Err(e) => warn!("full-text indexing failed: {e}"),
                    }
                }
                debug!("full-text indexer stopped");
            })?;
        *handle = Some(spawned);
        info!("full-text indexer started, interval {:?}", self.interval);
        Ok(())
    }

    /// Processes everything queued right now on the calling thread.
    pub fn drain(&self, ctx: &Context) -> Result<usize> {
        self.worker.drain(ctx)
    }

    /// Stops the worker and waits for the batch in flight.
    pub fn close(&self) {
        self.ctx.cancel();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("full-text indexer thread panicked");
            }
        }
    }
}

impl Drop for FulltextIndexer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Worker {
    fn drain(&self, ctx: &Context) -> Result<usize> {
        self.store
            .common()
            .batch_process_full_text_queue(ctx, self.batch_size, |ids| self.index_batch(ctx, ids))
    }

    /// Replaces every doc of `ids`. Objects that are gone or deleted end up
    /// with no docs at all.
    fn index_batch(&self, ctx: &Context, ids: &[String]) -> Result<()> {
        let mut batcher = self.fts.new_auto_batcher(self.max_docs, self.max_bytes);
        for id in ids {
            ctx.check()?;
            batcher.delete_doc(id);
            let space_id = match self.store.common().resolve_space_id(id) {
                Ok(space_id) => space_id,
                Err(e) if e.is_not_found() => {
                    debug!("{id} has no space, dropping its docs");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(space) = self.store.existing_space_index(&space_id)? else {
                continue;
            };
            let details = space.get_details(id)?;
            if details.len() <= 1 || details.get_bool(keys::IS_DELETED) {
                continue;
            }
            self.emit_docs(&mut batcher, &space, id, &space_id, &details)?;
        }
        batcher.finish()
    }

    fn emit_docs(
        &self,
        batcher: &mut AutoBatcher<'_>,
        space: &SpaceIndex,
        id: &str,
        space_id: &str,
        details: &Details,
    ) -> Result<()> {
        let blocks = self.text_blocks(space_id, id);
        for key in FULLTEXT_KEYS {
            let value = if *key == keys::SNIPPET {
                if !blocks.is_empty() {
                    continue;
                }
                // The snippet lives in its own table, not in the details.
                match details.get_str(key) {
                    Some(v) => v.to_string(),
                    None => space.get_snippet(id)?,
                }
            } else {
                match details.get_str(key) {
                    Some(v) => v.to_string(),
                    None => continue,
                }
            };
            if value.trim().is_empty() {
                continue;
            }
            let doc_id = DocPath::relation(id, key);
            let doc = if *key == keys::NAME {
                SearchDoc::new(&doc_id, space_id, &value, "")
            } else {
                SearchDoc::new(&doc_id, space_id, "", &value)
            };
            batcher.update_doc(doc)?;
        }
        for (block_id, text) in blocks {
            batcher.update_doc(SearchDoc::new(&DocPath::block(id, &block_id), space_id, "", &text))?;
        }
        Ok(())
    }

    fn text_blocks(&self, space_id: &str, id: &str) -> Vec<(String, String)> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        match registry.new_source(space_id, id).and_then(|s| s.read_doc(None)) {
            Ok(state) => state.text_blocks(),
            Err(e) => {
                debug!("no document for {id}, indexing relations only: {e}");
                Vec::new()
            }
        }
    }
}

impl Component for FulltextIndexer {
    fn name(&self) -> &'static str {
        "fulltext"
    }

    fn init(&self, app: &App) -> Result<()> {
        app.component::<ObjectStore>()?;
        app.component::<FtSearch>()?;
        if self.worker.registry.is_some() {
            app.component::<SourceRegistry>()?;
        }
        Ok(())
    }

    fn run(&self, _ctx: &Context) -> Result<()> {
        FulltextIndexer::run(self)
    }

    fn close(&self) -> Result<()> {
        FulltextIndexer::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftsearch::HighlightFormat;

    struct Fixture {
        store: Arc<ObjectStore>,
        fts: Arc<FtSearch>,
        indexer: FulltextIndexer,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            map_size: 16 * 1024 * 1024,
            fulltext_interval_ms: 20,
            ..EngineConfig::default()
        }
        .with_repo_path(dir.path());
        let fts = Arc::new(FtSearch::open(&config).unwrap());
        let store = Arc::new(ObjectStore::open(&config, Some(fts.clone())).unwrap());
        let indexer = FulltextIndexer::new(&config, store.clone(), fts.clone(), None);
        Fixture {
            store,
            fts,
            indexer,
            _dir: dir,
        }
    }

    fn put(fx: &Fixture, id: &str, name: &str, description: &str) {
        let space = fx.store.space_index("space1").unwrap();
        let mut d = Details::with_id(id);
        d.set(keys::NAME, name);
        d.set(keys::DESCRIPTION, description);
        space.update_object_details(&Context::new(), id, d).unwrap();
        space.update_object_snippet(id, description).unwrap();
    }

    fn hit_ids(fx: &Fixture, text: &str) -> Vec<String> {
        let mut ids: Vec<String> = fx
            .fts
            .search(&["space1".to_string()], HighlightFormat::Text, text)
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_drain_indexes_relation_docs() {
        let fx = fixture();
        put(&fx, "obj1", "Groceries", "buy oranges");
        assert_eq!(fx.store.common().full_text_queue_len().unwrap(), 1);

        assert_eq!(fx.indexer.drain(&Context::new()).unwrap(), 1);
        assert_eq!(fx.store.common().full_text_queue_len().unwrap(), 0);
        assert!(fx.fts.has_doc("obj1/r/name"));
        assert!(fx.fts.has_doc("obj1/r/description"));
        assert!(fx.fts.has_doc("obj1/r/snippet"));
        assert_eq!(hit_ids(&fx, "groceries"), vec!["obj1/r/name".to_string()]);
    }

    #[test]
    fn test_snippet_table_feeds_snippet_doc() {
        let fx = fixture();
        let space = fx.store.space_index("space1").unwrap();
        let mut d = Details::with_id("obj2");
        d.set(keys::NAME, "Notes");
        space.update_object_details(&Context::new(), "obj2", d).unwrap();
        space.update_object_snippet("obj2", "pick up parcels").unwrap();
        assert_eq!(space.get_details("obj2").unwrap().get_str(keys::SNIPPET), None);

        fx.indexer.drain(&Context::new()).unwrap();
        assert!(fx.fts.has_doc("obj2/r/snippet"));
        assert_eq!(hit_ids(&fx, "parcels"), vec!["obj2/r/snippet".to_string()]);
    }

    #[test]
    fn test_reindex_replaces_stale_docs() {
        let fx = fixture();
        put(&fx, "obj1", "First", "");
        fx.indexer.drain(&Context::new()).unwrap();
        assert!(fx.fts.has_doc("obj1/r/name"));

        let space = fx.store.space_index("space1").unwrap();
        let mut d = Details::with_id("obj1");
        d.set(keys::DESCRIPTION, "only a description");
        space.update_object_details(&Context::new(), "obj1", d).unwrap();
        fx.store.common().add_to_index_queue(&["obj1".to_string()]).unwrap();
        fx.indexer.drain(&Context::new()).unwrap();

        assert!(!fx.fts.has_doc("obj1/r/name"));
        assert!(fx.fts.has_doc("obj1/r/description"));
    }

    #[test]
    fn test_unknown_and_deleted_objects_have_no_docs() {
        let fx = fixture();
        put(&fx, "obj1", "Doomed", "");
        fx.indexer.drain(&Context::new()).unwrap();
        fx.store.space_index("space1").unwrap().delete_object("obj1").unwrap();
        fx.store
            .common()
            .add_to_index_queue(&["obj1".to_string(), "ghost".to_string()])
            .unwrap();

        assert_eq!(fx.indexer.drain(&Context::new()).unwrap(), 2);
        let mut count = 0;
        fx.fts.iterate("obj1", |_| {
            count += 1;
            true
        });
        assert_eq!(count, 0);
    }

    #[test]
    fn test_background_worker_drains_queue() {
        let fx = fixture();
        fx.indexer.run().unwrap();
        fx.indexer.run().unwrap();
        put(&fx, "obj1", "Background", "");
        for _ in 0..200 {
            if fx.fts.has_doc("obj1/r/name") {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        fx.indexer.close();
        assert!(fx.fts.has_doc("obj1/r/name"));
    }
}
