use std::sync::Arc;

use log::{debug, info, warn};

use super::ObjectIndexer;
use crate::app::{App, Component};
use crate::bundle;
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::objectstore::{Checksums, ObjectStore};
use crate::objecttree::SpaceService;
use crate::source::SourceRegistry;

/// Space holding the bundled relation and type records.
pub const MARKETPLACE_SPACE_ID: &str = "_anytype_marketplace";

const OBJECTS_FORCE_REINDEX_COUNTER: i32 = 1;
const FILES_FORCE_REINDEX_COUNTER: i32 = 1;
const BUNDLED_TEMPLATES: i32 = 1;
const BUNDLED_OBJECTS: i32 = 1;
const BUNDLED_LAYOUTS: i32 = 1;
const FILESTORE_KEYS_FORCE_REINDEX_COUNTER: i32 = 1;
const FULLTEXT_REBUILD: i32 = 1;
const IDX_REBUILD_COUNTER: i32 = 1;

/// Counters every space is brought up to.
pub fn target_checksums() -> Checksums {
    Checksums {
        objects_force_reindex_counter: OBJECTS_FORCE_REINDEX_COUNTER,
        files_force_reindex_counter: FILES_FORCE_REINDEX_COUNTER,
        bundled_templates: BUNDLED_TEMPLATES,
        bundled_objects: BUNDLED_OBJECTS,
        bundled_relations: bundle::RELATIONS_CHECKSUM,
        bundled_types: bundle::TYPES_CHECKSUM,
        bundled_layouts: BUNDLED_LAYOUTS,
        filestore_keys_force_reindex_counter: FILESTORE_KEYS_FORCE_REINDEX_COUNTER,
        fulltext_rebuild: FULLTEXT_REBUILD,
        idx_rebuild_counter: IDX_REBUILD_COUNTER,
    }
}

/// What one [`ReindexDriver::reindex_space`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexReport {
    pub objects: usize,
    pub fulltext_enqueued: usize,
    pub indices_rebuilt: bool,
    pub bundled: usize,
}

impl ReindexReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct ReindexDriver {
    store: Arc<ObjectStore>,
    registry: Arc<SourceRegistry>,
    indexer: Arc<ObjectIndexer>,
    spaces: Arc<dyn SpaceService>,
}

impl ReindexDriver {
    pub fn new(
        store: Arc<ObjectStore>,
        registry: Arc<SourceRegistry>,
        indexer: Arc<ObjectIndexer>,
        spaces: Arc<dyn SpaceService>,
    ) -> Self {
        Self {
            store,
            registry,
            indexer,
            spaces,
        }
    }

    /// Runs the passes whose stored counter is behind the target and
    /// persists the target afterwards. A cancelled run leaves the stored
    /// counters untouched so the next start repeats it.
    pub fn reindex_space(&self, ctx: &Context, space_id: &str) -> Result<ReindexReport> {
        let common = self.store.common();
        let stored = common.get_checksums(space_id)?.unwrap_or_default();
        let target = target_checksums();
        let mut report = ReindexReport::default();

        if stored.objects_force_reindex_counter < target.objects_force_reindex_counter {
            report.objects = self.reindex_objects(ctx, space_id)?;
        }
        if stored.bundled_relations < target.bundled_relations || stored.bundled_types < target.bundled_types {
            report.bundled = self.write_bundled(ctx, space_id)?;
        }
        if stored.fulltext_rebuild < target.fulltext_rebuild {
            let ids = self.store.space_index(space_id)?.list_ids()?;
            common.add_to_index_queue(&ids)?;
            report.fulltext_enqueued = ids.len();
        }
        if stored.idx_rebuild_counter < target.idx_rebuild_counter {
            self.store.space_index(space_id)?.rebuild_indices()?;
            report.indices_rebuilt = true;
        }

        ctx.check()?;
        if stored != target {
            common.save_checksums(space_id, &target)?;
        }
        if !report.is_empty() {
            info!("reindexed space {space_id}: {report:?}");
        }
        Ok(report)
    }

    /// Opens every space found on disk and brings each one up to date. The
    /// marketplace space is included when `bundled` is set. Failures of one
    /// space are logged and do not stop the others.
    pub fn reindex_all(&self, ctx: &Context, bundled: bool) -> Result<usize> {
        self.store.preload_spaces()?;
        let mut space_ids = self.store.space_ids();
        if bundled && !space_ids.iter().any(|s| s == MARKETPLACE_SPACE_ID) {
            space_ids.push(MARKETPLACE_SPACE_ID.to_string());
        }
        let mut done = 0;
        for space_id in space_ids {
            match self.reindex_space(ctx, &space_id) {
                Ok(_) => done += 1,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => warn!("reindex of space {space_id} failed: {e}"),
            }
        }
        Ok(done)
    }

    fn reindex_objects(&self, ctx: &Context, space_id: &str) -> Result<usize> {
        let builder = match self.spaces.get_space(space_id) {
            Ok(space) => space.tree_builder(),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let Some(builder) = builder else {
            debug!("space {space_id} has no trees to reindex");
            return Ok(0);
        };

        let mut indexed = 0;
        for id in builder.stored_ids() {
            ctx.check()?;
            let outcome = self
                .registry
                .new_source(space_id, &id)
                .and_then(|source| self.indexer.reindex(ctx, source.as_ref()));
            match outcome {
                Ok(_) => indexed += 1,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => warn!("failed to reindex {id} in {space_id}: {e}"),
            }
        }
        Ok(indexed)
    }

    fn write_bundled(&self, ctx: &Context, space_id: &str) -> Result<usize> {
        if space_id != MARKETPLACE_SPACE_ID {
            return Ok(0);
        }
        let space = self.store.space_index(space_id)?;
        let records = bundle::RELATIONS
            .iter()
            .map(|r| r.details())
            .chain(bundle::TYPES.iter().map(|t| t.details()));
        let mut written = 0;
        for details in records {
            let Some(id) = details.id().map(str::to_string) else {
                continue;
            };
            match space.update_object_details(ctx, &id, details) {
                Ok(()) => written += 1,
                Err(EngineError::DetailsNotChanged) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

impl Component for ReindexDriver {
    fn name(&self) -> &'static str {
        "reindexer"
    }

    fn init(&self, app: &App) -> Result<()> {
        app.component::<ObjectStore>()?;
        app.component::<SourceRegistry>()?;
        app.component::<ObjectIndexer>()?;
        Ok(())
    }

    /// Brings every space on disk up to date before the workers start.
    fn run(&self, ctx: &Context) -> Result<()> {
        self.reindex_all(ctx, self.store.config().index_bundled_objects)?;
        Ok(())
    }
}
