//! Source dispatch and reference-counted open sources.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use super::{Source, StoreSource, TreeSource, VirtualSource};
use crate::app::{App, Component};
use crate::error::{EngineError, Result};
use crate::objectstore::{CommonStore, ObjectStore};
use crate::objecttree::{KeyValueService, SpaceService};
use crate::typeprovider::TypeProvider;

struct OpenSource {
    source: Arc<dyn Source>,
    leases: usize,
}

type OpenMap = Arc<Mutex<HashMap<String, OpenSource>>>;

pub struct SourceRegistry {
    common: Arc<CommonStore>,
    spaces: Arc<dyn SpaceService>,
    types: Arc<TypeProvider>,
    tech_space_id: String,
    statics: RwLock<HashMap<String, Arc<dyn Source>>>,
    open: OpenMap,
}

impl SourceRegistry {
    pub fn new(
        common: Arc<CommonStore>,
        spaces: Arc<dyn SpaceService>,
        types: Arc<TypeProvider>,
        tech_space_id: &str,
    ) -> Self {
        Self {
            common,
            spaces,
            types,
            tech_space_id: tech_space_id.to_string(),
            statics: RwLock::new(HashMap::new()),
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn type_provider(&self) -> &Arc<TypeProvider> {
        &self.types
    }

    /// Builds a fresh source for `id`.
    ///
    /// Virtual prefixes win, then static registrations, then the type
    /// provider decides between a store and a plain tree source.
    pub fn new_source(&self, space_id: &str, id: &str) -> Result<Arc<dyn Source>> {
        if let Some(source) = VirtualSource::parse(space_id, id) {
            return Ok(Arc::new(source));
        }
        if let Some(source) = self.statics.read().get(id) {
            return Ok(source.clone());
        }

        let sb_type = self.types.type_by_id(space_id, id)?;
        let space = self.spaces.get_space(space_id)?;
        let builder = space
            .tree_builder()
            .ok_or_else(|| EngineError::SpaceWithoutTreeBuilder(space_id.to_string()))?;
        let tree = builder.build_tree(id)?;
        self.common.bind_id(id, space_id)?;

        let source: Arc<dyn Source> = if sb_type.is_store_backed() {
            let key_value = self.tech_key_value().or_else(|| space.key_value());
            StoreSource::new(space_id, tree, key_value)?
        } else {
            TreeSource::new(space_id, tree)?
        };
        debug!("built {:?} source for {id} in {space_id}", source.kind());
        Ok(source)
    }

    /// Serves `source` for its id from now on and binds the id to its space.
    pub fn register_static(&self, source: Arc<dyn Source>) -> Result<()> {
        self.common.bind_id(source.id(), source.space_id())?;
        self.types.register_static(source.id(), source.smartblock_type());
        self.statics.write().insert(source.id().to_string(), source);
        Ok(())
    }

    pub fn unregister_static(&self, id: &str) {
        self.types.unregister_static(id);
        self.statics.write().remove(id);
    }

    /// Shared handle on the open source of `id`, building it on first use.
    pub fn acquire(&self, space_id: &str, id: &str) -> Result<SourceLease> {
        let mut open = self.open.lock();
        if let Some(entry) = open.get_mut(id) {
            if entry.source.space_id() != space_id {
                return Err(EngineError::SpaceMismatch {
                    id: id.to_string(),
                    existing: entry.source.space_id().to_string(),
                    requested: space_id.to_string(),
                });
            }
            entry.leases += 1;
            return Ok(SourceLease {
                id: id.to_string(),
                source: entry.source.clone(),
                open: self.open.clone(),
            });
        }

        let source = self.new_source(space_id, id)?;
        open.insert(
            id.to_string(),
            OpenSource {
                source: source.clone(),
                leases: 1,
            },
        );
        Ok(SourceLease {
            id: id.to_string(),
            source,
            open: self.open.clone(),
        })
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.open.lock().contains_key(id)
    }

    /// Number of sources held by at least one lease.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Closes every open source regardless of outstanding leases.
    pub fn close_all(&self) {
        let drained: Vec<OpenSource> = self.open.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            if let Err(e) = entry.source.close() {
                warn!("failed to close source {}: {e}", entry.source.id());
            }
        }
    }

    fn tech_key_value(&self) -> Option<Arc<dyn KeyValueService>> {
        self.spaces
            .get_space(&self.tech_space_id)
            .ok()
            .and_then(|space| space.key_value())
    }
}

/// Counted reference to an open source. The source is closed when the last
/// lease is dropped.
pub struct SourceLease {
    id: String,
    source: Arc<dyn Source>,
    open: OpenMap,
}

impl SourceLease {
    pub fn source(&self) -> Arc<dyn Source> {
        self.source.clone()
    }
}

impl Deref for SourceLease {
    type Target = dyn Source;

    fn deref(&self) -> &Self::Target {
        self.source.as_ref()
    }
}

/// Leases only count against the entry they were issued for; a source reopened
/// under the same id after `close_all` is a different entry.
fn same_source(a: &Arc<dyn Source>, b: &Arc<dyn Source>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Clone for SourceLease {
    fn clone(&self) -> Self {
        if let Some(entry) = self.open.lock().get_mut(&self.id) {
            if same_source(&entry.source, &self.source) {
                entry.leases += 1;
            }
        }
        Self {
            id: self.id.clone(),
            source: self.source.clone(),
            open: self.open.clone(),
        }
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        let closing = {
            let mut open = self.open.lock();
            let last = match open.get_mut(&self.id) {
                Some(entry) if same_source(&entry.source, &self.source) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    entry.leases == 0
                }
                _ => false,
            };
            if last {
                open.remove(&self.id).map(|e| e.source)
            } else {
                None
            }
        };
        if let Some(source) = closing {
            if let Err(e) = source.close() {
                warn!("failed to close source {}: {e}", self.id);
            }
        }
    }
}

impl Component for SourceRegistry {
    fn name(&self) -> &'static str {
        "source"
    }

    fn init(&self, app: &App) -> Result<()> {
        app.component::<TypeProvider>()?;
        app.component::<ObjectStore>()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.close_all();
        Ok(())
    }
}
