//! Smart-block type of an object id.
//!
//! Resolution order: static registrations, virtual id prefixes, the in-memory
//! cache, the persisted `smartblock_types` table, the id's CID codec, and
//! finally the payload of the tree root fetched through the owning space.
//! Everything except statics and tentative answers is cached and persisted.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::app::{App, Component};
use crate::domain::cid;
use crate::domain::ids::VirtualId;
use crate::domain::SmartBlockType;
use crate::error::{EngineError, Result};
use crate::objectstore::{CommonStore, ObjectStore};
use crate::objecttree::{decode_root_payload, SpaceService};

pub struct TypeProvider {
    common: Arc<CommonStore>,
    spaces: Arc<dyn SpaceService>,
    statics: RwLock<HashMap<String, SmartBlockType>>,
    cache: RwLock<HashMap<String, SmartBlockType>>,
}

impl TypeProvider {
    pub fn new(common: Arc<CommonStore>, spaces: Arc<dyn SpaceService>) -> Self {
        Self {
            common,
            spaces,
            statics: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Overrides every other lookup for `id`.
    pub fn register_static(&self, id: &str, sb_type: SmartBlockType) {
        self.statics.write().insert(id.to_string(), sb_type);
    }

    pub fn unregister_static(&self, id: &str) {
        self.statics.write().remove(id);
    }

    pub fn type_by_id(&self, space_id: &str, id: &str) -> Result<SmartBlockType> {
        if let Some(sb) = self.statics.read().get(id) {
            return Ok(*sb);
        }
        if let Some(virtual_id) = VirtualId::parse(id) {
            return Ok(virtual_id.smartblock_type());
        }
        if let Some(sb) = self.cache.read().get(id) {
            return Ok(*sb);
        }
        if let Some(sb) = self.common.get_smartblock_type(id)? {
            self.cache.write().insert(id.to_string(), sb);
            return Ok(sb);
        }

        match cid::decode(id) {
            Some(info) if info.is_file() => {
                self.remember(id, SmartBlockType::File)?;
                Ok(SmartBlockType::File)
            }
            Some(info) if info.is_tree_root() => match self.from_root(space_id, id) {
                Ok((sb, _)) => {
                    self.remember(id, sb)?;
                    Ok(sb)
                }
                Err(err) => {
                    debug!("tree root of {id} unavailable ({err}), assuming page");
                    Ok(SmartBlockType::Page)
                }
            },
            _ => {
                let (sb, _) = self.from_root(space_id, id)?;
                self.remember(id, sb)?;
                Ok(sb)
            }
        }
    }

    /// Type plus the unique-key internal key carried by the tree root.
    /// Bundled ids yield their bundle key.
    pub fn type_and_key(&self, space_id: &str, id: &str) -> Result<(SmartBlockType, String)> {
        match VirtualId::parse(id) {
            Some(VirtualId::BundledRelation(key)) => Ok((SmartBlockType::BundledRelation, key)),
            Some(VirtualId::BundledType(key)) => Ok((SmartBlockType::BundledObjectType, key)),
            Some(other) => Ok((other.smartblock_type(), String::new())),
            None => {
                let (sb, key) = self.from_root(space_id, id)?;
                self.remember(id, sb)?;
                Ok((sb, key))
            }
        }
    }

    fn from_root(&self, space_id: &str, id: &str) -> Result<(SmartBlockType, String)> {
        let space = self.spaces.get_space(space_id)?;
        let builder = space
            .tree_builder()
            .ok_or_else(|| EngineError::SpaceWithoutTreeBuilder(space_id.to_string()))?;
        let root = builder.tree_root(id)?;
        let payload = decode_root_payload(&root)?;
        Ok((payload.smartblock_type, payload.key))
    }

    fn remember(&self, id: &str, sb: SmartBlockType) -> Result<()> {
        self.cache.write().insert(id.to_string(), sb);
        self.common.set_smartblock_type(id, sb)
    }
}

impl Component for TypeProvider {
    fn name(&self) -> &'static str {
        "typeprovider"
    }

    fn init(&self, app: &App) -> Result<()> {
        app.component::<ObjectStore>()?;
        Ok(())
    }
}
