use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{push_timestamp, ChangeReceiver, CreationInfo, PushChangeParams, Source, SourceKind};
use crate::change::{marshal_store_change, unmarshal_store_change, ChangeContent, FileKeys, StoreChange, StoreOp};
use crate::domain::ids::{bundled_type_id, participant_id};
use crate::domain::smartblock::layout;
use crate::domain::{keys, Details, SmartBlockType};
use crate::error::{EngineError, Result};
use crate::objecttree::{AddContent, KeyValueService, ObjectTree, RawTreeChange, ReadableObjectTree, UpdateListener};
use crate::state::{apply_state_fast_one, State};

/// Collections of documents folded from store changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    collections: BTreeMap<String, BTreeMap<String, Details>>,
    applied: HashSet<String>,
    order: Vec<String>,
}

impl StoreState {
    /// Applies every op of `change`. Ops that do not fit the current state are
    /// logged and skipped; a change is applied at most once.
    pub fn apply(&mut self, change_id: &str, change: &StoreChange) -> bool {
        if !self.applied.insert(change_id.to_string()) {
            return false;
        }
        self.order.push(change_id.to_string());
        for op in &change.ops {
            if let Err(e) = self.apply_op(op) {
                warn!("skipping store op of change {change_id}: {e}");
            }
        }
        true
    }

    fn apply_op(&mut self, op: &StoreOp) -> Result<()> {
        match op {
            StoreOp::Create { collection, id, doc } => {
                let docs = self.collections.entry(collection.clone()).or_default();
                if docs.contains_key(id) {
                    return Err(EngineError::Validation(format!("document {id} already exists in {collection}")));
                }
                let mut doc = doc.clone();
                doc.set(keys::ID, id.as_str());
                docs.insert(id.clone(), doc);
            }
            StoreOp::Modify {
                collection,
                id,
                key,
                value,
            } => {
                if key == keys::ID {
                    return Err(EngineError::Validation("document id is immutable".into()));
                }
                let doc = self
                    .collections
                    .get_mut(collection)
                    .and_then(|docs| docs.get_mut(id))
                    .ok_or_else(|| EngineError::not_found(format!("document {id} in {collection}")))?;
                doc.set(key, value.clone());
            }
            StoreOp::Delete { collection, id } => {
                if let Some(docs) = self.collections.get_mut(collection) {
                    docs.remove(id);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Details> {
        self.collections.get(collection)?.get(id)
    }

    /// Documents of `collection` ordered by id.
    pub fn collection(&self, collection: &str) -> Vec<&Details> {
        self.collections
            .get(collection)
            .map(|docs| docs.values().collect())
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    pub fn is_applied(&self, change_id: &str) -> bool {
        self.applied.contains(change_id)
    }

    /// Change ids in the order they were folded in.
    pub fn applied_order(&self) -> &[String] {
        &self.order
    }
}

pub type UpdateHook = Arc<dyn Fn(&StoreState) + Send + Sync>;

/// Chat-like objects whose content lives in collections rather than blocks.
///
/// The document half is synthetic (type, layout and visibility only); the
/// collections are folded from [`StoreChange`]s in tree order.
pub struct StoreSource {
    id: String,
    space_id: String,
    sb_type: SmartBlockType,
    tree: Arc<dyn ObjectTree>,
    store: Mutex<StoreState>,
    on_update: Mutex<Option<UpdateHook>>,
    key_value: Option<Arc<dyn KeyValueService>>,
}

impl StoreSource {
    pub fn new(
        space_id: &str,
        tree: Arc<dyn ObjectTree>,
        key_value: Option<Arc<dyn KeyValueService>>,
    ) -> Result<Arc<Self>> {
        let header = tree.header()?;
        let sb_type = header.payload.smartblock_type;
        if !sb_type.is_store_backed() {
            return Err(EngineError::Validation(format!("{sb_type:?} is not a store type")));
        }
        let source = Arc::new(Self {
            id: tree.id(),
            space_id: space_id.to_string(),
            sb_type,
            tree,
            store: Mutex::new(StoreState::default()),
            on_update: Mutex::new(None),
            key_value,
        });
        let weak: Weak<StoreSource> = Arc::downgrade(&source);
        let listener: Weak<dyn UpdateListener> = weak;
        source.tree.set_listener(listener);
        Ok(source)
    }

    /// Folds every store change into a fresh state. `on_update` runs after
    /// each later fold caused by local pushes or remote changes.
    pub fn read_store_doc(&self, on_update: Option<UpdateHook>) -> Result<StoreState> {
        if on_update.is_some() {
            *self.on_update.lock() = on_update;
        }
        let mut fresh = StoreState::default();
        self.fold(self.tree.as_ref(), &mut fresh)?;
        *self.store.lock() = fresh.clone();
        Ok(fresh)
    }

    pub fn store_state(&self) -> StoreState {
        self.store.lock().clone()
    }

    /// Appends a store change to the tree and folds it into the state.
    pub fn push_store_change(&self, ops: Vec<StoreOp>, timestamp: i64) -> Result<String> {
        let change = StoreChange { ops };
        let framed = marshal_store_change(&change)?;
        let timestamp = push_timestamp(timestamp);
        let added = self.tree.add_content(AddContent {
            data: framed.data,
            data_type: framed.data_type,
            is_snapshot: false,
            timestamp,
        })?;
        let change_id = added
            .added
            .first()
            .map(|c| c.id.clone())
            .ok_or_else(|| EngineError::Internal(format!("tree {} accepted no change", self.id)))?;

        let snapshot = {
            let mut store = self.store.lock();
            store.apply(&change_id, &change);
            store.clone()
        };
        self.fire_update(&snapshot);
        Ok(change_id)
    }

    /// Records `heads` as seen by the consumer `name`.
    pub fn mark_seen_heads(&self, name: &str, heads: &[String]) -> Result<()> {
        let Some(kv) = &self.key_value else {
            return Ok(());
        };
        let raw = serde_json::to_vec(heads)?;
        kv.set(&self.seen_heads_key(name), &raw)
    }

    /// Persists the current tree heads as seen by `name`.
    pub fn store_seen_heads(&self, name: &str) -> Result<()> {
        let heads = self.tree.heads();
        self.mark_seen_heads(name, &heads)
    }

    pub fn seen_heads(&self, name: &str) -> Result<Vec<String>> {
        let Some(kv) = &self.key_value else {
            return Ok(Vec::new());
        };
        match kv.get(&self.seen_heads_key(name))? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Changes `name` has not seen yet, in tree order. Everything reachable
    /// backwards from the seen heads counts as seen; the root never counts.
    pub fn unseen_change_ids(&self, name: &str) -> Result<Vec<String>> {
        let seen_heads = self.seen_heads(name)?;
        let mut previous: HashMap<String, Vec<String>> = HashMap::new();
        let mut ordered = Vec::new();
        self.tree.iterate_root(&mut |c| {
            previous.insert(c.id.clone(), c.previous_ids.clone());
            ordered.push(c.id.clone());
            true
        })?;

        let mut seen = HashSet::new();
        let mut stack: Vec<String> = seen_heads.into_iter().filter(|h| previous.contains_key(h)).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(prev) = previous.get(&id) {
                stack.extend(prev.iter().cloned());
            }
        }
        Ok(ordered
            .into_iter()
            .filter(|id| *id != self.id && !seen.contains(id))
            .collect())
    }

    fn seen_heads_key(&self, name: &str) -> String {
        format!("{}/seenHeads/{name}", self.id)
    }

    fn fold(&self, tree: &dyn ReadableObjectTree, store: &mut StoreState) -> Result<usize> {
        let root_id = self.id.clone();
        let mut pending: Vec<RawTreeChange> = Vec::new();
        tree.iterate_root(&mut |c| {
            if c.id != root_id && !store.is_applied(&c.id) {
                pending.push(c.clone());
            }
            true
        })?;
        let mut folded = 0;
        for raw in pending {
            match unmarshal_store_change(&raw.data, &raw.data_type) {
                Ok(change) => {
                    if store.apply(&raw.id, &change) {
                        folded += 1;
                    }
                }
                Err(e) => warn!("store change {} of {} is unreadable: {e}", raw.id, self.id),
            }
        }
        Ok(folded)
    }

    fn fire_update(&self, state: &StoreState) {
        let hook = self.on_update.lock().clone();
        if let Some(hook) = hook {
            hook(state);
        }
    }

    fn header_state(&self) -> Result<State> {
        let (type_key, object_layout, hidden) = match self.sb_type {
            SmartBlockType::ChatDerived => ("chatDerived", layout::CHAT_DERIVED, false),
            SmartBlockType::AccountObject => ("profile", layout::PROFILE, true),
            other => return Err(EngineError::Validation(format!("unsupported store type {other:?}"))),
        };
        let mut st = State::new_doc(&self.id).new_state();
        st.apply_change(&ChangeContent::ObjectTypeAdd { key: type_key.into() })?;
        st.set_detail(keys::TYPE, bundled_type_id(type_key));
        st.set_detail(keys::LAYOUT, object_layout);
        st.set_detail(keys::IS_HIDDEN, hidden);
        st.set_space_id(&self.space_id);
        st.set_smartblock_type(self.sb_type);
        let (st, _) = apply_state_fast_one(st)?;
        Ok(st)
    }
}

impl Source for StoreSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Store
    }

    fn smartblock_type(&self) -> SmartBlockType {
        self.sb_type
    }

    fn read_only(&self) -> bool {
        false
    }

    /// The document half carries no content; collections are read with
    /// [`StoreSource::read_store_doc`].
    fn read_doc(&self, _receiver: Option<Arc<dyn ChangeReceiver>>) -> Result<State> {
        self.header_state()
    }

    fn push_change(&self, params: PushChangeParams) -> Result<String> {
        debug!(
            "ignoring {} content items pushed to store object {}",
            params.content.len(),
            self.id
        );
        Ok(String::new())
    }

    fn heads(&self) -> Vec<String> {
        self.tree.heads()
    }

    fn file_keys_snapshot(&self) -> Vec<FileKeys> {
        Vec::new()
    }

    fn creation_info(&self) -> Result<CreationInfo> {
        let header = self.tree.header()?;
        Ok(CreationInfo {
            creator: participant_id(&self.space_id, &header.identity),
            created_date: header.timestamp,
        })
    }

    fn close(&self) -> Result<()> {
        self.on_update.lock().take();
        info!("closed store source {}", self.id);
        Ok(())
    }

    fn as_store(&self) -> Option<&StoreSource> {
        Some(self)
    }
}

impl UpdateListener for StoreSource {
    fn update(&self, tree: &dyn ReadableObjectTree) -> Result<()> {
        let snapshot = {
            let mut store = self.store.lock();
            if self.fold(tree, &mut store)? == 0 {
                return Ok(());
            }
            store.clone()
        };
        self.fire_update(&snapshot);
        Ok(())
    }

    fn rebuild(&self, tree: &dyn ReadableObjectTree) -> Result<()> {
        let mut fresh = StoreState::default();
        self.fold(tree, &mut fresh)?;
        *self.store.lock() = fresh.clone();
        self.fire_update(&fresh);
        Ok(())
    }
}
