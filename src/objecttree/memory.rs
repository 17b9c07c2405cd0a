//! In-process change trees, used by tests and by embedders without a sync layer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::change::codec;
use crate::change::ChangePayload;
use crate::domain::cid;
use crate::error::{EngineError, Result};
use crate::objecttree::{
    decode_root_payload, AddContent, AddResult, KeyValueService, ObjectTree, RawTreeChange, ReadableObjectTree, Space,
    SpaceService, TreeBuilder, TreeHeader, UpdateListener,
};

#[derive(Default)]
struct TreeInner {
    changes: HashMap<String, RawTreeChange>,
    /// Causal order with ties broken by (timestamp, id).
    order: Vec<String>,
    heads: Vec<String>,
}

impl TreeInner {
    fn insert(&mut self, change: RawTreeChange) -> Result<bool> {
        if self.changes.contains_key(&change.id) {
            return Ok(false);
        }
        if let Some(missing) = change.previous_ids.iter().find(|p| !self.changes.contains_key(*p)) {
            return Err(EngineError::Validation(format!(
                "change {} references unknown predecessor {missing}",
                change.id
            )));
        }
        self.changes.insert(change.id.clone(), change);
        Ok(true)
    }

    fn reorder(&mut self) {
        let mut pending: HashMap<&str, usize> = HashMap::with_capacity(self.changes.len());
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for change in self.changes.values() {
            pending.insert(&change.id, change.previous_ids.len());
            for prev in &change.previous_ids {
                children.entry(prev.as_str()).or_default().push(&change.id);
            }
        }

        let mut ready: BTreeSet<(i64, &str)> = self
            .changes
            .values()
            .filter(|c| c.previous_ids.is_empty())
            .map(|c| (c.timestamp, c.id.as_str()))
            .collect();

        let mut order = Vec::with_capacity(self.changes.len());
        while let Some((_, id)) = ready.pop_first() {
            order.push(id.to_string());
            for child in children.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        if let Some(c) = self.changes.get(*child) {
                            ready.insert((c.timestamp, c.id.as_str()));
                        }
                    }
                }
            }
        }

        let mut heads: Vec<String> = self
            .changes
            .keys()
            .filter(|id| !children.contains_key(id.as_str()))
            .cloned()
            .collect();
        heads.sort();

        self.order = order;
        self.heads = heads;
    }

    /// `start` plus everything reachable from it through successor edges.
    fn descendants(&self, start: &str) -> HashSet<String> {
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for change in self.changes.values() {
            for prev in &change.previous_ids {
                children.entry(prev.as_str()).or_default().push(&change.id);
            }
        }
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.to_string()) {
                continue;
            }
            if let Some(next) = children.get(id) {
                stack.extend(next.iter().copied());
            }
        }
        seen
    }

    fn ancestors(&self, heads: &[String], include_heads: bool) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for head in heads {
            if let Some(change) = self.changes.get(head) {
                if include_heads {
                    stack.push(&change.id);
                } else {
                    stack.extend(change.previous_ids.iter().map(String::as_str));
                }
            }
        }
        while let Some(id) = stack.pop() {
            if !seen.insert(id.to_string()) {
                continue;
            }
            if let Some(change) = self.changes.get(id) {
                stack.extend(change.previous_ids.iter().map(String::as_str));
            }
        }
        seen
    }
}

pub struct MemoryTree {
    id: String,
    identity: String,
    inner: RwLock<TreeInner>,
    listener: Mutex<Option<Weak<dyn UpdateListener>>>,
}

impl MemoryTree {
    /// Creates a tree holding only its root, whose id is derived from the payload.
    pub fn create(payload: &ChangePayload, identity: &str, timestamp: i64) -> Result<Self> {
        let framed = codec::marshal(payload)?;
        let mut seed = framed.data.clone();
        seed.extend_from_slice(identity.as_bytes());
        seed.extend_from_slice(&timestamp.to_be_bytes());
        // Derived objects (with a key) keep a deterministic id.
        if payload.key.is_empty() {
            seed.extend_from_slice(&rand::random::<[u8; 16]>());
        }
        let id = cid::encode_v1(cid::CODEC_DAG_CBOR, &seed);

        let root = RawTreeChange {
            id: id.clone(),
            previous_ids: Vec::new(),
            timestamp,
            data_type: framed.data_type,
            data: framed.data,
            is_snapshot: true,
            identity: identity.to_string(),
        };
        Self::from_changes(&id, identity, vec![root])
    }

    fn from_changes(id: &str, identity: &str, changes: Vec<RawTreeChange>) -> Result<Self> {
        let mut inner = TreeInner::default();
        let mut remaining = changes;
        // Insert in dependency order regardless of input order.
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for change in remaining {
                if change.previous_ids.iter().all(|p| inner.changes.contains_key(p)) {
                    inner.insert(change)?;
                } else {
                    deferred.push(change);
                }
            }
            if deferred.len() == before {
                return Err(EngineError::Validation(format!("tree {id} has dangling changes")));
            }
            remaining = deferred;
        }
        inner.reorder();
        Ok(Self {
            id: id.to_string(),
            identity: identity.to_string(),
            inner: RwLock::new(inner),
            listener: Mutex::new(None),
        })
    }

    /// Applies changes received from a peer, then notifies the listener.
    pub fn add_raw_changes(&self, changes: Vec<RawTreeChange>) -> Result<AddResult> {
        let result = {
            let mut inner = self.inner.write();
            let mut added = Vec::new();
            let mut remaining = changes;
            while !remaining.is_empty() {
                let before = remaining.len();
                let mut deferred = Vec::new();
                for change in remaining {
                    if change.previous_ids.iter().all(|p| inner.changes.contains_key(p)) {
                        if inner.insert(change.clone())? {
                            added.push(change);
                        }
                    } else {
                        deferred.push(change);
                    }
                }
                if deferred.len() == before {
                    return Err(EngineError::Validation(format!(
                        "{} changes reference unknown predecessors",
                        deferred.len()
                    )));
                }
                remaining = deferred;
            }
            inner.reorder();
            AddResult {
                heads: inner.heads.clone(),
                added,
            }
        };
        if !result.added.is_empty() {
            self.notify_update();
        }
        Ok(result)
    }

    pub fn all_changes(&self) -> Vec<RawTreeChange> {
        let inner = self.inner.read();
        inner.order.iter().filter_map(|id| inner.changes.get(id).cloned()).collect()
    }

    fn notify_update(&self) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            if let Err(e) = listener.update(self) {
                warn!("tree {} listener update failed: {e}", self.id);
            }
        }
    }
}

impl ReadableObjectTree for MemoryTree {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn root(&self) -> RawTreeChange {
        let inner = self.inner.read();
        inner.changes.get(&self.id).cloned().unwrap_or_else(|| RawTreeChange {
            id: self.id.clone(),
            previous_ids: Vec::new(),
            timestamp: 0,
            data_type: String::new(),
            data: Vec::new(),
            is_snapshot: true,
            identity: self.identity.clone(),
        })
    }

    fn header(&self) -> Result<TreeHeader> {
        let root = self.root();
        Ok(TreeHeader {
            payload: decode_root_payload(&root)?,
            id: root.id,
            identity: root.identity,
            timestamp: root.timestamp,
        })
    }

    fn heads(&self) -> Vec<String> {
        self.inner.read().heads.clone()
    }

    fn has_change(&self, id: &str) -> bool {
        self.inner.read().changes.contains_key(id)
    }

    fn iterate_from(&self, start_id: &str, f: &mut dyn FnMut(&RawTreeChange) -> bool) -> Result<()> {
        let batch: Vec<RawTreeChange> = {
            let inner = self.inner.read();
            if !inner.changes.contains_key(start_id) {
                return Err(EngineError::not_found(format!("change {start_id} in tree {}", self.id)));
            }
            let reachable = inner.descendants(start_id);
            inner
                .order
                .iter()
                .filter(|id| reachable.contains(*id))
                .filter_map(|id| inner.changes.get(id).cloned())
                .collect()
        };
        for change in &batch {
            if !f(change) {
                break;
            }
        }
        Ok(())
    }
}

impl ObjectTree for MemoryTree {
    fn add_content(&self, content: AddContent) -> Result<AddResult> {
        let mut inner = self.inner.write();
        let previous_ids = inner.heads.clone();

        let mut seed = previous_ids.join(",").into_bytes();
        seed.extend_from_slice(&content.data);
        seed.extend_from_slice(content.data_type.as_bytes());
        seed.extend_from_slice(&content.timestamp.to_be_bytes());
        let id = cid::encode_v1(cid::CODEC_DAG_CBOR, &seed);

        let change = RawTreeChange {
            id,
            previous_ids,
            timestamp: content.timestamp,
            data_type: content.data_type,
            data: content.data,
            is_snapshot: content.is_snapshot,
            identity: self.identity.clone(),
        };
        inner.insert(change.clone())?;
        inner.reorder();
        Ok(AddResult {
            heads: inner.heads.clone(),
            added: vec![change],
        })
    }

    fn set_listener(&self, listener: Weak<dyn UpdateListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn acl_identity(&self) -> String {
        self.identity.clone()
    }
}

/// Tree builder keeping every tree in memory.
pub struct MemoryTreeBuilder {
    identity: String,
    trees: RwLock<HashMap<String, Arc<MemoryTree>>>,
}

impl MemoryTreeBuilder {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            trees: RwLock::new(HashMap::new()),
        }
    }

    pub fn tree(&self, id: &str) -> Option<Arc<MemoryTree>> {
        self.trees.read().get(id).cloned()
    }

    pub fn create_memory_tree(&self, payload: ChangePayload, timestamp: i64) -> Result<Arc<MemoryTree>> {
        let tree = Arc::new(MemoryTree::create(&payload, &self.identity, timestamp)?);
        let mut trees = self.trees.write();
        if trees.contains_key(&tree.id) {
            return Err(EngineError::Validation(format!("tree {} already exists", tree.id)));
        }
        trees.insert(tree.id.clone(), tree.clone());
        Ok(tree)
    }
}

impl TreeBuilder for MemoryTreeBuilder {
    fn build_tree(&self, id: &str) -> Result<Arc<dyn ObjectTree>> {
        match self.tree(id) {
            Some(tree) => Ok(tree),
            None => Err(EngineError::not_found(format!("tree {id}"))),
        }
    }

    fn build_history_tree(&self, id: &str, heads: &[String], include_heads: bool) -> Result<Arc<dyn ReadableObjectTree>> {
        let tree = self.tree(id).ok_or_else(|| EngineError::not_found(format!("tree {id}")))?;
        let changes = {
            let inner = tree.inner.read();
            let keep = inner.ancestors(heads, include_heads);
            inner
                .changes
                .values()
                .filter(|c| keep.contains(&c.id))
                .cloned()
                .collect::<Vec<_>>()
        };
        Ok(Arc::new(MemoryTree::from_changes(id, &tree.identity, changes)?))
    }

    fn tree_root(&self, id: &str) -> Result<RawTreeChange> {
        self.tree(id)
            .map(|t| t.root())
            .ok_or_else(|| EngineError::not_found(format!("tree {id}")))
    }

    fn create_tree(&self, payload: ChangePayload, timestamp: i64) -> Result<Arc<dyn ObjectTree>> {
        Ok(self.create_memory_tree(payload, timestamp)?)
    }

    fn stored_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.trees.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Default)]
pub struct MemoryKeyValue {
    values: RwLock<HashMap<String, Vec<u8>>>,
    subscribers: Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>,
}

impl KeyValueService for MemoryKeyValue {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_vec());
        if let Some(subs) = self.subscribers.lock().get_mut(key) {
            subs.retain(|tx| tx.send(value.to_vec()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Receiver<Vec<u8>> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().entry(key.to_string()).or_default().push(tx);
        rx
    }
}

pub struct MemorySpace {
    id: String,
    builder: Option<Arc<MemoryTreeBuilder>>,
    key_value: Option<Arc<MemoryKeyValue>>,
}

impl MemorySpace {
    pub fn new(id: &str, builder: Arc<MemoryTreeBuilder>) -> Self {
        Self {
            id: id.to_string(),
            builder: Some(builder),
            key_value: Some(Arc::new(MemoryKeyValue::default())),
        }
    }

    /// A space with no tree builder, such as a virtual space.
    pub fn without_trees(id: &str) -> Self {
        Self {
            id: id.to_string(),
            builder: None,
            key_value: None,
        }
    }

    pub fn memory_builder(&self) -> Option<&Arc<MemoryTreeBuilder>> {
        self.builder.as_ref()
    }
}

impl Space for MemorySpace {
    fn id(&self) -> &str {
        &self.id
    }

    fn tree_builder(&self) -> Option<Arc<dyn TreeBuilder>> {
        self.builder.clone().map(|b| b as Arc<dyn TreeBuilder>)
    }

    fn key_value(&self) -> Option<Arc<dyn KeyValueService>> {
        self.key_value.clone().map(|kv| kv as Arc<dyn KeyValueService>)
    }
}

/// Space registry backed by a map.
#[derive(Default)]
pub struct MemorySpaceService {
    spaces: RwLock<HashMap<String, Arc<dyn Space>>>,
}

impl MemorySpaceService {
    pub fn add(&self, space: Arc<dyn Space>) {
        self.spaces.write().insert(space.id().to_string(), space);
    }
}

impl SpaceService for MemorySpaceService {
    fn get_space(&self, space_id: &str) -> Result<Arc<dyn Space>> {
        self.spaces
            .read()
            .get(space_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("space {space_id}")))
    }
}
