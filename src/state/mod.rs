//! Document state folded from a change tree.

use std::collections::BTreeMap;

use log::debug;

use crate::change::{Block, ChangeContent, FileKeys, Snapshot, SnapshotData};
use crate::domain::ids::participant_id;
use crate::domain::{keys, Details, RelationFormat, RelationLink, SmartBlockType, Value};
use crate::error::{EngineError, Result};

/// Snippets are cut at this many characters.
pub const SNIPPET_MAX_LEN: usize = 300;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct State {
    root_id: String,
    change_id: String,
    space_id: String,
    smartblock_type: Option<SmartBlockType>,
    blocks: BTreeMap<String, Block>,
    details: Details,
    relation_links: Vec<RelationLink>,
    object_types: Vec<String>,
    store: BTreeMap<String, Value>,
    unique_key: String,
    file_keys: Vec<FileKeys>,
    migration_version: u32,
    original_created_ts: i64,
    /// Content applied since this state was forked from its parent.
    applied: Vec<ChangeContent>,
    parent: Option<Box<State>>,
}

impl State {
    /// Empty document whose root block carries the object id.
    pub fn new_doc(root_id: &str) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(root_id.to_string(), Block::new(root_id));
        Self {
            root_id: root_id.to_string(),
            change_id: root_id.to_string(),
            blocks,
            ..Default::default()
        }
    }

    pub fn from_snapshot(root_id: &str, change_id: &str, snapshot: &Snapshot) -> Self {
        let mut st = Self::new_doc(root_id);
        st.change_id = change_id.to_string();
        for block in &snapshot.data.blocks {
            st.blocks.insert(block.id.clone(), block.clone());
        }
        st.details = snapshot.data.details.clone();
        st.relation_links = snapshot.data.relation_links.clone();
        st.object_types = snapshot.data.object_types.clone();
        st.store = snapshot.data.store.clone();
        st.unique_key = snapshot.data.unique_key.clone();
        st.original_created_ts = snapshot.data.original_created_ts;
        st.file_keys = snapshot.file_keys.clone();
        st
    }

    /// Child state; edits are recorded and can be committed back with
    /// [`apply_state_fast_one`].
    pub fn new_state(&self) -> State {
        let mut child = self.clone();
        child.applied.clear();
        child.parent = Some(Box::new(self.without_parent()));
        child
    }

    fn without_parent(&self) -> State {
        let mut copy = self.clone();
        copy.parent = None;
        copy
    }

    pub fn parent(&self) -> Option<&State> {
        self.parent.as_deref()
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    pub fn set_change_id(&mut self, id: &str) {
        self.change_id = id.to_string();
    }

    /// Only the tree root has been applied.
    pub fn is_the_header_change(&self) -> bool {
        self.change_id == self.root_id
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn set_space_id(&mut self, space_id: &str) {
        self.space_id = space_id.to_string();
    }

    pub fn smartblock_type(&self) -> Option<SmartBlockType> {
        self.smartblock_type
    }

    pub fn set_smartblock_type(&mut self, sb: SmartBlockType) {
        self.smartblock_type = Some(sb);
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    pub fn set_unique_key(&mut self, key: &str) {
        self.unique_key = key.to_string();
    }

    pub fn details(&self) -> &Details {
        &self.details
    }

    pub fn set_detail(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.applied.push(ChangeContent::DetailsSet {
            key: key.to_string(),
            value: value.clone(),
        });
        self.details.set(key, value);
    }

    pub fn blocks(&self) -> &BTreeMap<String, Block> {
        &self.blocks
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn relation_links(&self) -> &[RelationLink] {
        &self.relation_links
    }

    pub fn object_types(&self) -> &[String] {
        &self.object_types
    }

    pub fn store(&self) -> &BTreeMap<String, Value> {
        &self.store
    }

    pub fn file_keys(&self) -> &[FileKeys] {
        &self.file_keys
    }

    pub fn add_file_keys(&mut self, keys: &[FileKeys]) {
        for fk in keys {
            match self.file_keys.iter_mut().find(|k| k.hash == fk.hash) {
                Some(existing) => existing.keys.extend(fk.keys.clone()),
                None => self.file_keys.push(fk.clone()),
            }
        }
    }

    pub fn migration_version(&self) -> u32 {
        self.migration_version
    }

    pub fn set_migration_version(&mut self, version: u32) {
        self.migration_version = version;
    }

    pub fn original_created_ts(&self) -> i64 {
        self.original_created_ts
    }

    pub fn applied_content(&self) -> &[ChangeContent] {
        &self.applied
    }

    /// Records who touched the object last.
    pub fn set_last_modified(&mut self, timestamp: i64, identity: &str) {
        if timestamp > 0 {
            self.details.set(keys::LAST_MODIFIED_DATE, timestamp);
        }
        if !identity.is_empty() && !self.space_id.is_empty() {
            self.details.set(keys::LAST_MODIFIED_BY, participant_id(&self.space_id, identity));
        }
    }

    pub fn apply_change(&mut self, content: &ChangeContent) -> Result<()> {
        match content {
            ChangeContent::BlockCreate { target_id, blocks } => {
                let target = if target_id.is_empty() { self.root_id.clone() } else { target_id.clone() };
                if !self.blocks.contains_key(&target) {
                    return Err(EngineError::Validation(format!("block create target {target} not found")));
                }
                let ids: Vec<String> = blocks.iter().map(|b| b.id.clone()).collect();
                for block in blocks {
                    self.blocks.insert(block.id.clone(), block.clone());
                }
                if let Some(parent) = self.blocks.get_mut(&target) {
                    parent.children_ids.retain(|c| !ids.contains(c));
                    parent.children_ids.extend(ids);
                }
            }
            ChangeContent::BlockSetText { id, text } => {
                let block = self
                    .blocks
                    .get_mut(id)
                    .ok_or_else(|| EngineError::Validation(format!("block {id} not found")))?;
                block.text = Some(text.clone());
            }
            ChangeContent::BlockSetLink { id, target } => {
                let block = self
                    .blocks
                    .get_mut(id)
                    .ok_or_else(|| EngineError::Validation(format!("block {id} not found")))?;
                block.link_target = Some(target.clone());
            }
            ChangeContent::BlockRemove { ids } => {
                if ids.iter().any(|id| *id == self.root_id) {
                    return Err(EngineError::Validation("root block cannot be removed".into()));
                }
                for id in ids {
                    self.blocks.remove(id);
                }
                for block in self.blocks.values_mut() {
                    block.children_ids.retain(|c| !ids.contains(c));
                }
            }
            ChangeContent::DetailsSet { key, value } => {
                if key == keys::ID {
                    return Err(EngineError::Validation("details id is immutable".into()));
                }
                self.details.set(key, value.clone());
            }
            ChangeContent::DetailsUnset { key } => {
                if key == keys::ID {
                    return Err(EngineError::Validation("details id is immutable".into()));
                }
                self.details.remove(key);
            }
            ChangeContent::RelationAdd { links } => {
                for link in links {
                    if !self.relation_links.iter().any(|l| l.key == link.key) {
                        self.relation_links.push(link.clone());
                    }
                }
            }
            ChangeContent::RelationRemove { keys: removed } => {
                self.relation_links.retain(|l| !removed.contains(&l.key));
            }
            ChangeContent::ObjectTypeAdd { key } => {
                if !self.object_types.contains(key) {
                    self.object_types.push(key.clone());
                }
            }
            ChangeContent::ObjectTypeRemove { key } => {
                self.object_types.retain(|t| t != key);
            }
            ChangeContent::StoreSliceAdd { key, after_id, ids } => {
                let mut slice = self.store.get(key).map(Value::to_string_list).unwrap_or_default();
                slice.retain(|id| !ids.contains(id));
                let at = slice
                    .iter()
                    .position(|id| id == after_id)
                    .map(|p| p + 1)
                    .unwrap_or(if after_id.is_empty() { 0 } else { slice.len() });
                for (offset, id) in ids.iter().enumerate() {
                    slice.insert(at + offset, id.clone());
                }
                self.store.insert(key.clone(), Value::StringList(slice));
            }
            ChangeContent::StoreSliceRemove { key, ids } => {
                if let Some(Value::StringList(slice)) = self.store.get_mut(key) {
                    slice.retain(|id| !ids.contains(id));
                }
            }
            ChangeContent::StoreKeySet { path, value } => {
                self.store.insert(path.join("."), value.clone());
            }
            ChangeContent::StoreKeyUnset { path } => {
                self.store.remove(&path.join("."));
            }
            ChangeContent::OriginalCreatedTimestampSet { timestamp } => {
                self.original_created_ts = *timestamp;
            }
        }
        self.applied.push(content.clone());
        Ok(())
    }

    /// Block ids in document order, depth first from the root.
    pub fn block_order(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![self.root_id.clone()];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(block) = self.blocks.get(&id) {
                out.push(id.clone());
                stack.extend(block.children_ids.iter().rev().cloned());
            }
        }
        out
    }

    /// Text of the document truncated for previews.
    pub fn snippet(&self) -> String {
        let mut text = String::new();
        for id in self.block_order() {
            let Some(t) = self.blocks.get(&id).and_then(|b| b.text.as_deref()) else {
                continue;
            };
            if t.trim().is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(t.trim());
            if text.chars().count() >= SNIPPET_MAX_LEN {
                break;
            }
        }
        text.chars().take(SNIPPET_MAX_LEN).collect()
    }

    /// Text blocks as (block id, text) in document order.
    pub fn text_blocks(&self) -> Vec<(String, String)> {
        self.block_order()
            .into_iter()
            .filter_map(|id| {
                let text = self.blocks.get(&id)?.text.clone()?;
                (!text.trim().is_empty()).then_some((id, text))
            })
            .collect()
    }

    /// Outbound object ids: link blocks plus values of object-format relations.
    pub fn links(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !id.is_empty() && id != self.root_id && !out.iter().any(|o| o == id) {
                out.push(id.to_string());
            }
        };
        for id in self.block_order() {
            if let Some(target) = self.blocks.get(&id).and_then(|b| b.link_target.as_deref()) {
                push(target);
            }
        }
        for link in &self.relation_links {
            if link.format != RelationFormat::Object || is_derived_link_key(&link.key) {
                continue;
            }
            for target in self.details.get_list(&link.key) {
                push(&target);
            }
        }
        out
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            data: SnapshotData {
                blocks: self
                    .block_order()
                    .into_iter()
                    .filter(|id| *id != self.root_id)
                    .filter_map(|id| self.blocks.get(&id).cloned())
                    .chain(self.blocks.get(&self.root_id).cloned())
                    .collect(),
                details: self.details.clone(),
                relation_links: self.relation_links.clone(),
                object_types: self.object_types.clone(),
                store: self.store.clone(),
                unique_key: self.unique_key.clone(),
                original_created_ts: self.original_created_ts,
            },
            file_keys: self.file_keys.clone(),
        }
    }

    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.relation_links.retain(|l| seen.insert(l.key.clone()));
        let mut seen = std::collections::HashSet::new();
        self.object_types.retain(|t| seen.insert(t.clone()));

        let live: std::collections::HashSet<String> = self.blocks.keys().cloned().collect();
        for block in self.blocks.values_mut() {
            block.children_ids.retain(|c| live.contains(c));
        }
        self.details.set(keys::ID, self.root_id.clone());
    }
}

fn is_derived_link_key(key: &str) -> bool {
    key == keys::LINKS || key == keys::BACKLINKS
}

/// Validates a forked state and folds it into a standalone state.
/// Returns the state together with the content applied since the fork.
pub fn apply_state_fast_one(mut st: State) -> Result<(State, Vec<ChangeContent>)> {
    if st.root_id.is_empty() {
        return Err(EngineError::Validation("state has no root id".into()));
    }
    if !st.blocks.contains_key(&st.root_id) {
        return Err(EngineError::Validation(format!("state {} lost its root block", st.root_id)));
    }
    st.normalize();
    let applied = std::mem::take(&mut st.applied);
    st.parent = None;
    debug!("applied {} content items to {}", applied.len(), st.root_id);
    Ok((st, applied))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_edits_and_snippet() {
        let mut st = State::new_doc("obj");
        st.apply_change(&ChangeContent::BlockCreate {
            target_id: String::new(),
            blocks: vec![Block::text("b1", "Hello"), Block::text("b2", "world"), Block::link("b3", "other")],
        })
        .unwrap();
        st.apply_change(&ChangeContent::BlockSetText {
            id: "b2".into(),
            text: "there".into(),
        })
        .unwrap();
        assert_eq!(st.snippet(), "Hello there");
        assert_eq!(st.links(), vec!["other".to_string()]);

        st.apply_change(&ChangeContent::BlockRemove { ids: vec!["b1".into()] }).unwrap();
        assert_eq!(st.block_order(), vec!["obj".to_string(), "b2".into(), "b3".into()]);
        assert!(st.apply_change(&ChangeContent::BlockSetText { id: "b1".into(), text: "x".into() }).is_err());
    }

    #[test]
    fn test_object_relations_count_as_links() {
        let mut st = State::new_doc("obj");
        st.apply_change(&ChangeContent::RelationAdd {
            links: vec![
                RelationLink::new(keys::ASSIGNEE, RelationFormat::Object),
                RelationLink::new(keys::BACKLINKS, RelationFormat::Object),
            ],
        })
        .unwrap();
        st.apply_change(&ChangeContent::details_set(keys::ASSIGNEE, vec!["p1", "obj"])).unwrap();
        st.apply_change(&ChangeContent::details_set(keys::BACKLINKS, vec!["p2"])).unwrap();
        assert_eq!(st.links(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_slice_insert_after() {
        let mut st = State::new_doc("set");
        let add = |after: &str, ids: &[&str]| ChangeContent::StoreSliceAdd {
            key: "objects".into(),
            after_id: after.into(),
            ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        st.apply_change(&add("", &["a", "c"])).unwrap();
        st.apply_change(&add("a", &["b"])).unwrap();
        st.apply_change(&add("", &["z"])).unwrap();
        assert_eq!(st.store()["objects"], Value::from(vec!["z", "a", "b", "c"]));
        st.apply_change(&ChangeContent::StoreSliceRemove {
            key: "objects".into(),
            ids: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(st.store()["objects"], Value::from(vec!["z", "b", "c"]));
    }

    #[test]
    fn test_snapshot_round_trip_and_fork() {
        let mut st = State::new_doc("obj");
        st.apply_change(&ChangeContent::details_set(keys::NAME, "Title")).unwrap();
        st.apply_change(&ChangeContent::BlockCreate {
            target_id: "obj".into(),
            blocks: vec![Block::text("b1", "body")],
        })
        .unwrap();
        let restored = State::from_snapshot("obj", "c1", &st.to_snapshot());
        assert_eq!(restored.details(), st.details());
        assert_eq!(restored.block_order(), st.block_order());

        let mut child = restored.new_state();
        child.apply_change(&ChangeContent::details_set(keys::NAME, "New")).unwrap();
        assert_eq!(child.parent().unwrap().details().get_str(keys::NAME), Some("Title"));
        let (applied_state, applied) = apply_state_fast_one(child).unwrap();
        assert_eq!(applied.len(), 1);
        assert!(applied_state.parent().is_none());
        assert_eq!(applied_state.details().id(), Some("obj"));
    }

    #[test]
    fn test_id_detail_is_immutable() {
        let mut st = State::new_doc("obj");
        assert!(st.apply_change(&ChangeContent::details_set(keys::ID, "other")).is_err());
        assert!(st.apply_change(&ChangeContent::DetailsUnset { key: keys::ID.into() }).is_err());
    }
}
