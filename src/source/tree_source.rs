use std::collections::HashSet;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{push_timestamp, ChangeReceiver, CreationInfo, PushChangeParams, Source, SourceKind};
use crate::change::snapshot::SnapshotDecision;
use crate::change::{marshal_change, Change, ChangeType, FileKeys, CHANGE_VERSION};
use crate::domain::ids::participant_id;
use crate::domain::SmartBlockType;
use crate::error::{EngineError, Result};
use crate::objecttree::{AddContent, ObjectTree, ReadableObjectTree, UpdateListener};
use crate::reducer::{build_state, BuildOutcome};
use crate::state::{apply_state_fast_one, State};

#[derive(Default)]
struct Doc {
    /// Last state handed out, positioned at its change id.
    state: Option<State>,
    changes_since_snapshot: usize,
}

/// Plain document backed by one change tree.
pub struct TreeSource {
    id: String,
    space_id: String,
    sb_type: SmartBlockType,
    tree: Arc<dyn ObjectTree>,
    doc: Mutex<Doc>,
    rng: Mutex<StdRng>,
    receiver: Mutex<Option<Arc<dyn ChangeReceiver>>>,
}

impl TreeSource {
    /// Wraps `tree` and registers the source as its update listener.
    pub fn new(space_id: &str, tree: Arc<dyn ObjectTree>) -> Result<Arc<Self>> {
        let header = tree.header()?;
        let source = Arc::new(Self {
            id: tree.id(),
            space_id: space_id.to_string(),
            sb_type: header.payload.smartblock_type,
            tree,
            doc: Mutex::new(Doc::default()),
            rng: Mutex::new(StdRng::from_entropy()),
            receiver: Mutex::new(None),
        });
        let weak: Weak<TreeSource> = Arc::downgrade(&source);
        let listener: Weak<dyn UpdateListener> = weak;
        source.tree.set_listener(listener);
        Ok(source)
    }

    /// Replaces the snapshot dice, for reproducible pushes.
    pub fn seed_rng(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    pub fn tree(&self) -> &Arc<dyn ObjectTree> {
        &self.tree
    }

    pub fn changes_since_snapshot(&self) -> usize {
        self.doc.lock().changes_since_snapshot
    }

    fn full_build(&self, tree: &dyn ReadableObjectTree) -> Result<BuildOutcome> {
        build_state(&self.space_id, None, tree, true)
    }

    fn load(&self, doc: &mut Doc) -> Result<State> {
        if let Some(st) = &doc.state {
            return Ok(st.clone());
        }
        let outcome = self.full_build(self.tree.as_ref())?;
        doc.changes_since_snapshot = outcome.changes_since_snapshot;
        doc.state = Some(outcome.state.clone());
        Ok(outcome.state)
    }

    fn notify_append(&self, state: &State, appended: &[crate::change::ChangeContent]) {
        let receiver = self.receiver.lock().clone();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.state_append(state, appended) {
                warn!("receiver of {} rejected appended state: {e}", self.id);
            }
        }
    }

    fn notify_rebuild(&self, state: &State) {
        let receiver = self.receiver.lock().clone();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.state_rebuild(state) {
                warn!("receiver of {} rejected rebuilt state: {e}", self.id);
            }
        }
    }

    fn rebuild_from(&self, tree: &dyn ReadableObjectTree) -> Result<State> {
        let outcome = self.full_build(tree)?;
        let mut doc = self.doc.lock();
        doc.changes_since_snapshot = outcome.changes_since_snapshot;
        doc.state = Some(outcome.state.clone());
        Ok(outcome.state)
    }
}

/// Every head of `tree` descends from `change_id`.
fn heads_extend(tree: &dyn ReadableObjectTree, change_id: &str) -> Result<bool> {
    let mut reachable = HashSet::new();
    tree.iterate_from(change_id, &mut |c| {
        reachable.insert(c.id.clone());
        true
    })?;
    Ok(tree.heads().iter().all(|h| reachable.contains(h)))
}

impl Source for TreeSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Tree
    }

    fn smartblock_type(&self) -> SmartBlockType {
        self.sb_type
    }

    fn read_only(&self) -> bool {
        false
    }

    fn read_doc(&self, receiver: Option<Arc<dyn ChangeReceiver>>) -> Result<State> {
        if receiver.is_some() {
            *self.receiver.lock() = receiver;
        }
        let mut doc = self.doc.lock();
        doc.state = None;
        self.load(&mut doc)
    }

    fn push_change(&self, params: PushChangeParams) -> Result<String> {
        let mut doc = self.doc.lock();
        let base = self.load(&mut doc)?;

        let heads = self.tree.heads();
        let decision = SnapshotDecision {
            requested: params.do_snapshot,
            heads_are_root: heads.len() == 1 && heads[0] == self.id,
            content_is_empty: params.content.is_empty(),
            changes_since_snapshot: doc.changes_since_snapshot,
        };
        let with_snapshot = decision.should_snapshot(&mut *self.rng.lock());

        let mut next = base.new_state();
        for item in &params.content {
            next.apply_change(item)?;
        }
        next.add_file_keys(&params.file_keys);
        let (mut next, _) = apply_state_fast_one(next)?;

        let timestamp = push_timestamp(params.timestamp);
        let change = Change {
            content: params.content,
            snapshot: with_snapshot.then(|| next.to_snapshot()),
            file_keys: params.file_keys,
            timestamp,
            version: CHANGE_VERSION,
            change_type: ChangeType::User,
        };
        let framed = marshal_change(&change)?;
        let added = self.tree.add_content(AddContent {
            data: framed.data,
            data_type: framed.data_type,
            is_snapshot: with_snapshot,
            timestamp,
        })?;
        let change_id = added
            .added
            .first()
            .map(|c| c.id.clone())
            .ok_or_else(|| EngineError::Internal(format!("tree {} accepted no change", self.id)))?;

        next.set_change_id(&change_id);
        doc.state = Some(next);
        doc.changes_since_snapshot = if with_snapshot { 0 } else { doc.changes_since_snapshot + 1 };
        debug!("pushed change {change_id} to {} (snapshot: {with_snapshot})", self.id);
        Ok(change_id)
    }

    fn heads(&self) -> Vec<String> {
        self.tree.heads()
    }

    fn file_keys_snapshot(&self) -> Vec<FileKeys> {
        self.doc
            .lock()
            .state
            .as_ref()
            .map(|st| st.file_keys().to_vec())
            .unwrap_or_default()
    }

    fn creation_info(&self) -> Result<CreationInfo> {
        let header = self.tree.header()?;
        Ok(CreationInfo {
            creator: participant_id(&self.space_id, &header.identity),
            created_date: header.timestamp,
        })
    }

    fn close(&self) -> Result<()> {
        self.receiver.lock().take();
        info!("closed tree source {}", self.id);
        Ok(())
    }
}

impl UpdateListener for TreeSource {
    fn update(&self, tree: &dyn ReadableObjectTree) -> Result<()> {
        let current = self.doc.lock().state.clone();
        let Some(current) = current else {
            // Nothing was read yet; the next read builds from scratch.
            return Ok(());
        };

        if !heads_extend(tree, current.change_id())? {
            let state = self.rebuild_from(tree)?;
            self.notify_rebuild(&state);
            return Ok(());
        }

        let outcome = build_state(&self.space_id, Some(current), tree, true)?;
        {
            let mut doc = self.doc.lock();
            doc.changes_since_snapshot = if outcome.snapshot_seen {
                outcome.changes_since_snapshot
            } else {
                doc.changes_since_snapshot + outcome.changes_since_snapshot
            };
            doc.state = Some(outcome.state.clone());
        }
        self.notify_append(&outcome.state, &outcome.applied);
        Ok(())
    }

    fn rebuild(&self, tree: &dyn ReadableObjectTree) -> Result<()> {
        let state = self.rebuild_from(tree)?;
        self.notify_rebuild(&state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeContent, ChangePayload};
    use crate::domain::keys;
    use crate::objecttree::memory::{MemoryTree, MemoryTreeBuilder};
    use crate::objecttree::RawTreeChange;
    use crate::source::tests::RecordingReceiver;

    fn page(builder: &MemoryTreeBuilder) -> Arc<MemoryTree> {
        builder
            .create_memory_tree(
                ChangePayload {
                    smartblock_type: SmartBlockType::Page,
                    key: String::new(),
                },
                1_700_000_000,
            )
            .unwrap()
    }

    fn remote_change(id: &str, previous: Vec<String>, name: &str) -> RawTreeChange {
        let framed = marshal_change(&Change {
            content: vec![ChangeContent::details_set(keys::NAME, name)],
            timestamp: 1_700_000_500,
            ..Change::default()
        })
        .unwrap();
        RawTreeChange {
            id: id.into(),
            previous_ids: previous,
            timestamp: 1_700_000_500,
            data_type: framed.data_type,
            data: framed.data,
            is_snapshot: false,
            identity: "peer".into(),
        }
    }

    #[test]
    fn test_push_then_read_back() {
        let builder = MemoryTreeBuilder::new("alice");
        let tree = page(&builder);
        let source = TreeSource::new("space1", tree.clone()).unwrap();
        source.seed_rng(1);

        assert_eq!(source.read_doc(None).unwrap().details().id(), Some(tree.id().as_str()));
        let first = source
            .push_change(PushChangeParams::with_content(vec![ChangeContent::details_set(keys::NAME, "Hello")]))
            .unwrap();
        let second = source
            .push_change(PushChangeParams::with_content(vec![ChangeContent::details_set(
                keys::DESCRIPTION,
                "World",
            )]))
            .unwrap();
        assert_eq!(source.heads(), vec![second.clone()]);

        let changes = tree.all_changes();
        let first_raw = changes.iter().find(|c| c.id == first).unwrap();
        let second_raw = changes.iter().find(|c| c.id == second).unwrap();
        assert!(first_raw.is_snapshot, "first push on a bare root snapshots");
        assert!(!second_raw.is_snapshot);
        assert_eq!(source.changes_since_snapshot(), 1);

        let fresh = TreeSource::new("space1", tree.clone()).unwrap();
        let st = fresh.read_doc(None).unwrap();
        assert_eq!(st.details().get_str(keys::NAME), Some("Hello"));
        assert_eq!(st.details().get_str(keys::DESCRIPTION), Some("World"));
        assert_eq!(st.change_id(), second);
        assert_eq!(st.space_id(), "space1");
    }

    #[test]
    fn test_remote_append_notifies_receiver() {
        let builder = MemoryTreeBuilder::new("alice");
        let tree = page(&builder);
        let source = TreeSource::new("space1", tree.clone()).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        source.read_doc(Some(receiver.clone())).unwrap();

        tree.add_raw_changes(vec![remote_change("r1", tree.heads(), "Remote")]).unwrap();

        let appended = receiver.appended.lock().clone();
        assert_eq!(appended.len(), 1);
        assert!(appended[0].contains(&ChangeContent::details_set(keys::NAME, "Remote")));
        assert!(receiver.rebuilt.lock().is_empty());
        assert_eq!(source.read_doc(None).unwrap().details().get_str(keys::NAME), Some("Remote"));
    }

    #[test]
    fn test_concurrent_branch_triggers_rebuild() {
        let builder = MemoryTreeBuilder::new("alice");
        let tree = page(&builder);
        let source = TreeSource::new("space1", tree.clone()).unwrap();
        let receiver = Arc::new(RecordingReceiver::default());
        source.read_doc(Some(receiver.clone())).unwrap();
        source
            .push_change(PushChangeParams::with_content(vec![ChangeContent::details_set(
                keys::DESCRIPTION,
                "local",
            )]))
            .unwrap();

        // Branches off the root, so it does not extend the local change.
        tree.add_raw_changes(vec![remote_change("r1", vec![tree.id()], "Remote")]).unwrap();

        assert!(receiver.appended.lock().is_empty());
        let rebuilt = receiver.rebuilt.lock().clone();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].details().get_str(keys::DESCRIPTION), Some("local"));
        assert_eq!(rebuilt[0].details().get_str(keys::NAME), Some("Remote"));
    }

    #[test]
    fn test_creation_info_from_header() {
        let builder = MemoryTreeBuilder::new("alice");
        let tree = page(&builder);
        let source = TreeSource::new("space1", tree).unwrap();
        let info = source.creation_info().unwrap();
        assert_eq!(info.creator, participant_id("space1", "alice"));
        assert_eq!(info.created_date, 1_700_000_000);
        assert_eq!(source.kind(), SourceKind::Tree);
        assert!(!source.read_only());
    }

    #[test]
    fn test_invalid_content_is_rejected_before_append() {
        let builder = MemoryTreeBuilder::new("alice");
        let tree = page(&builder);
        let source = TreeSource::new("space1", tree.clone()).unwrap();
        let err = source
            .push_change(PushChangeParams::with_content(vec![ChangeContent::BlockSetText {
                id: "nope".into(),
                text: "x".into(),
            }]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(tree.heads(), vec![tree.id()]);
    }
}
