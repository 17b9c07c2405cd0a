//! Folds a change tree into a [`State`].

use log::warn;

use crate::change::{ChangeContent, ChangeType, SnapshotSkippingDecoder};
use crate::domain::{keys, Value};
use crate::error::{EngineError, Result};
use crate::objecttree::ReadableObjectTree;
use crate::state::{apply_state_fast_one, State};

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub state: State,
    /// Content applied on top of the initial state.
    pub applied: Vec<ChangeContent>,
    pub changes_since_snapshot: usize,
    /// A snapshot change was walked, so the counter restarted.
    pub snapshot_seen: bool,
}

/// Walks `tree` from the root, or from the change id of `initial`, and reduces
/// every change into a state.
///
/// Individual content items that fail to apply are logged and skipped. When
/// `apply` is set the resulting state is validated and detached from its parent.
pub fn build_state(space_id: &str, initial: Option<State>, tree: &dyn ReadableObjectTree, apply: bool) -> Result<BuildOutcome> {
    reduce(space_id, initial, None, tree, apply)
}

/// Builds a state starting at a snapshot change instead of the root.
pub fn build_state_from_snapshot(
    space_id: &str,
    snapshot_change_id: &str,
    tree: &dyn ReadableObjectTree,
    apply: bool,
) -> Result<BuildOutcome> {
    reduce(space_id, None, Some(snapshot_change_id.to_string()), tree, apply)
}

fn reduce(
    space_id: &str,
    initial: Option<State>,
    start_from: Option<String>,
    tree: &dyn ReadableObjectTree,
    apply: bool,
) -> Result<BuildOutcome> {
    let root_id = tree.id();
    let header = tree.header()?;
    let sb_type = header.payload.smartblock_type;
    let unique_key = header.payload.key;

    let start_id = match (&start_from, &initial) {
        (Some(id), _) => id.clone(),
        (None, Some(st)) => st.change_id().to_string(),
        (None, None) => root_id.clone(),
    };

    let mut st = initial;
    let mut decoder = SnapshotSkippingDecoder::new();
    let mut since_snapshot = 0usize;
    let mut snapshot_seen = false;
    let mut last_modified: Option<(i64, String)> = None;
    let mut max_version = 0u32;
    let mut failure: Option<EngineError> = None;

    tree.iterate_from(&start_id, &mut |raw| {
        if raw.id == root_id {
            let mut next = match st.take() {
                Some(current) => current.new_state(),
                None => {
                    let mut doc = State::new_doc(&root_id);
                    doc.set_unique_key(&unique_key);
                    doc
                }
            };
            next.set_change_id(&raw.id);
            st = Some(next);
            return true;
        }

        let change = match decoder.decode(&raw.data, &raw.data_type) {
            Ok(change) => change,
            Err(e) => {
                failure = Some(e);
                return false;
            }
        };

        // The start change counts toward last-modified and the migration
        // version even though its content is already in the state.
        max_version = max_version.max(change.version);
        if change.change_type == ChangeType::User && sb_type.tracks_last_modified() {
            let ts = if change.timestamp > 0 { change.timestamp } else { raw.timestamp };
            if last_modified.as_ref().map_or(true, |(seen, _)| ts >= *seen) {
                last_modified = Some((ts, raw.identity.clone()));
            }
        }

        if raw.id == start_id {
            st = match st.take() {
                Some(current) => Some(current.new_state()),
                None => {
                    let Some(snapshot) = change.snapshot.as_ref() else {
                        failure = Some(EngineError::Validation(format!("start change {} has no snapshot", raw.id)));
                        return false;
                    };
                    since_snapshot = 0;
                    snapshot_seen = true;
                    let mut doc = State::from_snapshot(&root_id, &raw.id, snapshot);
                    if doc.unique_key().is_empty() {
                        doc.set_unique_key(&unique_key);
                    }
                    Some(doc)
                }
            };
            return true;
        }

        if raw.is_snapshot || change.snapshot.is_some() {
            since_snapshot = 0;
            snapshot_seen = true;
        } else {
            since_snapshot += 1;
        }

        let Some(current) = st.as_mut() else {
            failure = Some(EngineError::Validation(format!("change {} precedes the tree root", raw.id)));
            return false;
        };

        let content = clean_up_change(&raw.previous_ids, &root_id, change.content);
        for item in &content {
            if let Err(e) = current.apply_change(item) {
                warn!("skipping content of change {} in {}: {e}", raw.id, root_id);
            }
        }
        current.set_change_id(&raw.id);
        current.add_file_keys(&change.file_keys);
        true
    })?;

    if let Some(e) = failure {
        return Err(e);
    }
    let mut state = st.ok_or_else(|| EngineError::not_found(format!("change {start_id} in tree {root_id}")))?;
    state.set_smartblock_type(sb_type);
    state.set_space_id(space_id);

    let applied = if apply {
        let (committed, applied) = apply_state_fast_one(state)?;
        state = committed;
        applied
    } else {
        state.applied_content().to_vec()
    };

    if !state.is_the_header_change() {
        if let Some((ts, identity)) = last_modified {
            state.set_last_modified(ts, &identity);
        }
    }
    state.set_migration_version(max_version);

    Ok(BuildOutcome {
        state,
        applied,
        changes_since_snapshot: since_snapshot,
        snapshot_seen,
    })
}

/// Drops `name = ""` detail sets from direct children of the root; replaying
/// them over a populated snapshot would wipe the title.
fn clean_up_change(previous_ids: &[String], root_id: &str, mut content: Vec<ChangeContent>) -> Vec<ChangeContent> {
    if previous_ids.len() == 1 && previous_ids[0] == root_id {
        content.retain(|item| {
            !matches!(item, ChangeContent::DetailsSet { key, value }
                if key == keys::NAME && *value == Value::String(String::new()))
        });
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{marshal_change, Block, Change, ChangePayload, Snapshot, SnapshotData};
    use crate::domain::{Details, SmartBlockType};
    use crate::objecttree::memory::MemoryTree;
    use crate::objecttree::{AddContent, ObjectTree};

    fn page_tree() -> MemoryTree {
        MemoryTree::create(
            &ChangePayload {
                smartblock_type: SmartBlockType::Page,
                key: String::new(),
            },
            "alice",
            100,
        )
        .unwrap()
    }

    fn push(tree: &MemoryTree, change: &Change, snapshot: bool) -> String {
        let framed = marshal_change(change).unwrap();
        tree.add_content(AddContent {
            data: framed.data,
            data_type: framed.data_type,
            is_snapshot: snapshot,
            timestamp: change.timestamp,
        })
        .unwrap()
        .added[0]
            .id
            .clone()
    }

    fn delta(ts: i64, content: Vec<ChangeContent>) -> Change {
        Change {
            content,
            timestamp: ts,
            version: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_from_root() {
        let tree = page_tree();
        push(&tree, &delta(101, vec![ChangeContent::details_set(keys::NAME, "Title")]), true);
        let last = push(
            &tree,
            &delta(
                102,
                vec![ChangeContent::BlockCreate {
                    target_id: String::new(),
                    blocks: vec![Block::text("b1", "hello")],
                }],
            ),
            false,
        );

        let out = build_state("space1", None, &tree, true).unwrap();
        assert_eq!(out.state.change_id(), last);
        assert_eq!(out.state.details().get_str(keys::NAME), Some("Title"));
        assert_eq!(out.state.details().get_i64(keys::LAST_MODIFIED_DATE), Some(102));
        assert_eq!(out.state.details().get_str(keys::LAST_MODIFIED_BY), Some("_participant_space1_alice"));
        assert_eq!(out.state.migration_version(), 2);
        assert_eq!(out.changes_since_snapshot, 1);
        assert_eq!(out.state.snippet(), "hello");
    }

    #[test]
    fn test_root_only_state_is_header() {
        let tree = page_tree();
        let out = build_state("space1", None, &tree, true).unwrap();
        assert!(out.state.is_the_header_change());
        assert!(out.state.details().get(keys::LAST_MODIFIED_DATE).is_none());
    }

    #[test]
    fn test_rerun_is_deterministic() {
        let tree = page_tree();
        push(&tree, &delta(101, vec![ChangeContent::details_set(keys::NAME, "A")]), true);
        push(&tree, &delta(102, vec![ChangeContent::details_set(keys::DESCRIPTION, "B")]), false);
        let first = build_state("s", None, &tree, true).unwrap();
        let second = build_state("s", None, &tree, true).unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.applied, second.applied);
    }

    #[test]
    fn test_incremental_build_from_state() {
        let tree = page_tree();
        push(&tree, &delta(101, vec![ChangeContent::details_set(keys::NAME, "A")]), true);
        let base = build_state("s", None, &tree, true).unwrap().state;

        push(&tree, &delta(102, vec![ChangeContent::details_set(keys::NAME, "B")]), false);
        let out = build_state("s", Some(base), &tree, false).unwrap();
        assert_eq!(out.state.details().get_str(keys::NAME), Some("B"));
        assert_eq!(out.applied.len(), 1);
        assert!(out.state.parent().is_some());
    }

    #[test]
    fn test_start_from_snapshot_change() {
        let tree = page_tree();
        let mut details = Details::new();
        details.set(keys::NAME, "From snapshot");
        let snap = Change {
            snapshot: Some(Snapshot {
                data: SnapshotData {
                    details,
                    ..Default::default()
                },
                file_keys: Vec::new(),
            }),
            timestamp: 101,
            ..Default::default()
        };
        let snap_id = push(&tree, &snap, true);
        push(&tree, &delta(102, vec![ChangeContent::details_set(keys::DESCRIPTION, "d")]), false);

        let mut seed = State::new_doc(&tree.id());
        seed.set_change_id(&snap_id);
        // A seed with a change id but no content forks, it does not re-read the snapshot.
        let forked = build_state("s", Some(seed), &tree, true).unwrap();
        assert_eq!(forked.state.details().get_str(keys::DESCRIPTION), Some("d"));
        assert_eq!(forked.state.details().get_str(keys::NAME), None);
    }

    #[test]
    fn test_build_from_snapshot_without_state() {
        let tree = page_tree();
        push(&tree, &delta(101, vec![ChangeContent::details_set(keys::NAME, "old")]), true);
        let mut details = Details::new();
        details.set(keys::NAME, "Snap");
        let snap_id = push(
            &tree,
            &Change {
                snapshot: Some(Snapshot {
                    data: SnapshotData {
                        details,
                        ..Default::default()
                    },
                    file_keys: Vec::new(),
                }),
                timestamp: 102,
                ..Default::default()
            },
            true,
        );
        push(&tree, &delta(103, vec![ChangeContent::details_set(keys::DESCRIPTION, "after")]), false);

        let out = build_state_from_snapshot("s", &snap_id, &tree, true).unwrap();
        assert_eq!(out.state.details().get_str(keys::NAME), Some("Snap"));
        assert_eq!(out.state.details().get_str(keys::DESCRIPTION), Some("after"));
        assert_eq!(out.changes_since_snapshot, 1);

        let root_id = tree.id();
        assert!(build_state_from_snapshot("s", &root_id, &tree, true).is_ok());
    }

    #[test]
    fn test_start_change_counts_for_last_modified_and_version() {
        let tree = page_tree();
        let mut details = Details::new();
        details.set(keys::NAME, "Snap");
        let snap_id = push(
            &tree,
            &Change {
                snapshot: Some(Snapshot {
                    data: SnapshotData {
                        details,
                        ..Default::default()
                    },
                    file_keys: Vec::new(),
                }),
                timestamp: 150,
                version: 5,
                ..Default::default()
            },
            true,
        );

        let out = build_state_from_snapshot("space1", &snap_id, &tree, true).unwrap();
        assert_eq!(out.state.change_id(), snap_id);
        assert_eq!(out.state.migration_version(), 5);
        assert_eq!(out.state.details().get_i64(keys::LAST_MODIFIED_DATE), Some(150));
        assert_eq!(out.state.details().get_str(keys::LAST_MODIFIED_BY), Some("_participant_space1_alice"));
    }

    #[test]
    fn test_root_conflict_cleanup() {
        let tree = page_tree();
        push(
            &tree,
            &delta(
                101,
                vec![
                    ChangeContent::details_set(keys::NAME, ""),
                    ChangeContent::details_set(keys::DESCRIPTION, "kept"),
                ],
            ),
            true,
        );
        let out = build_state("s", None, &tree, true).unwrap();
        assert!(out.state.details().get(keys::NAME).is_none());
        assert_eq!(out.state.details().get_str(keys::DESCRIPTION), Some("kept"));

        push(&tree, &delta(102, vec![ChangeContent::details_set(keys::NAME, "")]), false);
        let out = build_state("s", None, &tree, true).unwrap();
        assert_eq!(out.state.details().get_str(keys::NAME), Some(""));
    }

    #[test]
    fn test_failed_content_is_skipped() {
        let tree = page_tree();
        push(
            &tree,
            &delta(
                101,
                vec![
                    ChangeContent::BlockSetText {
                        id: "missing".into(),
                        text: "x".into(),
                    },
                    ChangeContent::details_set(keys::NAME, "still applied"),
                ],
            ),
            true,
        );
        let out = build_state("s", None, &tree, true).unwrap();
        assert_eq!(out.state.details().get_str(keys::NAME), Some("still applied"));
    }

    #[test]
    fn test_system_changes_do_not_touch_last_modified() {
        let tree = page_tree();
        push(&tree, &delta(101, vec![ChangeContent::details_set(keys::NAME, "A")]), true);
        let system = Change {
            change_type: ChangeType::System,
            ..delta(500, vec![ChangeContent::details_set(keys::DESCRIPTION, "sys")])
        };
        push(&tree, &system, false);
        let out = build_state("s", None, &tree, true).unwrap();
        assert_eq!(out.state.details().get_i64(keys::LAST_MODIFIED_DATE), Some(101));
    }
}
