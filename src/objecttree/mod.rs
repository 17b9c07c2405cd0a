//! Contracts of the change-tree transport.
//!
//! Replication and signing live outside the engine. The engine only needs to
//! iterate a tree in causal order, append content and be told about updates.
//! [`memory::MemoryTreeBuilder`] is an in-process implementation.

pub mod memory;

use std::sync::{Arc, Weak};

use crate::change::{ChangePayload, COMPRESSED_DATA_TYPE};
use crate::error::{EngineError, Result};

/// One stored change as the tree sees it: header plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTreeChange {
    pub id: String,
    pub previous_ids: Vec<String>,
    pub timestamp: i64,
    pub data_type: String,
    pub data: Vec<u8>,
    pub is_snapshot: bool,
    /// Account that signed the change.
    pub identity: String,
}

impl RawTreeChange {
    pub fn is_compressed(&self) -> bool {
        self.data_type == COMPRESSED_DATA_TYPE
    }
}

/// Decoded tree root.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeHeader {
    pub id: String,
    pub payload: ChangePayload,
    pub identity: String,
    pub timestamp: i64,
}

/// Content for a new change appended on top of the current heads.
#[derive(Debug, Clone)]
pub struct AddContent {
    pub data: Vec<u8>,
    pub data_type: String,
    pub is_snapshot: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct AddResult {
    pub heads: Vec<String>,
    pub added: Vec<RawTreeChange>,
}

pub trait UpdateListener: Send + Sync {
    /// New changes were appended on top of what the listener has seen.
    fn update(&self, tree: &dyn ReadableObjectTree) -> Result<()>;
    /// History was rewritten; the listener must rebuild from the root.
    fn rebuild(&self, tree: &dyn ReadableObjectTree) -> Result<()>;
}

pub trait ReadableObjectTree: Send + Sync {
    fn id(&self) -> String;
    fn root(&self) -> RawTreeChange;
    fn header(&self) -> Result<TreeHeader>;
    fn heads(&self) -> Vec<String>;
    fn has_change(&self, id: &str) -> bool;
    /// Visits changes reachable from `start_id` in causal order; stops when `f` returns false.
    fn iterate_from(&self, start_id: &str, f: &mut dyn FnMut(&RawTreeChange) -> bool) -> Result<()>;

    fn iterate_root(&self, f: &mut dyn FnMut(&RawTreeChange) -> bool) -> Result<()> {
        let root = self.id();
        self.iterate_from(&root, f)
    }
}

pub trait ObjectTree: ReadableObjectTree {
    fn add_content(&self, content: AddContent) -> Result<AddResult>;
    fn set_listener(&self, listener: Weak<dyn UpdateListener>);
    /// Identity the local node signs with, taken from the space ACL.
    fn acl_identity(&self) -> String;
}

pub trait TreeBuilder: Send + Sync {
    fn build_tree(&self, id: &str) -> Result<Arc<dyn ObjectTree>>;
    /// Read-only view of the history restricted to ancestors of `heads`.
    fn build_history_tree(&self, id: &str, heads: &[String], include_heads: bool) -> Result<Arc<dyn ReadableObjectTree>>;
    fn tree_root(&self, id: &str) -> Result<RawTreeChange>;
    fn create_tree(&self, payload: ChangePayload, timestamp: i64) -> Result<Arc<dyn ObjectTree>>;
    fn stored_ids(&self) -> Vec<String>;
}

/// Decodes the root change body into its payload.
pub fn decode_root_payload(root: &RawTreeChange) -> Result<ChangePayload> {
    crate::change::codec::unmarshal(&root.data, &root.data_type)
        .map_err(|e| EngineError::Codec(format!("tree root {}: {e}", root.id)))
}

/// Space-level collaborators the source layer reaches through.
pub trait Space: Send + Sync {
    fn id(&self) -> &str;
    fn tree_builder(&self) -> Option<Arc<dyn TreeBuilder>>;
    fn key_value(&self) -> Option<Arc<dyn KeyValueService>>;
}

/// Resolves space handles by id.
pub trait SpaceService: Send + Sync {
    fn get_space(&self, space_id: &str) -> Result<Arc<dyn Space>>;
}

/// Small string-keyed store in the tech space.
pub trait KeyValueService: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Receives every value later set under `key`.
    fn subscribe(&self, key: &str) -> crossbeam_channel::Receiver<Vec<u8>>;
}
