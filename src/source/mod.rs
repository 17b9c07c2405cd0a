//! Sources: where the document of an object comes from.
//!
//! Every object is served by exactly one [`Source`]. Ids with a virtual
//! prefix get a synthesised read-only source, statically registered ids get
//! their pre-built source, and everything else is backed by a change tree,
//! either as a plain document or as a store of collections.
//!
//! Sources push state updates to a [`ChangeReceiver`] when the underlying tree
//! moves: `state_append` when the new changes extend what was read,
//! `state_rebuild` when history had to be replayed from the root.

pub mod registry;
mod static_source;
mod store_source;
mod tree_source;
mod virtual_source;

use std::sync::Arc;

pub use registry::{SourceLease, SourceRegistry};
pub use static_source::StaticSource;
pub use store_source::{StoreSource, StoreState};
pub use tree_source::TreeSource;
pub use virtual_source::VirtualSource;

use crate::change::{ChangeContent, FileKeys};
use crate::domain::SmartBlockType;
use crate::error::Result;
use crate::state::State;

/// Variant tag of a source, decided from the id shape and the type provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Tree,
    Store,
    Static,
    Date,
    BundledType,
    BundledRelation,
    Profile,
    Missing,
    Participant,
}

impl SourceKind {
    pub fn is_virtual(self) -> bool {
        !matches!(self, SourceKind::Tree | SourceKind::Store | SourceKind::Static)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushChangeParams {
    pub content: Vec<ChangeContent>,
    pub file_keys: Vec<FileKeys>,
    /// Forces a snapshot into the pushed change.
    pub do_snapshot: bool,
    /// Unix seconds; zero means now.
    pub timestamp: i64,
}

impl PushChangeParams {
    pub fn with_content(content: Vec<ChangeContent>) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreationInfo {
    /// Participant id of the account that created the tree.
    pub creator: String,
    pub created_date: i64,
}

/// Editor side of a source: told whenever the document moved underneath it.
pub trait ChangeReceiver: Send + Sync {
    fn state_append(&self, state: &State, appended: &[ChangeContent]) -> Result<()>;
    fn state_rebuild(&self, state: &State) -> Result<()>;
}

pub trait Source: Send + Sync {
    fn id(&self) -> &str;
    fn space_id(&self) -> &str;
    fn kind(&self) -> SourceKind;
    fn smartblock_type(&self) -> SmartBlockType;
    fn read_only(&self) -> bool;

    /// Materialises the document. `receiver` gets later updates, if any.
    fn read_doc(&self, receiver: Option<Arc<dyn ChangeReceiver>>) -> Result<State>;

    /// Appends content and returns the new change id. Read-only sources fail
    /// with `ReadOnly`.
    fn push_change(&self, params: PushChangeParams) -> Result<String>;

    fn heads(&self) -> Vec<String>;
    fn file_keys_snapshot(&self) -> Vec<FileKeys>;
    fn creation_info(&self) -> Result<CreationInfo>;
    fn close(&self) -> Result<()>;

    /// Store-backed sources expose their collection API through this.
    fn as_store(&self) -> Option<&StoreSource> {
        None
    }
}

/// Unix seconds for a push timestamp, defaulting to now.
pub(crate) fn push_timestamp(ts: i64) -> i64 {
    if ts > 0 {
        ts
    } else {
        chrono::Utc::now().timestamp()
    }
}
