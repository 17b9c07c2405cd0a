//! Change records carried by the change tree.
//!
//! Field names are shortened on the wire; empty fields are skipped so that a
//! single small edit stays under the compression threshold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Details, RelationLink, SmartBlockType, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "i")]
    pub id: String,
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<String>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Target object of a link or mention block.
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl Block {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            children_ids: Vec::new(),
            text: None,
            link_target: None,
        }
    }

    pub fn text(id: &str, text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::new(id)
        }
    }

    pub fn link(id: &str, target: &str) -> Self {
        Self {
            link_target: Some(target.to_string()),
            ..Self::new(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeContent {
    #[serde(rename = "bc")]
    BlockCreate {
        #[serde(rename = "t")]
        target_id: String,
        #[serde(rename = "b")]
        blocks: Vec<Block>,
    },
    #[serde(rename = "bt")]
    BlockSetText {
        #[serde(rename = "i")]
        id: String,
        #[serde(rename = "t")]
        text: String,
    },
    #[serde(rename = "bl")]
    BlockSetLink {
        #[serde(rename = "i")]
        id: String,
        #[serde(rename = "t")]
        target: String,
    },
    #[serde(rename = "br")]
    BlockRemove {
        #[serde(rename = "i")]
        ids: Vec<String>,
    },
    #[serde(rename = "ds")]
    DetailsSet {
        #[serde(rename = "k")]
        key: String,
        #[serde(rename = "v")]
        value: Value,
    },
    #[serde(rename = "du")]
    DetailsUnset {
        #[serde(rename = "k")]
        key: String,
    },
    #[serde(rename = "ra")]
    RelationAdd {
        #[serde(rename = "l")]
        links: Vec<RelationLink>,
    },
    #[serde(rename = "rr")]
    RelationRemove {
        #[serde(rename = "k")]
        keys: Vec<String>,
    },
    #[serde(rename = "ta")]
    ObjectTypeAdd {
        #[serde(rename = "k")]
        key: String,
    },
    #[serde(rename = "tr")]
    ObjectTypeRemove {
        #[serde(rename = "k")]
        key: String,
    },
    #[serde(rename = "sa")]
    StoreSliceAdd {
        #[serde(rename = "k")]
        key: String,
        #[serde(rename = "a", default, skip_serializing_if = "String::is_empty")]
        after_id: String,
        #[serde(rename = "i")]
        ids: Vec<String>,
    },
    #[serde(rename = "sr")]
    StoreSliceRemove {
        #[serde(rename = "k")]
        key: String,
        #[serde(rename = "i")]
        ids: Vec<String>,
    },
    #[serde(rename = "sk")]
    StoreKeySet {
        #[serde(rename = "p")]
        path: Vec<String>,
        #[serde(rename = "v")]
        value: Value,
    },
    #[serde(rename = "su")]
    StoreKeyUnset {
        #[serde(rename = "p")]
        path: Vec<String>,
    },
    #[serde(rename = "oc")]
    OriginalCreatedTimestampSet {
        #[serde(rename = "t")]
        timestamp: i64,
    },
}

impl ChangeContent {
    pub fn details_set(key: &str, value: impl Into<Value>) -> Self {
        ChangeContent::DetailsSet {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChangeType {
    #[default]
    #[serde(rename = "u")]
    User,
    #[serde(rename = "s")]
    System,
    #[serde(rename = "f")]
    FileMetadata,
}

impl ChangeType {
    fn is_user(&self) -> bool {
        *self == ChangeType::User
    }
}

/// Encryption keys of one file, keyed by path inside the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileKeys {
    #[serde(rename = "h")]
    pub hash: String,
    #[serde(rename = "k")]
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    #[serde(rename = "b", default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
    #[serde(rename = "d", default, skip_serializing_if = "Details::is_empty")]
    pub details: Details,
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub relation_links: Vec<RelationLink>,
    #[serde(rename = "t", default, skip_serializing_if = "Vec::is_empty")]
    pub object_types: Vec<String>,
    #[serde(rename = "s", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub store: BTreeMap<String, Value>,
    #[serde(rename = "k", default, skip_serializing_if = "String::is_empty")]
    pub unique_key: String,
    #[serde(rename = "o", default, skip_serializing_if = "is_zero_i64")]
    pub original_created_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "d")]
    pub data: SnapshotData,
    #[serde(rename = "f", default, skip_serializing_if = "Vec::is_empty")]
    pub file_keys: Vec<FileKeys>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ChangeContent>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(rename = "f", default, skip_serializing_if = "Vec::is_empty")]
    pub file_keys: Vec<FileKeys>,
    #[serde(rename = "t", default, skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
    #[serde(rename = "v", default, skip_serializing_if = "is_zero_u32")]
    pub version: u32,
    #[serde(rename = "ct", default, skip_serializing_if = "ChangeType::is_user")]
    pub change_type: ChangeType,
}

/// Same wire layout as [`Change`] with the snapshot left undecoded.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ChangeNoSnapshot {
    #[serde(rename = "c", default)]
    pub content: Vec<ChangeContent>,
    #[serde(rename = "f", default)]
    pub file_keys: Vec<FileKeys>,
    #[serde(rename = "t", default)]
    pub timestamp: i64,
    #[serde(rename = "v", default)]
    pub version: u32,
    #[serde(rename = "ct", default)]
    pub change_type: ChangeType,
}

impl From<ChangeNoSnapshot> for Change {
    fn from(c: ChangeNoSnapshot) -> Self {
        Change {
            content: c.content,
            snapshot: None,
            file_keys: c.file_keys,
            timestamp: c.timestamp,
            version: c.version,
            change_type: c.change_type,
        }
    }
}

/// Payload of a tree root: what kind of object the tree holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(rename = "t")]
    pub smartblock_type: SmartBlockType,
    #[serde(rename = "k", default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

/// One operation of a store change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    #[serde(rename = "c")]
    Create {
        #[serde(rename = "l")]
        collection: String,
        #[serde(rename = "i")]
        id: String,
        #[serde(rename = "d")]
        doc: Details,
    },
    #[serde(rename = "m")]
    Modify {
        #[serde(rename = "l")]
        collection: String,
        #[serde(rename = "i")]
        id: String,
        #[serde(rename = "k")]
        key: String,
        #[serde(rename = "v")]
        value: Value,
    },
    #[serde(rename = "d")]
    Delete {
        #[serde(rename = "l")]
        collection: String,
        #[serde(rename = "i")]
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreChange {
    #[serde(rename = "o")]
    pub ops: Vec<StoreOp>,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Wire version written into every new change.
pub const CHANGE_VERSION: u32 = 1;
