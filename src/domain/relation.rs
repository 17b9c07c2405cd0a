//! Well-known relation keys and formats.

use serde::{Deserialize, Serialize};

pub mod keys {
    pub const ID: &str = "id";
    pub const SPACE_ID: &str = "spaceId";
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const SNIPPET: &str = "snippet";
    pub const TYPE: &str = "type";
    pub const LAYOUT: &str = "layout";
    pub const LINKS: &str = "links";
    pub const BACKLINKS: &str = "backlinks";
    pub const IS_DELETED: &str = "isDeleted";
    pub const IS_ARCHIVED: &str = "isArchived";
    pub const IS_HIDDEN: &str = "isHidden";
    pub const IS_READONLY: &str = "isReadonly";
    pub const SYNC_STATUS: &str = "syncStatus";
    pub const RECOMMENDED_RELATIONS: &str = "recommendedRelations";
    pub const LAST_MODIFIED_DATE: &str = "lastModifiedDate";
    pub const LAST_MODIFIED_BY: &str = "lastModifiedBy";
    pub const LAST_OPENED_DATE: &str = "lastOpenedDate";
    pub const CREATED_DATE: &str = "createdDate";
    pub const CREATOR: &str = "creator";
    pub const UNIQUE_KEY: &str = "uniqueKey";
    pub const RELATION_KEY: &str = "relationKey";
    pub const RELATION_FORMAT: &str = "relationFormat";
    pub const TAG: &str = "tag";
    pub const STATUS: &str = "status";
    pub const ASSIGNEE: &str = "assignee";
    pub const TIMESTAMP: &str = "timestamp";
    pub const IDENTITY: &str = "identity";
    pub const PARTICIPANT_STATUS: &str = "participantStatus";
    pub const SOURCE_OBJECT: &str = "sourceObject";
    pub const TARGET_SPACE_ID: &str = "targetSpaceId";
    pub const SMARTBLOCK_TYPES: &str = "smartblockTypes";
}

/// Local-only keys that may be staged in pending details before the tree exists.
pub const LOCAL_ONLY_KEYS: &[&str] = &[
    keys::SYNC_STATUS,
    keys::BACKLINKS,
    keys::LAST_OPENED_DATE,
    keys::LINKS,
];

/// Relation keys indexed into the full-text engine as `objId/r/{key}` documents.
pub const FULLTEXT_KEYS: &[&str] = &[keys::NAME, keys::DESCRIPTION, keys::SNIPPET];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationFormat {
    ShortText,
    LongText,
    Number,
    Status,
    Tag,
    Date,
    File,
    Checkbox,
    Url,
    Email,
    Phone,
    Object,
}

impl RelationFormat {
    /// Values of these formats are option ids and feed the option index.
    pub fn is_option(self) -> bool {
        matches!(self, RelationFormat::Tag | RelationFormat::Status)
    }

    /// Values of these formats are object ids and count as outbound links.
    pub fn is_object(self) -> bool {
        matches!(self, RelationFormat::Object | RelationFormat::File)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationFormat::ShortText => "shortText",
            RelationFormat::LongText => "longText",
            RelationFormat::Number => "number",
            RelationFormat::Status => "status",
            RelationFormat::Tag => "tag",
            RelationFormat::Date => "date",
            RelationFormat::File => "file",
            RelationFormat::Checkbox => "checkbox",
            RelationFormat::Url => "url",
            RelationFormat::Email => "email",
            RelationFormat::Phone => "phone",
            RelationFormat::Object => "object",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            RelationFormat::ShortText,
            RelationFormat::LongText,
            RelationFormat::Number,
            RelationFormat::Status,
            RelationFormat::Tag,
            RelationFormat::Date,
            RelationFormat::File,
            RelationFormat::Checkbox,
            RelationFormat::Url,
            RelationFormat::Email,
            RelationFormat::Phone,
            RelationFormat::Object,
        ]
        .into_iter()
        .find(|f| f.as_str() == s)
    }
}

/// A relation attached to an object state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationLink {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "f")]
    pub format: RelationFormat,
}

impl RelationLink {
    pub fn new(key: &str, format: RelationFormat) -> Self {
        Self {
            key: key.to_string(),
            format,
        }
    }
}
