//! In-process bundle of well-known relations and object types.

use crate::domain::ids::{bundled_relation_id, bundled_type_id};
use crate::domain::smartblock::layout;
use crate::domain::{keys, Details, RelationFormat};

/// Bumped whenever bundled relations change; drives reindexing.
pub const RELATIONS_CHECKSUM: i32 = 3;
/// Bumped whenever bundled types change; drives reindexing.
pub const TYPES_CHECKSUM: i32 = 2;

#[derive(Debug)]
pub struct BundledRelation {
    pub key: &'static str,
    pub name: &'static str,
    pub format: RelationFormat,
    pub hidden: bool,
    pub readonly: bool,
}

#[derive(Debug)]
pub struct BundledType {
    pub key: &'static str,
    pub name: &'static str,
    pub layout: i64,
    pub recommended_relations: &'static [&'static str],
}

macro_rules! relation {
    ($key:expr, $name:expr, $format:ident, $hidden:expr, $readonly:expr) => {
        BundledRelation {
            key: $key,
            name: $name,
            format: RelationFormat::$format,
            hidden: $hidden,
            readonly: $readonly,
        }
    };
}

pub static RELATIONS: &[BundledRelation] = &[
    relation!(keys::ID, "Anytype ID", ShortText, true, true),
    relation!(keys::SPACE_ID, "Space ID", ShortText, true, true),
    relation!(keys::NAME, "Name", ShortText, false, false),
    relation!(keys::DESCRIPTION, "Description", LongText, false, false),
    relation!(keys::SNIPPET, "Snippet", LongText, true, true),
    relation!(keys::TYPE, "Object type", Object, false, false),
    relation!(keys::LAYOUT, "Layout", Number, true, false),
    relation!(keys::LINKS, "Links", Object, true, true),
    relation!(keys::BACKLINKS, "Backlinks", Object, false, true),
    relation!(keys::IS_DELETED, "Is deleted", Checkbox, true, true),
    relation!(keys::IS_ARCHIVED, "Archived", Checkbox, true, false),
    relation!(keys::IS_HIDDEN, "Hidden", Checkbox, true, false),
    relation!(keys::IS_READONLY, "Read only", Checkbox, true, true),
    relation!(keys::SYNC_STATUS, "Sync status", Number, true, true),
    relation!(keys::RECOMMENDED_RELATIONS, "Recommended relations", Object, true, false),
    relation!(keys::LAST_MODIFIED_DATE, "Last modified date", Date, false, true),
    relation!(keys::LAST_MODIFIED_BY, "Last modified by", Object, false, true),
    relation!(keys::LAST_OPENED_DATE, "Last opened date", Date, true, true),
    relation!(keys::CREATED_DATE, "Creation date", Date, false, true),
    relation!(keys::CREATOR, "Created by", Object, false, true),
    relation!(keys::UNIQUE_KEY, "Unique key", ShortText, true, true),
    relation!(keys::RELATION_KEY, "Relation key", ShortText, true, true),
    relation!(keys::RELATION_FORMAT, "Format", Number, true, true),
    relation!(keys::TAG, "Tag", Tag, false, false),
    relation!(keys::STATUS, "Status", Status, false, false),
    relation!(keys::ASSIGNEE, "Assignee", Object, false, false),
    relation!(keys::TIMESTAMP, "Timestamp", Date, true, true),
    relation!(keys::IDENTITY, "Identity", ShortText, true, true),
    relation!(keys::PARTICIPANT_STATUS, "Participant status", Number, true, true),
    relation!(keys::TARGET_SPACE_ID, "Target space", ShortText, true, true),
];

pub static TYPES: &[BundledType] = &[
    BundledType {
        key: "page",
        name: "Page",
        layout: layout::BASIC,
        recommended_relations: &[keys::TAG, keys::BACKLINKS],
    },
    BundledType {
        key: "note",
        name: "Note",
        layout: layout::NOTE,
        recommended_relations: &[keys::TAG],
    },
    BundledType {
        key: "task",
        name: "Task",
        layout: layout::TODO,
        recommended_relations: &[keys::ASSIGNEE, keys::STATUS, keys::TAG],
    },
    BundledType {
        key: "set",
        name: "Set",
        layout: layout::SET,
        recommended_relations: &[],
    },
    BundledType {
        key: "collection",
        name: "Collection",
        layout: layout::COLLECTION,
        recommended_relations: &[],
    },
    BundledType {
        key: "profile",
        name: "Human",
        layout: layout::PROFILE,
        recommended_relations: &[],
    },
    BundledType {
        key: "date",
        name: "Date",
        layout: layout::DATE,
        recommended_relations: &[],
    },
    BundledType {
        key: "relation",
        name: "Relation",
        layout: layout::RELATION,
        recommended_relations: &[keys::RELATION_FORMAT],
    },
    BundledType {
        key: "relationOption",
        name: "Option",
        layout: layout::RELATION_OPTION,
        recommended_relations: &[],
    },
    BundledType {
        key: "objectType",
        name: "Type",
        layout: layout::OBJECT_TYPE,
        recommended_relations: &[keys::RECOMMENDED_RELATIONS],
    },
    BundledType {
        key: "participant",
        name: "Space member",
        layout: layout::PARTICIPANT,
        recommended_relations: &[keys::IDENTITY],
    },
    BundledType {
        key: "spaceView",
        name: "Space",
        layout: layout::SPACE_VIEW,
        recommended_relations: &[keys::TARGET_SPACE_ID],
    },
    BundledType {
        key: "chatDerived",
        name: "Chat",
        layout: layout::CHAT_DERIVED,
        recommended_relations: &[],
    },
];

pub fn relation(key: &str) -> Option<&'static BundledRelation> {
    RELATIONS.iter().find(|r| r.key == key)
}

pub fn object_type(key: &str) -> Option<&'static BundledType> {
    TYPES.iter().find(|t| t.key == key)
}

pub fn relation_format(key: &str) -> Option<RelationFormat> {
    relation(key).map(|r| r.format)
}

impl BundledRelation {
    pub fn details(&self) -> Details {
        let mut d = Details::with_id(&bundled_relation_id(self.key));
        d.set(keys::NAME, self.name);
        d.set(keys::RELATION_KEY, self.key);
        d.set(keys::RELATION_FORMAT, self.format.as_str());
        d.set(keys::LAYOUT, layout::RELATION);
        d.set(keys::TYPE, bundled_type_id("relation"));
        d.set(keys::UNIQUE_KEY, format!("rel-{}", self.key));
        d.set(keys::IS_HIDDEN, self.hidden);
        d.set(keys::IS_READONLY, true);
        d
    }
}

impl BundledType {
    pub fn details(&self) -> Details {
        let mut d = Details::with_id(&bundled_type_id(self.key));
        d.set(keys::NAME, self.name);
        d.set(keys::LAYOUT, layout::OBJECT_TYPE);
        d.set(keys::TYPE, bundled_type_id("objectType"));
        d.set(keys::UNIQUE_KEY, format!("ot-{}", self.key));
        d.set(
            keys::RECOMMENDED_RELATIONS,
            self.recommended_relations
                .iter()
                .map(|k| bundled_relation_id(k))
                .collect::<Vec<_>>(),
        );
        d.set(keys::IS_READONLY, true);
        d
    }
}
