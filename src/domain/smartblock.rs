use serde::{Deserialize, Serialize};

/// Classification of an object. Drives source dispatch and query defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SmartBlockType {
    Page,
    ProfilePage,
    Home,
    Archive,
    Widget,
    Workspace,
    SpaceView,
    Template,
    BundledTemplate,
    Date,
    File,
    Relation,
    RelationOption,
    ObjectType,
    BundledRelation,
    BundledObjectType,
    AnytypeProfile,
    MissingObject,
    Participant,
    Identity,
    ChatDerived,
    AccountObject,
}

impl SmartBlockType {
    /// Types served by a store source instead of a plain tree source.
    pub fn is_store_backed(self) -> bool {
        matches!(self, SmartBlockType::ChatDerived | SmartBlockType::AccountObject)
    }

    /// Types synthesised in-process with no change tree.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            SmartBlockType::Date
                | SmartBlockType::BundledRelation
                | SmartBlockType::BundledObjectType
                | SmartBlockType::AnytypeProfile
                | SmartBlockType::MissingObject
                | SmartBlockType::Participant
        )
    }

    /// Whether the backlinks relation of such an object is maintained.
    pub fn keeps_backlinks(self) -> bool {
        !self.is_virtual()
            && !matches!(
                self,
                SmartBlockType::Home
                    | SmartBlockType::Archive
                    | SmartBlockType::Widget
                    | SmartBlockType::Workspace
                    | SmartBlockType::SpaceView
                    | SmartBlockType::Identity
            )
    }

    /// Changes of these types carry user edits and feed last-modified tracking.
    pub fn tracks_last_modified(self) -> bool {
        !matches!(
            self,
            SmartBlockType::Archive | SmartBlockType::Widget | SmartBlockType::Workspace | SmartBlockType::Home
        )
    }
}

/// Numeric layouts stored under the `layout` relation.
pub mod layout {
    pub const BASIC: i64 = 0;
    pub const PROFILE: i64 = 1;
    pub const TODO: i64 = 2;
    pub const SET: i64 = 3;
    pub const OBJECT_TYPE: i64 = 4;
    pub const RELATION: i64 = 5;
    pub const FILE: i64 = 6;
    pub const DASHBOARD: i64 = 7;
    pub const NOTE: i64 = 9;
    pub const SPACE: i64 = 10;
    pub const RELATION_OPTION: i64 = 13;
    pub const COLLECTION: i64 = 14;
    pub const SPACE_VIEW: i64 = 17;
    pub const PARTICIPANT: i64 = 19;
    pub const DATE: i64 = 21;
    pub const CHAT_DERIVED: i64 = 23;
}
