//! Self-describing virtual ids.

use chrono::NaiveDate;

use crate::domain::smartblock::SmartBlockType;

pub const BUNDLED_RELATION_PREFIX: &str = "_br";
pub const BUNDLED_TYPE_PREFIX: &str = "_ot";
pub const DATE_PREFIX: &str = "_date_";
pub const PARTICIPANT_PREFIX: &str = "_participant_";
pub const MISSING_OBJECT_ID: &str = "_missing_object";
pub const ANYTYPE_PROFILE_ID: &str = "_anytype_profile";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualId {
    BundledRelation(String),
    BundledType(String),
    Date(NaiveDate),
    Participant { space_id: String, identity: String },
    MissingObject,
    Profile,
}

impl VirtualId {
    pub fn parse(id: &str) -> Option<Self> {
        if id == MISSING_OBJECT_ID {
            return Some(VirtualId::MissingObject);
        }
        if id == ANYTYPE_PROFILE_ID {
            return Some(VirtualId::Profile);
        }
        if let Some(rest) = id.strip_prefix(DATE_PREFIX) {
            return NaiveDate::parse_from_str(rest, DATE_FORMAT).ok().map(VirtualId::Date);
        }
        if let Some(rest) = id.strip_prefix(PARTICIPANT_PREFIX) {
            let (space_id, identity) = rest.rsplit_once('_')?;
            if space_id.is_empty() || identity.is_empty() {
                return None;
            }
            return Some(VirtualId::Participant {
                space_id: space_id.to_string(),
                identity: identity.to_string(),
            });
        }
        if let Some(key) = id.strip_prefix(BUNDLED_RELATION_PREFIX) {
            return (!key.is_empty()).then(|| VirtualId::BundledRelation(key.to_string()));
        }
        if let Some(key) = id.strip_prefix(BUNDLED_TYPE_PREFIX) {
            return (!key.is_empty()).then(|| VirtualId::BundledType(key.to_string()));
        }
        None
    }

    pub fn smartblock_type(&self) -> SmartBlockType {
        match self {
            VirtualId::BundledRelation(_) => SmartBlockType::BundledRelation,
            VirtualId::BundledType(_) => SmartBlockType::BundledObjectType,
            VirtualId::Date(_) => SmartBlockType::Date,
            VirtualId::Participant { .. } => SmartBlockType::Participant,
            VirtualId::MissingObject => SmartBlockType::MissingObject,
            VirtualId::Profile => SmartBlockType::AnytypeProfile,
        }
    }
}

pub fn date_object_id(date: NaiveDate) -> String {
    format!("{DATE_PREFIX}{}", date.format(DATE_FORMAT))
}

pub fn participant_id(space_id: &str, identity: &str) -> String {
    format!("{PARTICIPANT_PREFIX}{space_id}_{identity}")
}

pub fn bundled_relation_id(key: &str) -> String {
    format!("{BUNDLED_RELATION_PREFIX}{key}")
}

pub fn bundled_type_id(key: &str) -> String {
    format!("{BUNDLED_TYPE_PREFIX}{key}")
}

pub fn is_date_id(id: &str) -> bool {
    id.starts_with(DATE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_virtual_prefixes() {
        assert_eq!(VirtualId::parse("_brname"), Some(VirtualId::BundledRelation("name".into())));
        assert_eq!(VirtualId::parse("_otpage"), Some(VirtualId::BundledType("page".into())));
        assert_eq!(VirtualId::parse(MISSING_OBJECT_ID), Some(VirtualId::MissingObject));
        assert_eq!(VirtualId::parse(ANYTYPE_PROFILE_ID), Some(VirtualId::Profile));
        assert_eq!(VirtualId::parse("bafyreiabc"), None);
        assert_eq!(VirtualId::parse("_br"), None);
    }

    #[test]
    fn test_date_id_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let id = date_object_id(date);
        assert_eq!(id, "_date_2024-01-15");
        assert_eq!(VirtualId::parse(&id), Some(VirtualId::Date(date)));
        assert_eq!(VirtualId::parse("_date_2024-13-40"), None);
    }

    #[test]
    fn test_participant_splits_on_last_underscore() {
        let id = participant_id("space_a.1", "identity1");
        assert_eq!(
            VirtualId::parse(&id),
            Some(VirtualId::Participant {
                space_id: "space_a.1".into(),
                identity: "identity1".into()
            })
        );
    }
}
