use std::sync::Arc;

use chrono::NaiveDate;

use super::{ChangeReceiver, CreationInfo, PushChangeParams, Source, SourceKind};
use crate::bundle;
use crate::change::FileKeys;
use crate::domain::ids::{bundled_type_id, VirtualId};
use crate::domain::smartblock::layout;
use crate::domain::{keys, Details, SmartBlockType};
use crate::error::{EngineError, Result};
use crate::state::{apply_state_fast_one, State};

const DATE_NAME_FORMAT: &str = "%d %b %Y";

/// Read-only object synthesised from its id.
pub struct VirtualSource {
    id: String,
    space_id: String,
    virtual_id: VirtualId,
}

impl VirtualSource {
    pub fn new(space_id: &str, id: &str, virtual_id: VirtualId) -> Self {
        Self {
            id: id.to_string(),
            space_id: space_id.to_string(),
            virtual_id,
        }
    }

    /// Parses `id` and wraps it when it carries a virtual prefix.
    pub fn parse(space_id: &str, id: &str) -> Option<Self> {
        VirtualId::parse(id).map(|v| Self::new(space_id, id, v))
    }

    /// Details the document is made of.
    pub fn details(&self) -> Result<Details> {
        let mut d = match &self.virtual_id {
            VirtualId::Date(date) => date_details(&self.id, *date),
            VirtualId::BundledType(key) => bundle::object_type(key)
                .map(|t| t.details())
                .ok_or_else(|| EngineError::not_found(format!("bundled type {key}")))?,
            VirtualId::BundledRelation(key) => bundle::relation(key)
                .map(|r| r.details())
                .ok_or_else(|| EngineError::not_found(format!("bundled relation {key}")))?,
            VirtualId::Profile => {
                let mut d = Details::with_id(&self.id);
                d.set(keys::NAME, "Anytype");
                d.set(keys::DESCRIPTION, "Authored by Anytype team");
                d.set(keys::LAYOUT, layout::PROFILE);
                d.set(keys::TYPE, bundled_type_id("profile"));
                d
            }
            VirtualId::MissingObject => {
                let mut d = Details::with_id(&self.id);
                d.set(keys::LAYOUT, layout::BASIC);
                d.set(keys::IS_HIDDEN, true);
                d
            }
            VirtualId::Participant { identity, .. } => {
                let mut d = Details::with_id(&self.id);
                d.set(keys::LAYOUT, layout::PARTICIPANT);
                d.set(keys::TYPE, bundled_type_id("participant"));
                d.set(keys::IDENTITY, identity.as_str());
                d
            }
        };
        d.set(keys::IS_READONLY, true);
        d.set(keys::SPACE_ID, self.space_id.as_str());
        Ok(d)
    }
}

fn date_details(id: &str, date: NaiveDate) -> Details {
    let mut d = Details::with_id(id);
    d.set(keys::NAME, date.format(DATE_NAME_FORMAT).to_string());
    d.set(keys::LAYOUT, layout::DATE);
    d.set(keys::TYPE, bundled_type_id("date"));
    d.set(keys::TIMESTAMP, midnight_utc(date));
    d
}

fn midnight_utc(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

impl Source for VirtualSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    fn kind(&self) -> SourceKind {
        match self.virtual_id {
            VirtualId::Date(_) => SourceKind::Date,
            VirtualId::BundledType(_) => SourceKind::BundledType,
            VirtualId::BundledRelation(_) => SourceKind::BundledRelation,
            VirtualId::Profile => SourceKind::Profile,
            VirtualId::MissingObject => SourceKind::Missing,
            VirtualId::Participant { .. } => SourceKind::Participant,
        }
    }

    fn smartblock_type(&self) -> SmartBlockType {
        self.virtual_id.smartblock_type()
    }

    fn read_only(&self) -> bool {
        true
    }

    fn read_doc(&self, _receiver: Option<Arc<dyn ChangeReceiver>>) -> Result<State> {
        let details = self.details()?;
        let mut st = State::new_doc(&self.id).new_state();
        for (key, value) in details.iter().filter(|(k, _)| k.as_str() != keys::ID) {
            st.set_detail(key, value.clone());
        }
        st.set_space_id(&self.space_id);
        st.set_smartblock_type(self.smartblock_type());
        let (st, _) = apply_state_fast_one(st)?;
        Ok(st)
    }

    fn push_change(&self, _params: PushChangeParams) -> Result<String> {
        Err(EngineError::ReadOnly(self.id.clone()))
    }

    fn heads(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn file_keys_snapshot(&self) -> Vec<FileKeys> {
        Vec::new()
    }

    fn creation_info(&self) -> Result<CreationInfo> {
        let created_date = match &self.virtual_id {
            VirtualId::Date(date) => midnight_utc(*date),
            _ => 0,
        };
        Ok(CreationInfo {
            creator: String::new(),
            created_date,
        })
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{bundled_relation_id, date_object_id, participant_id, MISSING_OBJECT_ID};

    #[test]
    fn test_date_details_from_id() {
        let id = date_object_id(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let source = VirtualSource::parse("space1", &id).unwrap();
        assert_eq!(source.kind(), SourceKind::Date);
        let st = source.read_doc(None).unwrap();
        let d = st.details();
        assert_eq!(d.get_str(keys::NAME), Some("15 Jan 2024"));
        assert_eq!(d.get_i64(keys::TIMESTAMP), Some(1_705_276_800));
        assert_eq!(d.get_i64(keys::LAYOUT), Some(layout::DATE));
        assert_eq!(d.get_str(keys::SPACE_ID), Some("space1"));
        assert_eq!(d.id(), Some(id.as_str()));
        assert_eq!(source.creation_info().unwrap().created_date, 1_705_276_800);
    }

    #[test]
    fn test_bundled_sources_use_bundle() {
        let rel = VirtualSource::parse("space1", &bundled_relation_id(keys::TAG)).unwrap();
        assert_eq!(rel.kind(), SourceKind::BundledRelation);
        let d = rel.read_doc(None).unwrap().details().clone();
        assert_eq!(d.get_str(keys::RELATION_FORMAT), Some("tag"));

        let unknown = VirtualSource::parse("space1", "_otnosuchtype").unwrap();
        assert!(unknown.read_doc(None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_virtual_sources_are_read_only() {
        for id in [
            MISSING_OBJECT_ID.to_string(),
            participant_id("space1", "alice"),
            "_anytype_profile".to_string(),
        ] {
            let source = VirtualSource::parse("space1", &id).unwrap();
            assert!(source.read_only());
            assert!(source.kind().is_virtual());
            assert!(matches!(
                source.push_change(PushChangeParams::default()),
                Err(EngineError::ReadOnly(_))
            ));
            assert_eq!(source.heads(), vec![id.clone()]);
            assert!(source.read_doc(None).unwrap().details().get_bool(keys::IS_READONLY));
        }
    }
}
