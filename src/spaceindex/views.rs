//! Active dataview per block, kept out of details.

use std::collections::BTreeMap;

use super::{SpaceIndex, ACTIVE_VIEWS};
use crate::error::{EngineError, Result};

/// Packs `block:view` pairs separated by commas.
pub fn pack_views(views: &BTreeMap<String, String>) -> String {
    views
        .iter()
        .map(|(block, view)| format!("{block}:{view}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Every entry must hold exactly one `:`. Either side may be empty.
pub fn parse_views(raw: &str) -> Result<BTreeMap<String, String>> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    raw.split(',')
        .map(|entry| {
            let (block, view) = entry
                .split_once(':')
                .filter(|(_, view)| !view.contains(':'))
                .ok_or_else(|| EngineError::ParseView(entry.to_string()))?;
            Ok((block.to_string(), view.to_string()))
        })
        .collect()
}

impl SpaceIndex {
    pub fn set_active_view(&self, object_id: &str, block_id: &str, view_id: &str) -> Result<()> {
        self.kv.write(|w| {
            let mut views = match w.get(ACTIVE_VIEWS, object_id.as_bytes())? {
                Some(raw) => parse_views(&String::from_utf8_lossy(&raw))?,
                None => BTreeMap::new(),
            };
            views.insert(block_id.to_string(), view_id.to_string());
            w.put(ACTIVE_VIEWS, object_id.as_bytes(), pack_views(&views).as_bytes())
        })
    }

    /// Replaces every active view of the object.
    pub fn set_active_views(&self, object_id: &str, views: &BTreeMap<String, String>) -> Result<()> {
        self.kv.put(ACTIVE_VIEWS, object_id.as_bytes(), pack_views(views).as_bytes())
    }

    pub fn get_active_views(&self, object_id: &str) -> Result<BTreeMap<String, String>> {
        match self.kv.get(ACTIVE_VIEWS, object_id.as_bytes())? {
            Some(raw) => parse_views(&String::from_utf8_lossy(&raw)),
            None => Ok(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaceindex::tests::Fixture;

    #[test]
    fn test_pack_parse_with_empty_sides() {
        let views: BTreeMap<String, String> = [("blk1", "view1"), ("", "view2"), ("blk3", "")]
            .into_iter()
            .map(|(b, v)| (b.to_string(), v.to_string()))
            .collect();
        let packed = pack_views(&views);
        assert_eq!(packed, ":view2,blk1:view1,blk3:");
        assert_eq!(parse_views(&packed).unwrap(), views);
    }

    #[test]
    fn test_malformed_entries_rejected() {
        assert!(matches!(parse_views("blk1view1"), Err(EngineError::ParseView(_))));
        assert!(matches!(parse_views("a:b,c"), Err(EngineError::ParseView(_))));
        assert!(matches!(parse_views("a:b:c"), Err(EngineError::ParseView(_))));
        assert!(parse_views("").unwrap().is_empty());
    }

    #[test]
    fn test_set_and_get() {
        let fx = Fixture::new("space1");
        fx.index.set_active_view("obj", "blk1", "v1").unwrap();
        fx.index.set_active_view("obj", "blk2", "v2").unwrap();
        fx.index.set_active_view("obj", "blk1", "v3").unwrap();
        let views = fx.index.get_active_views("obj").unwrap();
        assert_eq!(views.get("blk1").map(String::as_str), Some("v3"));
        assert_eq!(views.len(), 2);
        // Not part of details.
        assert!(fx.index.get_details("obj").unwrap().is_empty());

        fx.index.set_active_views("obj", &BTreeMap::new()).unwrap();
        assert!(fx.index.get_active_views("obj").unwrap().is_empty());
    }
}
