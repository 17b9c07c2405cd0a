//! Outbound/inbound link edges and the link-update fan-out.

use std::collections::BTreeSet;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{pair_key, pair_prefix, second_of_pair, ObjectInfo, SpaceIndex, LINKS_IN, LINKS_OUT};
use crate::error::Result;
use crate::kv_store::WriteTxn;

/// Diff of one object's outbound links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinksUpdateInfo {
    pub space_id: String,
    pub links_from_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl LinksUpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Fans link diffs out to every subscriber. Sends never block.
#[derive(Default)]
pub struct LinksHub {
    subscribers: Mutex<Vec<Sender<LinksUpdateInfo>>>,
}

impl LinksHub {
    pub fn subscribe(&self) -> Receiver<LinksUpdateInfo> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, info: LinksUpdateInfo) {
        if info.is_empty() {
            return;
        }
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.try_send(info.clone()).is_ok());
        debug!(
            "links of {} changed: +{} -{} ({} subscribers)",
            info.links_from_id,
            info.added.len(),
            info.removed.len(),
            subs.len()
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfoWithLinks {
    pub info: ObjectInfo,
    pub inbound: Vec<ObjectInfo>,
    pub outbound: Vec<ObjectInfo>,
}

impl SpaceIndex {
    /// Replaces the outbound links of `id` and mirrors the change into the
    /// inbound table. Subscribers receive the diff when it is not empty.
    pub fn update_object_links(&self, id: &str, links: &[String]) -> Result<()> {
        let wanted: BTreeSet<String> = links.iter().filter(|l| !l.is_empty()).cloned().collect();
        let (added, removed) = self.kv.write(|w| {
            let existing: BTreeSet<String> = outbound_in_txn(w, id)?.into_iter().collect();
            let added: Vec<String> = wanted.difference(&existing).cloned().collect();
            let removed: Vec<String> = existing.difference(&wanted).cloned().collect();
            for target in &added {
                w.put(LINKS_OUT, &pair_key(id, target), b"")?;
            }
            for target in &added {
                w.put(LINKS_IN, &pair_key(target, id), b"")?;
            }
            for target in &removed {
                w.delete(LINKS_OUT, &pair_key(id, target))?;
                w.delete(LINKS_IN, &pair_key(target, id))?;
            }
            Ok((added, removed))
        })?;
        self.links_hub.publish(LinksUpdateInfo {
            space_id: self.space_id.clone(),
            links_from_id: id.to_string(),
            added,
            removed,
        });
        Ok(())
    }

    pub fn get_outbound_links_by_id(&self, id: &str) -> Result<Vec<String>> {
        self.kv.read(|r| {
            Ok(r.scan_prefix(LINKS_OUT, &pair_prefix(id))?
                .iter()
                .filter_map(|(k, _)| second_of_pair(k))
                .collect())
        })
    }

    pub fn get_inbound_links_by_id(&self, id: &str) -> Result<Vec<String>> {
        self.kv.read(|r| {
            Ok(r.scan_prefix(LINKS_IN, &pair_prefix(id))?
                .iter()
                .filter_map(|(k, _)| second_of_pair(k))
                .collect())
        })
    }

    pub fn get_with_links_info_by_id(&self, id: &str) -> Result<ObjectInfoWithLinks> {
        let info = self.object_info(id)?;
        let inbound = self.get_by_ids(&self.get_inbound_links_by_id(id)?)?;
        let outbound = self.get_by_ids(&self.get_outbound_links_by_id(id)?)?;
        Ok(ObjectInfoWithLinks { info, inbound, outbound })
    }
}

pub(super) fn outbound_in_txn(w: &WriteTxn<'_>, id: &str) -> Result<Vec<String>> {
    Ok(w.scan_prefix(LINKS_OUT, &pair_prefix(id))?
        .iter()
        .filter_map(|(k, _)| second_of_pair(k))
        .collect())
}

pub(super) fn inbound_in_txn(w: &WriteTxn<'_>, id: &str) -> Result<Vec<String>> {
    Ok(w.scan_prefix(LINKS_IN, &pair_prefix(id))?
        .iter()
        .filter_map(|(k, _)| second_of_pair(k))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaceindex::tests::Fixture;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_links_are_symmetric() {
        let fx = Fixture::new("space1");
        let rx = fx.hub.subscribe();
        fx.index.update_object_links("id1", &ids(&["id2", "id3"])).unwrap();
        assert_eq!(fx.index.get_outbound_links_by_id("id1").unwrap(), ids(&["id2", "id3"]));
        assert_eq!(fx.index.get_inbound_links_by_id("id2").unwrap(), ids(&["id1"]));
        assert_eq!(fx.index.get_inbound_links_by_id("id3").unwrap(), ids(&["id1"]));

        let info = rx.try_recv().unwrap();
        assert_eq!(info.added, ids(&["id2", "id3"]));
        assert!(info.removed.is_empty());
        assert_eq!(info.space_id, "space1");
    }

    #[test]
    fn test_replacing_links_emits_diff() {
        let fx = Fixture::new("space1");
        fx.index.update_object_links("id1", &ids(&["id2", "id3"])).unwrap();
        let rx = fx.hub.subscribe();
        fx.index.update_object_links("id1", &ids(&["id3", "id4"])).unwrap();

        let info = rx.try_recv().unwrap();
        assert_eq!(info.added, ids(&["id4"]));
        assert_eq!(info.removed, ids(&["id2"]));
        assert!(fx.index.get_inbound_links_by_id("id2").unwrap().is_empty());

        // Same set again: nothing to publish.
        fx.index.update_object_links("id1", &ids(&["id4", "id3"])).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_links_info() {
        let fx = Fixture::new("space1");
        fx.put_named("id1", "one");
        fx.put_named("id2", "two");
        fx.put_named("id3", "three");
        fx.index.update_object_links("id1", &ids(&["id2", "id3"])).unwrap();
        fx.index.update_object_links("id2", &ids(&["id3"])).unwrap();

        let info = fx.index.get_with_links_info_by_id("id3").unwrap();
        assert_eq!(info.info.id, "id3");
        let inbound: Vec<&str> = info.inbound.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(inbound, vec!["id1", "id2"]);
        assert!(info.outbound.is_empty());
    }
}
