//! Per-space materialized index.
//!
//! Every space owns one LMDB environment under `spaces/{spaceId}` holding the
//! details collection plus everything derived from it: links, snippets,
//! pending local details, active views, the last indexed heads hash and the
//! secondary indices used to narrow query scans.
//!
//! Details are stored as JSON keyed by object id. Writes that depend on a prior
//! read go through an optimistic loop: the stored bytes are captured outside
//! the write transaction, the caller's modifier runs, and the write commits only
//! if the bytes are unchanged. Otherwise the loop retries up to
//! `EngineConfig::conflict_retry_budget` times.

pub mod links;
pub mod query;
pub mod subscription;
pub mod views;

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use links::{LinksHub, LinksUpdateInfo, ObjectInfoWithLinks};
pub use subscription::{Subscription, SUBSCRIPTION_CAPACITY};

use crate::bundle;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::database::Filter;
use crate::domain::smartblock::layout;
use crate::domain::{keys, Details, RelationFormat};
use crate::error::{EngineError, Result};
use crate::ftsearch::FtSearch;
use crate::kv_store::{KvStore, WriteTxn};
use crate::objectstore::CommonStore;
use subscription::Subscriptions;

pub(crate) const DETAILS: &str = "details";
pub(crate) const PENDING: &str = "pending";
pub(crate) const ACTIVE_VIEWS: &str = "active_views";
pub(crate) const SNIPPETS: &str = "snippets";
pub(crate) const HEADS: &str = "heads_state";
pub(crate) const LINKS_OUT: &str = "links_out";
pub(crate) const LINKS_IN: &str = "links_in";
pub(crate) const IDX_TYPE: &str = "idx_type";
pub(crate) const IDX_OPTION: &str = "idx_option";
pub(crate) const IDX_RELATION: &str = "idx_relation";
pub(crate) const RELATION_FORMATS: &str = "relation_formats";

const TABLES: &[&str] = &[
    DETAILS,
    PENDING,
    ACTIVE_VIEWS,
    SNIPPETS,
    HEADS,
    LINKS_OUT,
    LINKS_IN,
    IDX_TYPE,
    IDX_OPTION,
    IDX_RELATION,
    RELATION_FORMATS,
];

const INDEX_TABLES: &[&str] = &[IDX_TYPE, IDX_OPTION, IDX_RELATION];

/// `a\0b`
pub(crate) fn pair_key(a: &str, b: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(a.len() + b.len() + 1);
    key.extend_from_slice(a.as_bytes());
    key.push(0);
    key.extend_from_slice(b.as_bytes());
    key
}

/// `a\0`
pub(crate) fn pair_prefix(a: &str) -> Vec<u8> {
    let mut key = a.as_bytes().to_vec();
    key.push(0);
    key
}

/// Last `\0`-separated segment of a composite key.
pub(crate) fn second_of_pair(key: &[u8]) -> Option<String> {
    let pos = key.iter().rposition(|b| *b == 0)?;
    Some(String::from_utf8_lossy(&key[pos + 1..]).into_owned())
}

fn option_key(relation_key: &str, option_id: &str, object_id: &str) -> Vec<u8> {
    let mut key = pair_key(relation_key, option_id);
    key.push(0);
    key.extend_from_slice(object_id.as_bytes());
    key
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: String,
    pub details: Details,
    #[serde(default)]
    pub snippet: String,
}

pub struct SpaceIndex {
    pub(crate) space_id: String,
    pub(crate) kv: KvStore,
    pub(crate) common: Arc<CommonStore>,
    pub(crate) fts: Option<Arc<FtSearch>>,
    pub(crate) links_hub: Arc<LinksHub>,
    subscriptions: Subscriptions,
    retry_budget: usize,
}

impl SpaceIndex {
    pub fn open(
        config: &EngineConfig,
        space_id: &str,
        common: Arc<CommonStore>,
        fts: Option<Arc<FtSearch>>,
        links_hub: Arc<LinksHub>,
    ) -> Result<Self> {
        let kv = KvStore::open(&config.spaces_path().join(space_id), TABLES, config.map_size)?;
        info!("space index {space_id} opened");
        Ok(Self {
            space_id: space_id.to_string(),
            kv,
            common,
            fts,
            links_hub,
            subscriptions: Subscriptions::default(),
            retry_budget: config.conflict_retry_budget.max(1),
        })
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    // Subscriptions

    /// Receives every details write accepted by `filter` or touching one of
    /// `seed_ids`. Without either, receives every write.
    pub fn subscribe(&self, filter: Option<Filter>, seed_ids: Vec<String>) -> Subscription {
        self.subscriptions.subscribe(filter, seed_ids)
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.subscriptions.unsubscribe(subscription_id)
    }

    // Details

    /// Stores `details` for `id`, injecting `id` and `spaceId`. Staged pending
    /// details are merged over the new ones and cleared in the same transaction.
    ///
    /// Returns `DetailsNotChanged` when the stored record already equals the
    /// result. Subscribers are not notified in that case.
    pub fn update_object_details(&self, ctx: &Context, id: &str, details: Details) -> Result<()> {
        ctx.check()?;
        if details.is_empty() {
            return Err(EngineError::Validation(format!("empty details for {id}")));
        }
        if let Some(own) = details.id() {
            if own != id {
                return Err(EngineError::Validation(format!("details id {own} does not match {id}")));
            }
        }
        self.common.bind_id(id, &self.space_id)?;

        let mut next = details;
        next.set(keys::ID, id);
        next.set(keys::SPACE_ID, self.space_id.as_str());

        let written = self.kv.write(|w| {
            let previous: Option<Details> = w.get_json(DETAILS, id.as_bytes())?;
            if let Some(pending) = w.get_json::<Details>(PENDING, id.as_bytes())? {
                next.merge(&pending);
                next.set(keys::ID, id);
                w.delete(PENDING, id.as_bytes())?;
            }
            if previous.as_ref() == Some(&next) {
                return Ok(None);
            }
            self.write_details(w, id, previous.as_ref(), &next)?;
            Ok(Some(previous))
        })?;

        match written {
            Some(previous) => {
                self.after_details_write(id, previous.as_ref(), &next);
                Ok(())
            }
            None => Err(EngineError::DetailsNotChanged),
        }
    }

    /// Read-modify-write of one record.
    ///
    /// `modify` receives the stored details (empty when absent) and may run
    /// more than once, always with a fresh read. Returning `DetailsNotChanged`
    /// or the unchanged record skips the write. `Ok(None)` leaves only `{id}`.
    pub fn modify_object_details(
        &self,
        id: &str,
        mut modify: impl FnMut(Details) -> Result<Option<Details>>,
    ) -> Result<()> {
        self.common.bind_id(id, &self.space_id)?;
        for attempt in 1..=self.retry_budget {
            let raw = self.kv.get(DETAILS, id.as_bytes())?;
            let current: Details = match &raw {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => Details::new(),
            };
            let next = match modify(current.clone()) {
                Ok(Some(mut d)) => {
                    d.set(keys::ID, id);
                    d.set(keys::SPACE_ID, self.space_id.as_str());
                    d
                }
                Ok(None) => Details::with_id(id),
                Err(EngineError::DetailsNotChanged) => return Ok(()),
                Err(err) => return Err(err),
            };
            if raw.is_some() && next == current {
                return Ok(());
            }

            let previous = raw.is_some().then_some(&current);
            let committed = self.kv.write(|w| {
                if w.get(DETAILS, id.as_bytes())? != raw {
                    return Ok(false);
                }
                self.write_details(w, id, previous, &next)?;
                Ok(true)
            })?;
            if committed {
                self.after_details_write(id, previous, &next);
                return Ok(());
            }
            debug!("details of {id} changed concurrently, retry {attempt}");
        }
        Err(EngineError::ObjectStoreConflict {
            id: id.to_string(),
            attempts: self.retry_budget,
        })
    }

    /// Read-modify-write over the pending staging map. `modify` receives the
    /// staged details with `id` set; `Ok(None)` deletes the entry and an error
    /// leaves it untouched.
    pub fn update_pending_local_details(
        &self,
        id: &str,
        mut modify: impl FnMut(Details) -> Result<Option<Details>>,
    ) -> Result<()> {
        for attempt in 1..=self.retry_budget {
            let raw = self.kv.get(PENDING, id.as_bytes())?;
            let mut current: Details = match &raw {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => Details::new(),
            };
            current.set(keys::ID, id);
            let next = match modify(current) {
                Ok(next) => next,
                Err(EngineError::DetailsNotChanged) => return Ok(()),
                Err(err) => return Err(err),
            };

            let committed = self.kv.write(|w| {
                if w.get(PENDING, id.as_bytes())? != raw {
                    return Ok(false);
                }
                match &next {
                    Some(details) => {
                        let mut details = details.clone();
                        details.set(keys::ID, id);
                        w.put_json(PENDING, id.as_bytes(), &details)?;
                    }
                    None => {
                        w.delete(PENDING, id.as_bytes())?;
                    }
                }
                Ok(true)
            })?;
            if committed {
                return Ok(());
            }
            debug!("pending details of {id} changed concurrently, retry {attempt}");
        }
        Err(EngineError::ObjectStoreConflict {
            id: id.to_string(),
            attempts: self.retry_budget,
        })
    }

    pub fn get_pending_local_details(&self, id: &str) -> Result<Option<Details>> {
        self.kv.get_json(PENDING, id.as_bytes())
    }

    /// Empty when the object is unknown.
    pub fn get_details(&self, id: &str) -> Result<Details> {
        Ok(self.kv.get_json(DETAILS, id.as_bytes())?.unwrap_or_default())
    }

    /// Ids with a stored record, tombstones included, in input order.
    pub fn has_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        self.kv.read(|r| {
            let mut present = Vec::with_capacity(ids.len());
            for id in ids {
                if r.get(DETAILS, id.as_bytes())?.is_some() {
                    present.push(id.clone());
                }
            }
            Ok(present)
        })
    }

    /// Live objects among `ids`; missing and deleted ones are skipped.
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ObjectInfo>> {
        self.kv.read(|r| {
            let mut infos = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(details) = r.get_json::<Details>(DETAILS, id.as_bytes())? else {
                    continue;
                };
                if details.get_bool(keys::IS_DELETED) {
                    continue;
                }
                let snippet = r
                    .get(SNIPPETS, id.as_bytes())?
                    .map(|s| String::from_utf8_lossy(&s).into_owned())
                    .unwrap_or_default();
                infos.push(ObjectInfo {
                    id: id.clone(),
                    details,
                    snippet,
                });
            }
            Ok(infos)
        })
    }

    pub fn object_info(&self, id: &str) -> Result<ObjectInfo> {
        let details: Details = self
            .kv
            .get_json(DETAILS, id.as_bytes())?
            .ok_or_else(|| EngineError::not_found(format!("object {id} in space {}", self.space_id)))?;
        Ok(ObjectInfo {
            id: id.to_string(),
            details,
            snippet: self.get_snippet(id)?,
        })
    }

    /// Ids of every live object.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list_all_details()?
            .into_iter()
            .filter(|d| !d.get_bool(keys::IS_DELETED))
            .filter_map(|d| d.id().map(str::to_string))
            .collect())
    }

    /// Every stored record, tombstones included.
    pub fn list_all_details(&self) -> Result<Vec<Details>> {
        self.kv
            .scan_prefix(DETAILS, b"")?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_slice(&v)?))
            .collect()
    }

    // Snippets

    /// Stores the snippet and queues the object for full-text indexing when it changed.
    pub fn update_object_snippet(&self, id: &str, snippet: &str) -> Result<()> {
        let changed = self.kv.write(|w| {
            if w.get(SNIPPETS, id.as_bytes())?.as_deref() == Some(snippet.as_bytes()) {
                return Ok(false);
            }
            w.put(SNIPPETS, id.as_bytes(), snippet.as_bytes())?;
            Ok(true)
        })?;
        if changed {
            self.common.add_to_index_queue(&[id.to_string()])?;
        }
        Ok(())
    }

    pub fn get_snippet(&self, id: &str) -> Result<String> {
        Ok(self
            .kv
            .get(SNIPPETS, id.as_bytes())?
            .map(|s| String::from_utf8_lossy(&s).into_owned())
            .unwrap_or_default())
    }

    // Heads

    pub fn save_last_indexed_heads_hash(&self, id: &str, hash: &str) -> Result<()> {
        self.kv.put(HEADS, id.as_bytes(), hash.as_bytes())
    }

    pub fn get_last_indexed_heads_hash(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(HEADS, id.as_bytes())?
            .map(|h| String::from_utf8_lossy(&h).into_owned()))
    }

    // Deletion

    /// Replaces the record with a `{id, isDeleted}` tombstone and drops
    /// everything derived from it: snippet, heads hash, pending details,
    /// active views, and links in both directions. Idempotent.
    pub fn delete_object(&self, id: &str) -> Result<Details> {
        let mut tombstone = Details::with_id(id);
        tombstone.set(keys::IS_DELETED, true);

        let (changed, removed_outbound) = self.kv.write(|w| {
            let previous: Option<Details> = w.get_json(DETAILS, id.as_bytes())?;
            let changed = previous.as_ref() != Some(&tombstone);
            if changed {
                self.write_details(w, id, previous.as_ref(), &tombstone)?;
            }
            for table in [SNIPPETS, HEADS, PENDING, ACTIVE_VIEWS] {
                w.delete(table, id.as_bytes())?;
            }

            let outbound = links::outbound_in_txn(w, id)?;
            for target in &outbound {
                w.delete(LINKS_OUT, &pair_key(id, target))?;
                w.delete(LINKS_IN, &pair_key(target, id))?;
            }
            for source in links::inbound_in_txn(w, id)? {
                w.delete(LINKS_OUT, &pair_key(&source, id))?;
                w.delete(LINKS_IN, &pair_key(id, &source))?;
            }
            Ok((changed, outbound))
        })?;

        self.common.remove_ids_from_full_text_queue(&[id.to_string()])?;
        if let Some(fts) = &self.fts {
            if let Err(err) = fts.delete_object(id) {
                warn!("failed to remove {id} from full-text index: {err}");
            }
        }
        if changed {
            self.subscriptions.publish(&tombstone);
        }
        self.links_hub.publish(LinksUpdateInfo {
            space_id: self.space_id.clone(),
            links_from_id: id.to_string(),
            added: Vec::new(),
            removed: removed_outbound,
        });
        Ok(tombstone)
    }

    /// Wipes details and snippets of `ids`, leaving links in place.
    pub fn delete_details(&self, ids: &[String]) -> Result<()> {
        self.kv.write(|w| {
            for id in ids {
                if let Some(previous) = w.get_json::<Details>(DETAILS, id.as_bytes())? {
                    for (table, key) in index_entries(w, id, &previous)? {
                        w.delete(table, &key)?;
                    }
                    w.delete(DETAILS, id.as_bytes())?;
                }
                w.delete(SNIPPETS, id.as_bytes())?;
            }
            Ok(())
        })
    }

    // Derived indices

    /// Drops and recomputes the type, option and relation indices from the
    /// stored details.
    pub fn rebuild_indices(&self) -> Result<usize> {
        let count = self.kv.write(|w| {
            for table in INDEX_TABLES {
                w.clear(table)?;
            }
            let all: Vec<(String, Details)> = w
                .scan_prefix(DETAILS, b"")?
                .into_iter()
                .map(|(k, v)| -> Result<(String, Details)> {
                    Ok((String::from_utf8_lossy(&k).into_owned(), serde_json::from_slice(&v)?))
                })
                .collect::<Result<_>>()?;
            for (_, details) in &all {
                remember_relation_format(w, details)?;
            }
            for (id, details) in &all {
                for (table, key) in index_entries(w, id, details)? {
                    w.put(table, &key, b"")?;
                }
            }
            Ok(all.len())
        })?;
        info!("rebuilt indices of {count} objects in space {}", self.space_id);
        Ok(count)
    }

    /// Format of `key`, from the bundle or from a relation object stored in this space.
    pub fn relation_format(&self, key: &str) -> Result<Option<RelationFormat>> {
        if let Some(format) = bundle::relation_format(key) {
            return Ok(Some(format));
        }
        Ok(self
            .kv
            .get(RELATION_FORMATS, key.as_bytes())?
            .and_then(|raw| RelationFormat::parse(&String::from_utf8_lossy(&raw))))
    }

    fn write_details(&self, w: &mut WriteTxn<'_>, id: &str, previous: Option<&Details>, next: &Details) -> Result<()> {
        remember_relation_format(w, next)?;
        let old_entries = match previous {
            Some(prev) => index_entries(w, id, prev)?,
            None => BTreeSet::new(),
        };
        let new_entries = index_entries(w, id, next)?;
        for (table, key) in old_entries.difference(&new_entries) {
            w.delete(table, key)?;
        }
        for (table, key) in new_entries.difference(&old_entries) {
            w.put(table, key, b"")?;
        }
        w.put_json(DETAILS, id.as_bytes(), next)
    }

    /// Publishes the write and queues the object for full-text indexing when a
    /// searchable field changed.
    fn after_details_write(&self, id: &str, previous: Option<&Details>, next: &Details) {
        self.subscriptions.publish(next);
        let needs_fulltext = match previous {
            None => true,
            Some(prev) => prev
                .changed_keys(next)
                .iter()
                .any(|k| crate::domain::relation::FULLTEXT_KEYS.contains(&k.as_str())),
        };
        if needs_fulltext && !next.get_bool(keys::IS_DELETED) {
            if let Err(err) = self.common.add_to_index_queue(&[id.to_string()]) {
                warn!("failed to queue {id} for full-text indexing: {err}");
            }
        }
    }
}

fn remember_relation_format(w: &mut WriteTxn<'_>, details: &Details) -> Result<()> {
    if details.get_i64(keys::LAYOUT) != Some(layout::RELATION) {
        return Ok(());
    }
    if let (Some(key), Some(format)) = (details.get_str(keys::RELATION_KEY), details.get_str(keys::RELATION_FORMAT)) {
        w.put(RELATION_FORMATS, key.as_bytes(), format.as_bytes())?;
    }
    Ok(())
}

fn format_in_txn(w: &WriteTxn<'_>, key: &str) -> Result<Option<RelationFormat>> {
    if let Some(format) = bundle::relation_format(key) {
        return Ok(Some(format));
    }
    Ok(w
        .get(RELATION_FORMATS, key.as_bytes())?
        .and_then(|raw| RelationFormat::parse(&String::from_utf8_lossy(&raw))))
}

/// Index rows derived from one record. Tombstones have none.
fn index_entries(w: &WriteTxn<'_>, id: &str, details: &Details) -> Result<BTreeSet<(&'static str, Vec<u8>)>> {
    let mut entries = BTreeSet::new();
    if details.get_bool(keys::IS_DELETED) {
        return Ok(entries);
    }
    for type_id in details.get_list(keys::TYPE) {
        entries.insert((IDX_TYPE, pair_key(&type_id, id)));
    }
    for (key, value) in details.iter() {
        if key == keys::ID || value.is_empty() {
            continue;
        }
        entries.insert((IDX_RELATION, pair_key(key, id)));
        if format_in_txn(w, key)?.is_some_and(RelationFormat::is_option) {
            for option in value.to_string_list() {
                entries.insert((IDX_OPTION, option_key(key, &option, id)));
            }
        }
    }
    Ok(entries)
}
