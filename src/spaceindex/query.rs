//! Query evaluation over one space.
//!
//! Candidates come from the narrowest source available: full-text hits, the
//! type index, the option index, or a scan of every record. Each candidate is
//! checked against the effective filter and kept in a bounded ordered map, so
//! memory stays at `offset + limit` entries no matter how many records match.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{pair_key, pair_prefix, second_of_pair, SpaceIndex, DETAILS, IDX_OPTION, IDX_TYPE};
use crate::database::{Filter, Meta, Query, QueryResult, Record, SortKey};
use crate::domain::{keys, Details};
use crate::error::Result;
use crate::ftsearch::{DocPath, FtSearch, HighlightFormat};

/// Full-text result folded per object.
#[derive(Debug, Clone, Default)]
pub(crate) struct TextMatch {
    /// Position of the object's best hit in the ranked list.
    pub rank: usize,
    pub score: f64,
    pub meta: Vec<Meta>,
}

pub(crate) type TextMatches = HashMap<String, TextMatch>;

/// Runs the search once and groups document hits by owning object.
pub(crate) fn text_matches(fts: &FtSearch, space_ids: &[String], text: &str) -> Result<TextMatches> {
    let hits = fts.search(space_ids, HighlightFormat::Text, text)?;
    let mut matches: TextMatches = HashMap::new();
    for hit in hits {
        let path = DocPath::parse(&hit.id);
        let next_rank = matches.len();
        let entry = matches
            .entry(path.object_id().to_string())
            .or_insert_with(|| TextMatch {
                rank: next_rank,
                score: hit.score,
                meta: Vec::new(),
            });
        entry.score = entry.score.max(hit.score);
        let mut meta = Meta {
            highlight: hit.highlight,
            highlight_ranges: hit.ranges,
            ..Meta::default()
        };
        match path {
            DocPath::Block { block_id, .. } => meta.block_id = block_id,
            DocPath::Relation { key, .. } => meta.relation_key = key,
            DocPath::Object { .. } => {}
        }
        entry.meta.push(meta);
    }
    Ok(matches)
}

/// Ordered matches of one space, capped at `keep` entries.
pub(crate) struct Collected {
    pub entries: BTreeMap<SortKey, Record>,
    pub total: usize,
}

/// Number of records a page needs before pagination is applied.
pub(crate) fn keep_for(query: &Query) -> usize {
    query.limit.map_or(usize::MAX, |limit| query.offset.saturating_add(limit))
}

/// Inserts keeping only the first `keep` entries in sort order.
pub(crate) fn insert_bounded(entries: &mut BTreeMap<SortKey, Record>, key: SortKey, record: Record, keep: usize) {
    if keep == 0 {
        return;
    }
    entries.insert(key, record);
    if entries.len() > keep {
        entries.pop_last();
    }
}

impl SpaceIndex {
    /// Filters, sorts and paginates the records of this space.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        let matches = match (&self.fts, query.full_text.trim().is_empty()) {
            (_, true) => None,
            (Some(fts), false) => Some(text_matches(fts, &[self.space_id.clone()], &query.full_text)?),
            (None, false) => Some(TextMatches::new()),
        };
        let collected = self.collect(query, matches.as_ref(), keep_for(query))?;
        let records: Vec<Record> = collected.entries.into_values().collect();
        let mut result = QueryResult::paginate(records, query.offset, query.limit);
        result.total = collected.total;
        Ok(result)
    }

    /// Records matching `filter` in id order. Deleted and archived records are
    /// not excluded implicitly.
    pub fn query_raw(&self, filter: &Filter, limit: Option<usize>, offset: usize) -> Result<Vec<Details>> {
        let mut out = Vec::new();
        let mut skipped = 0;
        for (_, raw) in self.kv.scan_prefix(DETAILS, b"")? {
            let details: Details = serde_json::from_slice(&raw)?;
            if !filter.matches(&details) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
            out.push(details);
        }
        Ok(out)
    }

    /// Stored records among `ids`, in input order.
    pub fn query_by_ids(&self, ids: &[String]) -> Result<Vec<Record>> {
        self.kv.read(|r| {
            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(details) = r.get_json::<Details>(DETAILS, id.as_bytes())? {
                    records.push(Record::new(details));
                }
            }
            Ok(records)
        })
    }

    /// Ids of one page plus the unclipped total.
    pub fn query_object_ids(&self, query: &Query) -> Result<(Vec<String>, usize)> {
        let result = self.query(query)?;
        Ok((result.ids(), result.total))
    }

    pub(crate) fn collect(&self, query: &Query, matches: Option<&TextMatches>, keep: usize) -> Result<Collected> {
        let filter = query.effective_filter();
        let mut entries = BTreeMap::new();
        let mut total = 0;

        let mut visit = |details: Details| {
            if !filter.matches(&details) {
                return;
            }
            let id = details.id().unwrap_or_default().to_string();
            let mut record = Record::new(details);
            let mut rank = 0;
            if let Some(m) = matches.and_then(|m| m.get(&id)) {
                rank = m.rank;
                record.score = Some(m.score);
                record.meta = m.meta.clone();
            }
            total += 1;
            let key = SortKey::new(&query.sorts, &record.details, rank, &id);
            insert_bounded(&mut entries, key, record, keep);
        };

        match self.candidates(&filter, matches)? {
            Some(ids) => {
                let records = self.kv.read(|r| {
                    let mut found = Vec::with_capacity(ids.len());
                    for id in &ids {
                        if let Some(details) = r.get_json::<Details>(DETAILS, id.as_bytes())? {
                            found.push(details);
                        }
                    }
                    Ok(found)
                })?;
                records.into_iter().for_each(&mut visit);
            }
            None => {
                for (_, raw) in self.kv.scan_prefix(DETAILS, b"")? {
                    visit(serde_json::from_slice(&raw)?);
                }
            }
        }
        Ok(Collected { entries, total })
    }

    /// Candidate ids from the narrowest index, or `None` for a full scan.
    fn candidates(&self, filter: &Filter, matches: Option<&TextMatches>) -> Result<Option<BTreeSet<String>>> {
        if let Some(matches) = matches {
            return Ok(Some(matches.keys().cloned().collect()));
        }
        if let Some(types) = filter.pinned_values(keys::TYPE) {
            return self.index_lookup(IDX_TYPE, types.iter().map(|t| pair_prefix(t))).map(Some);
        }
        for key in pinned_keys(filter) {
            if !self.relation_format(&key)?.is_some_and(|f| f.is_option()) {
                continue;
            }
            if let Some(options) = filter.pinned_values(&key) {
                let prefixes = options.iter().map(|o| {
                    let mut p = pair_key(&key, o);
                    p.push(0);
                    p
                });
                return self.index_lookup(IDX_OPTION, prefixes).map(Some);
            }
        }
        Ok(None)
    }

    fn index_lookup(&self, table: &str, prefixes: impl Iterator<Item = Vec<u8>>) -> Result<BTreeSet<String>> {
        self.kv.read(|r| {
            let mut ids = BTreeSet::new();
            for prefix in prefixes {
                for (k, _) in r.scan_prefix(table, &prefix)? {
                    ids.extend(second_of_pair(&k));
                }
            }
            Ok(ids)
        })
    }
}

/// Keys pinned by top-level `Eq`/`In` clauses.
fn pinned_keys(filter: &Filter) -> Vec<String> {
    match filter {
        Filter::And { filters } => filters.iter().flat_map(pinned_keys).collect(),
        Filter::Eq { key, .. } | Filter::In { key, .. } => vec![key.clone()],
        _ => Vec::new(),
    }
}
