//! Query model shared by the space index and the cross-space store.

pub mod filter;
pub mod order;

use serde::{Deserialize, Serialize};

pub use filter::Filter;
pub use order::{Sort, SortDirection, SortKey};

use crate::domain::{keys, Details};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Query {
    /// Conjunction of filters.
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    /// `None` means unlimited; `Some(0)` returns only the total.
    pub limit: Option<usize>,
    pub offset: usize,
    pub full_text: String,
    pub space_ids: Vec<String>,
}

impl Query {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_full_text(mut self, text: &str) -> Self {
        self.full_text = text.to_string();
        self
    }

    /// The user filters plus the default exclusion of deleted and archived
    /// objects, unless the query asks about those flags itself.
    pub fn effective_filter(&self) -> Filter {
        let mut all = self.filters.clone();
        for key in [keys::IS_DELETED, keys::IS_ARCHIVED] {
            if !self.filters.iter().any(|f| f.mentions(key)) {
                all.push(Filter::Empty { key: key.to_string() });
            }
        }
        Filter::and(all)
    }

    /// Space ids named either explicitly or through a `spaceId` filter.
    pub fn target_spaces(&self) -> Option<Vec<String>> {
        if !self.space_ids.is_empty() {
            return Some(self.space_ids.clone());
        }
        self.filters.iter().find_map(Filter::space_ids)
    }
}

/// Highlight attached to a full-text hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub relation_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub block_id: String,
    pub highlight: String,
    pub highlight_ranges: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub details: Details,
    #[serde(rename = "_score", skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub meta: Vec<Meta>,
}

impl Record {
    pub fn new(details: Details) -> Self {
        Self {
            details,
            score: None,
            meta: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.details.id().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub records: Vec<Record>,
    /// Count of matches before offset and limit.
    pub total: usize,
}

impl QueryResult {
    /// Applies offset then limit to records already in final order.
    pub fn paginate(records: Vec<Record>, offset: usize, limit: Option<usize>) -> Self {
        let total = records.len();
        let records = records
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Self { records, total }
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags_are_excluded() {
        let mut deleted = Details::with_id("a");
        deleted.set(keys::IS_DELETED, true);
        let live = Details::with_id("b");
        let q = Query::default();
        assert!(!q.effective_filter().matches(&deleted));
        assert!(q.effective_filter().matches(&live));

        let q = Query::default().with_filter(Filter::eq(keys::IS_DELETED, true));
        assert!(q.effective_filter().matches(&deleted));
    }

    #[test]
    fn test_paginate_limit_zero_and_large_offset() {
        let records: Vec<Record> = ["a", "b", "c"].iter().map(|id| Record::new(Details::with_id(id))).collect();
        let r = QueryResult::paginate(records.clone(), 0, Some(0));
        assert!(r.records.is_empty());
        assert_eq!(r.total, 3);
        let r = QueryResult::paginate(records.clone(), 5, None);
        assert!(r.records.is_empty());
        assert_eq!(r.total, 3);
        let r = QueryResult::paginate(records, 1, Some(1));
        assert_eq!(r.ids(), vec!["b".to_string()]);
    }
}
