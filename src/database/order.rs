//! Sort keys for query results.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::{Details, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub key: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(key: &str) -> Self {
        Self {
            key: key.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(key: &str) -> Self {
        Self {
            key: key.to_string(),
            direction: SortDirection::Desc,
        }
    }
}

/// Precomputed sort tuple of one record. Ties are broken by id ascending and
/// missing values sort last in either direction.
#[derive(Debug, Clone)]
pub struct SortKey {
    values: Vec<(Option<Value>, SortDirection)>,
    rank: usize,
    id: String,
}

impl SortKey {
    /// `rank` orders records when no sort is given, e.g. full-text position.
    pub fn new(sorts: &[Sort], details: &Details, rank: usize, id: &str) -> Self {
        let values = sorts
            .iter()
            .map(|s| {
                let v = details.get(&s.key).filter(|v| !matches!(v, Value::Null)).cloned();
                (v, s.direction)
            })
            .collect();
        Self {
            values,
            rank,
            id: id.to_string(),
        }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((a, dir), (b, _)) in self.values.iter().zip(other.values.iter()) {
            let ord = match (a, b) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => match dir {
                    SortDirection::Asc => x.compare(y),
                    SortDirection::Desc => y.compare(x),
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        // Full-text rank only orders unsorted queries; an explicit sort
        // overrides it and ties fall to the id.
        if self.values.is_empty() {
            self.rank.cmp(&other.rank).then_with(|| self.id.cmp(&other.id))
        } else {
            self.id.cmp(&other.id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, name: Option<&str>) -> Details {
        let mut d = Details::with_id(id);
        if let Some(n) = name {
            d.set("name", n);
        }
        d
    }

    #[test]
    fn test_nulls_last_both_directions() {
        let sorts = [Sort::asc("name")];
        let a = SortKey::new(&sorts, &rec("a", None), 0, "a");
        let b = SortKey::new(&sorts, &rec("b", Some("zeta")), 0, "b");
        assert!(b < a);

        let sorts = [Sort::desc("name")];
        let a = SortKey::new(&sorts, &rec("a", None), 0, "a");
        let b = SortKey::new(&sorts, &rec("b", Some("alpha")), 0, "b");
        assert!(b < a);
    }

    #[test]
    fn test_id_breaks_ties() {
        let sorts = [Sort::asc("name")];
        let a = SortKey::new(&sorts, &rec("a", Some("same")), 0, "a");
        let b = SortKey::new(&sorts, &rec("b", Some("same")), 0, "b");
        assert!(a < b);
        let by_rank = SortKey::new(&[], &rec("z", None), 0, "z");
        let later = SortKey::new(&[], &rec("a", None), 1, "a");
        assert!(by_rank < later);
    }

    #[test]
    fn test_explicit_sort_ignores_rank_on_ties() {
        let sorts = [Sort::asc("name")];
        let a = SortKey::new(&sorts, &rec("a", Some("same")), 7, "a");
        let b = SortKey::new(&sorts, &rec("b", Some("same")), 0, "b");
        assert!(a < b);
    }
}
