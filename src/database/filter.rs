//! Filter trees evaluated against details records.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::{keys, Details, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Filter {
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
    Eq { key: String, value: Value },
    NotEq { key: String, value: Value },
    In { key: String, values: Vec<Value> },
    Empty { key: String },
    NotEmpty { key: String },
    Like { key: String, value: String },
    NotLike { key: String, value: String },
    Exists { key: String },
    Greater { key: String, value: Value },
    Less { key: String, value: Value },
}

impl Filter {
    pub fn eq(key: &str, value: impl Into<Value>) -> Self {
        Filter::Eq {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn not_eq(key: &str, value: impl Into<Value>) -> Self {
        Filter::NotEq {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(key: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            key: key.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn like(key: &str, value: &str) -> Self {
        Filter::Like {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    pub fn matches(&self, details: &Details) -> bool {
        match self {
            Filter::And { filters } => filters.iter().all(|f| f.matches(details)),
            Filter::Or { filters } => filters.iter().any(|f| f.matches(details)),
            Filter::Not { filter } => !filter.matches(details),
            Filter::Eq { key, value } => details.get(key).is_some_and(|v| value_eq(v, value)),
            Filter::NotEq { key, value } => !details.get(key).is_some_and(|v| value_eq(v, value)),
            Filter::In { key, values } => details
                .get(key)
                .is_some_and(|v| values.iter().any(|want| value_eq(v, want))),
            Filter::Empty { key } => details.get(key).map_or(true, Value::is_empty),
            Filter::NotEmpty { key } => details.get(key).is_some_and(|v| !v.is_empty()),
            Filter::Like { key, value } => details.get(key).is_some_and(|v| value_like(v, value)),
            Filter::NotLike { key, value } => !details.get(key).is_some_and(|v| value_like(v, value)),
            Filter::Exists { key } => details.contains(key),
            Filter::Greater { key, value } => details
                .get(key)
                .is_some_and(|v| comparable(v, value) && v.compare(value) == Ordering::Greater),
            Filter::Less { key, value } => details
                .get(key)
                .is_some_and(|v| comparable(v, value) && v.compare(value) == Ordering::Less),
        }
    }

    /// Values this filter pins `key` to, when every match must carry one of them.
    pub fn pinned_values(&self, key: &str) -> Option<Vec<String>> {
        match self {
            Filter::Eq { key: k, value } if k == key => Some(value.to_string_list()),
            Filter::In { key: k, values } if k == key => {
                Some(values.iter().flat_map(Value::to_string_list).collect())
            }
            Filter::And { filters } => filters.iter().find_map(|f| f.pinned_values(key)),
            _ => None,
        }
    }

    /// Space ids the filter restricts the query to, if any.
    pub fn space_ids(&self) -> Option<Vec<String>> {
        self.pinned_values(keys::SPACE_ID)
    }

    /// Whether the filter mentions `key` anywhere.
    pub fn mentions(&self, key: &str) -> bool {
        match self {
            Filter::And { filters } | Filter::Or { filters } => filters.iter().any(|f| f.mentions(key)),
            Filter::Not { filter } => filter.mentions(key),
            Filter::Eq { key: k, .. }
            | Filter::NotEq { key: k, .. }
            | Filter::In { key: k, .. }
            | Filter::Empty { key: k }
            | Filter::NotEmpty { key: k }
            | Filter::Like { key: k, .. }
            | Filter::NotLike { key: k, .. }
            | Filter::Exists { key: k }
            | Filter::Greater { key: k, .. }
            | Filter::Less { key: k, .. } => k == key,
        }
    }
}

/// List values match a scalar when they contain it.
fn value_eq(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::StringList(list), Value::String(s)) => list.iter().any(|x| x == s),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            have.compare(want) == Ordering::Equal
        }
        _ => have == want,
    }
}

fn value_like(have: &Value, pattern: &str) -> bool {
    let needle = pattern.to_lowercase();
    match have {
        Value::String(s) => s.to_lowercase().contains(&needle),
        Value::StringList(list) => list.iter().any(|s| s.to_lowercase().contains(&needle)),
        _ => false,
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}
