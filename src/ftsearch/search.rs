use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{tokenize, IndexedDoc, MemoryIndex, SEARCH_LIMIT};
use crate::error::{EngineError, Result};

const BOOST_ID_PREFIX: f64 = 40.0;
const BOOST_PHRASE_PREFIX: f64 = 20.0;
const BOOST_TITLE_PREFIX: f64 = 15.0;
const BOOST_TITLE_SUBSTRING: f64 = 10.0;
const BOOST_FUZZY_TITLE: f64 = 6.0;
const BOOST_FUZZY_TEXT: f64 = 3.0;
const BOOST_TERM_ORDER: f64 = 2.0;

/// Tokens at least this long tolerate one edit.
const FUZZY_MIN_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HighlightFormat {
    /// Plain fragment plus character ranges.
    #[default]
    Text,
    /// Fragment with matches wrapped in `<b>`.
    Html,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub highlight: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ranges: Vec<(usize, usize)>,
}

struct Compiled {
    raw: String,
    lower: String,
    tokens: Vec<String>,
    term_order: Option<Regex>,
}

impl Compiled {
    fn new(text: &str) -> Result<Self> {
        let tokens = tokenize(text);
        let term_order = if tokens.is_empty() {
            None
        } else {
            let pattern = tokens.iter().map(|t| regex::escape(t)).collect::<Vec<_>>().join(".*");
            Some(Regex::new(&pattern).map_err(|e| EngineError::Internal(format!("term order pattern: {e}")))?)
        };
        Ok(Self {
            raw: text.trim().to_string(),
            lower: text.trim().to_lowercase(),
            tokens,
            term_order,
        })
    }

    fn score(&self, d: &IndexedDoc) -> f64 {
        let mut score = 0.0;
        if d.doc.id.starts_with(&self.raw) {
            score += BOOST_ID_PREFIX;
        }
        if phrase_prefix(&self.tokens, &d.title_tokens) || phrase_prefix(&self.tokens, &d.text_tokens) {
            score += BOOST_PHRASE_PREFIX;
        }
        if d.title_lower.starts_with(&self.lower) {
            score += BOOST_TITLE_PREFIX;
        }
        if d.title_lower.contains(&self.lower) {
            score += BOOST_TITLE_SUBSTRING;
        }
        if fuzzy_all(&self.tokens, &d.title_tokens) {
            score += BOOST_FUZZY_TITLE;
        }
        if fuzzy_all(&self.tokens, &d.text_tokens) {
            score += BOOST_FUZZY_TEXT;
        }
        if let Some(re) = &self.term_order {
            if re.is_match(&d.title_lower) || re.is_match(&d.text_lower) {
                score += BOOST_TERM_ORDER;
            }
        }
        score
    }
}

pub(super) fn run(index: &MemoryIndex, space_ids: &[String], format: HighlightFormat, text: &str) -> Result<Vec<SearchHit>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let query = Compiled::new(text)?;
    let spaces: HashSet<&str> = space_ids.iter().map(String::as_str).collect();

    let mut hits: Vec<SearchHit> = index
        .docs
        .values()
        .filter(|d| spaces.is_empty() || spaces.contains(d.doc.space_id.as_str()))
        .filter_map(|d| {
            let score = query.score(d);
            (score > 0.0).then(|| {
                let (highlight, ranges) = highlight(&d.doc.text, &query.tokens, format);
                SearchHit {
                    id: d.doc.id.clone(),
                    score,
                    highlight,
                    ranges,
                }
            })
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(SEARCH_LIMIT);
    Ok(hits)
}

/// Query tokens appear consecutively in `doc`, the last one as a prefix.
fn phrase_prefix(query: &[String], doc: &[String]) -> bool {
    let Some((last, head)) = query.split_last() else {
        return false;
    };
    if doc.len() < query.len() {
        return false;
    }
    doc.windows(query.len()).any(|w| match w.split_last() {
        Some((w_last, w_head)) => w_head == head && w_last.starts_with(last.as_str()),
        None => false,
    })
}

fn fuzzy_all(query: &[String], doc: &[String]) -> bool {
    !query.is_empty() && query.iter().all(|q| doc.iter().any(|t| fuzzy_eq(q, t)))
}

fn fuzzy_eq(query: &str, term: &str) -> bool {
    if query == term {
        return true;
    }
    query.chars().count() >= FUZZY_MIN_LEN && within_one_edit(query, term)
}

fn within_one_edit(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if long.len() - short.len() > 1 {
        return false;
    }
    let (mut i, mut j, mut edits) = (0, 0, 0);
    while i < short.len() && j < long.len() {
        if short[i] == long[j] {
            i += 1;
            j += 1;
            continue;
        }
        edits += 1;
        if edits > 1 {
            return false;
        }
        if short.len() == long.len() {
            i += 1;
        }
        j += 1;
    }
    edits + (long.len() - j) + (short.len() - i) <= 1
}

/// Marks every occurrence of a query token in `text`. Ranges are char offsets.
fn highlight(text: &str, tokens: &[String], format: HighlightFormat) -> (String, Vec<(usize, usize)>) {
    if text.is_empty() || tokens.is_empty() {
        return (String::new(), Vec::new());
    }
    let chars: Vec<char> = text.chars().collect();
    let lower: Vec<char> = chars.iter().map(|c| c.to_lowercase().next().unwrap_or(*c)).collect();
    let mut ranges = Vec::new();
    let mut pos = 0;
    while pos < lower.len() {
        let matched = tokens
            .iter()
            .map(|t| t.chars().collect::<Vec<_>>())
            .filter(|t| !t.is_empty() && lower[pos..].starts_with(t))
            .map(|t| t.len())
            .max();
        match matched {
            Some(len) => {
                ranges.push((pos, pos + len));
                pos += len;
            }
            None => pos += 1,
        }
    }
    if ranges.is_empty() {
        return (String::new(), Vec::new());
    }
    match format {
        HighlightFormat::Text => (text.to_string(), ranges),
        HighlightFormat::Html => (to_html(&chars, &ranges), ranges),
    }
}

fn to_html(chars: &[char], ranges: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(chars.len() + ranges.len() * 7);
    let mut next = ranges.iter().peekable();
    for (i, c) in chars.iter().enumerate() {
        if next.peek().is_some_and(|(start, _)| *start == i) {
            out.push_str("<b>");
        }
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(*c),
        }
        if let Some((_, end)) = next.peek() {
            if *end == i + 1 {
                out.push_str("</b>");
                next.next();
            }
        }
    }
    out
}
