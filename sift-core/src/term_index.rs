//! Inverted index from atomic terms to fact ids.
//!
//! Search is a candidate generator: it returns every id whose indexed term
//! set is a superset of the queried terms. The matcher then decides which
//! candidates actually match, so false positives here are fine and false
//! negatives are not.

use crate::error::{Error, Result};
use crate::matcher::is_variable;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
pub struct TermIndex {
    terms: HashMap<String, BTreeSet<String>>,
}

impl TermIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, term: &str, id: &str) {
        self.terms
            .entry(term.to_string())
            .or_default()
            .insert(id.to_string());
    }

    pub fn rem(&mut self, term: &str, id: &str) {
        if let Some(ids) = self.terms.get_mut(term) {
            ids.remove(id);
            if ids.is_empty() {
                self.terms.remove(term);
            }
        }
    }

    /// Number of ids indexed under a term.
    pub fn card(&self, term: &str) -> usize {
        self.terms.get(term).map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Ids indexed under every queried term. The smallest id set seeds the
    /// intersection; a term with no entries short-circuits to empty.
    pub fn search(&self, terms: &BTreeSet<String>) -> Result<Vec<String>> {
        if terms.is_empty() {
            return Err(Error::Syntax("term search requires at least one term".into()));
        }
        let mut sets = Vec::with_capacity(terms.len());
        for term in terms {
            match self.terms.get(term) {
                Some(ids) => sets.push(ids),
                None => return Ok(vec![]),
            }
        }
        sets.sort_by_key(|ids| ids.len());
        let seed = sets[0];
        let rest = &sets[1..];
        Ok(seed
            .iter()
            .filter(|id| rest.iter().all(|ids| ids.contains(*id)))
            .cloned()
            .collect())
    }
}

/// Extract the indexable terms of a value.
///
/// Non-variable strings within the length limit index themselves; map keys
/// index unless they are variables (patterns run through this extractor
/// too). The body of a `rule` key is not descended (rules are found through
/// the pattern index), and values of keys ending in `!` are skipped.
/// Numbers and booleans are not indexed.
pub fn extract_terms(value: &Value, max_len: usize) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    collect_terms(value, max_len, &mut terms);
    terms
}

fn collect_terms(value: &Value, max_len: usize, terms: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if !is_variable(s) && s.len() <= max_len {
                terms.insert(s.clone());
            }
        }
        Value::Array(elems) => {
            for e in elems {
                collect_terms(e, max_len, terms);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs {
                if !is_variable(k) {
                    terms.insert(k.clone());
                }
                if k == "rule" || k.ends_with('!') {
                    continue;
                }
                collect_terms(v, max_len, terms);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
