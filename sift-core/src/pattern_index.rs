//! Prefix-tree index from rule trigger patterns to rule ids.
//!
//! A pattern map is linearized into a token chain: key-sorted pairs, array
//! values expanded into repeated same-key pairs in canonical element order,
//! nested map values descending through a dedicated child with an explicit
//! end-of-map token so the outer pairs resume deterministically. Atomic
//! values carry a type-tag prefix (`S_`, `F_`, `B_`, `null`) so `1` and
//! `"1"` never collide.
//!
//! Search walks an event through the same linearization and returns every
//! rule id whose full token chain can be consumed, skipping extra event
//! pairs at any depth. The result is a superset of the rules whose trigger
//! could match; the matcher resolves false positives.

use crate::matcher::is_variable;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Reserved key token closing a nested map chain. Not a legal map key in
/// practice (control character).
const MAP_END: &str = "\u{1}end";

#[derive(Default)]
struct Node {
    keys: HashMap<String, Node>,
    var: Option<Box<Node>>,
    map: Option<Box<Node>>,
    rules: BTreeSet<String>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.keys.is_empty() && self.var.is_none() && self.map.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Key(String),
    VarKey,
    Val(String),
    VarVal,
    MapOpen,
    MapEnd,
}

#[derive(Default)]
pub struct PatternIndex {
    root: Node,
}

impl PatternIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `pattern` under `rule_id`. An empty pattern indexes nothing.
    pub fn add(&mut self, pattern: &Map<String, Value>, rule_id: &str) {
        let toks = linearize(pattern);
        if toks.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for tok in &toks {
            node = match tok {
                Tok::Key(k) => node.keys.entry(k.clone()).or_default(),
                Tok::Val(t) => node.keys.entry(t.clone()).or_default(),
                Tok::MapEnd => node.keys.entry(MAP_END.to_string()).or_default(),
                Tok::VarKey | Tok::VarVal => node.var.get_or_insert_with(Default::default).as_mut(),
                Tok::MapOpen => node.map.get_or_insert_with(Default::default).as_mut(),
            };
        }
        node.rules.insert(rule_id.to_string());
    }

    /// Remove `rule_id`'s entry for `pattern`, pruning emptied nodes so
    /// add followed by rem restores the prior structure.
    pub fn rem(&mut self, pattern: &Map<String, Value>, rule_id: &str) {
        let toks = linearize(pattern);
        if toks.is_empty() {
            return;
        }
        remove_toks(&mut self.root, &toks, rule_id);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Candidate rule ids for an event: a superset of every rule whose
    /// trigger pattern could match the event.
    pub fn search(&self, event: &Map<String, Value>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let pairs = expand_pairs(event, true);
        let done: &dyn Fn(&Node, &mut BTreeSet<String>) = &|_n, _out| {};
        walk(&self.root, &pairs, 0, done, &mut out);
        out
    }
}

fn remove_toks(node: &mut Node, toks: &[Tok], rule_id: &str) -> bool {
    let Some((tok, rest)) = toks.split_first() else {
        node.rules.remove(rule_id);
        return node.is_empty();
    };
    match tok {
        Tok::Key(k) | Tok::Val(k) => {
            if let Some(child) = node.keys.get_mut(k.as_str()) {
                if remove_toks(child, rest, rule_id) {
                    node.keys.remove(k.as_str());
                }
            }
        }
        Tok::MapEnd => {
            if let Some(child) = node.keys.get_mut(MAP_END) {
                if remove_toks(child, rest, rule_id) {
                    node.keys.remove(MAP_END);
                }
            }
        }
        Tok::VarKey | Tok::VarVal => {
            if let Some(child) = node.var.as_deref_mut() {
                if remove_toks(child, rest, rule_id) {
                    node.var = None;
                }
            }
        }
        Tok::MapOpen => {
            if let Some(child) = node.map.as_deref_mut() {
                if remove_toks(child, rest, rule_id) {
                    node.map = None;
                }
            }
        }
    }
    node.is_empty()
}

fn linearize(map: &Map<String, Value>) -> Vec<Tok> {
    let mut toks = Vec::new();
    linearize_into(map, &mut toks);
    toks
}

fn linearize_into(map: &Map<String, Value>, toks: &mut Vec<Tok>) {
    for (k, v) in expand_pairs(map, false) {
        toks.push(if is_variable(&k) { Tok::VarKey } else { Tok::Key(k) });
        match v {
            Value::String(ref s) if is_variable(s) => toks.push(Tok::VarVal),
            Value::Object(ref m) => {
                toks.push(Tok::MapOpen);
                linearize_into(m, toks);
                toks.push(Tok::MapEnd);
            }
            other => toks.push(Tok::Val(tag(&other))),
        }
    }
}

/// Key-sorted pairs with array values expanded into repeated same-key pairs
/// in canonical element order. On the event side every array also emits an
/// empty-array marker pair so empty-sequence patterns stay findable.
fn expand_pairs(map: &Map<String, Value>, event_side: bool) -> Vec<(String, Value)> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut out = Vec::new();
    for k in keys {
        push_value(k, &map[k], event_side, &mut out);
    }
    out
}

fn push_value(key: &str, value: &Value, event_side: bool, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Array(elems) => {
            if event_side || elems.is_empty() {
                out.push((key.to_string(), Value::Array(vec![])));
            }
            let mut sorted: Vec<&Value> = elems.iter().collect();
            sorted.sort_by_key(|e| serde_json::to_string(e).unwrap_or_default());
            for e in sorted {
                match e {
                    Value::Array(_) => push_value(key, e, event_side, out),
                    _ => out.push((key.to_string(), (*e).clone())),
                }
            }
        }
        _ => out.push((key.to_string(), value.clone())),
    }
}

fn tag(value: &Value) -> String {
    match value {
        Value::String(s) => format!("S_{s}"),
        Value::Number(n) => format!("F_{}", n.as_f64().unwrap_or(f64::NAN)),
        Value::Bool(b) => format!("B_{b}"),
        Value::Null => "null".to_string(),
        Value::Array(_) => "A_".to_string(),
        Value::Object(_) => "M_".to_string(),
    }
}

fn walk(
    node: &Node,
    pairs: &[(String, Value)],
    pos: usize,
    pop: &dyn Fn(&Node, &mut BTreeSet<String>),
    out: &mut BTreeSet<String>,
) {
    out.extend(node.rules.iter().cloned());
    // A nested pattern map may end here, skipping the event map's remaining
    // extra pairs.
    if let Some(end) = node.keys.get(MAP_END) {
        pop(end, out);
    }
    for j in pos..pairs.len() {
        let (k, v) = &pairs[j];
        let key_children = [node.keys.get(k.as_str()), node.var.as_deref()];
        for kn in key_children.into_iter().flatten() {
            match v {
                Value::Object(m) => {
                    if let Some(vn) = kn.var.as_deref() {
                        walk(vn, pairs, j + 1, pop, out);
                    }
                    if let Some(mc) = kn.map.as_deref() {
                        let nested = expand_pairs(m, true);
                        let resume: &dyn Fn(&Node, &mut BTreeSet<String>) =
                            &|n, out| walk(n, pairs, j + 1, pop, out);
                        walk(mc, &nested, 0, resume, out);
                    }
                }
                _ => {
                    if let Some(vn) = kn.keys.get(tag(v).as_str()) {
                        walk(vn, pairs, j + 1, pop, out);
                    }
                    if let Some(vn) = kn.var.as_deref() {
                        walk(vn, pairs, j + 1, pop, out);
                    }
                }
            }
        }
    }
}
