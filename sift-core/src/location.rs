//! Per-location state: the id→fact map and both indexes atop storage.
//!
//! A location owns everything inside one namespace. Writes persist to
//! storage first, then update the in-memory indexes under the writer lock;
//! reads treat expired facts as absent and purge them lazily. Rules are
//! stored as ordinary facts wrapped under a `rule` key, with their trigger
//! patterns additionally entered into the pattern index.

use crate::control::Control;
use crate::error::{Error, Result};
use crate::matcher::{match_pattern, Bindings};
use crate::pattern_index::PatternIndex;
use crate::storage::Storage;
use crate::term_index::{extract_terms, TermIndex};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

const MAX_ID_LEN: usize = 256;

/// Reserved key under which the fact's own id is injected when the
/// location's control asks for it. The `!` suffix keeps its value out of
/// the term index.
pub const ID_KEY: &str = "id!";

/// One matched fact with every bindings set the pattern produced for it.
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub id: String,
    pub bindings: Vec<Bindings>,
}

/// Search output plus the counters callers may surface.
#[derive(Clone, Debug, Default)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
    pub checked: usize,
    pub expired: usize,
    pub elapsed_ms: u64,
}

/// Hook invoked inside the writer critical section. The [`Txn`] handle is
/// the re-entrance marker: it gives the hook lock-free access to the same
/// location's state on the same thread.
pub type Hook = Box<dyn Fn(&mut Txn<'_>, &str, &Map<String, Value>) -> Result<()> + Send + Sync>;

struct LocState {
    facts: HashMap<String, Map<String, Value>>,
    terms: TermIndex,
    patterns: PatternIndex,
}

pub struct Location {
    name: String,
    control: RwLock<Arc<Control>>,
    storage: Arc<dyn Storage>,
    state: RwLock<LocState>,
    add_hook: RwLock<Option<Hook>>,
    rem_hook: RwLock<Option<Hook>>,
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Location").field("name", &self.name).finish()
    }
}

/// Lock-free view of a location's state for hooks running inside the
/// writer critical section.
pub struct Txn<'a> {
    loc: &'a Location,
    control: &'a Control,
    state: &'a mut LocState,
}

impl<'a> Txn<'a> {
    pub fn add_fact(&mut self, id: Option<&str>, fact: Value) -> Result<String> {
        self.loc.add_locked(self.control, self.state, id, fact)
    }

    pub fn rem_fact(&mut self, id: &str) -> Result<Map<String, Value>> {
        let mut visited = BTreeSet::new();
        self.loc.rem_locked(self.control, self.state, id, &mut visited)
    }

    pub fn get_fact(&self, id: &str) -> Option<&Map<String, Value>> {
        self.state.facts.get(id)
    }
}

impl Location {
    /// Open a location, loading its state from storage. Pairs that are
    /// already expired are purged from storage rather than loaded.
    pub fn open(name: &str, control: Control, storage: Arc<dyn Storage>) -> Result<Self> {
        let loc = Self {
            name: name.to_string(),
            control: RwLock::new(Arc::new(control)),
            storage,
            state: RwLock::new(LocState {
                facts: HashMap::new(),
                terms: TermIndex::new(),
                patterns: PatternIndex::new(),
            }),
            add_hook: RwLock::new(None),
            rem_hook: RwLock::new(None),
        };
        loc.load()?;
        Ok(loc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current control snapshot.
    pub fn control(&self) -> Arc<Control> {
        self.control
            .read()
            .map(|c| Arc::clone(&c))
            .unwrap_or_default()
    }

    /// Swap in a new control snapshot; in-flight readers keep the old one.
    pub fn set_control(&self, control: Control) {
        if let Ok(mut slot) = self.control.write() {
            *slot = Arc::new(control);
        }
    }

    pub fn set_add_hook(&self, hook: Option<Hook>) {
        if let Ok(mut slot) = self.add_hook.write() {
            *slot = hook;
        }
    }

    pub fn set_rem_hook(&self, hook: Option<Hook>) {
        if let Ok(mut slot) = self.rem_hook.write() {
            *slot = hook;
        }
    }

    fn load(&self) -> Result<()> {
        let control = self.control();
        let pairs = self.storage.load(&self.name)?;
        let mut state = self.state.write().map_err(|e| Error::Storage(e.to_string()))?;
        for (id, raw) in pairs {
            let fact: Map<String, Value> = match serde_json::from_str(&raw) {
                Ok(Value::Object(m)) => m,
                _ => {
                    warn!(location = %self.name, id = %id, "dropping unparseable stored pair");
                    continue;
                }
            };
            if is_expired(&fact) {
                debug!(location = %self.name, id = %id, "purging expired pair at load");
                let _ = self.storage.remove(&self.name, &id);
                continue;
            }
            index_fact(&control, &mut state, &id, &fact);
            state.facts.insert(id, fact);
        }
        Ok(())
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Add a fact (or a rule wrapped under `rule`). With no id, property
    /// facts get their canonical `!<target>.<name>` id and anything else a
    /// generated one. Returns the id actually used.
    pub fn add_fact(&self, key: Option<&str>, id: Option<&str>, fact: Value) -> Result<String> {
        let control = self.check_write(key)?;
        let mut state = self.state.write().map_err(|e| Error::Storage(e.to_string()))?;
        let id = self.add_locked(&control, &mut state, id, fact)?;

        if let Ok(slot) = self.add_hook.read() {
            if let Some(hook) = slot.as_ref() {
                let fact = state.facts.get(&id).cloned().unwrap_or_default();
                let mut txn = Txn {
                    loc: self,
                    control: &control,
                    state: &mut state,
                };
                hook(&mut txn, &id, &fact)?;
            }
        }
        Ok(id)
    }

    fn add_locked(
        &self,
        control: &Control,
        state: &mut LocState,
        id: Option<&str>,
        fact: Value,
    ) -> Result<String> {
        let Value::Object(mut fact) = fact else {
            return Err(Error::Syntax("a fact must be a map".into()));
        };

        canonicalize_expiry(&mut fact)?;
        if is_expired(&fact) {
            return Err(Error::Expired("fact is already expired".into()));
        }

        let id = match id {
            Some(id) if !id.is_empty() => {
                if id.starts_with('!') || id.len() > MAX_ID_LEN {
                    return Err(Error::Syntax(format!("illegal fact id '{id}'")));
                }
                id.to_string()
            }
            _ => match property_target(&fact) {
                Some((target, name)) => format!("!{target}.{name}"),
                None => uuid::Uuid::new_v4().to_string(),
            },
        };

        if control.max_facts > 0
            && state.facts.len() >= control.max_facts
            && !state.facts.contains_key(&id)
        {
            return Err(Error::CapacityExceeded(self.name.clone()));
        }

        match fact.get("rule") {
            Some(Value::Object(rule)) => {
                let mut rule = rule.clone();
                validate_rule(&mut rule)?;
                when_patterns(&rule)?;
                fact.insert("rule".into(), Value::Object(rule));
            }
            Some(_) => return Err(Error::Syntax("rule body must be a map".into())),
            None => {}
        }

        if control.inject_id {
            fact.insert(ID_KEY.into(), Value::String(id.clone()));
        }

        let serialized = serde_json::to_string(&Value::Object(fact.clone()))
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.storage.add(&self.name, &id, &serialized)?;

        if let Some(old) = state.facts.remove(&id) {
            unindex_fact(control, state, &id, &old);
        }
        index_fact(control, state, &id, &fact);
        state.facts.insert(id.clone(), fact);
        Ok(id)
    }

    /// Remove a fact and, transitively, every fact whose `deleteWith`
    /// names it.
    pub fn rem_fact(&self, key: Option<&str>, id: &str) -> Result<Map<String, Value>> {
        let control = self.check_write(key)?;
        let mut state = self.state.write().map_err(|e| Error::Storage(e.to_string()))?;
        let mut visited = BTreeSet::new();
        self.rem_locked(&control, &mut state, id, &mut visited)
    }

    fn rem_locked(
        &self,
        control: &Control,
        state: &mut LocState,
        id: &str,
        visited: &mut BTreeSet<String>,
    ) -> Result<Map<String, Value>> {
        if !state.facts.contains_key(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        visited.insert(id.to_string());

        if let Ok(slot) = self.rem_hook.read() {
            if let Some(hook) = slot.as_ref() {
                let fact = state.facts.get(id).cloned().unwrap_or_default();
                let mut txn = Txn {
                    loc: self,
                    control,
                    state: &mut *state,
                };
                hook(&mut txn, id, &fact)?;
            }
        }

        self.storage.remove(&self.name, id)?;
        let fact = match state.facts.remove(id) {
            Some(fact) => {
                unindex_fact(control, state, id, &fact);
                fact
            }
            None => return Err(Error::NotFound(id.to_string())),
        };

        // The target goes first, then its cohort: facts that asked to be
        // deleted with this id. Self-references were already consumed by
        // the visited set, so cycles terminate.
        for dep in dependents(state, id) {
            if visited.contains(&dep) {
                continue;
            }
            if let Err(err) = self.rem_locked(control, state, &dep, visited) {
                warn!(location = %self.name, id = %dep, error = %err, "deleteWith cascade failed");
            }
        }
        Ok(fact)
    }

    pub fn clear(&self, key: Option<&str>) -> Result<()> {
        let _control = self.check_write(key)?;
        let mut state = self.state.write().map_err(|e| Error::Storage(e.to_string()))?;
        self.storage.clear(&self.name)?;
        state.facts.clear();
        state.terms = TermIndex::new();
        state.patterns = PatternIndex::new();
        Ok(())
    }

    pub fn delete(&self, key: Option<&str>) -> Result<()> {
        let _control = self.check_write(key)?;
        let mut state = self.state.write().map_err(|e| Error::Storage(e.to_string()))?;
        self.storage.delete(&self.name)?;
        state.facts.clear();
        state.terms = TermIndex::new();
        state.patterns = PatternIndex::new();
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Fetch a fact by id. An expired fact reads as `Expired` and is
    /// removed as a side effect.
    pub fn get_fact(&self, key: Option<&str>, id: &str) -> Result<Map<String, Value>> {
        let _control = self.check_read(key)?;
        let expired = {
            let state = self.state.read().map_err(|e| Error::Storage(e.to_string()))?;
            match state.facts.get(id) {
                Some(fact) if !is_expired(fact) => return Ok(fact.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.purge_expired(&[id.to_string()]);
            return Err(Error::Expired(id.to_string()));
        }
        Err(Error::NotFound(id.to_string()))
    }

    /// Match a pattern against every candidate fact the term index offers.
    pub fn search(&self, key: Option<&str>, pattern: &Value) -> Result<SearchResults> {
        let control = self.check_read(key)?;
        let started = Instant::now();
        let mut out = SearchResults::default();
        let mut expired_ids = Vec::new();
        {
            let state = self.state.read().map_err(|e| Error::Storage(e.to_string()))?;
            let terms = extract_terms(pattern, control.max_indexed_string);
            let candidates: Vec<String> = if terms.is_empty() {
                // All-variable patterns offer the index nothing; scan.
                state.facts.keys().cloned().collect()
            } else {
                state.terms.search(&terms)?
            };

            for id in candidates {
                let Some(fact) = state.facts.get(&id) else {
                    continue;
                };
                out.checked += 1;
                if is_expired(fact) {
                    out.expired += 1;
                    expired_ids.push(id);
                    continue;
                }
                let fact_value = Value::Object(fact.clone());
                let bindings = match_pattern(pattern, &fact_value, &Bindings::new())?;
                if !bindings.is_empty() {
                    out.results.push(SearchResult { id, bindings });
                }
            }
        }
        if !expired_ids.is_empty() {
            self.purge_expired(&expired_ids);
        }
        out.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(out)
    }

    /// Candidate rules for an event, keyed by rule id. A superset pruned of
    /// expired entries; the pipeline re-matches each rule's trigger.
    pub fn find_rules(&self, key: Option<&str>, event: &Map<String, Value>) -> Result<HashMap<String, Map<String, Value>>> {
        let _control = self.check_read(key)?;
        let mut rules = HashMap::new();
        let mut expired_ids = Vec::new();
        {
            let state = self.state.read().map_err(|e| Error::Storage(e.to_string()))?;
            for id in state.patterns.search(event) {
                let Some(fact) = state.facts.get(&id) else {
                    continue;
                };
                if is_expired(fact) {
                    expired_ids.push(id);
                    continue;
                }
                if let Some(Value::Object(rule)) = fact.get("rule") {
                    rules.insert(id, rule.clone());
                }
            }
        }
        if !expired_ids.is_empty() {
            self.purge_expired(&expired_ids);
        }
        Ok(rules)
    }

    /// Ids of every stored (unexpired) rule.
    pub fn list_rules(&self, key: Option<&str>) -> Result<Vec<String>> {
        let _control = self.check_read(key)?;
        let state = self.state.read().map_err(|e| Error::Storage(e.to_string()))?;
        let mut ids: Vec<String> = state
            .facts
            .iter()
            .filter(|(_, fact)| fact.contains_key("rule") && !is_expired(fact))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// A rule body by id, treating expired rules as absent.
    pub fn get_rule(&self, key: Option<&str>, id: &str) -> Result<Map<String, Value>> {
        let fact = self.get_fact(key, id)?;
        match fact.get("rule") {
            Some(Value::Object(rule)) => Ok(rule.clone()),
            _ => Err(Error::NotFound(format!("rule '{id}'"))),
        }
    }

    pub fn fact_count(&self) -> usize {
        self.state.read().map(|s| s.facts.len()).unwrap_or(0)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn check_read(&self, key: Option<&str>) -> Result<Arc<Control>> {
        let control = self.control();
        if control.disabled || !control.allows_read(key) {
            return Err(Error::Disabled(self.name.clone()));
        }
        Ok(control)
    }

    fn check_write(&self, key: Option<&str>) -> Result<Arc<Control>> {
        let control = self.control();
        if control.disabled || !control.allows_write(key) {
            return Err(Error::Disabled(self.name.clone()));
        }
        Ok(control)
    }

    /// Best-effort removal of expired facts noticed by a read. Failures are
    /// logged, never surfaced to the observing reader.
    fn purge_expired(&self, ids: &[String]) {
        let control = self.control();
        let Ok(mut state) = self.state.write() else {
            return;
        };
        for id in ids {
            let still_expired = state.facts.get(id).is_some_and(is_expired);
            if !still_expired {
                continue;
            }
            if let Err(err) = self.storage.remove(&self.name, id) {
                warn!(location = %self.name, id = %id, error = %err, "expired purge failed");
                continue;
            }
            if let Some(fact) = state.facts.remove(id) {
                unindex_fact(&control, &mut state, id, &fact);
            }
            debug!(location = %self.name, id = %id, "purged expired fact");
        }
    }
}

fn index_fact(control: &Control, state: &mut LocState, id: &str, fact: &Map<String, Value>) {
    let value = Value::Object(fact.clone());
    for term in extract_terms(&value, control.max_indexed_string) {
        state.terms.add(&term, id);
    }
    if let Some(Value::Object(rule)) = fact.get("rule") {
        if let Ok(patterns) = when_patterns(rule) {
            for p in patterns {
                state.patterns.add(&p, id);
            }
        }
    }
}

fn unindex_fact(control: &Control, state: &mut LocState, id: &str, fact: &Map<String, Value>) {
    let value = Value::Object(fact.clone());
    for term in extract_terms(&value, control.max_indexed_string) {
        state.terms.rem(&term, id);
    }
    if let Some(Value::Object(rule)) = fact.get("rule") {
        if let Ok(patterns) = when_patterns(rule) {
            for p in patterns {
                state.patterns.rem(&p, id);
            }
        }
    }
}

/// Facts whose `deleteWith` names `id`. The `deleteWith` key itself is
/// always term-indexed, so the candidate set stays small; the id may be
/// longer than the indexed-string cap and is filtered for directly.
fn dependents(state: &LocState, id: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    terms.insert("deleteWith".to_string());
    let candidates = state.terms.search(&terms).unwrap_or_default();
    candidates
        .into_iter()
        .filter(|cand| {
            state.facts.get(cand).is_some_and(|fact| {
                fact.get("deleteWith")
                    .and_then(Value::as_array)
                    .is_some_and(|deps| deps.iter().any(|d| d.as_str() == Some(id)))
            })
        })
        .collect()
}

/// `{id: target, !name: value}` is a property fact; its id is canonical.
fn property_target(fact: &Map<String, Value>) -> Option<(String, String)> {
    let mut bang_keys = fact.keys().filter(|k| k.starts_with('!'));
    let key = bang_keys.next()?;
    if bang_keys.next().is_some() {
        return None;
    }
    let target = fact.get("id")?.as_str()?;
    Some((target.to_string(), key[1..].to_string()))
}

/// Seconds since the epoch.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn is_expired(fact: &Map<String, Value>) -> bool {
    fact.get("expires")
        .and_then(Value::as_f64)
        .is_some_and(|t| t <= now_secs())
}

/// Rewrite `ttl` into an absolute `expires`.
fn canonicalize_expiry(fact: &mut Map<String, Value>) -> Result<()> {
    let Some(ttl) = fact.remove("ttl") else {
        return Ok(());
    };
    let secs = parse_ttl(&ttl)?;
    let expires = now_secs() + secs;
    fact.insert("expires".into(), Value::from(expires));
    Ok(())
}

/// A ttl is a number of seconds or a duration string like `"1h30m"`,
/// `"2s"`, `"500ms"`.
fn parse_ttl(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|s| *s >= 0.0)
            .ok_or_else(|| Error::Syntax(format!("bad ttl {n}"))),
        Value::String(s) => parse_duration_secs(s),
        other => Err(Error::Syntax(format!("bad ttl {other}"))),
    }
}

fn parse_duration_secs(s: &str) -> Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Syntax("empty duration".into()));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }
    let mut total = 0.0;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
            continue;
        }
        let count: f64 = digits
            .parse()
            .map_err(|_| Error::Syntax(format!("bad duration '{s}'")))?;
        digits.clear();
        let scale = match c {
            'h' => 3600.0,
            's' => 1.0,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    0.001
                } else {
                    60.0
                }
            }
            _ => return Err(Error::Syntax(format!("bad duration '{s}'"))),
        };
        total += count * scale;
    }
    if !digits.is_empty() {
        return Err(Error::Syntax(format!("bad duration '{s}'")));
    }
    Ok(total)
}

/// Structural rule validation and normalization: exactly one of
/// `when`/`schedule`, at least one action, singular `action` folded into
/// `actions`.
pub fn validate_rule(rule: &mut Map<String, Value>) -> Result<()> {
    let has_when = rule.contains_key("when");
    let has_schedule = rule.contains_key("schedule");
    if has_when == has_schedule {
        return Err(Error::Syntax(
            "a rule requires exactly one of 'when' and 'schedule'".into(),
        ));
    }
    if rule.contains_key("action") && rule.contains_key("actions") {
        return Err(Error::Syntax("a rule may not carry both 'action' and 'actions'".into()));
    }
    if let Some(action) = rule.remove("action") {
        rule.insert("actions".into(), Value::Array(vec![action]));
    }
    let action_count = rule
        .get("actions")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if action_count == 0 {
        return Err(Error::Syntax("a rule requires at least one action".into()));
    }
    Ok(())
}

/// The trigger patterns of a rule's `when` query, in both its `pattern`
/// and `patterns` flavors. Scheduled-only rules have none.
pub fn when_patterns(rule: &Map<String, Value>) -> Result<Vec<Map<String, Value>>> {
    let Some(when) = rule.get("when") else {
        return Ok(vec![]);
    };
    let Value::Object(when) = when else {
        return Err(Error::Syntax("'when' must be a map".into()));
    };
    if let Some(p) = when.get("pattern") {
        match p {
            Value::Object(m) => return Ok(vec![m.clone()]),
            _ => return Err(Error::Syntax("'when.pattern' must be a map".into())),
        }
    }
    if let Some(ps) = when.get("patterns") {
        let Value::Array(ps) = ps else {
            return Err(Error::Syntax("'when.patterns' must be a sequence".into()));
        };
        let mut out = Vec::with_capacity(ps.len());
        for p in ps {
            match p {
                Value::Object(m) => out.push(m.clone()),
                _ => return Err(Error::Syntax("'when.patterns' entries must be maps".into())),
            }
        }
        return Ok(out);
    }
    Err(Error::Syntax("'when' requires 'pattern' or 'patterns'".into()))
}
