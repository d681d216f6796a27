//! The location registry: opens locations on demand from storage and walks
//! parent chains for inherited searches.

use crate::control::Control;
use crate::error::{Error, Result};
use crate::location::{Location, SearchResults};
use crate::storage::Storage;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// A rule found during an inherited search, together with the location that
/// owns it (one-shot removal must go back to the owner).
#[derive(Clone, Debug)]
pub struct RuleHit {
    pub location: String,
    pub rule: Map<String, Value>,
}

pub struct Manager {
    storage: Arc<dyn Storage>,
    default_control: Control,
    locations: RwLock<HashMap<String, Arc<Location>>>,
}

impl Manager {
    pub fn new(storage: Arc<dyn Storage>, default_control: Control) -> Self {
        Self {
            storage,
            default_control,
            locations: RwLock::new(HashMap::new()),
        }
    }

    /// The named location, opened from storage on first use.
    pub fn location(&self, name: &str) -> Result<Arc<Location>> {
        if let Ok(locations) = self.locations.read() {
            if let Some(loc) = locations.get(name) {
                return Ok(Arc::clone(loc));
            }
        }
        let opened = Arc::new(Location::open(
            name,
            self.default_control.clone(),
            Arc::clone(&self.storage),
        )?);
        let mut locations = self
            .locations
            .write()
            .map_err(|e| Error::Storage(e.to_string()))?;
        // Another thread may have opened it while we loaded.
        Ok(Arc::clone(locations.entry(name.to_string()).or_insert(opened)))
    }

    /// Destroy a location's state container and its stored pairs.
    pub fn delete(&self, name: &str, key: Option<&str>) -> Result<()> {
        let loc = self.location(name)?;
        loc.delete(key)?;
        if let Ok(mut locations) = self.locations.write() {
            locations.remove(name);
        }
        Ok(())
    }

    pub fn health(&self) -> Result<()> {
        self.storage.health()
    }

    /// The location and its ancestor chain, depth-first, each visited once.
    /// A parent chain that cycles back onto the walk's own path is an
    /// `AncestorLoop`.
    pub fn ancestors(&self, name: &str) -> Result<Vec<Arc<Location>>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        let mut visited = BTreeSet::new();
        self.collect_ancestors(name, &mut path, &mut visited, &mut out)?;
        Ok(out)
    }

    fn collect_ancestors(
        &self,
        name: &str,
        path: &mut Vec<String>,
        visited: &mut BTreeSet<String>,
        out: &mut Vec<Arc<Location>>,
    ) -> Result<()> {
        if path.iter().any(|p| p == name) {
            return Err(Error::AncestorLoop(name.to_string()));
        }
        if !visited.insert(name.to_string()) {
            // Shared ancestor reached along a second path; a DAG, not a loop.
            return Ok(());
        }
        let loc = self.location(name)?;
        let parents = loc.control().parents.clone();
        out.push(loc);
        path.push(name.to_string());
        for parent in &parents {
            self.collect_ancestors(parent, path, visited, out)?;
        }
        path.pop();
        Ok(())
    }

    /// Search one location, or it and its ancestors when `inherited` is set.
    pub fn search(
        &self,
        name: &str,
        key: Option<&str>,
        pattern: &Value,
        inherited: bool,
    ) -> Result<SearchResults> {
        if !inherited {
            return self.location(name)?.search(key, pattern);
        }
        let mut merged = SearchResults::default();
        for loc in self.ancestors(name)? {
            let got = loc.search(key, pattern)?;
            merged.results.extend(got.results);
            merged.checked += got.checked;
            merged.expired += got.expired;
            merged.elapsed_ms += got.elapsed_ms;
        }
        Ok(merged)
    }

    /// Candidate rules for an event across the ancestor chain. An id defined
    /// by two different locations in the chain is a `DuplicateId`.
    pub fn find_rules(
        &self,
        name: &str,
        key: Option<&str>,
        event: &Map<String, Value>,
    ) -> Result<HashMap<String, RuleHit>> {
        let mut hits: HashMap<String, RuleHit> = HashMap::new();
        for loc in self.ancestors(name)? {
            for (id, rule) in loc.find_rules(key, event)? {
                if let Some(prior) = hits.get(&id) {
                    if prior.location != loc.name() {
                        return Err(Error::DuplicateId(id));
                    }
                    continue;
                }
                hits.insert(
                    id,
                    RuleHit {
                        location: loc.name().to_string(),
                        rule,
                    },
                );
            }
        }
        Ok(hits)
    }
}
