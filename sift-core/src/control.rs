use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default cap on the length of strings admitted into the term index.
pub const DEFAULT_MAX_INDEXED_STRING: usize = 64;

/// Default per-run script timeout.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5_000;

/// Per-location policy. Treated as a copy-on-write snapshot: the location
/// holds an `Arc<Control>` that is swapped whole, never mutated in place,
/// so hooks and concurrent readers observe a consistent version.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Control {
    /// Maximum stored facts (rules included); 0 means unlimited.
    pub max_facts: usize,
    /// A disabled location rejects every operation.
    pub disabled: bool,
    /// When set, reads must present this key.
    pub read_key: Option<String>,
    /// When set, writes must present this key.
    pub write_key: Option<String>,
    /// Upper bound for a single embedded-script run.
    pub script_timeout_ms: u64,
    /// Named action endpoints: service name → candidate URLs.
    pub services: HashMap<String, Vec<String>>,
    /// Named script libraries: library name → source URL.
    pub libraries: HashMap<String, String>,
    /// Ancestor chain searched when inherited facts/rules are requested.
    pub parents: Vec<String>,
    /// Inject the fact id into the fact under `id!` before persisting.
    pub inject_id: bool,
    /// Strings longer than this are not term-indexed.
    pub max_indexed_string: usize,
    /// Per-endpoint properties passed to the script runtime.
    pub props: HashMap<String, serde_json::Value>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            max_facts: 0,
            disabled: false,
            read_key: None,
            write_key: None,
            script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            services: HashMap::new(),
            libraries: HashMap::new(),
            parents: Vec::new(),
            inject_id: false,
            max_indexed_string: DEFAULT_MAX_INDEXED_STRING,
            props: HashMap::new(),
        }
    }
}

impl Control {
    /// Check a presented read key against the required one.
    pub fn allows_read(&self, key: Option<&str>) -> bool {
        match &self.read_key {
            Some(required) => key == Some(required.as_str()),
            None => true,
        }
    }

    /// Check a presented write key against the required one.
    pub fn allows_write(&self, key: Option<&str>) -> bool {
        match &self.write_key {
            Some(required) => key == Some(required.as_str()),
            None => true,
        }
    }
}
