//! End-to-end scenarios driven through the manager and pipeline with the
//! canned script runtime standing in for an embedded language.

use serde_json::{json, Value};
use sift_core::actions::Dispatcher;
use sift_core::breaker::RateBreaker;
use sift_core::fetch::LibraryFetcher;
use sift_core::matcher::Bindings;
use sift_core::query::{parse_query, QueryCtx};
use sift_core::{
    Control, Disposition, Manager, MemStorage, Pipeline, ScriptRuntime, StaticRuntime, Storage,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    storage: Arc<MemStorage>,
    pipeline: Pipeline,
    scripts: Arc<StaticRuntime>,
}

impl Harness {
    fn new() -> Self {
        let storage = Arc::new(MemStorage::new());
        let scripts = Arc::new(StaticRuntime::new());
        let runtime: Arc<dyn ScriptRuntime> = Arc::clone(&scripts) as Arc<dyn ScriptRuntime>;
        let fetcher = Arc::new(LibraryFetcher::new(8).expect("fetcher"));
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&runtime),
                Arc::clone(&fetcher),
                Arc::new(RateBreaker::new(0, Duration::from_secs(1))),
            )
            .expect("dispatcher"),
        );
        Self {
            pipeline: Pipeline {
                manager: Arc::new(Manager::new(
                    Arc::clone(&storage) as Arc<dyn Storage>,
                    Control::default(),
                )),
                dispatcher,
                runtime,
                fetcher,
            },
            storage,
            scripts,
        }
    }

    fn add(&self, id: Option<&str>, fact: Value) {
        self.pipeline
            .manager
            .location("here")
            .expect("location")
            .add_fact(None, id, fact)
            .expect("add");
    }

    fn process(&self, event: Value) -> sift_core::EventState {
        let Value::Object(event) = event else {
            panic!("event must be a map");
        };
        self.pipeline
            .process_event("here", None, event)
            .expect("process")
    }

    fn query(&self, query: Value) -> Vec<Bindings> {
        let location = self.pipeline.manager.location("here").expect("location");
        let ctx = QueryCtx {
            manager: self.pipeline.manager.as_ref(),
            location: &location,
            read_key: None,
            runtime: &self.pipeline.runtime,
            fetcher: self.pipeline.fetcher.as_ref(),
        };
        parse_query(&query)
            .expect("parse")
            .exec(&ctx, vec![Bindings::new()])
            .expect("exec")
    }
}

fn announce_rule() -> Value {
    json!({"rule": {
        "when": {"pattern": {"wants": "?x"}},
        "condition": {"pattern": {"has": "?x"}},
        "action": {"code": "announce(?x)", "subvars": true}
    }})
}

fn sorted_values(got: &[Bindings], var: &str) -> Vec<Value> {
    let mut vals: Vec<Value> = got.iter().filter_map(|b| b.get(var).cloned()).collect();
    vals.sort_by_key(|v| serde_json::to_string(v).unwrap_or_default());
    vals
}

// A stored rule matches an event, its condition binds against facts,
// and the action fires exactly once.
#[test]
fn simple_pattern_condition_rule() {
    let h = Harness::new();
    h.add(None, json!({"has": "tacos"}));
    h.add(None, json!({"has": "beer"}));
    h.add(Some("r1"), announce_rule());

    let state = h.process(json!({"wants": "beer"}));
    assert_eq!(state.disposition(), Disposition::Complete);

    let runs = h.scripts.invocations();
    assert_eq!(runs.len(), 1, "action fires exactly once");
    assert!(runs[0].source.contains("announce(beer)"));
    assert_eq!(runs[0].bindings.get("x"), Some(&json!("beer")));
}

// A trigger! event considers only the named rule, same outcome.
#[test]
fn triggered_rule() {
    let h = Harness::new();
    h.add(None, json!({"has": "beer"}));
    h.add(Some("r1"), announce_rule());

    let state = h.process(json!({"wants": "beer", "trigger!": "r1"}));
    assert_eq!(state.disposition(), Disposition::Complete);

    let runs = h.scripts.invocations();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].source.contains("announce(beer)"));
}

// An embedded rule evaluates with no stored rules at all.
#[test]
fn embedded_rule() {
    let h = Harness::new();
    h.add(None, json!({"has": "beer"}));

    let state = h.process(json!({"wants": "beer", "evaluate!": {
        "when": {"pattern": {"wants": "?x"}},
        "condition": {"pattern": {"has": "?x"}},
        "action": {"code": "announce(?x)", "subvars": true}
    }}));
    assert_eq!(state.disposition(), Disposition::Complete);

    let runs = h.scripts.invocations();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].bindings.get("x"), Some(&json!("beer")));
}

// Conjunction with negation keeps only the unmatched binding.
#[test]
fn negation_narrows_bindings() {
    let h = Harness::new();
    h.add(None, json!({"likes": "rum"}));
    h.add(None, json!({"likes": "tacos"}));
    h.add(None, json!({"drinks": "rum"}));

    let got = h.query(json!({"and": [
        {"pattern": {"likes": "?likes"}},
        {"not": {"pattern": {"drinks": "?likes"}}}
    ]}));
    assert_eq!(sorted_values(&got, "?likes"), vec![json!("tacos")]);
}

// Or with shortCircuit returns the first disjunct's bindings only.
#[test]
fn or_short_circuits() {
    let h = Harness::new();
    h.add(None, json!({"likes": "chips"}));
    h.add(None, json!({"likes": "tacos"}));
    h.add(None, json!({"drinks": "beer"}));

    let got = h.query(json!({"or": [
        {"pattern": {"likes": "?likes"}},
        {"pattern": {"drinks": "?drinks"}}
    ], "shortCircuit": true}));
    assert_eq!(
        sorted_values(&got, "?likes"),
        vec![json!("chips"), json!("tacos")]
    );
    assert!(
        sorted_values(&got, "?drinks").is_empty(),
        "drinks branch must not run"
    );
}

// A ttl'd fact is present, then absent, and its stored pair is gone.
#[test]
fn expiration_removes_fact_and_storage() {
    let h = Harness::new();
    h.add(None, json!({"likes": "tacos", "ttl": "1s"}));

    let location = h.pipeline.manager.location("here").expect("location");
    let before = location
        .search(None, &json!({"likes": "?x"}))
        .expect("search");
    assert_eq!(before.results.len(), 1);

    std::thread::sleep(Duration::from_millis(1500));

    let after = location
        .search(None, &json!({"likes": "?x"}))
        .expect("search");
    assert!(after.results.is_empty());
    assert_eq!(after.expired, 1);
    assert!(
        h.storage.load("here").expect("load").is_empty(),
        "expired pair purged from storage"
    );
}

// Adding then removing a fact leaves the location structurally as it was,
// observed through the public surface.
#[test]
fn add_remove_is_inverse() {
    let h = Harness::new();
    h.add(Some("keep"), json!({"likes": "chips"}));
    h.add(Some("f1"), json!({"likes": "tacos", "tags": ["food"]}));

    let location = h.pipeline.manager.location("here").expect("location");
    location.rem_fact(None, "f1").expect("rem");

    assert_eq!(location.fact_count(), 1);
    let hits = location.search(None, &json!({"likes": "?x"})).expect("search");
    assert_eq!(hits.results.len(), 1);
    assert_eq!(hits.results[0].id, "keep");
    let stored = h.storage.load("here").expect("load");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0, "keep");
}

// A fact search result substituted back into the pattern reproduces the
// consumed parts of the fact.
#[test]
fn match_then_substitute_roundtrips() {
    let h = Harness::new();
    h.add(None, json!({"order": {"item": "tacos", "qty": 2}}));

    let location = h.pipeline.manager.location("here").expect("location");
    let pattern = json!({"order": {"item": "?what", "qty": "?n"}});
    let hits = location.search(None, &pattern).expect("search");
    assert_eq!(hits.results.len(), 1);

    let substituted = sift_core::matcher::substitute(&hits.results[0].bindings[0], &pattern);
    assert_eq!(substituted, json!({"order": {"item": "tacos", "qty": 2}}));
}

// Events spread across one Map<...> submission surface extra reserved keys
// untouched: trigger! and evaluate! never leak into the term index.
#[test]
fn reserved_event_keys_are_inert_as_facts() {
    let h = Harness::new();
    h.add(Some("r1"), announce_rule());
    h.add(None, json!({"has": "beer"}));

    // An event that carries a trigger! for a missing rule is nonfatal and
    // fires nothing.
    let state = h.process(json!({"wants": "beer", "trigger!": "ghost"}));
    assert_eq!(state.disposition(), Disposition::Nonfatal);
    assert!(h.scripts.invocations().is_empty());
}

fn _assert_send_sync<T: Send + Sync>() {}

#[test]
fn engine_types_are_shareable_across_threads() {
    _assert_send_sync::<Manager>();
    _assert_send_sync::<Pipeline>();
    _assert_send_sync::<sift_core::Location>();
}

#[test]
fn concurrent_writers_keep_the_location_consistent() {
    let h = Harness::new();
    let location = h.pipeline.manager.location("here").expect("location");

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let location = &location;
            scope.spawn(move || {
                for i in 0..25 {
                    location
                        .add_fact(None, Some(&format!("w{worker}-{i}")), json!({"n": i}))
                        .expect("add");
                }
            });
        }
    });

    assert_eq!(location.fact_count(), 100);
    assert_eq!(h.storage.load("here").expect("load").len(), 100);
}
