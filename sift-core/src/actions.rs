//! Action dispatch: embedded script, HTTP endpoint, or named service.

use crate::breaker::Breaker;
use crate::error::{Error, Result};
use crate::fetch::LibraryFetcher;
use crate::location::Location;
use crate::matcher::Bindings;
use crate::query::code_text;
use crate::script::{run_with_timeout, ScriptRuntime};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The embedded-script endpoint; also the default when an action names
/// none.
pub const SCRIPT_ENDPOINT: &str = "code";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed action record.
#[derive(Clone, Debug)]
pub struct Action {
    pub code: String,
    pub endpoint: String,
    pub subvars: bool,
    pub libraries: Vec<String>,
    pub opts: Map<String, Value>,
}

/// Parse an action from its map representation. `code` may be a string or
/// a sequence of lines; `opts.libraries` lists library URLs or names.
pub fn parse_action(value: &Value) -> Result<Action> {
    let Value::Object(m) = value else {
        return Err(Error::Syntax(format!("an action must be a map, got {value}")));
    };
    let code = match m.get("code") {
        Some(code) => code_text(code)?,
        None => return Err(Error::Syntax("an action requires 'code'".into())),
    };
    let endpoint = match m.get("endpoint") {
        None => SCRIPT_ENDPOINT.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => return Err(Error::Syntax(format!("'endpoint' must be a string, got {other}"))),
    };
    let opts = match m.get("opts") {
        None => Map::new(),
        Some(Value::Object(opts)) => opts.clone(),
        Some(other) => return Err(Error::Syntax(format!("'opts' must be a map, got {other}"))),
    };
    let libraries = match opts.get("libraries") {
        None => Vec::new(),
        Some(Value::Array(libs)) => {
            let mut out = Vec::with_capacity(libs.len());
            for lib in libs {
                match lib.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => return Err(Error::Syntax("'opts.libraries' entries must be strings".into())),
                }
            }
            out
        }
        Some(other) => return Err(Error::Syntax(format!("'opts.libraries' must be a sequence, got {other}"))),
    };
    Ok(Action {
        code,
        endpoint,
        subvars: m.get("subvars").and_then(Value::as_bool).unwrap_or(false),
        libraries,
        opts,
    })
}

/// Resolves an action's endpoint and executes it.
pub struct Dispatcher {
    runtime: Arc<dyn ScriptRuntime>,
    fetcher: Arc<LibraryFetcher>,
    breaker: Arc<dyn Breaker>,
    http: reqwest::blocking::Client,
}

impl Dispatcher {
    pub fn new(
        runtime: Arc<dyn ScriptRuntime>,
        fetcher: Arc<LibraryFetcher>,
        breaker: Arc<dyn Breaker>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            runtime,
            fetcher,
            breaker,
            http,
        })
    }

    pub fn dispatch(&self, loc: &Location, action: &Action, bindings: &Bindings) -> Result<Value> {
        let code = if action.subvars {
            subvars(&action.code, bindings)?
        } else {
            action.code.clone()
        };
        debug!(location = %loc.name(), endpoint = %action.endpoint, "dispatching action");

        if action.endpoint.is_empty() || action.endpoint == SCRIPT_ENDPOINT {
            return self.run_script(loc, action, &code, bindings);
        }
        if action.endpoint.starts_with("http://") || action.endpoint.starts_with("https://") {
            return self.post(&action.endpoint, action, &code, bindings);
        }

        let control = loc.control();
        let urls = control
            .services
            .get(&action.endpoint)
            .filter(|urls| !urls.is_empty())
            .ok_or_else(|| Error::UnsupportedEndpoint(action.endpoint.clone()))?;
        let url = &urls[fastrand::usize(..urls.len())];
        self.post(url, action, &code, bindings)
    }

    fn run_script(
        &self,
        loc: &Location,
        action: &Action,
        code: &str,
        bindings: &Bindings,
    ) -> Result<Value> {
        let control = loc.control();
        let sources: Vec<String> = action
            .libraries
            .iter()
            .map(|lib| self.fetcher.resolve(&control, lib))
            .collect::<Result<_>>()?;
        let compiled = self.runtime.compile(code, &sources)?;
        let marshaled = strip_variable_prefixes(bindings);
        let props = endpoint_props(&control.props, SCRIPT_ENDPOINT);
        run_with_timeout(
            &self.runtime,
            &compiled,
            &marshaled,
            &props,
            control.script_timeout_ms,
        )
    }

    fn post(&self, url: &str, action: &Action, code: &str, bindings: &Bindings) -> Result<Value> {
        self.breaker.submit()?;
        let payload = json!({
            "bindings": bindings,
            "opts": action.opts,
            "code": code,
        });
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("{status} posting to {url}")));
        }
        let body = response.text().map_err(|e| Error::Http(e.to_string()))?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// Variable names minus their `?` prefix, for the script runtime.
pub fn strip_variable_prefixes(bindings: &Bindings) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in bindings {
        out.insert(name.trim_start_matches('?').to_string(), value.clone());
    }
    out
}

/// The location's properties for one endpoint.
pub fn endpoint_props(
    props: &std::collections::HashMap<String, Value>,
    endpoint: &str,
) -> Map<String, Value> {
    match props.get(endpoint) {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    }
}

/// Textual variable substitution: each whole-word `?name` occurrence is
/// replaced by the binding's value (strings raw, anything else as compact
/// JSON). Partial matches like `?named` for a binding `?name` are left
/// untouched; this is load-bearing, callers rely on it.
pub fn subvars(code: &str, bindings: &Bindings) -> Result<String> {
    let mut out = code.to_string();
    for (name, value) in bindings {
        let bare = name.trim_start_matches('?');
        if bare.is_empty() {
            continue;
        }
        let pattern = format!(r"\?{}\b", regex::escape(bare));
        let re = Regex::new(&pattern).map_err(|e| Error::Syntax(e.to_string()))?;
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).map_err(|e| Error::Syntax(e.to_string()))?,
        };
        out = re.replace_all(&out, regex::NoExpand(&rendered)).into_owned();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::RateBreaker;
    use crate::control::Control;
    use crate::script::StaticRuntime;
    use crate::storage::MemStorage;
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn open_loc(control: Control) -> Location {
        Location::open("here", control, Arc::new(MemStorage::new())).expect("open")
    }

    fn dispatcher(rt: Arc<StaticRuntime>, breaker_cap: usize) -> Dispatcher {
        Dispatcher::new(
            rt as Arc<dyn ScriptRuntime>,
            Arc::new(LibraryFetcher::new(8).expect("fetcher")),
            Arc::new(RateBreaker::new(breaker_cap, Duration::from_secs(60))),
        )
        .expect("dispatcher")
    }

    #[test]
    fn parse_action_defaults_to_the_script_endpoint() {
        let action = parse_action(&json!({"code": "announce(?x)"})).expect("parse");
        assert_eq!(action.endpoint, SCRIPT_ENDPOINT);
        assert!(!action.subvars);
        assert!(action.libraries.is_empty());
    }

    #[test]
    fn parse_action_joins_code_lines() {
        let action = parse_action(&json!({"code": ["a()", "b()"]})).expect("parse");
        assert_eq!(action.code, "a()\nb()");
    }

    #[test]
    fn parse_action_requires_code() {
        assert!(parse_action(&json!({"endpoint": "code"})).is_err());
        assert!(parse_action(&json!("announce()")).is_err());
    }

    #[test]
    fn script_endpoint_runs_with_stripped_bindings() {
        let rt = Arc::new(StaticRuntime::new());
        let d = dispatcher(Arc::clone(&rt), 0);
        let loc = open_loc(Control::default());
        let action = parse_action(&json!({"code": "announce(x)"})).expect("parse");

        d.dispatch(&loc, &action, &bindings(&[("?x", json!("beer"))]))
            .expect("dispatch");

        let runs = rt.invocations();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].bindings.get("x"), Some(&json!("beer")));
    }

    #[test]
    fn subvars_substitutes_whole_words_only() {
        let b = bindings(&[("?x", json!("beer")), ("?n", json!(2))]);
        assert_eq!(subvars("announce(?x, ?n)", &b).expect("sub"), "announce(beer, 2)");
        assert_eq!(
            subvars("announce(?xtra, ?x)", &b).expect("sub"),
            "announce(?xtra, beer)"
        );
    }

    #[test]
    fn subvars_renders_non_strings_as_json() {
        let b = bindings(&[("?v", json!({"a": [1, 2]}))]);
        assert_eq!(subvars("take(?v)", &b).expect("sub"), "take({\"a\":[1,2]})");
    }

    #[test]
    fn subvars_applies_before_script_dispatch() {
        let rt = Arc::new(StaticRuntime::new());
        let d = dispatcher(Arc::clone(&rt), 0);
        let loc = open_loc(Control::default());
        let action =
            parse_action(&json!({"code": "announce(\"?x\")", "subvars": true})).expect("parse");

        d.dispatch(&loc, &action, &bindings(&[("?x", json!("beer"))]))
            .expect("dispatch");
        assert!(rt.invocations()[0].source.contains("announce(\"beer\")"));
    }

    #[test]
    fn unknown_endpoints_are_unsupported() {
        let d = dispatcher(Arc::new(StaticRuntime::new()), 0);
        let loc = open_loc(Control::default());
        let action = parse_action(&json!({"code": "x", "endpoint": "mailer"})).expect("parse");
        let err = d
            .dispatch(&loc, &action, &Bindings::new())
            .expect_err("no such service");
        assert!(matches!(err, Error::UnsupportedEndpoint(_)));
    }

    #[test]
    fn named_services_resolve_through_the_control_map() {
        let control = Control {
            services: [("mailer".to_string(), vec!["http://127.0.0.1:1/post".to_string()])]
                .into_iter()
                .collect(),
            ..Control::default()
        };
        let d = dispatcher(Arc::new(StaticRuntime::new()), 0);
        let loc = open_loc(control);
        let action = parse_action(&json!({"code": "x", "endpoint": "mailer"})).expect("parse");
        // The service resolves; the request itself fails fast against a
        // closed port.
        let err = d
            .dispatch(&loc, &action, &Bindings::new())
            .expect_err("unreachable");
        assert!(matches!(err, Error::Http(_)));
    }

    #[test]
    fn open_breaker_throttles_http_dispatch() {
        let d = dispatcher(Arc::new(StaticRuntime::new()), 1);
        let loc = open_loc(Control::default());
        let action = parse_action(
            &json!({"code": "x", "endpoint": "http://127.0.0.1:1/post"}),
        )
        .expect("parse");

        // First submission consumes the window; it still fails on connect.
        let _ = d.dispatch(&loc, &action, &Bindings::new());
        let err = d
            .dispatch(&loc, &action, &Bindings::new())
            .expect_err("throttled");
        assert!(matches!(err, Error::Throttled(_)));
    }

    #[test]
    fn script_props_come_from_the_endpoint_entry() {
        let props = [("code".to_string(), json!({"region": "us"}))]
            .into_iter()
            .collect();
        let got = endpoint_props(&props, SCRIPT_ENDPOINT);
        assert_eq!(got.get("region"), Some(&json!("us")));
        assert!(endpoint_props(&props, "other").is_empty());
    }
}
