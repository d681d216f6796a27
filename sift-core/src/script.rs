//! The embedded-script collaborator boundary.
//!
//! The engine never depends on a concrete language; it talks to whatever
//! implements [`ScriptRuntime`]. Condition code and script actions go
//! through [`run_with_timeout`], which bounds a run by the location's
//! configured timeout and asks the runtime to halt when it is exceeded.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A compiled, reusable script: the source with any library sources
/// prepended.
#[derive(Clone, Debug)]
pub struct CompiledScript {
    pub source: String,
}

/// Embedded script runtime collaborator.
pub trait ScriptRuntime: Send + Sync {
    /// Compile `code`, prefixing the concatenated `libraries` sources.
    fn compile(&self, code: &str, libraries: &[String]) -> Result<CompiledScript>;

    /// Run a compiled script with variable bindings (variable names already
    /// stripped of their `?` prefix) and endpoint properties, returning the
    /// script's single result value.
    fn run(
        &self,
        script: &CompiledScript,
        bindings: &Map<String, Value>,
        props: &Map<String, Value>,
    ) -> Result<Value>;

    /// Ask the runtime to stop the current run.
    fn halt(&self);
}

/// Run a script on its own thread, failing with `ScriptTimeout` and halting
/// the runtime if it does not finish within `timeout_ms`.
pub fn run_with_timeout(
    runtime: &Arc<dyn ScriptRuntime>,
    script: &CompiledScript,
    bindings: &Map<String, Value>,
    props: &Map<String, Value>,
    timeout_ms: u64,
) -> Result<Value> {
    let (tx, rx) = std::sync::mpsc::channel();
    let rt = Arc::clone(runtime);
    let script = script.clone();
    let bindings = bindings.clone();
    let props = props.clone();
    std::thread::spawn(move || {
        let _ = tx.send(rt.run(&script, &bindings, &props));
    });

    match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
        Ok(result) => result,
        Err(_) => {
            runtime.halt();
            Err(Error::ScriptTimeout(timeout_ms))
        }
    }
}

/// One recorded script invocation.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub source: String,
    pub bindings: Map<String, Value>,
}

/// A canned-response runtime for tests and for running the engine without
/// an embedded language linked in. Unconfigured scripts evaluate to `true`.
#[derive(Default)]
pub struct StaticRuntime {
    results: Mutex<Vec<(String, Value)>>,
    runs: Mutex<Vec<Invocation>>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canned result for any script whose source contains `fragment`.
    pub fn with_result(self, fragment: &str, value: Value) -> Self {
        if let Ok(mut results) = self.results.lock() {
            results.push((fragment.to_string(), value));
        }
        self
    }

    /// Every run so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ScriptRuntime for StaticRuntime {
    fn compile(&self, code: &str, libraries: &[String]) -> Result<CompiledScript> {
        let mut source = String::new();
        for lib in libraries {
            source.push_str(lib);
            source.push('\n');
        }
        source.push_str(code);
        Ok(CompiledScript { source })
    }

    fn run(
        &self,
        script: &CompiledScript,
        bindings: &Map<String, Value>,
        _props: &Map<String, Value>,
    ) -> Result<Value> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(Invocation {
                source: script.source.clone(),
                bindings: bindings.clone(),
            });
        }
        let results = self.results.lock().map_err(|e| Error::Script(e.to_string()))?;
        for (fragment, value) in results.iter() {
            if script.source.contains(fragment.as_str()) {
                return Ok(value.clone());
            }
        }
        Ok(Value::Bool(true))
    }

    fn halt(&self) {}
}
