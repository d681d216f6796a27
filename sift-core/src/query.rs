//! Composable condition queries.
//!
//! A query maps a sequence of candidate bindings to a new sequence. The
//! pipeline seeds the sequence with the bindings produced by matching a
//! rule's trigger against the event; each combinator narrows, widens, or
//! extends it.

use crate::error::{Error, Result};
use crate::fetch::LibraryFetcher;
use crate::location::Location;
use crate::manager::Manager;
use crate::matcher::{substitute, Bindings};
use crate::script::{run_with_timeout, ScriptRuntime};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum Query {
    /// Identity.
    Empty,
    /// Substitute each candidate into the pattern and search the named
    /// locations (the current one when unspecified), merging found bindings
    /// into the candidate.
    Pattern { pattern: Value, locations: Vec<String> },
    /// Fold-left conjunction.
    And(Vec<Query>),
    /// Per-candidate concatenation of disjunct outputs; `short_circuit`
    /// stops at the first disjunct that yields anything for that candidate.
    Or {
        disjuncts: Vec<Query>,
        short_circuit: bool,
    },
    /// Keep a candidate iff the inner query yields nothing for it.
    Not(Box<Query>),
    /// Run the script runtime per candidate; the result shape decides:
    /// false/null drop, a map extends the bindings, anything else keeps.
    Code { code: String, libraries: Vec<String> },
}

/// Everything a query needs at execution time.
pub struct QueryCtx<'a> {
    pub manager: &'a Manager,
    pub location: &'a Arc<Location>,
    pub read_key: Option<&'a str>,
    pub runtime: &'a Arc<dyn ScriptRuntime>,
    pub fetcher: &'a LibraryFetcher,
}

/// Parse a query from its map representation. Discriminators are probed in
/// order: `pattern`, `code`, `and`, `or`, `not`; the empty map is the
/// identity query.
pub fn parse_query(value: &Value) -> Result<Query> {
    let Value::Object(m) = value else {
        return Err(Error::UnknownPattern(format!("query must be a map, got {value}")));
    };
    if m.is_empty() {
        return Ok(Query::Empty);
    }
    if let Some(pattern) = m.get("pattern") {
        return Ok(Query::Pattern {
            pattern: pattern.clone(),
            locations: parse_locations(m)?,
        });
    }
    if let Some(code) = m.get("code") {
        return Ok(Query::Code {
            code: code_text(code)?,
            libraries: parse_libraries(m)?,
        });
    }
    if let Some(qs) = m.get("and") {
        return Ok(Query::And(parse_query_seq(qs)?));
    }
    if let Some(qs) = m.get("or") {
        return Ok(Query::Or {
            disjuncts: parse_query_seq(qs)?,
            short_circuit: m
                .get("shortCircuit")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }
    if let Some(q) = m.get("not") {
        return Ok(Query::Not(Box::new(parse_query(q)?)));
    }
    Err(Error::Syntax(format!("unrecognized query shape: {value}")))
}

fn parse_query_seq(value: &Value) -> Result<Vec<Query>> {
    let Value::Array(items) = value else {
        return Err(Error::Syntax("'and'/'or' take a sequence of queries".into()));
    };
    items.iter().map(parse_query).collect()
}

fn parse_locations(m: &Map<String, Value>) -> Result<Vec<String>> {
    if let Some(loc) = m.get("location") {
        let Some(name) = loc.as_str() else {
            return Err(Error::Syntax("'location' must be a string".into()));
        };
        return Ok(vec![name.to_string()]);
    }
    match m.get("locations") {
        None => Ok(vec![]),
        Some(Value::Array(names)) => names
            .iter()
            .map(|n| {
                n.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Syntax("'locations' entries must be strings".into()))
            })
            .collect(),
        Some(other) => Err(Error::Syntax(format!("'locations' must be a sequence, got {other}"))),
    }
}

fn parse_libraries(m: &Map<String, Value>) -> Result<Vec<String>> {
    match m.get("libraries") {
        None => Ok(vec![]),
        Some(Value::Array(libs)) => libs
            .iter()
            .map(|l| {
                l.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Syntax("'libraries' entries must be strings".into()))
            })
            .collect(),
        Some(other) => Err(Error::Syntax(format!("'libraries' must be a sequence, got {other}"))),
    }
}

/// Action/query code: a single string, or a sequence of lines joined with
/// newlines.
pub fn code_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(lines) => {
            let mut out = Vec::with_capacity(lines.len());
            for line in lines {
                match line.as_str() {
                    Some(s) => out.push(s),
                    None => return Err(Error::Syntax("'code' lines must be strings".into())),
                }
            }
            Ok(out.join("\n"))
        }
        other => Err(Error::Syntax(format!("'code' must be a string or sequence, got {other}"))),
    }
}

impl Query {
    pub fn exec(&self, ctx: &QueryCtx<'_>, candidates: Vec<Bindings>) -> Result<Vec<Bindings>> {
        match self {
            Query::Empty => Ok(candidates),
            Query::Pattern { pattern, locations } => exec_pattern(ctx, pattern, locations, candidates),
            Query::And(conjuncts) => {
                let mut acc = candidates;
                for q in conjuncts {
                    acc = q.exec(ctx, acc)?;
                }
                Ok(acc)
            }
            Query::Or {
                disjuncts,
                short_circuit,
            } => {
                let mut out = Vec::new();
                for c in candidates {
                    for q in disjuncts {
                        let got = q.exec(ctx, vec![c.clone()])?;
                        let satisfied = !got.is_empty();
                        out.extend(got);
                        if *short_circuit && satisfied {
                            break;
                        }
                    }
                }
                Ok(out)
            }
            Query::Not(inner) => {
                let mut out = Vec::new();
                for c in candidates {
                    if inner.exec(ctx, vec![c.clone()])?.is_empty() {
                        out.push(c);
                    }
                }
                Ok(out)
            }
            Query::Code { code, libraries } => exec_code(ctx, code, libraries, candidates),
        }
    }
}

fn exec_pattern(
    ctx: &QueryCtx<'_>,
    pattern: &Value,
    locations: &[String],
    candidates: Vec<Bindings>,
) -> Result<Vec<Bindings>> {
    let mut out = Vec::new();
    for c in candidates {
        let substituted = substitute(&c, pattern);
        let targets: Vec<&str> = if locations.is_empty() {
            vec![ctx.location.name()]
        } else {
            locations.iter().map(String::as_str).collect()
        };
        for target in targets {
            let results = if target == ctx.location.name() {
                ctx.location.search(ctx.read_key, &substituted)?
            } else {
                ctx.manager.location(target)?.search(ctx.read_key, &substituted)?
            };
            for hit in results.results {
                for found in hit.bindings {
                    let mut merged = c.clone();
                    merged.extend(found);
                    out.push(merged);
                }
            }
        }
    }
    Ok(out)
}

fn exec_code(
    ctx: &QueryCtx<'_>,
    code: &str,
    libraries: &[String],
    candidates: Vec<Bindings>,
) -> Result<Vec<Bindings>> {
    let control = ctx.location.control();
    let sources: Vec<String> = libraries
        .iter()
        .map(|lib| ctx.fetcher.resolve(&control, lib))
        .collect::<Result<_>>()?;
    let compiled = ctx.runtime.compile(code, &sources)?;

    let props = crate::actions::endpoint_props(&control.props, crate::actions::SCRIPT_ENDPOINT);
    let mut out = Vec::new();
    for c in candidates {
        let marshaled = crate::actions::strip_variable_prefixes(&c);
        let result = run_with_timeout(
            ctx.runtime,
            &compiled,
            &marshaled,
            &props,
            control.script_timeout_ms,
        )?;
        match result {
            Value::Bool(false) | Value::Null => {}
            Value::Object(entries) => {
                let mut extended = c.clone();
                for (k, v) in entries {
                    let key = if k.starts_with('?') { k } else { format!("?{k}") };
                    extended.insert(key, v);
                }
                out.push(extended);
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}
