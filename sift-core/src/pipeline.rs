//! The event-processing pipeline.
//!
//! Processing an event builds a four-level tree: FindRules fans out into
//! one EvalRule per candidate, each EvalRule into one EvalRuleCondition per
//! trigger-match bindings, and each condition into one ExecRuleAction per
//! (bindings, action) pair, with a terminal RuleDone step per rule. Every
//! node records a disposition; the walk executes nodes under a step budget
//! and stops at the first non-complete disposition, so a partially walked
//! tree can be re-walked later and completed nodes are never re-executed.

use crate::actions::{parse_action, Dispatcher};
use crate::error::{Error, Result};
use crate::fetch::LibraryFetcher;
use crate::location::{validate_rule, when_patterns};
use crate::manager::Manager;
use crate::matcher::{match_pattern, Bindings};
use crate::query::{parse_query, Query, QueryCtx};
use crate::script::ScriptRuntime;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Reserved event key naming the single rule to consider.
pub const TRIGGER_KEY: &str = "trigger!";
/// Reserved event key carrying an embedded rule body.
pub const EVALUATE_KEY: &str = "evaluate!";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Not yet executed.
    Unknown,
    Complete,
    Fatal,
    Nonfatal,
}

#[derive(Debug)]
enum NodeKind {
    FindRules,
    EvalRule {
        rule_loc: String,
        rule_id: String,
        rule: Map<String, Value>,
    },
    EvalRuleCondition {
        rule_loc: String,
        rule_id: String,
        rule: Map<String, Value>,
        bindings: Bindings,
        serial: bool,
    },
    ExecRuleAction {
        action: Value,
        bindings: Bindings,
    },
    RuleDone {
        rule_loc: String,
        rule_id: String,
        one_shot: bool,
    },
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    disposition: Disposition,
    error: Option<String>,
    children: Vec<Node>,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            disposition: Disposition::Unknown,
            error: None,
            children: Vec::new(),
        }
    }

    fn fail(&mut self, err: &Error) {
        self.disposition = if err.is_nonfatal() {
            Disposition::Nonfatal
        } else {
            Disposition::Fatal
        };
        self.error = Some(err.to_string());
    }

    fn collect_errors(&self, out: &mut Vec<String>) {
        if let Some(err) = &self.error {
            out.push(err.clone());
        }
        for child in &self.children {
            child.collect_errors(out);
        }
    }
}

/// One event's processing tree plus the values its actions produced.
pub struct EventState {
    location: String,
    event: Map<String, Value>,
    root: Node,
    values: Vec<Value>,
}

impl EventState {
    pub fn new(location: &str, event: Map<String, Value>) -> Self {
        Self {
            location: location.to_string(),
            event,
            root: Node::new(NodeKind::FindRules),
            values: Vec::new(),
        }
    }

    /// Action results gathered so far, in completion order (insertion order
    /// for serial rules).
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The tree's aggregate disposition: the first non-complete node's, or
    /// `Complete`.
    pub fn disposition(&self) -> Disposition {
        fn agg(node: &Node) -> Disposition {
            if node.disposition != Disposition::Complete {
                return node.disposition;
            }
            for child in &node.children {
                let d = agg(child);
                if d != Disposition::Complete {
                    return d;
                }
            }
            Disposition::Complete
        }
        agg(&self.root)
    }

    pub fn errors(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.collect_errors(&mut out);
        out
    }
}

/// The pipeline's collaborators, shared across events.
pub struct Pipeline {
    pub manager: Arc<Manager>,
    pub dispatcher: Arc<Dispatcher>,
    pub runtime: Arc<dyn ScriptRuntime>,
    pub fetcher: Arc<LibraryFetcher>,
}

struct WalkCtx<'a> {
    pipeline: &'a Pipeline,
    location: &'a str,
    key: Option<&'a str>,
    event: &'a Map<String, Value>,
    values: &'a Mutex<Vec<Value>>,
}

impl Pipeline {
    /// Process an event to completion.
    pub fn process_event(
        &self,
        location: &str,
        key: Option<&str>,
        event: Map<String, Value>,
    ) -> Result<EventState> {
        let mut state = EventState::new(location, event);
        self.walk(&mut state, key, usize::MAX)?;
        Ok(state)
    }

    /// Walk (or re-walk) an event tree, executing at most `budget` nodes.
    /// Nodes already complete are skipped, so a partial walk resumes where
    /// it stopped.
    pub fn walk(&self, state: &mut EventState, key: Option<&str>, budget: usize) -> Result<Disposition> {
        let values = Mutex::new(Vec::new());
        let mut steps = budget;
        let ctx = WalkCtx {
            pipeline: self,
            location: &state.location,
            key,
            event: &state.event,
            values: &values,
        };
        let disposition = walk_node(&mut state.root, &ctx, &mut steps);
        state
            .values
            .append(&mut values.into_inner().unwrap_or_default());
        Ok(disposition)
    }
}

fn walk_node(node: &mut Node, ctx: &WalkCtx<'_>, steps: &mut usize) -> Disposition {
    if node.disposition == Disposition::Unknown {
        if *steps == 0 {
            return Disposition::Unknown;
        }
        *steps -= 1;
        run_work(node, ctx);
    }
    if node.disposition != Disposition::Complete {
        return node.disposition;
    }

    if let NodeKind::EvalRuleCondition { serial: false, .. } = node.kind {
        return walk_actions_concurrently(node, ctx, steps);
    }
    for child in &mut node.children {
        let d = walk_node(child, ctx, steps);
        if d != Disposition::Complete {
            return d;
        }
    }
    Disposition::Complete
}

/// Concurrent action fan-out: every pending action leaf runs on its own
/// thread; results land in the shared value vector in completion order.
fn walk_actions_concurrently(node: &mut Node, ctx: &WalkCtx<'_>, steps: &mut usize) -> Disposition {
    let mut pending: Vec<&mut Node> = node
        .children
        .iter_mut()
        .filter(|c| c.disposition == Disposition::Unknown)
        .collect();
    let allowed = (*steps).min(pending.len());
    *steps -= allowed;
    let (run_now, _deferred) = pending.split_at_mut(allowed);

    std::thread::scope(|scope| {
        for child in run_now.iter_mut() {
            let child: &mut Node = child;
            scope.spawn(move || run_work(child, ctx));
        }
    });

    node.children
        .iter()
        .map(|c| c.disposition)
        .find(|d| *d != Disposition::Complete)
        .unwrap_or(Disposition::Complete)
}

fn run_work(node: &mut Node, ctx: &WalkCtx<'_>) {
    let result = match node.kind {
        NodeKind::FindRules => find_rules(node, ctx),
        NodeKind::EvalRule { .. } => eval_rule(node, ctx),
        NodeKind::EvalRuleCondition { .. } => eval_condition(node, ctx),
        NodeKind::ExecRuleAction { .. } => exec_action(node, ctx),
        NodeKind::RuleDone { .. } => rule_done(node, ctx),
    };
    match result {
        Ok(()) => node.disposition = Disposition::Complete,
        Err(err) => {
            warn!(location = %ctx.location, error = %err, "pipeline node failed");
            node.fail(&err);
        }
    }
}

/// Candidate rules, by precedence: `trigger!` names one stored rule,
/// `evaluate!` embeds one rule body, otherwise the pattern index (with
/// ancestor inheritance) decides.
fn find_rules(node: &mut Node, ctx: &WalkCtx<'_>) -> Result<()> {
    if let Some(trigger) = ctx.event.get(TRIGGER_KEY) {
        let Some(rule_id) = trigger.as_str() else {
            return Err(Error::Syntax(format!("'{TRIGGER_KEY}' must be a rule id string")));
        };
        let (rule_loc, rule) = find_triggered_rule(ctx, rule_id)?;
        node.children.push(eval_rule_node(rule_loc, rule_id.to_string(), rule));
        return Ok(());
    }

    if let Some(embedded) = ctx.event.get(EVALUATE_KEY) {
        let Value::Object(rule) = embedded else {
            return Err(Error::Syntax(format!("'{EVALUATE_KEY}' must be a rule body")));
        };
        let mut rule = rule.clone();
        validate_rule(&mut rule)?;
        let rule_id = format!("evaluated-{}", uuid::Uuid::new_v4());
        node.children
            .push(eval_rule_node(ctx.location.to_string(), rule_id, rule));
        return Ok(());
    }

    let hits = ctx
        .pipeline
        .manager
        .find_rules(ctx.location, ctx.key, ctx.event)?;
    let mut ids: Vec<String> = hits.keys().cloned().collect();
    ids.sort();
    debug!(location = %ctx.location, candidates = ids.len(), "found candidate rules");
    for id in ids {
        let hit = &hits[&id];
        node.children
            .push(eval_rule_node(hit.location.clone(), id, hit.rule.clone()));
    }
    Ok(())
}

fn find_triggered_rule(ctx: &WalkCtx<'_>, rule_id: &str) -> Result<(String, Map<String, Value>)> {
    for loc in ctx.pipeline.manager.ancestors(ctx.location)? {
        match loc.get_rule(ctx.key, rule_id) {
            Ok(rule) => return Ok((loc.name().to_string(), rule)),
            Err(Error::NotFound(_)) | Err(Error::Expired(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(Error::NotFound(format!("rule '{rule_id}'")))
}

fn eval_rule_node(rule_loc: String, rule_id: String, rule: Map<String, Value>) -> Node {
    Node::new(NodeKind::EvalRule {
        rule_loc,
        rule_id,
        rule,
    })
}

/// Fan out one condition evaluation per bindings set produced by matching
/// the rule's trigger against the event; scheduled rules contribute one
/// empty-bindings child. Ends with the rule's RuleDone step.
fn eval_rule(node: &mut Node, ctx: &WalkCtx<'_>) -> Result<()> {
    let NodeKind::EvalRule {
        rule_loc,
        rule_id,
        rule,
    } = &node.kind
    else {
        return Err(Error::Syntax("mismatched node kind".into()));
    };
    let (rule_loc, rule_id, rule) = (rule_loc.clone(), rule_id.clone(), rule.clone());

    let patterns = when_patterns(&rule)?;
    let bindings_sets: Vec<Bindings> = if patterns.is_empty() {
        vec![Bindings::new()]
    } else {
        let event_value = Value::Object(ctx.event.clone());
        let mut sets = Vec::new();
        for p in &patterns {
            sets.extend(match_pattern(&Value::Object(p.clone()), &event_value, &Bindings::new())?);
        }
        sets
    };

    let serial = rule
        .get("policies")
        .and_then(|p| p.get("serialActions"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    for bindings in bindings_sets {
        node.children.push(Node::new(NodeKind::EvalRuleCondition {
            rule_loc: rule_loc.clone(),
            rule_id: rule_id.clone(),
            rule: rule.clone(),
            bindings,
            serial,
        }));
    }
    node.children.push(Node::new(NodeKind::RuleDone {
        one_shot: is_one_shot(&rule),
        rule_loc,
        rule_id,
    }));
    Ok(())
}

/// Run the rule's condition query over this bindings candidate, then fan
/// out one action execution per (surviving bindings, action) pair.
fn eval_condition(node: &mut Node, ctx: &WalkCtx<'_>) -> Result<()> {
    let NodeKind::EvalRuleCondition {
        rule_id,
        rule,
        bindings,
        ..
    } = &node.kind
    else {
        return Err(Error::Syntax("mismatched node kind".into()));
    };
    let (rule_id, rule, bindings) = (rule_id.clone(), rule.clone(), bindings.clone());

    let location = ctx.pipeline.manager.location(ctx.location)?;
    let query = match rule.get("condition") {
        Some(condition) => parse_query(condition)?,
        None => Query::Empty,
    };
    let qctx = QueryCtx {
        manager: ctx.pipeline.manager.as_ref(),
        location: &location,
        read_key: ctx.key,
        runtime: &ctx.pipeline.runtime,
        fetcher: ctx.pipeline.fetcher.as_ref(),
    };
    let mut survivors = query.exec(&qctx, vec![bindings])?;

    for b in &mut survivors {
        if !b.contains_key("?event") {
            b.insert("?event".into(), Value::Object(ctx.event.clone()));
        }
        if !b.contains_key("?location") {
            b.insert("?location".into(), Value::String(ctx.location.to_string()));
        }
        if !b.contains_key("?ruleId") {
            b.insert("?ruleId".into(), Value::String(rule_id.clone()));
        }
    }

    let actions = rule
        .get("actions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for b in survivors {
        for action in &actions {
            node.children.push(Node::new(NodeKind::ExecRuleAction {
                action: action.clone(),
                bindings: b.clone(),
            }));
        }
    }
    Ok(())
}

fn exec_action(node: &Node, ctx: &WalkCtx<'_>) -> Result<()> {
    let NodeKind::ExecRuleAction { action, bindings } = &node.kind else {
        return Err(Error::Syntax("mismatched node kind".into()));
    };
    let action = parse_action(action)?;
    let location = ctx.pipeline.manager.location(ctx.location)?;
    let value = ctx.pipeline.dispatcher.dispatch(&location, &action, bindings)?;
    if let Ok(mut values) = ctx.values.lock() {
        values.push(value);
    }
    Ok(())
}

/// Terminal per-rule step: one-shot rules are removed after the rule's
/// evaluation completed successfully.
fn rule_done(node: &Node, ctx: &WalkCtx<'_>) -> Result<()> {
    let NodeKind::RuleDone {
        rule_loc,
        rule_id,
        one_shot,
    } = &node.kind
    else {
        return Err(Error::Syntax("mismatched node kind".into()));
    };
    if !one_shot {
        return Ok(());
    }
    match ctx
        .pipeline
        .manager
        .location(rule_loc)?
        .rem_fact(ctx.key, rule_id)
    {
        Ok(_) => Ok(()),
        // Embedded one-shot rules were never stored.
        Err(Error::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// `once` truthy, or a schedule string marked `+`/`!`, makes a rule
/// one-shot.
fn is_one_shot(rule: &Map<String, Value>) -> bool {
    if rule.get("once").is_some_and(|v| v.as_bool() == Some(true)) {
        return true;
    }
    rule.get("schedule")
        .and_then(Value::as_str)
        .is_some_and(|s| s.starts_with('+') || s.starts_with('!'))
}
