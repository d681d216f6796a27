//! Unification-style pattern matching over JSON values.
//!
//! A pattern is an ordinary [`serde_json::Value`] that may contain variables:
//! strings starting with `?`. Matching a pattern against a fact produces zero
//! or more [`Bindings`] — extensions of the caller's initial bindings under
//! which the pattern structurally unifies with the fact.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Variable name → bound value. Ordered so that equal binding sets render
/// identically, which the matcher relies on for deduplication.
pub type Bindings = BTreeMap<String, Value>;

/// A string is a variable iff it starts with `?`.
pub fn is_variable(s: &str) -> bool {
    s.starts_with('?')
}

/// Structural equality with IEEE-754 numeric comparison, so `1` and `1.0`
/// are equal regardless of how serde_json parsed them.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| value_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| value_eq(x, y)))
        }
        _ => a == b,
    }
}

/// Match `pattern` against `fact`, extending `bindings`.
///
/// Returns every distinct extension of `bindings` under which the pattern
/// unifies with the fact; an empty vector means no match. A variable that is
/// already bound only re-matches a value structurally equal to its binding.
pub fn match_pattern(pattern: &Value, fact: &Value, bindings: &Bindings) -> Result<Vec<Bindings>> {
    let mut out = match (pattern, fact) {
        (Value::String(s), _) if is_variable(s) => match bindings.get(s) {
            Some(bound) => {
                let bound = bound.clone();
                match_pattern(&bound, fact, bindings)?
            }
            None => {
                let mut extended = bindings.clone();
                extended.insert(s.clone(), fact.clone());
                vec![extended]
            }
        },
        (Value::Null, _) | (Value::Bool(_), _) | (Value::Number(_), _) | (Value::String(_), _) => {
            if value_eq(pattern, fact) {
                vec![bindings.clone()]
            } else {
                vec![]
            }
        }
        (Value::Object(pairs), _) => match_map(pairs, fact, bindings)?,
        (Value::Array(elems), Value::Array(felems)) => match_seq(elems, felems, bindings)?,
        (Value::Array(_), _) => vec![],
    };
    dedup(&mut out);
    Ok(out)
}

fn match_map(pairs: &Map<String, Value>, fact: &Value, bindings: &Bindings) -> Result<Vec<Bindings>> {
    let var_keys = pairs.keys().filter(|k| is_variable(k)).count();
    if var_keys > 0 {
        if pairs.len() != 1 {
            return Err(Error::BadPatternVariable(
                "a variable key must be the only key in its map".into(),
            ));
        }
        // Property variable: {?k: v} matches each entry of the fact map,
        // fanning out one candidate bindings set per entry.
        let Some((k, v)) = pairs.iter().next() else {
            return Ok(vec![bindings.clone()]);
        };
        let Value::Object(fpairs) = fact else {
            return Ok(vec![]);
        };
        let key_pattern = Value::String(k.clone());
        let mut out = Vec::new();
        for (fk, fv) in fpairs {
            let fk_value = Value::String(fk.clone());
            for b in match_pattern(&key_pattern, &fk_value, bindings)? {
                out.extend(match_pattern(v, fv, &b)?);
            }
        }
        return Ok(out);
    }

    let Value::Object(fpairs) = fact else {
        return Ok(vec![]);
    };
    let mut acc = vec![bindings.clone()];
    for (k, v) in pairs {
        let Some(fv) = fpairs.get(k) else {
            return Ok(vec![]);
        };
        let mut next = Vec::new();
        for b in &acc {
            next.extend(match_pattern(v, fv, b)?);
        }
        if next.is_empty() {
            return Ok(vec![]);
        }
        acc = next;
    }
    Ok(acc)
}

/// Sequences match as sets: atomic pattern elements are consumed from the
/// fact by multiset membership, structural elements each claim a distinct
/// fact element (with backtracking), and a lone variable element binds to
/// whatever fact elements remain.
fn match_seq(elems: &[Value], felems: &[Value], bindings: &Bindings) -> Result<Vec<Bindings>> {
    let mut variable: Option<&str> = None;
    let mut atoms: Vec<&Value> = Vec::new();
    let mut structs: Vec<&Value> = Vec::new();
    for e in elems {
        match e {
            Value::String(s) if is_variable(s) => {
                if variable.is_some() {
                    return Err(Error::BadPatternVariable(
                        "at most one variable element per sequence".into(),
                    ));
                }
                variable = Some(s);
            }
            Value::Array(_) | Value::Object(_) => structs.push(e),
            _ => atoms.push(e),
        }
    }

    let mut used = vec![false; felems.len()];
    for atom in atoms {
        let Some(i) = felems
            .iter()
            .enumerate()
            .position(|(i, f)| !used[i] && value_eq(atom, f))
        else {
            return Ok(vec![]);
        };
        used[i] = true;
    }

    let mut candidates = Vec::new();
    assign_structs(&structs, felems, &mut used, bindings, &mut candidates)?;

    let Some(var) = variable else {
        return Ok(candidates.into_iter().map(|(b, _)| b).collect());
    };
    let var_pattern = Value::String(var.to_string());
    let mut out = Vec::new();
    for (b, mask) in candidates {
        let rest: Vec<Value> = felems
            .iter()
            .enumerate()
            .filter(|(i, _)| !mask[*i])
            .map(|(_, f)| f.clone())
            .collect();
        out.extend(match_pattern(&var_pattern, &Value::Array(rest), &b)?);
    }
    Ok(out)
}

fn assign_structs(
    structs: &[&Value],
    felems: &[Value],
    used: &mut Vec<bool>,
    bindings: &Bindings,
    out: &mut Vec<(Bindings, Vec<bool>)>,
) -> Result<()> {
    let Some((first, rest)) = structs.split_first() else {
        out.push((bindings.clone(), used.clone()));
        return Ok(());
    };
    for i in 0..felems.len() {
        if used[i] {
            continue;
        }
        for b in match_pattern(first, &felems[i], bindings)? {
            used[i] = true;
            assign_structs(rest, felems, used, &b, out)?;
            used[i] = false;
        }
    }
    Ok(())
}

/// Deep variable substitution. Bound variables are replaced by their values;
/// unknown variables are kept literal. A bound variable in key position is
/// substituted only when its value is a string.
pub fn substitute(bindings: &Bindings, value: &Value) -> Value {
    match value {
        Value::String(s) if is_variable(s) => bindings.get(s).cloned().unwrap_or_else(|| value.clone()),
        Value::Array(elems) => Value::Array(elems.iter().map(|e| substitute(bindings, e)).collect()),
        Value::Object(pairs) => {
            let mut out = Map::new();
            for (k, v) in pairs {
                let key = match bindings.get(k) {
                    Some(Value::String(bound)) if is_variable(k) => bound.clone(),
                    _ => k.clone(),
                };
                out.insert(key, substitute(bindings, v));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

fn dedup(sets: &mut Vec<Bindings>) {
    let mut seen = std::collections::HashSet::new();
    sets.retain(|b| {
        let key = serde_json::to_string(b).unwrap_or_default();
        seen.insert(key)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(pattern: serde_json::Value, fact: serde_json::Value) -> Vec<Bindings> {
        match_pattern(&pattern, &fact, &Bindings::new()).expect("match")
    }

    #[test]
    fn constants_match_structurally() {
        assert_eq!(matches(json!("tacos"), json!("tacos")).len(), 1);
        assert_eq!(matches(json!("tacos"), json!("beer")).len(), 0);
        assert_eq!(matches(json!(null), json!(null)).len(), 1);
        assert_eq!(matches(json!(true), json!(false)).len(), 0);
    }

    #[test]
    fn numbers_compare_as_ieee754() {
        assert_eq!(matches(json!(1), json!(1.0)).len(), 1);
        assert_eq!(matches(json!({"n": 2}), json!({"n": 2.0})).len(), 1);
        assert_eq!(matches(json!(1), json!(1.5)).len(), 0);
    }

    #[test]
    fn unbound_variable_binds_to_fact() {
        let got = matches(json!({"wants": "?x"}), json!({"wants": "beer"}));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("?x"), Some(&json!("beer")));
    }

    #[test]
    fn bound_variable_requires_equal_value() {
        let mut initial = Bindings::new();
        initial.insert("?x".into(), json!("beer"));
        let hit = match_pattern(&json!({"wants": "?x"}), &json!({"wants": "beer"}), &initial)
            .expect("match");
        assert_eq!(hit.len(), 1);
        let miss = match_pattern(&json!({"wants": "?x"}), &json!({"wants": "rum"}), &initial)
            .expect("match");
        assert!(miss.is_empty());
    }

    #[test]
    fn shared_variable_constrains_across_keys() {
        let got = matches(
            json!({"a": "?x", "b": "?x"}),
            json!({"a": "tacos", "b": "tacos"}),
        );
        assert_eq!(got.len(), 1);
        let none = matches(json!({"a": "?x", "b": "?x"}), json!({"a": "tacos", "b": "beer"}));
        assert!(none.is_empty());
    }

    #[test]
    fn extra_fact_keys_are_ignored() {
        let got = matches(json!({"wants": "?x"}), json!({"wants": "beer", "at": "home"}));
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn missing_pattern_key_fails() {
        assert!(matches(json!({"wants": "?x"}), json!({"has": "beer"})).is_empty());
    }

    #[test]
    fn property_variable_fans_out_over_entries() {
        let got = matches(json!({"?p": "?v"}), json!({"a": 1, "b": 2}));
        assert_eq!(got.len(), 2);
        let keys: Vec<_> = got.iter().map(|b| b.get("?p").cloned()).collect();
        assert!(keys.contains(&Some(json!("a"))));
        assert!(keys.contains(&Some(json!("b"))));
    }

    #[test]
    fn property_variable_value_filters_entries() {
        let got = matches(json!({"?p": 2}), json!({"a": 1, "b": 2}));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("?p"), Some(&json!("b")));
    }

    #[test]
    fn variable_key_with_sibling_is_rejected() {
        let err = match_pattern(
            &json!({"?p": 1, "other": 2}),
            &json!({"a": 1}),
            &Bindings::new(),
        )
        .expect_err("ill-formed pattern");
        assert!(matches!(err, Error::BadPatternVariable(_)));
    }

    #[test]
    fn sequence_atoms_consume_as_multiset() {
        assert_eq!(matches(json!(["a", "b"]), json!(["b", "c", "a"])).len(), 1);
        assert!(matches(json!(["a", "a"]), json!(["a", "b"])).is_empty());
    }

    #[test]
    fn sequence_variable_binds_remaining_elements() {
        let got = matches(json!(["a", "?rest"]), json!(["b", "a", "c"]));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("?rest"), Some(&json!(["b", "c"])));
    }

    #[test]
    fn sequence_with_two_variables_is_rejected() {
        let err = match_pattern(&json!(["?a", "?b"]), &json!(["x"]), &Bindings::new())
            .expect_err("ill-formed pattern");
        assert!(matches!(err, Error::BadPatternVariable(_)));
    }

    #[test]
    fn structural_sequence_elements_backtrack() {
        let got = matches(
            json!([{"likes": "?x"}, {"drinks": "?x"}]),
            json!([{"drinks": "rum"}, {"likes": "rum"}]),
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("?x"), Some(&json!("rum")));
    }

    #[test]
    fn structural_elements_claim_distinct_fact_elements() {
        let none = matches(
            json!([{"likes": "tacos"}, {"likes": "tacos"}]),
            json!([{"likes": "tacos"}]),
        );
        assert!(none.is_empty());
    }

    #[test]
    fn nested_patterns_unify() {
        let got = matches(
            json!({"order": {"item": "?what", "qty": 2}}),
            json!({"order": {"item": "tacos", "qty": 2, "note": "hot"}}),
        );
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("?what"), Some(&json!("tacos")));
    }

    #[test]
    fn no_duplicate_bindings_are_returned() {
        // Both entries produce the same binding for ?v.
        let got = matches(json!({"?p": "x"}), json!({"a": "x", "b": "x"}));
        let vals: Vec<_> = got.iter().map(|b| b.get("?p").cloned()).collect();
        assert_eq!(got.len(), 2, "distinct keys are distinct bindings: {vals:?}");
        let got = matches(json!(["?rest"]), json!(["a", "a"]));
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn substitution_inverts_match_for_consumed_parts() {
        let pattern = json!({"wants": "?x", "at": "?where"});
        let fact = json!({"wants": "beer", "at": "home"});
        let got = matches(pattern.clone(), fact.clone());
        assert_eq!(got.len(), 1);
        assert!(value_eq(&substitute(&got[0], &pattern), &fact));
    }

    #[test]
    fn substitution_keeps_unknown_variables_literal() {
        let mut b = Bindings::new();
        b.insert("?x".into(), json!("beer"));
        let out = substitute(&b, &json!({"has": "?x", "wants": "?y"}));
        assert_eq!(out, json!({"has": "beer", "wants": "?y"}));
    }

    #[test]
    fn substitution_replaces_bound_string_keys() {
        let mut b = Bindings::new();
        b.insert("?p".into(), json!("likes"));
        let out = substitute(&b, &json!({"?p": "tacos"}));
        assert_eq!(out, json!({"likes": "tacos"}));
    }
}
