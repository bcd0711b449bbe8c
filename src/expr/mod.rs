//! Template reference resolution.
//!
//! Recognized forms:
//! - `${var:name}`: a pipeline variable
//! - `${env:NAME}` / `${env:NAME:default}`: an environment entry, with an
//!   optional literal fallback when absent
//! - `${steps.<id>.output.<path>}`: a prior step's committed output, with
//!   dot-field access and zero-based `[idx]` access into sequences
//!
//! Resolution is pure: only path traversal and literal substitution, no code
//! execution. A reference that cannot be resolved is reported, never silently
//! replaced with an empty value. A path that lands on JSON `null` resolves to
//! null; only an absent key or out-of-range index is an error.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use crate::{FlowgateError, Result};

/// Pattern for step output references: `${steps.<id>.output.<path>}`.
const STEP_REF_PATTERN: &str = r"\$\{steps\.([A-Za-z0-9_-]+)\.output((?:\.[A-Za-z0-9_-]+|\[[0-9]+\])*)\}";
/// Pattern for variable references: `${var:name}`.
const VAR_REF_PATTERN: &str = r"\$\{var:([A-Za-z0-9_.-]+)\}";
/// Pattern for environment references: `${env:NAME}` or `${env:NAME:default}`.
const ENV_REF_PATTERN: &str = r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}";

/// Lookup surface the resolver evaluates against. Implemented by the
/// execution context; tests supply plain structs.
pub trait Scope {
    /// A pipeline variable by name.
    fn var(&self, name: &str) -> Option<Value>;

    /// An environment entry by name, from the run's read-only snapshot.
    fn env_value(&self, name: &str) -> Option<String>;

    /// A committed step output envelope (`{data, meta, error}`) as JSON,
    /// or None when the step has not produced output.
    fn step_output_value(&self, id: &str) -> Option<Value>;
}

/// One path segment: an object field or a sequence index.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse_path(raw: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    name.push(chars.next().unwrap());
                }
                segments.push(Segment::Field(name));
            }
            '[' => {
                let mut digits = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    digits.push(next);
                }
                if let Ok(idx) = digits.parse::<usize>() {
                    segments.push(Segment::Index(idx));
                }
            }
            _ => {}
        }
    }

    segments
}

/// Walk a path into a value. Distinguishes an absent segment (error) from a
/// present-but-null value (resolves to null).
fn lookup_path(
    root: &Value,
    path: &[Segment],
    reference: &str,
) -> Result<Value> {
    let mut current = root;

    for segment in path {
        match segment {
            Segment::Field(name) => match current {
                Value::Object(map) => {
                    current = map
                        .get(name)
                        .ok_or_else(|| FlowgateError::UnresolvedReference(format!("'{}': no field '{}'", reference, name)))?;
                }
                _ => {
                    return Err(FlowgateError::UnresolvedReference(format!(
                        "'{}': cannot take field '{}' of a non-object value",
                        reference, name
                    )));
                }
            },
            Segment::Index(idx) => match current {
                Value::Array(items) => {
                    current = items
                        .get(*idx)
                        .ok_or_else(|| FlowgateError::UnresolvedReference(format!("'{}': index {} out of range", reference, idx)))?;
                }
                _ => {
                    return Err(FlowgateError::UnresolvedReference(format!(
                        "'{}': cannot index a non-sequence value",
                        reference
                    )));
                }
            },
        }
    }

    Ok(current.clone())
}

/// Resolve one reference to its raw JSON value.
fn resolve_reference(
    scope: &dyn Scope,
    reference: &str,
) -> Result<Value> {
    let step_re = Regex::new(STEP_REF_PATTERN).unwrap();
    if let Some(caps) = step_re.captures(reference) {
        if caps[0].len() == reference.len() {
            let step_id = &caps[1];
            let envelope = scope
                .step_output_value(step_id)
                .ok_or_else(|| FlowgateError::UnresolvedReference(format!("step '{}' has not produced output", step_id)))?;
            let path = parse_path(&caps[2]);
            return lookup_path(&envelope, &path, reference);
        }
    }

    let var_re = Regex::new(VAR_REF_PATTERN).unwrap();
    if let Some(caps) = var_re.captures(reference) {
        if caps[0].len() == reference.len() {
            let name = &caps[1];
            return scope.var(name).ok_or_else(|| FlowgateError::UnresolvedReference(format!("variable '{}' not found", name)));
        }
    }

    let env_re = Regex::new(ENV_REF_PATTERN).unwrap();
    if let Some(caps) = env_re.captures(reference) {
        if caps[0].len() == reference.len() {
            let name = &caps[1];
            return match scope.env_value(name) {
                Some(v) => Ok(Value::String(v)),
                None => match caps.get(2) {
                    Some(default) => Ok(Value::String(default.as_str().to_string())),
                    None => Err(FlowgateError::UnresolvedReference(format!("env entry '{}' not found", name))),
                },
            };
        }
    }

    Err(FlowgateError::UnresolvedReference(format!("unrecognized reference '{}'", reference)))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Substitute every reference in a template string. Errors from all
/// unresolved references are accumulated and reported together.
pub fn resolve_str(
    scope: &dyn Scope,
    template: &str,
) -> Result<String> {
    let mut result = template.to_string();
    let mut errors: Vec<String> = Vec::new();

    for pattern in [STEP_REF_PATTERN, VAR_REF_PATTERN, ENV_REF_PATTERN] {
        let re = Regex::new(pattern).unwrap();
        for caps in re.captures_iter(template) {
            let full_match = &caps[0];
            match resolve_reference(scope, full_match) {
                Ok(value) => {
                    result = result.replace(full_match, &stringify(&value));
                }
                Err(e) => errors.push(e.to_string()),
            }
        }
    }

    if !errors.is_empty() {
        return Err(FlowgateError::UnresolvedReference(errors.join(", ")));
    }

    Ok(result)
}

/// Resolve a template to a JSON value. A template that is exactly one
/// reference yields the referenced value with its original type; anything
/// else substitutes into a string.
pub fn resolve_value(
    scope: &dyn Scope,
    template: &str,
) -> Result<Value> {
    let trimmed = template.trim();
    if is_single_reference(trimmed) {
        return resolve_reference(scope, trimmed);
    }
    resolve_str(scope, template).map(Value::String)
}

fn is_single_reference(s: &str) -> bool {
    for pattern in [STEP_REF_PATTERN, VAR_REF_PATTERN, ENV_REF_PATTERN] {
        let re = Regex::new(pattern).unwrap();
        if let Some(m) = re.find(s) {
            if m.start() == 0 && m.end() == s.len() {
                return true;
            }
        }
    }
    false
}

/// Resolve every string inside a JSON structure, depth-first. Non-string
/// leaves pass through unchanged.
pub fn resolve_json(
    scope: &dyn Scope,
    value: &Value,
) -> Result<Value> {
    match value {
        Value::String(s) => resolve_value(scope, s),
        Value::Array(arr) => {
            let resolved: Result<Vec<Value>> = arr.iter().map(|v| resolve_json(scope, v)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(obj) => {
            let resolved: Result<serde_json::Map<String, Value>> =
                obj.iter().map(|(k, v)| resolve_json(scope, v).map(|rv| (k.clone(), rv))).collect();
            Ok(Value::Object(resolved?))
        }
        _ => Ok(value.clone()),
    }
}

/// Statically collect the step ids referenced anywhere inside a value.
/// Used by the graph builder to derive data-dependency edges.
pub fn scan_step_refs(value: &Value) -> HashSet<String> {
    let mut refs = HashSet::new();
    collect_step_refs(value, &mut refs);
    refs
}

fn collect_step_refs(
    value: &Value,
    refs: &mut HashSet<String>,
) {
    match value {
        Value::String(s) => {
            let re = Regex::new(STEP_REF_PATTERN).unwrap();
            for caps in re.captures_iter(s) {
                refs.insert(caps[1].to_string());
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_step_refs(v, refs);
            }
        }
        Value::Object(obj) => {
            for v in obj.values() {
                collect_step_refs(v, refs);
            }
        }
        _ => {}
    }
}
