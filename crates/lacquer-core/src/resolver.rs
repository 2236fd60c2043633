// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Variable resolver: turns a dotted `<scope>.<rest>` path into a `Value` by
//! consulting the execution context. Shared by the template engine and the
//! expression evaluator's variable pre-pass.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::value::{IndexOutcome, Value};

/// The six scopes recognized at the head of a dotted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Inputs,
    State,
    Steps,
    Metadata,
    Env,
    Workflow,
}

impl Scope {
    pub fn parse(name: &str) -> Option<Scope> {
        match name {
            "inputs" => Some(Scope::Inputs),
            "state" => Some(Scope::State),
            "steps" => Some(Scope::Steps),
            "metadata" => Some(Scope::Metadata),
            "env" => Some(Scope::Env),
            "workflow" => Some(Scope::Workflow),
            _ => None,
        }
    }
}

/// Splits a path like `state.user.name` into scope + remaining segments,
/// respecting `[index]` segments as their own path element (e.g.
/// `state.items[0].name` -> ["items", "0", "name"], with bracketed segments
/// flagged so callers can decide int vs string indexing... in practice both
/// the resolver and evaluator treat a numeric segment as a sequence index and
/// anything else as a map key, so no separate flag is required).
fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut idx = String::new();
                for c2 in chars.by_ref() {
                    if c2 == ']' {
                        break;
                    }
                    idx.push(c2);
                }
                segments.push(idx);
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Resolves a full dotted path (including the leading scope name) against the
/// execution context.
pub fn resolve(path: &str, ctx: &ExecutionContext) -> Result<Value> {
    let segments = split_path(path);
    let Some(head) = segments.first() else {
        return Err(OrchestratorError::FieldNotFound(path.to_string()));
    };
    let Some(scope) = Scope::parse(head) else {
        return Err(OrchestratorError::FieldNotFound(format!(
            "unrecognized scope in path '{}'",
            path
        )));
    };
    let rest = &segments[1..];

    match scope {
        Scope::Inputs => resolve_into(&ctx.get_input_map(), rest, path),
        Scope::State => resolve_into(&ctx.get_state_map(), rest, path),
        Scope::Metadata => resolve_into(&ctx.get_metadata_map(), rest, path),
        Scope::Env => {
            if rest.is_empty() {
                return Err(OrchestratorError::FieldNotFound(path.to_string()));
            }
            Ok(Value::String(ctx.env_lookup(&rest[0]).unwrap_or_default()))
        }
        Scope::Steps => resolve_step(rest, ctx, path),
        Scope::Workflow => resolve_workflow(rest, ctx, path),
    }
}

fn resolve_into(root: &Value, rest: &[String], full_path: &str) -> Result<Value> {
    let mut current = root.clone();
    for segment in rest {
        let key_value: Value = match segment.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::String(segment.clone()),
        };
        match current.index(&key_value) {
            Some(IndexOutcome::Found(v)) => current = v,
            Some(IndexOutcome::KeyMissing(_)) => {
                return Err(OrchestratorError::FieldNotFound(full_path.to_string()))
            }
            Some(IndexOutcome::OutOfBounds { index, len }) => {
                return Err(OrchestratorError::IndexOutOfBounds { index, len })
            }
            None => return Err(OrchestratorError::TypeError(format!(
                "cannot index into non-container while resolving '{}'",
                full_path
            ))),
        }
    }
    Ok(current)
}

fn resolve_step(rest: &[String], ctx: &ExecutionContext, full_path: &str) -> Result<Value> {
    let [step_id, field, tail @ ..] = rest else {
        return Err(OrchestratorError::FieldNotFound(full_path.to_string()));
    };
    let Some(result) = ctx.get_step_result(step_id) else {
        return Err(OrchestratorError::FieldNotFound(format!(
            "no such step '{}' in path '{}'",
            step_id, full_path
        )));
    };

    let value = match field.as_str() {
        "status" => Value::String(result.status.as_str().to_string()),
        "duration" => Value::String(result.duration_human()),
        "output" => Value::String(result.response.clone().unwrap_or_default()),
        "error" => Value::String(result.error.clone().unwrap_or_default()),
        "success" => Value::Bool(result.status.is_success()),
        "failed" => Value::Bool(result.status.is_failed()),
        other => match result.outputs.get(other) {
            Some(v) => v.clone(),
            None => return Err(OrchestratorError::FieldNotFound(full_path.to_string())),
        },
    };

    if tail.is_empty() {
        Ok(value)
    } else {
        resolve_into(&value, tail, full_path)
    }
}

fn resolve_workflow(rest: &[String], ctx: &ExecutionContext, full_path: &str) -> Result<Value> {
    let Some(field) = rest.first() else {
        return Err(OrchestratorError::FieldNotFound(full_path.to_string()));
    };
    match field.as_str() {
        "run_id" => Ok(Value::String(ctx.run_id.clone())),
        "start_time" => Ok(Value::String(ctx.start_time.to_rfc3339())),
        "step_index" => Ok(Value::Int(ctx.current_step_index() as i64 + 1)),
        "total_steps" => Ok(Value::Int(ctx.total_steps() as i64)),
        "completed_at" => Ok(ctx
            .completed_at()
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null)),
        _ => Err(OrchestratorError::FieldNotFound(full_path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_dotted_and_bracketed_paths() {
        assert_eq!(split_path("state.items[0].name"), vec!["state", "items", "0", "name"]);
        assert_eq!(split_path("inputs.name"), vec!["inputs", "name"]);
    }
}
