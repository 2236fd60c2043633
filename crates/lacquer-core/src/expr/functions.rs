// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in function registry consulted by the expression evaluator.
//! Functions receive already-evaluated arguments and a read-only context
//! reference; none of them may mutate context state.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::value::Value;

pub fn call(name: &str, args: &[Value], _ctx: &ExecutionContext) -> Result<Value> {
    match name {
        "contains" => contains(args),
        "startsWith" => starts_with(args),
        "endsWith" => ends_with(args),
        "format" => format_fn(args),
        "join" => join(args),
        "toJson" => to_json(args),
        "fromJson" => from_json(args),
        "equal" => equal(args),
        "length" => length(args),
        other => Err(OrchestratorError::UndefinedVariable(other.to_string())),
    }
}

fn arg_string(args: &[Value], idx: usize, fname: &str) -> Result<String> {
    args.get(idx)
        .map(Value::to_display_string)
        .ok_or_else(|| OrchestratorError::ExpressionParseError(format!("{} expects an argument at position {}", fname, idx)))
}

fn contains(args: &[Value]) -> Result<Value> {
    match args.first() {
        Some(Value::Sequence(items)) => {
            let needle = args.get(1).ok_or_else(|| {
                OrchestratorError::ExpressionParseError("contains expects 2 arguments".to_string())
            })?;
            Ok(Value::Bool(items.iter().any(|v| v.eq_loose(needle))))
        }
        _ => {
            let haystack = arg_string(args, 0, "contains")?;
            let needle = arg_string(args, 1, "contains")?;
            Ok(Value::Bool(haystack.contains(&needle)))
        }
    }
}

fn starts_with(args: &[Value]) -> Result<Value> {
    let s = arg_string(args, 0, "startsWith")?;
    let prefix = arg_string(args, 1, "startsWith")?;
    Ok(Value::Bool(s.starts_with(&prefix)))
}

fn ends_with(args: &[Value]) -> Result<Value> {
    let s = arg_string(args, 0, "endsWith")?;
    let suffix = arg_string(args, 1, "endsWith")?;
    Ok(Value::Bool(s.ends_with(&suffix)))
}

/// `format('{0} is {1}', a, b)` — positional `{N}` placeholders.
fn format_fn(args: &[Value]) -> Result<Value> {
    let template = arg_string(args, 0, "format")?;
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek() == Some(&'}') && !digits.is_empty() {
                chars.next();
                let idx: usize = digits.parse().unwrap_or(0);
                out.push_str(&args.get(idx + 1).map(Value::to_display_string).unwrap_or_default());
                continue;
            }
            out.push('{');
            out.push_str(&digits);
        } else {
            out.push(c);
        }
    }
    Ok(Value::String(out))
}

fn join(args: &[Value]) -> Result<Value> {
    let Some(Value::Sequence(items)) = args.first() else {
        return Err(OrchestratorError::TypeError("join expects a sequence as its first argument".to_string()));
    };
    let sep = args.get(1).map(Value::to_display_string).unwrap_or_else(|| ",".to_string());
    Ok(Value::String(items.iter().map(Value::to_display_string).collect::<Vec<_>>().join(&sep)))
}

fn to_json(args: &[Value]) -> Result<Value> {
    let value = args.first().cloned().unwrap_or(Value::Null);
    Ok(Value::String(value.to_json().to_string()))
}

fn from_json(args: &[Value]) -> Result<Value> {
    let text = arg_string(args, 0, "fromJson")?;
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| OrchestratorError::TypeError(format!("fromJson: invalid JSON: {}", e)))?;
    Ok(Value::from_json(&json))
}

fn equal(args: &[Value]) -> Result<Value> {
    let a = args.first().cloned().unwrap_or(Value::Null);
    let b = args.get(1).cloned().unwrap_or(Value::Null);
    Ok(Value::Bool(a.eq_loose(&b)))
}

fn length(args: &[Value]) -> Result<Value> {
    let len = match args.first() {
        Some(Value::String(s)) => s.chars().count(),
        Some(Value::Sequence(items)) => items.len(),
        Some(Value::Map(map)) => map.len(),
        Some(Value::Null) | None => 0,
        Some(other) => {
            return Err(OrchestratorError::TypeError(format!(
                "length is not defined for {:?}",
                other
            )))
        }
    };
    Ok(Value::Int(len as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::workflow::Workflow;
    use std::collections::HashMap;

    fn ctx() -> ExecutionContext {
        let workflow: Workflow = serde_yaml::from_str(
            r#"
version: "1.0"
workflow:
  steps:
    - id: s
      action: update_state
"#,
        )
        .unwrap();
        ExecutionContext::new(workflow, HashMap::new(), None).unwrap()
    }

    #[test]
    fn format_substitutes_positional_placeholders() {
        let c = ctx();
        let result = call(
            "format",
            &[Value::string("{0}-{1}"), Value::Int(1), Value::string("x")],
            &c,
        )
        .unwrap();
        assert_eq!(result, Value::string("1-x"));
    }

    #[test]
    fn join_uses_default_comma_separator() {
        let c = ctx();
        let result = call("join", &[Value::Sequence(vec![Value::Int(1), Value::Int(2)])], &c).unwrap();
        assert_eq!(result, Value::string("1,2"));
    }

    #[test]
    fn contains_checks_sequence_membership() {
        let c = ctx();
        let result = call(
            "contains",
            &[Value::Sequence(vec![Value::string("a"), Value::string("b")]), Value::string("b")],
            &c,
        )
        .unwrap();
        assert_eq!(result, Value::Bool(true));
    }
}
