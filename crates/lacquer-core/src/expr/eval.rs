// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expression evaluation: the variable-substitution pre-pass followed by
//! tokenizing, parsing, and recursively evaluating the resulting AST.

use super::ast::{BinOp, Expr, UnaryOp};
use super::{functions, parser};
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::resolver;
use crate::value::{IndexOutcome, Value};
use regex::Regex;
use std::sync::OnceLock;

fn prepass_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?x)
            (?:'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")
            |
            (\b(?:inputs|state|steps|metadata|env|workflow)\.[A-Za-z0-9_.\[\]]+)
            "#,
        )
        .expect("static pre-pass regex is valid")
    })
}

/// Scans `expr` for `<scope>.<rest>` occurrences outside quoted regions and
/// replaces each with a literal representation of its resolved value.
/// Occurrences inside string literals are left untouched.
pub fn prepass_substitute(expr: &str, ctx: &ExecutionContext) -> Result<String> {
    let re = prepass_regex();
    let mut err: Option<OrchestratorError> = None;
    let result = re.replace_all(expr, |caps: &regex::Captures| {
        if err.is_some() {
            return String::new();
        }
        match caps.get(1) {
            Some(path_match) => match resolver::resolve(path_match.as_str(), ctx) {
                Ok(value) => literal_for(&value),
                Err(e) => {
                    err = Some(e);
                    String::new()
                }
            },
            None => caps.get(0).unwrap().as_str().to_string(),
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(result.into_owned())
}

fn literal_for(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => quote_single(s),
        Value::Sequence(_) | Value::Map(_) => quote_single(&value.to_json().to_string()),
    }
}

fn quote_single(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Evaluates an expression string against the execution context, applying
/// the variable pre-pass first.
pub fn evaluate_expr(expr: &str, ctx: &ExecutionContext) -> Result<Value> {
    let substituted = prepass_substitute(expr, ctx)?;
    let ast = parser::parse(&substituted)?;
    eval_node(&ast, ctx)
}

fn eval_node(expr: &Expr, ctx: &ExecutionContext) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(numeric_value(*n)),
        Expr::String(s) => Ok(Value::String(s.clone())),
        Expr::Ident(name) => Err(OrchestratorError::UndefinedVariable(name.clone())),
        Expr::Call(name, args) => {
            let values = args.iter().map(|a| eval_node(a, ctx)).collect::<Result<Vec<_>>>()?;
            functions::call(name, &values, ctx)
        }
        Expr::Index(base, key) => {
            let base_val = eval_node(base, ctx)?;
            let key_val = eval_node(key, ctx)?;
            match base_val.index(&key_val) {
                Some(IndexOutcome::Found(v)) => Ok(v),
                Some(IndexOutcome::KeyMissing(k)) => Err(OrchestratorError::KeyNotFound(k)),
                Some(IndexOutcome::OutOfBounds { index, len }) => {
                    Err(OrchestratorError::IndexOutOfBounds { index, len })
                }
                None => Err(OrchestratorError::TypeError(
                    "attempted to index a non-container value".to_string(),
                )),
            }
        }
        Expr::Unary(op, inner) => {
            let v = eval_node(inner, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.to_bool())),
                UnaryOp::Neg => v
                    .to_f64()
                    .map(|f| {
                        if matches!(v, Value::Int(_)) {
                            Value::Int(-(v.to_i64().unwrap_or(0)))
                        } else {
                            Value::Float(-f)
                        }
                    })
                    .ok_or_else(|| OrchestratorError::TypeError("unary '-' requires a numeric operand".to_string())),
            }
        }
        Expr::Ternary(cond, then_branch, else_branch) => {
            if eval_node(cond, ctx)?.to_bool() {
                eval_node(then_branch, ctx)
            } else {
                eval_node(else_branch, ctx)
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
    }
}

fn numeric_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, ctx: &ExecutionContext) -> Result<Value> {
    // Short-circuit operators evaluate their right side lazily.
    if op == BinOp::And {
        let l = eval_node(lhs, ctx)?;
        return Ok(Value::Bool(l.to_bool() && eval_node(rhs, ctx)?.to_bool()));
    }
    if op == BinOp::Or {
        let l = eval_node(lhs, ctx)?;
        return Ok(Value::Bool(l.to_bool() || eval_node(rhs, ctx)?.to_bool()));
    }

    let l = eval_node(lhs, ctx)?;
    let r = eval_node(rhs, ctx)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(l.eq_loose(&r))),
        BinOp::NotEq => Ok(Value::Bool(!l.eq_loose(&r))),
        BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq => {
            let ordering = l.partial_cmp_loose(&r).ok_or_else(|| {
                OrchestratorError::TypeError("comparison requires comparable operands".to_string())
            })?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::LtEq => ordering.is_le(),
                BinOp::GtEq => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => {
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Ok(Value::String(format!("{}{}", l.to_display_string(), r.to_display_string())))
            } else {
                numeric_binary(l, r, |a, b| a + b)
            }
        }
        BinOp::Sub => numeric_binary(l, r, |a, b| a - b),
        BinOp::Mul => numeric_binary(l, r, |a, b| a * b),
        BinOp::Div => {
            let (a, b) = numeric_pair(&l, &r)?;
            if b == 0.0 {
                return Err(OrchestratorError::DivisionByZero);
            }
            Ok(wrap_numeric(a / b))
        }
        BinOp::Mod => {
            let (a, b) = numeric_pair(&l, &r)?;
            if b == 0.0 {
                return Err(OrchestratorError::DivisionByZero);
            }
            Ok(wrap_numeric(a % b))
        }
        BinOp::And | BinOp::Or => unreachable!("handled via short-circuit above"),
    }
}

fn numeric_pair(l: &Value, r: &Value) -> Result<(f64, f64)> {
    match (l.to_f64(), r.to_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(OrchestratorError::TypeError(
            "arithmetic requires numeric operands".to_string(),
        )),
    }
}

fn numeric_binary(l: Value, r: Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    let (a, b) = numeric_pair(&l, &r)?;
    Ok(wrap_numeric(f(a, b)))
}

fn wrap_numeric(f: f64) -> Value {
    numeric_value(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use std::collections::HashMap;

    fn ctx_with_state(state_yaml: &str) -> ExecutionContext {
        let yaml = format!(
            r#"
version: "1.0"
workflow:
  state:
{}
  steps:
    - id: s
      action: update_state
"#,
            state_yaml
        );
        let workflow: Workflow = serde_yaml::from_str(&yaml).unwrap();
        ExecutionContext::new(workflow, HashMap::new(), None).unwrap()
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let ctx = ctx_with_state("    x: 0");
        let err = evaluate_expr("1 / state.x", &ctx).unwrap_err();
        assert!(matches!(err, OrchestratorError::DivisionByZero));
    }

    #[test]
    fn string_concatenation_via_plus() {
        let ctx = ctx_with_state("    name: world");
        let result = evaluate_expr("'hello ' + state.name", &ctx).unwrap();
        assert_eq!(result, Value::string("hello world"));
    }

    #[test]
    fn ternary_picks_correct_branch() {
        let ctx = ctx_with_state("    flag: true");
        let result = evaluate_expr("state.flag ? 'yes' : 'no'", &ctx).unwrap();
        assert_eq!(result, Value::string("yes"));
    }

    #[test]
    fn prepass_preserves_occurrences_inside_string_literals() {
        let ctx = ctx_with_state("    done: true");
        // `state.done` inside the string literal must not be substituted;
        // only the bare comparison operand should resolve.
        let result = evaluate_expr("'state.done' == 'state.done'", &ctx).unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn undefined_identifier_errors() {
        let ctx = ctx_with_state("    x: 1");
        let err = evaluate_expr("totallyUndefined", &ctx).unwrap_err();
        assert!(matches!(err, OrchestratorError::UndefinedVariable(_)));
    }

    #[test]
    fn nil_equality_semantics() {
        let ctx = ctx_with_state("    missing: null");
        assert_eq!(evaluate_expr("state.missing == null", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(evaluate_expr("null == 0", &ctx).unwrap(), Value::Bool(false));
    }

    #[test]
    fn numeric_equality_coerces_string_and_number() {
        let ctx = ctx_with_state("    count: 3");
        assert_eq!(evaluate_expr("state.count == 3", &ctx).unwrap(), Value::Bool(true));
    }
}
