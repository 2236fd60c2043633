// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `{{ path }}` template engine. Scans for interpolation markers, resolves
//! each path via the variable resolver, and stringifies the result per
//! `Value::to_display_string`. A template with no markers renders unchanged.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::resolver;
use crate::value::Value;
use regex::Regex;
use serde_json::Value as Json;
use std::sync::OnceLock;

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("static template regex is valid"))
}

/// Renders every `{{ path }}` occurrence in `template` against `ctx`.
/// A string made up of a single marker and nothing else (after trimming
/// whitespace) is not special-cased here — it always renders to the scalar's
/// display form, matching the behavior the executor's string-valued fields
/// (`prompt`, `condition`, `run`) expect.
pub fn render_template(template: &str, ctx: &ExecutionContext) -> Result<String> {
    let re = template_regex();
    let mut err: Option<OrchestratorError> = None;
    let rendered = re.replace_all(template, |caps: &regex::Captures| {
        if err.is_some() {
            return String::new();
        }
        let path = caps[1].trim();
        match resolver::resolve(path, ctx) {
            Ok(value) => value.to_display_string(),
            Err(cause) => {
                err = Some(OrchestratorError::TemplateResolutionError {
                    path: path.to_string(),
                    cause: cause.to_string(),
                });
                String::new()
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(rendered.into_owned())
}

/// Whether a string contains at least one `{{ ... }}` marker, used by callers
/// deciding whether a field needs rendering at all.
pub fn has_template(s: &str) -> bool {
    template_regex().is_match(s)
}

/// Statically checks every `{{ ... }}` marker in `template`: the path must
/// have a non-empty segment at every dot/bracket position and must start
/// with a recognized scope. Unlike `render_template`, this never resolves a
/// path against a context — it catches typos (`{{ stat.x }}`, `{{ state. }}`)
/// at workflow-load time, before any step runs.
pub fn validate_template(template: &str) -> Result<()> {
    for caps in template_regex().captures_iter(template) {
        let path = caps[1].trim();
        if path.is_empty() {
            return Err(OrchestratorError::TemplateResolutionError {
                path: path.to_string(),
                cause: "empty path".to_string(),
            });
        }

        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(OrchestratorError::TemplateResolutionError {
                path: path.to_string(),
                cause: "path contains an empty segment".to_string(),
            });
        }

        let head = parts[0].split('[').next().unwrap_or(parts[0]);
        if resolver::Scope::parse(head).is_none() {
            return Err(OrchestratorError::TemplateResolutionError {
                path: path.to_string(),
                cause: format!("unrecognized scope '{}'", head),
            });
        }
    }
    Ok(())
}

/// A `{{ path }}` string that is *exactly* one marker (nothing else before or
/// after, once trimmed) renders to the resolved value itself rather than its
/// stringified form — this is how a `with:` field passes a whole map/sequence
/// through instead of flattening it to text.
pub fn render_template_value(template: &str, ctx: &ExecutionContext) -> Result<Value> {
    let trimmed = template.trim();
    if let Some(path) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
        if !path.contains("{{") {
            return resolver::resolve(path.trim(), ctx);
        }
    }
    render_template(template, ctx).map(Value::String)
}

/// Recursively renders templates embedded anywhere inside a JSON value — used
/// to materialize a step's `with`/`updates` map before dispatch. Object keys
/// are left untouched; only string leaves (and string map/array entries) are
/// rendered.
pub fn render_json(value: &Json, ctx: &ExecutionContext) -> Result<Json> {
    match value {
        Json::String(s) => Ok(render_template_value(s, ctx)?.to_json()),
        Json::Array(items) => {
            let rendered = items.iter().map(|v| render_json(v, ctx)).collect::<Result<Vec<_>>>()?;
            Ok(Json::Array(rendered))
        }
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_json(v, ctx)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use std::collections::HashMap;

    fn ctx() -> ExecutionContext {
        let workflow: Workflow = serde_yaml::from_str(
            r#"
version: "1.0"
workflow:
  state:
    name: Ada
    count: 3
  steps:
    - id: s
      action: update_state
"#,
        )
        .unwrap();
        ExecutionContext::new(workflow, HashMap::new(), None).unwrap()
    }

    #[test]
    fn renders_scalar_path_into_surrounding_text() {
        let c = ctx();
        let out = render_template("hello {{ state.name }}!", &c).unwrap();
        assert_eq!(out, "hello Ada!");
    }

    #[test]
    fn unmatched_template_is_a_resolution_error() {
        let c = ctx();
        let err = render_template("{{ state.missing }}", &c).unwrap_err();
        assert!(matches!(err, OrchestratorError::TemplateResolutionError { .. }));
    }

    #[test]
    fn whole_string_marker_preserves_value_type() {
        let c = ctx();
        let value = render_template_value("{{ state.count }}", &c).unwrap();
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn validate_template_accepts_recognized_scopes() {
        assert!(validate_template("hello {{ inputs.name }}, you have {{ state.count }}").is_ok());
    }

    #[test]
    fn validate_template_rejects_unrecognized_scope() {
        let err = validate_template("{{ stat.count }}").unwrap_err();
        assert!(matches!(err, OrchestratorError::TemplateResolutionError { .. }));
    }

    #[test]
    fn validate_template_rejects_empty_path_segment() {
        let err = validate_template("{{ state..count }}").unwrap_err();
        assert!(matches!(err, OrchestratorError::TemplateResolutionError { .. }));
    }

    #[test]
    fn validate_template_rejects_trailing_dot() {
        let err = validate_template("{{ state. }}").unwrap_err();
        assert!(matches!(err, OrchestratorError::TemplateResolutionError { .. }));
    }

    #[test]
    fn validate_template_does_not_resolve_against_a_context() {
        // Unlike render_template, a path to a key that doesn't exist yet is fine —
        // only shape and scope are checked, never resolved.
        assert!(validate_template("{{ state.not_declared_yet }}").is_ok());
    }

    #[test]
    fn render_json_recurses_into_nested_structures() {
        let c = ctx();
        let input = serde_json::json!({"greeting": "hi {{ state.name }}", "n": "{{ state.count }}"});
        let rendered = render_json(&input, &c).unwrap();
        assert_eq!(rendered["greeting"], serde_json::json!("hi Ada"));
        assert_eq!(rendered["n"], serde_json::json!(3));
    }
}
