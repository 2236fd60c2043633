// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured output parser: turns a raw agent response into a typed output
//! map governed by a step's declared output schema. Always succeeds — when
//! nothing in the response matches the schema, the caller still gets
//! `{"response": raw}` (and `{"output": raw}` if that key was declared).

use crate::value::Value;
use crate::workflow::OutputSpec;
use regex::Regex;
use serde_json::Value as Json;
use std::collections::HashMap;

pub fn parse_output(outputs: &HashMap<String, OutputSpec>, raw: &str) -> HashMap<String, Value> {
    if outputs.is_empty() {
        let mut map = HashMap::new();
        map.insert("output".to_string(), Value::string(raw));
        return map;
    }

    let mut result = HashMap::new();
    let mut populated = false;

    if looks_schema_guided(raw) {
        if let Some(json) = extract_json(raw) {
            if apply_json_result(outputs, &json, &mut result) {
                populated = true;
            }
        }
    }

    if !populated {
        extract_from_prose(outputs, raw, &mut result);
    }

    result.insert("response".to_string(), Value::string(raw));
    if outputs.contains_key("output") && !result.contains_key("output") {
        result.insert("output".to_string(), Value::string(raw));
    }
    result
}

fn looks_schema_guided(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.contains("```json")
        || trimmed.contains("\"type\":")
        || trimmed.contains("\"properties\":")
        || (starts_and_ends_like_json(trimmed))
}

fn starts_and_ends_like_json(trimmed: &str) -> bool {
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

fn fence_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("static fence regex is valid"))
}

/// Primary JSON-extraction path: fenced block, then direct parse, then
/// greedy outermost-brace extraction, then progressive fixups.
fn extract_json(raw: &str) -> Option<Json> {
    if let Some(caps) = fence_regex().captures(raw) {
        let inner = caps[1].trim();
        if let Ok(json) = serde_json::from_str(inner) {
            return Some(json);
        }
        if let Some(fixed) = parse_with_fixups(inner) {
            return Some(fixed);
        }
    }

    let trimmed = raw.trim();
    if let Ok(json) = serde_json::from_str(trimmed) {
        return Some(json);
    }

    if let Some(candidate) = outermost_braces(trimmed) {
        if let Ok(json) = serde_json::from_str(&candidate) {
            return Some(json);
        }
        if let Some(fixed) = parse_with_fixups(&candidate) {
            return Some(fixed);
        }
    }

    if starts_and_ends_like_json(trimmed) {
        parse_with_fixups(trimmed)
    } else {
        None
    }
}

fn outermost_braces(s: &str) -> Option<String> {
    let brace = (s.find('{'), s.rfind('}'));
    let bracket = (s.find('['), s.rfind(']'));

    match (brace, bracket) {
        ((Some(start), Some(end)), _) if end > start => Some(s[start..=end].to_string()),
        (_, (Some(start), Some(end))) if end > start => Some(s[start..=end].to_string()),
        _ => None,
    }
}

/// Applies single-quote-to-double-quote, trailing-comma removal, unquoted-key
/// quoting, and newline-flattening in order, retrying a parse after each.
fn parse_with_fixups(candidate: &str) -> Option<Json> {
    if !(candidate.contains(':') || candidate.contains('\'')) {
        return None;
    }

    let mut text = candidate.to_string();

    text = single_to_double_quotes(&text);
    if let Ok(json) = serde_json::from_str(&text) {
        return Some(json);
    }

    text = remove_trailing_commas(&text);
    if let Ok(json) = serde_json::from_str(&text) {
        return Some(json);
    }

    text = quote_unquoted_keys(&text);
    if let Ok(json) = serde_json::from_str(&text) {
        return Some(json);
    }

    text = flatten_newlines(&text);
    serde_json::from_str(&text).ok()
}

fn single_to_double_quotes(s: &str) -> String {
    s.replace('\'', "\"")
}

fn trailing_comma_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static trailing-comma regex is valid"))
}

fn remove_trailing_commas(s: &str) -> String {
    trailing_comma_regex().replace_all(s, "$1").into_owned()
}

fn unquoted_key_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)"#).expect("static unquoted-key regex is valid")
    })
}

fn quote_unquoted_keys(s: &str) -> String {
    unquoted_key_regex().replace_all(s, "$1\"$2\"$3").into_owned()
}

fn flatten_newlines(s: &str) -> String {
    s.replace('\n', " ")
}

/// Maps object keys to declared outputs by direct name match, coercing each
/// by its declared type. Falls back to assigning the whole value to the sole
/// declared output when nothing matched directly. Returns whether anything
/// was populated.
fn apply_json_result(outputs: &HashMap<String, OutputSpec>, json: &Json, result: &mut HashMap<String, Value>) -> bool {
    let mut matched = false;
    if let Json::Object(map) = json {
        for (name, spec) in outputs {
            if let Some(value) = map.get(name) {
                result.insert(name.clone(), coerce(Value::from_json(value), spec.type_name()));
                matched = true;
            }
        }
    }

    if !matched && outputs.len() == 1 {
        let (name, spec) = outputs.iter().next().expect("len == 1");
        result.insert(name.clone(), coerce(Value::from_json(json), spec.type_name()));
        matched = true;
    }

    matched
}

fn coerce(value: Value, type_name: &str) -> Value {
    match normalize_type(type_name) {
        "integer" => Value::Int(value.to_i64().unwrap_or(0)),
        "number" => Value::Float(value.to_f64().unwrap_or(0.0)),
        "boolean" => Value::Bool(value.to_bool()),
        "string" => Value::String(value.to_display_string()),
        "array" => match value {
            Value::Sequence(_) => value,
            Value::String(ref s) => serde_json::from_str::<Json>(s)
                .ok()
                .map(|j| Value::from_json(&j))
                .filter(|v| matches!(v, Value::Sequence(_)))
                .unwrap_or_else(|| Value::Sequence(vec![value.clone()])),
            other => Value::Sequence(vec![other]),
        },
        "object" => match value {
            Value::Map(_) => value,
            Value::String(ref s) => serde_json::from_str::<Json>(s)
                .ok()
                .map(|j| Value::from_json(&j))
                .filter(|v| matches!(v, Value::Map(_)))
                .unwrap_or(value.clone()),
            other => other,
        },
        _ => value,
    }
}

fn normalize_type(type_name: &str) -> &'static str {
    match type_name {
        "integer" | "int" => "integer",
        "number" | "float" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" => "array",
        "object" | "map" => "object",
        _ => "string",
    }
}

fn extract_from_prose(outputs: &HashMap<String, OutputSpec>, raw: &str, result: &mut HashMap<String, Value>) {
    for (name, spec) in outputs {
        let type_name = normalize_type(spec.type_name());
        let value = match type_name {
            "boolean" => extract_bool(name, raw),
            "array" => extract_array(name, raw).map(Value::Sequence),
            _ => extract_scalar(name, raw).map(|s| coerce(Value::String(s), type_name)),
        };
        if let Some(v) = value {
            result.insert(name.clone(), v);
        }
    }
}

fn extract_bool(name: &str, raw: &str) -> Option<Value> {
    let re = Regex::new(&format!(r"(?i){}\s*[:\s]\s*(yes|no|true|false)", regex::escape(name))).ok()?;
    let caps = re.captures(raw)?;
    let word = caps[1].to_lowercase();
    Some(Value::Bool(word == "yes" || word == "true"))
}

fn extract_array(name: &str, raw: &str) -> Option<Vec<Value>> {
    let re = Regex::new(&format!(
        r"(?m)^{}[:\s]*\n((?:[ \t]*[-*\x{{2022}}] .*\n?)+)",
        regex::escape(name)
    ))
    .ok()?;
    let caps = re.captures(raw)?;
    let block = &caps[1];
    let items: Vec<Value> = block
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            for prefix in ["- ", "* ", "\u{2022} "] {
                if let Some(rest) = trimmed.strip_prefix(prefix) {
                    return Some(Value::string(rest.trim()));
                }
            }
            None
        })
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn extract_scalar(name: &str, raw: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?m)(?:^|\s){}:\s*(.+)$", regex::escape(name))).ok()?;
    re.captures(raw).map(|c| c[1].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::OutputSpec;

    fn outs(pairs: &[(&str, &str)]) -> HashMap<String, OutputSpec> {
        pairs
            .iter()
            .map(|(k, t)| (k.to_string(), OutputSpec::Shorthand(t.to_string())))
            .collect()
    }

    #[test]
    fn empty_schema_wraps_raw_as_output() {
        let result = parse_output(&HashMap::new(), "hello");
        assert_eq!(result.get("output"), Some(&Value::string("hello")));
    }

    #[test]
    fn prose_fallback_extracts_scalars_and_arrays() {
        let outputs = outs(&[("score", "integer"), ("tags", "array")]);
        let raw = "score: 42\ntags:\n- a\n- b\n";
        let result = parse_output(&outputs, raw);
        assert_eq!(result.get("score"), Some(&Value::Int(42)));
        assert_eq!(
            result.get("tags"),
            Some(&Value::Sequence(vec![Value::string("a"), Value::string("b")]))
        );
        assert_eq!(result.get("response"), Some(&Value::string(raw)));
    }

    #[test]
    fn trailing_comma_json_is_fixed_up() {
        let outputs = outs(&[("score", "integer"), ("tags", "array")]);
        let raw = r#"{"score":1,"tags":["a",],}"#;
        let result = parse_output(&outputs, raw);
        assert_eq!(result.get("score"), Some(&Value::Int(1)));
        assert_eq!(result.get("tags"), Some(&Value::Sequence(vec![Value::string("a")])));
    }

    #[test]
    fn direct_json_object_match_wins_over_prose_fallback() {
        let outputs = outs(&[("score", "integer")]);
        let raw = r#"```json
{"score": 7}
```"#;
        let result = parse_output(&outputs, raw);
        assert_eq!(result.get("score"), Some(&Value::Int(7)));
    }

    #[test]
    fn sole_output_receives_whole_json_value_when_no_key_matches() {
        let outputs = outs(&[("result", "string")]);
        let raw = r#"{"unexpected_key": "value"}"#;
        let result = parse_output(&outputs, raw);
        assert!(result.get("result").is_some());
    }
}
