// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON-Schema generation from a step's declared `outputs` map, plus the
//! prompt instruction text the executor prepends to agent prompts that
//! declare outputs.

use crate::workflow::{OutputSchemaField, OutputSpec};
use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;

/// Builds a JSON-Schema object (`type: object`, sorted `properties`/`required`)
/// from a step's declared outputs.
pub fn generate_schema(outputs: &HashMap<String, OutputSpec>) -> Json {
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();

    let mut names: Vec<&String> = outputs.keys().collect();
    names.sort();

    for name in names {
        let spec = &outputs[name];
        properties.insert(name.clone(), field_schema(spec));
        if !spec.is_optional() {
            required.push(name.clone());
        }
    }
    required.sort();

    json!({
        "type": "object",
        "properties": Json::Object(properties),
        "required": required,
    })
}

fn field_schema(spec: &OutputSpec) -> Json {
    match spec {
        OutputSpec::Shorthand(type_name) => json!({ "type": json_type_name(type_name) }),
        OutputSpec::Full(field) => full_field_schema(field),
    }
}

fn full_field_schema(field: &OutputSchemaField) -> Json {
    let mut obj = Map::new();
    obj.insert("type".to_string(), json!(json_type_name(&field.type_name)));

    if let Some(desc) = &field.description {
        obj.insert("description".to_string(), json!(desc));
    }
    if !field.enum_values.is_empty() {
        obj.insert("enum".to_string(), Json::Array(field.enum_values.clone()));
    }
    if let Some(min) = field.min {
        obj.insert("minimum".to_string(), json!(min));
    }
    if let Some(max) = field.max {
        obj.insert("maximum".to_string(), json!(max));
    }
    if let Some(min_len) = field.min_length {
        obj.insert("minLength".to_string(), json!(min_len));
    }
    if let Some(max_len) = field.max_length {
        obj.insert("maxLength".to_string(), json!(max_len));
    }
    if let Some(pattern) = &field.pattern {
        obj.insert("pattern".to_string(), json!(pattern));
    }
    if !field.properties.is_empty() {
        let mut nested_props = Map::new();
        let mut nested_required = Vec::new();
        let mut names: Vec<&String> = field.properties.keys().collect();
        names.sort();
        for name in names {
            let nested = &field.properties[name];
            nested_props.insert(name.clone(), field_schema(nested));
            if !nested.is_optional() {
                nested_required.push(name.clone());
            }
        }
        nested_required.sort();
        obj.insert("properties".to_string(), Json::Object(nested_props));
        obj.insert("required".to_string(), json!(nested_required));
    }
    if let Some(items) = &field.items {
        obj.insert("items".to_string(), field_schema(items));
    }

    Json::Object(obj)
}

fn json_type_name(type_name: &str) -> &'static str {
    match type_name {
        "integer" | "int" => "integer",
        "number" | "float" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" => "array",
        "object" | "map" => "object",
        _ => "string",
    }
}

/// The instruction block prepended to an agent prompt when its step declares
/// outputs: asks the model to respond with JSON matching the generated
/// schema, inside a fenced block so the parser's fence-extraction path fires.
pub fn prompt_instructions(outputs: &HashMap<String, OutputSpec>) -> String {
    let schema = generate_schema(outputs);
    format!(
        "Respond with valid JSON matching this schema:\n```json\n{}\n```",
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::OutputSchemaField;

    #[test]
    fn shorthand_fields_are_required_by_default() {
        let mut outputs = HashMap::new();
        outputs.insert("score".to_string(), OutputSpec::Shorthand("integer".to_string()));
        let schema = generate_schema(&outputs);
        assert_eq!(schema["properties"]["score"]["type"], json!("integer"));
        assert_eq!(schema["required"], json!(["score"]));
    }

    #[test]
    fn optional_full_field_is_excluded_from_required() {
        let mut outputs = HashMap::new();
        outputs.insert(
            "note".to_string(),
            OutputSpec::Full(Box::new(OutputSchemaField {
                type_name: "string".to_string(),
                description: Some("an optional note".to_string()),
                optional: true,
                enum_values: vec![],
                min: None,
                max: None,
                min_length: None,
                max_length: None,
                pattern: None,
                properties: HashMap::new(),
                items: None,
            })),
        );
        let schema = generate_schema(&outputs);
        assert_eq!(schema["required"], json!([] as [String; 0]));
        assert_eq!(schema["properties"]["note"]["description"], json!("an optional note"));
    }

    #[test]
    fn prompt_instructions_embed_a_json_fence() {
        let mut outputs = HashMap::new();
        outputs.insert("x".to_string(), OutputSpec::Shorthand("string".to_string()));
        let text = prompt_instructions(&outputs);
        assert!(text.contains("```json"));
    }
}
