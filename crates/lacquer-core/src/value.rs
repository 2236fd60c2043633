// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tagged value model shared by the expression evaluator, template engine,
//! variable resolver, and output parser.
//!
//! The source this engine is modeled on threads an untyped JSON value
//! everywhere, which pushes type coercion into every call site. `Value` gives
//! the evaluator a closed set of cases to match on, so conversions live in one
//! place instead of being reflected out of `serde_json::Value` ad hoc.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value as Json};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A dynamically-typed value flowing through expressions, templates, and
/// step outputs. Serializes/deserializes through its `serde_json::Value`
/// projection so it slots into any `#[derive(Serialize, Deserialize)]`
/// struct (step outputs, snapshots) without a bespoke wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn map_from(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Map(entries.into_iter().collect())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
            || matches!(self, Value::String(s) if s.trim().parse::<f64>().is_ok())
    }

    /// `toBool` heuristic from the expression evaluator: `false`, `""`, `0`,
    /// and `nil` are false; everything else is true.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Sequence(_) | Value::Map(_) => true,
        }
    }

    /// Best-effort numeric coercion used by arithmetic and numeric equality.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Stringification used by the template engine. Bools render as
    /// `true`/`false`, sequences are comma-space joined, maps are not
    /// stringified implicitly (callers needing that use `to_json`).
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) => s.clone(),
            Value::Sequence(items) => items
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(_) => self.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Sequence(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                Json::Object(out)
            }
        }
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Sequence(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                Value::Map(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect())
            }
        }
    }

    /// Index access: maps by string key, sequences by integer-coercible
    /// index. Returns `None` on a type mismatch (caller maps that to
    /// `TypeError`); bounds/key errors are reported by the caller so it can
    /// attach the offending path.
    pub fn index(&self, key: &Value) -> Option<IndexOutcome> {
        match (self, key) {
            (Value::Map(map), Value::String(k)) => Some(match map.get(k) {
                Some(v) => IndexOutcome::Found(v.clone()),
                None => IndexOutcome::KeyMissing(k.clone()),
            }),
            (Value::Sequence(items), idx) if idx.is_numeric() => {
                let i = idx.to_i64().unwrap_or(0);
                if i < 0 || (i as usize) >= items.len() {
                    Some(IndexOutcome::OutOfBounds { index: i, len: items.len() })
                } else {
                    Some(IndexOutcome::Found(items[i as usize].clone()))
                }
            }
            _ => None,
        }
    }

    /// Equality per the evaluator spec: numeric comparison when both sides
    /// coerce to numbers, otherwise string comparison; `nil == nil` is true,
    /// `nil == <non-nil>` is false.
    pub fn eq_loose(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => {
                if self.is_numeric() && other.is_numeric() {
                    match (self.to_f64(), other.to_f64()) {
                        (Some(a), Some(b)) => a == b,
                        _ => self.to_display_string() == other.to_display_string(),
                    }
                } else {
                    self.to_display_string() == other.to_display_string()
                }
            }
        }
    }

    pub fn partial_cmp_loose(&self, other: &Value) -> Option<Ordering> {
        if self.is_numeric() && other.is_numeric() {
            self.to_f64()?.partial_cmp(&other.to_f64()?)
        } else {
            Some(self.to_display_string().cmp(&other.to_display_string()))
        }
    }

    /// Deep-copies any complex (map/sequence) value; scalars are already
    /// value types so this is a plain clone for them. Exists as a named
    /// operation because call sites reason about "reading through a
    /// deep-copy boundary" (context accessors, snapshot capture).
    pub fn deep_copy(&self) -> Value {
        self.clone()
    }

    /// Deep-merges `other` into `self` (used by `update_state`): maps merge
    /// key-by-key recursively, any other pairing replaces wholesale.
    pub fn merge(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Map(a), Value::Map(b)) => {
                let mut merged = a.clone();
                for (k, v) in b {
                    let next = match merged.get(k) {
                        Some(existing) => existing.merge(v),
                        None => v.clone(),
                    };
                    merged.insert(k.clone(), next);
                }
                Value::Map(merged)
            }
            _ => other.clone(),
        }
    }
}

/// Outcome of a single index-access step, used so callers can tell "found
/// nothing because the key is missing" apart from "found nothing because the
/// index is out of range" and attach the right error kind.
pub enum IndexOutcome {
    Found(Value),
    KeyMissing(String),
    OutOfBounds { index: i64, len: usize },
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.0}", f)
    } else {
        let s = format!("{}", f);
        s
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Value::from_json(&json)
    }
}

impl From<&Json> for Value {
    fn from(json: &Json) -> Self {
        Value::from_json(json)
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = Json::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}
