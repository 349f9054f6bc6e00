//! Variable system for Ansirun.
//!
//! This module provides the value types shared by every layer of the engine
//! and the per-run [`VariableScope`] that assembles a host's context:
//! - Layer merging helpers (inventory, role defaults, play, role vars, facts,
//!   registered results, extra vars; lowest first)
//! - YAML to JSON conversion for decoded documents
//! - Dotted path resolution used by the template gateway

pub mod scope;

pub use scope::VariableScope;

/// The typed value carried by arguments, facts and registered results.
pub type JsonValue = serde_json::Value;

/// An ordered variable mapping.
pub type VarMap = serde_json::Map<String, JsonValue>;

/// Convert a decoded YAML value into the engine's JSON value.
///
/// Mapping keys are stringified and tags are dropped.
pub fn yaml_to_json(value: &serde_yaml::Value) -> JsonValue {
    match value {
        serde_yaml::Value::Null => JsonValue::Null,
        serde_yaml::Value::Bool(b) => JsonValue::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::from(i)
            } else if let Some(u) = n.as_u64() {
                JsonValue::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
        }
        serde_yaml::Value::String(s) => JsonValue::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => JsonValue::Array(seq.iter().map(yaml_to_json).collect()),
        serde_yaml::Value::Mapping(map) => {
            let mut out = VarMap::new();
            for (k, v) in map {
                out.insert(yaml_key_to_string(k), yaml_to_json(v));
            }
            JsonValue::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

/// Stringify a YAML mapping key.
pub fn yaml_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Convert a YAML mapping into a [`VarMap`].
pub fn yaml_mapping_to_vars(map: &serde_yaml::Mapping) -> VarMap {
    map.iter()
        .map(|(k, v)| (yaml_key_to_string(k), yaml_to_json(v)))
        .collect()
}

/// Shallow merge: keys of `overlay` replace keys of `base`.
pub fn merge_into(base: &mut VarMap, overlay: &VarMap) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Fill keys of `base` that are absent with values from `defaults`.
pub fn fill_absent(base: &mut VarMap, defaults: &VarMap) {
    for (key, value) in defaults {
        if !base.contains_key(key) {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Variable resolution helpers
pub mod resolve {
    use super::{JsonValue, VarMap};

    /// Resolve a dotted variable path (e.g. `result.stdout` or `items.0`)
    pub fn resolve_path<'a>(vars: &'a VarMap, path: &str) -> Option<&'a JsonValue> {
        let mut parts = path.split('.');
        let mut current = vars.get(parts.next()?.trim())?;

        for part in parts {
            let part = part.trim();
            current = match current {
                JsonValue::Object(map) => map.get(part)?,
                JsonValue::Array(seq) => seq.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    /// Whether `s` is a plain dotted identifier path with no operators
    pub fn is_bare_path(s: &str) -> bool {
        let s = s.trim();
        !s.is_empty()
            && s.split('.').all(|part| {
                let mut chars = part.chars();
                matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
            && !s.starts_with(|c: char| c.is_ascii_digit())
    }

    /// Convert a value to string the way modules and output expect it
    pub fn to_string(value: &JsonValue) -> String {
        match value {
            JsonValue::Null => String::new(),
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Convert a value to boolean using Ansible's truthy spellings
    pub fn to_bool(value: &JsonValue) -> Option<bool> {
        match value {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" | "y" => Some(true),
                "false" | "no" | "off" | "0" | "n" | "" => Some(false),
                _ => None,
            },
            JsonValue::Number(n) => n.as_i64().map(|i| i != 0),
            JsonValue::Null => Some(false),
            _ => None,
        }
    }
}
