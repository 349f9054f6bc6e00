//! Host definition for the Ansirun inventory.
//!
//! A host is a name, its own variables, and the set of groups it was declared
//! in. Connection attributes are ordinary `ansible_*` variables and are read
//! through the accessors below.

use crate::vars::{JsonValue, VarMap};
use std::collections::BTreeSet;

/// A managed host in the inventory
#[derive(Debug, Clone)]
pub struct Host {
    /// Inventory name (hostname, IP, or alias)
    pub name: String,

    /// Host-specific variables
    pub vars: VarMap,

    /// Groups this host was declared in (direct membership only)
    pub groups: BTreeSet<String>,
}

impl Host {
    /// Create a new host with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: VarMap::new(),
            groups: BTreeSet::new(),
        }
    }

    /// Create a new host with hostname/IP
    pub fn with_address(name: impl Into<String>, address: impl Into<String>) -> Self {
        let mut host = Self::new(name);
        host.set_var("ansible_host", JsonValue::String(address.into()));
        host
    }

    /// Get the actual address to connect to
    pub fn address(&self) -> &str {
        self.vars
            .get("ansible_host")
            .and_then(JsonValue::as_str)
            .unwrap_or(&self.name)
    }

    /// Set a variable on this host
    pub fn set_var(&mut self, key: impl Into<String>, value: JsonValue) {
        self.vars.insert(key.into(), value);
    }

    /// Get a variable from this host
    pub fn get_var(&self, key: &str) -> Option<&JsonValue> {
        self.vars.get(key)
    }

    /// Add this host to a group
    pub fn add_to_group(&mut self, group: impl Into<String>) {
        self.groups.insert(group.into());
    }

    /// Check if host belongs directly to a specific group
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Merge variables from another source (other takes precedence)
    pub fn merge_vars(&mut self, other: &VarMap) {
        for (key, value) in other {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    /// Parse a host line such as `web1 ansible_host=10.0.0.1 ansible_port=2222`.
    ///
    /// Values may be quoted; they are typed with [`parse_ini_value`].
    pub fn parse(input: &str) -> Result<Self, HostParseError> {
        let parts = shell_words::split(input)
            .map_err(|e| HostParseError::Malformed(format!("{}: {}", input, e)))?;
        let mut parts = parts.into_iter();
        let name = parts.next().ok_or(HostParseError::EmptyInput)?;

        let mut host = Host::new(name);
        for part in parts {
            match part.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    if key == "ansible_port" && value.parse::<u16>().is_err() {
                        return Err(HostParseError::InvalidPort(value.to_string()));
                    }
                    host.set_var(key, parse_ini_value(value));
                }
                _ => return Err(HostParseError::InvalidVariable(part)),
            }
        }

        Ok(host)
    }
}

/// Parse an INI value into a typed value (bool, integer, float or string)
pub fn parse_ini_value(value: &str) -> JsonValue {
    let value = value.trim();

    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        return JsonValue::String(value[1..value.len() - 1].to_string());
    }

    match value.to_lowercase().as_str() {
        "true" | "yes" => return JsonValue::Bool(true),
        "false" | "no" => return JsonValue::Bool(false),
        _ => {}
    }

    if let Ok(n) = value.parse::<i64>() {
        return JsonValue::from(n);
    }
    if let Ok(n) = value.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return JsonValue::Number(n);
        }
    }

    JsonValue::String(value.to_string())
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if self.address() != self.name {
            write!(f, " ({})", self.address())?;
        }
        Ok(())
    }
}

/// Errors that can occur when parsing a host definition
#[derive(Debug, thiserror::Error)]
pub enum HostParseError {
    #[error("empty input")]
    EmptyInput,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("expected key=value, got '{0}'")]
    InvalidVariable(String),
    #[error("malformed host line: {0}")]
    Malformed(String),
}
