//! Inventory management for Ansirun.
//!
//! This module provides the INI inventory used by both runners:
//! - `[group]`, `[group:vars]` and `[group:children]` sections
//! - Host pattern matching
//! - Group hierarchy and variable inheritance (`all` → parents → groups → host)

pub mod group;
pub mod host;

pub use group::{Group, GroupHierarchy};
pub use host::{parse_ini_value, Host, HostParseError};

use crate::vars::VarMap;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during inventory operations
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read inventory '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("invalid host pattern: {0}")]
    InvalidPattern(String),

    #[error("no hosts matched pattern: {0}")]
    NoHostsMatched(String),

    #[error("circular group dependency detected: {0}")]
    CircularDependency(String),

    #[error("invalid INI format at line {line}: {message}")]
    InvalidIniFormat { line: usize, message: String },

    #[error("host parse error at line {line}: {source}")]
    HostParse {
        line: usize,
        #[source]
        source: HostParseError,
    },
}

/// Result type for inventory operations
pub type InventoryResult<T> = Result<T, InventoryError>;

/// The main inventory structure holding all hosts and groups
#[derive(Debug, Clone)]
pub struct Inventory {
    /// All hosts indexed by name, in declaration order
    hosts: IndexMap<String, Host>,

    /// All groups indexed by name, in declaration order
    groups: IndexMap<String, Group>,

    /// Source file path
    source: Option<String>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    /// Create a new empty inventory with default groups
    pub fn new() -> Self {
        let mut groups = IndexMap::new();
        groups.insert("all".to_string(), Group::all());
        groups.insert("ungrouped".to_string(), Group::ungrouped());

        Self {
            hosts: IndexMap::new(),
            groups,
            source: None,
        }
    }

    /// Load an INI inventory file
    pub fn load<P: AsRef<Path>>(path: P) -> InventoryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut inventory = Self::parse(&content)?;
        inventory.source = Some(path.display().to_string());
        debug!(
            path = %path.display(),
            hosts = inventory.host_count(),
            groups = inventory.group_count(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    /// Parse INI inventory content
    pub fn parse(content: &str) -> InventoryResult<Self> {
        let mut inventory = Self::new();
        inventory.parse_ini(content)?;
        inventory.compute_group_parents()?;
        Ok(inventory)
    }

    /// Parse INI inventory format
    fn parse_ini(&mut self, content: &str) -> InventoryResult<()> {
        let mut current_group = "ungrouped".to_string();
        let mut is_vars_section = false;
        let mut is_children_section = false;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') {
                    return Err(InventoryError::InvalidIniFormat {
                        line: line_no,
                        message: format!("unterminated section header '{}'", line),
                    });
                }
                let section = line[1..line.len() - 1].trim();

                let (group_name, suffix) = match section.rsplit_once(':') {
                    Some((name, suffix)) => (name.trim(), Some(suffix.trim())),
                    None => (section, None),
                };
                if group_name.is_empty() {
                    return Err(InventoryError::InvalidIniFormat {
                        line: line_no,
                        message: "empty group name".to_string(),
                    });
                }

                current_group = group_name.to_string();
                is_vars_section = suffix == Some("vars");
                is_children_section = suffix == Some("children");
                if let Some(other) = suffix.filter(|s| *s != "vars" && *s != "children") {
                    return Err(InventoryError::InvalidIniFormat {
                        line: line_no,
                        message: format!("unknown section type ':{}'", other),
                    });
                }

                self.groups
                    .entry(current_group.clone())
                    .or_insert_with(|| Group::new(group_name));
                continue;
            }

            if is_vars_section {
                let (key, value) =
                    line.split_once('=')
                        .ok_or_else(|| InventoryError::InvalidIniFormat {
                            line: line_no,
                            message: format!("expected key=value, got '{}'", line),
                        })?;
                if let Some(group) = self.groups.get_mut(&current_group) {
                    group.set_var(key.trim(), parse_ini_value(value));
                }
            } else if is_children_section {
                let child = line.to_string();
                self.groups
                    .entry(child.clone())
                    .or_insert_with(|| Group::new(&child));
                if let Some(group) = self.groups.get_mut(&current_group) {
                    group.add_child(child);
                }
            } else {
                let host = Host::parse(line).map_err(|source| InventoryError::HostParse {
                    line: line_no,
                    source,
                })?;
                self.insert_host(host, &current_group);
            }
        }

        Ok(())
    }

    fn insert_host(&mut self, host: Host, group_name: &str) {
        let name = host.name.clone();

        if let Some(group) = self.groups.get_mut(group_name) {
            group.add_host(name.clone());
        }
        if let Some(all) = self.groups.get_mut("all") {
            all.add_host(name.clone());
        }

        match self.hosts.get_mut(&name) {
            Some(existing) => {
                existing.add_to_group(group_name);
                existing.merge_vars(&host.vars);
            }
            None => {
                let mut host = host;
                host.add_to_group(group_name);
                self.hosts.insert(name, host);
            }
        }
    }

    /// Compute parent group relationships from children and reject cycles
    fn compute_group_parents(&mut self) -> InventoryResult<()> {
        let links: Vec<(String, String)> = self
            .groups
            .values()
            .flat_map(|g| g.children.iter().map(move |c| (g.name.clone(), c.clone())))
            .collect();

        for (parent, child) in links {
            if let Some(group) = self.groups.get_mut(&child) {
                group.add_parent(parent);
            }
        }

        for name in self.groups.keys() {
            let mut stack = vec![name.clone()];
            self.check_cycle(name, &mut stack)?;
        }

        Ok(())
    }

    fn check_cycle(&self, group: &str, stack: &mut Vec<String>) -> InventoryResult<()> {
        if let Some(g) = self.groups.get(group) {
            for child in &g.children {
                if stack.contains(child) {
                    stack.push(child.clone());
                    return Err(InventoryError::CircularDependency(stack.join(" -> ")));
                }
                stack.push(child.clone());
                self.check_cycle(child, stack)?;
                stack.pop();
            }
        }
        Ok(())
    }

    /// Add a host to the inventory (ungrouped unless it already lists groups)
    pub fn add_host(&mut self, host: Host) {
        let groups: Vec<String> = host.groups.iter().cloned().collect();
        if groups.is_empty() {
            self.insert_host(host, "ungrouped");
        } else {
            let mut host = host;
            host.groups.clear();
            for group in &groups {
                self.groups
                    .entry(group.clone())
                    .or_insert_with(|| Group::new(group));
                self.insert_host(host.clone(), group);
            }
        }
    }

    /// Get a host by name
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Get a group by name
    pub fn get_group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All hosts in declaration order
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// All groups in declaration order
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Get the source path this inventory was loaded from
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Resolve a host pattern to hosts, keeping inventory order.
    ///
    /// Supported patterns:
    /// - `all` / `*` - all hosts
    /// - `hostname` - specific host
    /// - `groupname` - all hosts in group, including child groups
    /// - `a,b` or `a:b` - union
    /// - `a:&b` - intersection
    /// - `a:!b` - exclusion
    /// - `~regex` - regex match on hostname
    /// - `web*` - wildcard match
    pub fn resolve(&self, pattern: &str) -> InventoryResult<Vec<&Host>> {
        let mut selected: Option<HashSet<&str>> = None;

        for part in split_pattern(pattern) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some(sub) = part.strip_prefix('&') {
                let matched = self.match_single(sub)?;
                let current = selected.get_or_insert_with(HashSet::new);
                current.retain(|name| matched.contains(name));
            } else if let Some(sub) = part.strip_prefix('!') {
                let matched = self.match_single(sub)?;
                let current = selected.get_or_insert_with(HashSet::new);
                current.retain(|name| !matched.contains(name));
            } else {
                let matched = self.match_single(part)?;
                selected.get_or_insert_with(HashSet::new).extend(matched);
            }
        }

        let selected = selected.unwrap_or_default();
        let hosts: Vec<&Host> = self
            .hosts
            .values()
            .filter(|h| selected.contains(h.name.as_str()))
            .collect();

        if hosts.is_empty() {
            return Err(InventoryError::NoHostsMatched(pattern.to_string()));
        }
        Ok(hosts)
    }

    /// Host names matched by a single pattern element
    fn match_single(&self, pattern: &str) -> InventoryResult<HashSet<&str>> {
        if pattern == "all" || pattern == "*" {
            return Ok(self.hosts.keys().map(String::as_str).collect());
        }

        if let Some(expr) = pattern.strip_prefix('~') {
            let regex =
                Regex::new(expr).map_err(|_| InventoryError::InvalidPattern(pattern.to_string()))?;
            return Ok(self
                .hosts
                .keys()
                .filter(|name| regex.is_match(name))
                .map(String::as_str)
                .collect());
        }

        if pattern.contains('*') || pattern.contains('?') {
            let regex = Regex::new(&glob_to_regex(pattern))
                .map_err(|_| InventoryError::InvalidPattern(pattern.to_string()))?;
            return Ok(self
                .hosts
                .keys()
                .filter(|name| regex.is_match(name))
                .map(String::as_str)
                .collect());
        }

        if self.groups.contains_key(pattern) {
            let mut names = HashSet::new();
            let mut visited = HashSet::new();
            self.collect_group_hosts(pattern, &mut names, &mut visited);
            return Ok(names);
        }

        if let Some((name, _)) = self.hosts.get_key_value(pattern) {
            return Ok(std::iter::once(name.as_str()).collect());
        }

        Ok(HashSet::new())
    }

    fn collect_group_hosts<'a>(
        &'a self,
        group: &str,
        names: &mut HashSet<&'a str>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(group.to_string()) {
            return;
        }
        if let Some(g) = self.groups.get(group) {
            names.extend(g.hosts.iter().filter_map(|h| {
                self.hosts.get_key_value(h.as_str()).map(|(k, _)| k.as_str())
            }));
            for child in &g.children {
                self.collect_group_hosts(child, names, visited);
            }
        }
    }

    /// Get the group hierarchy for a host (from most specific to least specific).
    ///
    /// `all` is not part of the hierarchy; it is always applied first.
    pub fn host_group_hierarchy(&self, host: &Host) -> GroupHierarchy {
        fn collect_parents(
            inventory: &Inventory,
            group_name: &str,
            hierarchy: &mut GroupHierarchy,
            visited: &mut HashSet<String>,
        ) {
            if group_name == "all" || !visited.insert(group_name.to_string()) {
                return;
            }
            hierarchy.push(group_name);

            if let Some(group) = inventory.groups.get(group_name) {
                for parent in &group.parents {
                    collect_parents(inventory, parent, hierarchy, visited);
                }
            }
        }

        let mut hierarchy = GroupHierarchy::new();
        let mut visited = HashSet::new();
        for group_name in &host.groups {
            collect_parents(self, group_name, &mut hierarchy, &mut visited);
        }
        hierarchy
    }

    /// All group names a host belongs to, directly or through parents, sorted
    pub fn group_names(&self, host: &Host) -> Vec<String> {
        let mut names: Vec<String> = self
            .host_group_hierarchy(host)
            .groups
            .into_iter()
            .collect();
        names.sort();
        names
    }

    /// Merged variables for a host: `all`, then groups parent to child, then host
    pub fn host_vars(&self, name: &str) -> InventoryResult<VarMap> {
        let host = self
            .hosts
            .get(name)
            .ok_or_else(|| InventoryError::HostNotFound(name.to_string()))?;

        let mut vars = VarMap::new();
        if let Some(all) = self.groups.get("all") {
            crate::vars::merge_into(&mut vars, &all.vars);
        }

        for group_name in self.host_group_hierarchy(host).parent_to_child() {
            if let Some(group) = self.groups.get(group_name) {
                crate::vars::merge_into(&mut vars, &group.vars);
            }
        }

        crate::vars::merge_into(&mut vars, &host.vars);
        Ok(vars)
    }

    /// Map of group name to member host names (recursive), `all` included
    pub fn group_members(&self) -> IndexMap<String, Vec<String>> {
        self.groups
            .keys()
            .map(|group| {
                let mut names = HashSet::new();
                let mut visited = HashSet::new();
                self.collect_group_hosts(group, &mut names, &mut visited);
                let ordered = self
                    .hosts
                    .keys()
                    .filter(|h| names.contains(h.as_str()))
                    .cloned()
                    .collect();
                (group.clone(), ordered)
            })
            .collect()
    }

    /// Count total hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Count total groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Split pattern on `,` and `:` but not inside brackets
fn split_pattern(pattern: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut bracket_depth: usize = 0;

    for (i, ch) in pattern.char_indices() {
        match ch {
            '[' => bracket_depth += 1,
            ']' => bracket_depth = bracket_depth.saturating_sub(1),
            ':' | ',' if bracket_depth == 0 && !pattern[start..i].starts_with('~') => {
                parts.push(&pattern[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    parts.push(&pattern[start..]);
    parts
}

/// Convert a glob pattern to regex
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");

    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' | ']' | '(' | ')' | '{' | '}' | '.' | '+' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }

    regex.push('$');
    regex
}

impl std::fmt::Display for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Inventory ({} hosts, {} groups)", self.host_count(), self.group_count())?;
        for group in self.groups.values() {
            writeln!(f, "  [{}] {} hosts", group.name, group.hosts.len())?;
        }
        Ok(())
    }
}
