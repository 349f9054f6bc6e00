//! Group definition for the Ansirun inventory.
//!
//! This module provides the `Group` structure representing a logical grouping
//! of hosts with shared variables and parent-child relationships.

use crate::vars::{JsonValue, VarMap};
use indexmap::IndexSet;

/// A group of hosts in the inventory
#[derive(Debug, Clone)]
pub struct Group {
    /// Group name
    pub name: String,

    /// Host names declared directly in this group, in declaration order
    pub hosts: IndexSet<String>,

    /// Child group names
    pub children: IndexSet<String>,

    /// Parent group names (computed from children relationships)
    pub parents: IndexSet<String>,

    /// Group-specific variables
    pub vars: VarMap,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: IndexSet::new(),
            children: IndexSet::new(),
            parents: IndexSet::new(),
            vars: VarMap::new(),
        }
    }

    /// Create the special "all" group
    pub fn all() -> Self {
        Self::new("all")
    }

    /// Create the special "ungrouped" group
    pub fn ungrouped() -> Self {
        Self::new("ungrouped")
    }

    /// Add a host to this group
    pub fn add_host(&mut self, host: impl Into<String>) {
        self.hosts.insert(host.into());
    }

    /// Check if host is a direct member
    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    /// Add a child group
    pub fn add_child(&mut self, child: impl Into<String>) {
        self.children.insert(child.into());
    }

    /// Add a parent group
    pub fn add_parent(&mut self, parent: impl Into<String>) {
        self.parents.insert(parent.into());
    }

    /// Set a group variable
    pub fn set_var(&mut self, key: impl Into<String>, value: JsonValue) {
        self.vars.insert(key.into(), value);
    }

    /// Get a group variable
    pub fn get_var(&self, key: &str) -> Option<&JsonValue> {
        self.vars.get(key)
    }
}

/// Represents the group hierarchy for variable inheritance
#[derive(Debug, Clone, Default)]
pub struct GroupHierarchy {
    /// Groups ordered from most specific to least specific (child to parent)
    pub groups: Vec<String>,
}

impl GroupHierarchy {
    /// Create a new empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group to the hierarchy
    pub fn push(&mut self, group: impl Into<String>) {
        self.groups.push(group.into());
    }

    /// Groups from least specific to most specific, the order in which
    /// variables are applied (later overrides earlier)
    pub fn parent_to_child(&self) -> impl Iterator<Item = &String> {
        self.groups.iter().rev()
    }

    /// Whether the hierarchy contains `group`
    pub fn contains(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_new() {
        let group = Group::new("webservers");
        assert_eq!(group.name, "webservers");
        assert!(group.hosts.is_empty());
        assert!(group.children.is_empty());
    }

    #[test]
    fn test_group_membership_keeps_order() {
        let mut group = Group::new("web");
        group.add_host("b");
        group.add_host("a");
        group.add_host("b");
        assert_eq!(group.hosts.iter().collect::<Vec<_>>(), vec!["b", "a"]);
        assert!(group.has_host("a"));
    }

    #[test]
    fn test_group_vars() {
        let mut group = Group::new("web");
        group.set_var("http_port", json!(80));
        assert_eq!(group.get_var("http_port"), Some(&json!(80)));
    }

    #[test]
    fn test_hierarchy_order() {
        let mut hierarchy = GroupHierarchy::new();
        hierarchy.push("web");
        hierarchy.push("prod");
        let order: Vec<_> = hierarchy.parent_to_child().collect();
        assert_eq!(order, vec!["prod", "web"]);
    }
}
