//! Group definition for the Converge inventory.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

/// A group of hosts in the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,

    /// Direct host members, in declaration order
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Child group names
    #[serde(default)]
    pub children: Vec<String>,

    /// Parent group names (computed from children relationships)
    #[serde(skip)]
    pub parents: BTreeSet<String>,

    /// Group-level default variables
    #[serde(default)]
    pub vars: IndexMap<String, JsonValue>,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: Vec::new(),
            children: Vec::new(),
            parents: BTreeSet::new(),
            vars: IndexMap::new(),
        }
    }

    /// Create the implicit "all" group
    pub fn all() -> Self {
        Self::new("all")
    }

    /// Add a host to this group; repeated additions are ignored
    pub fn add_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    /// Check if a host belongs to this group directly
    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    /// Add a child group
    pub fn add_child(&mut self, child: impl Into<String>) {
        let child = child.into();
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Set a variable on this group
    pub fn set_var(&mut self, key: impl Into<String>, value: JsonValue) {
        self.vars.insert(key.into(), value);
    }

    /// Get a variable from this group
    pub fn get_var(&self, key: &str) -> Option<&JsonValue> {
        self.vars.get(key)
    }

    /// Whether the group has no members and no children
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_membership_is_deduplicated() {
        let mut group = Group::new("web");
        group.add_host("web1");
        group.add_host("web2");
        group.add_host("web1");
        group.add_child("canary");
        group.add_child("canary");

        assert_eq!(group.hosts, vec!["web1", "web2"]);
        assert_eq!(group.children, vec!["canary"]);
        assert!(group.has_host("web2"));
        assert!(!group.is_empty());
    }

    #[test]
    fn test_vars() {
        let mut group = Group::all();
        group.set_var("ntp_server", json!("pool.ntp.org"));
        assert_eq!(group.get_var("ntp_server"), Some(&json!("pool.ntp.org")));
        assert!(group.is_empty());
    }
}
