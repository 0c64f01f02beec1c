//! Inventory management for Converge.
//!
//! This module provides:
//! - Loading the group-keyed YAML inventory format, with per-line diagnostics
//! - Group resolution including nested children
//! - Group hierarchy and variable inheritance
//!
//! ```yaml
//! webservers:
//!   hosts:
//!     web1: { address: 10.0.0.11, remote_user: deploy }
//!     web2: { address: 10.0.0.12 }
//!   vars: { http_port: 80 }
//!   children: [canary]
//! canary:
//!   hosts:
//!     web2:
//! ```

pub mod group;
pub mod host;

pub use group::Group;
pub use host::{ConnectionParams, Host, Transport};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the implicit group containing every host
pub const ALL_GROUP: &str = "all";

/// A problem found while parsing an inventory file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based line number; 0 when the location is unknown
    pub line: usize,
    /// What is wrong
    pub message: String,
}

impl Diagnostic {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Errors that can occur during inventory operations
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Invalid inventory: {}", join_diagnostics(.0))]
    Parse(Vec<Diagnostic>),

    #[error("Failed to read inventory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for inventory operations
pub type InventoryResult<T> = Result<T, InventoryError>;

/// The main inventory structure holding all hosts and groups
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: HashMap<String, Host>,
    groups: IndexMap<String, Group>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    /// Create a new empty inventory holding only the implicit `all` group
    pub fn new() -> Self {
        let mut groups = IndexMap::new();
        groups.insert(ALL_GROUP.to_string(), Group::all());
        Self {
            hosts: HashMap::new(),
            groups,
        }
    }

    /// Load an inventory file
    pub fn load(path: impl AsRef<Path>) -> InventoryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse the YAML inventory format
    pub fn from_yaml(source: &str) -> InventoryResult<Self> {
        let index = LineIndex::scan(source);
        if !index.diagnostics.is_empty() {
            return Err(InventoryError::Parse(index.diagnostics));
        }

        let document: serde_yaml::Value = serde_yaml::from_str(source).map_err(|e| {
            let line = e.location().map(|l| l.line()).unwrap_or(0);
            InventoryError::Parse(vec![Diagnostic::new(line, e.to_string())])
        })?;

        let mut inventory = Self::new();
        let mut diagnostics = Vec::new();
        let mut has_address: HashSet<String> = HashSet::new();

        let root = match document {
            serde_yaml::Value::Null => return Ok(inventory),
            serde_yaml::Value::Mapping(root) => root,
            _ => {
                return Err(InventoryError::Parse(vec![Diagnostic::new(
                    1,
                    "inventory must be a mapping of group names",
                )]))
            }
        };

        for (key, body) in root {
            let Some(group_name) = key.as_str().map(str::to_string) else {
                diagnostics.push(Diagnostic::new(0, format!("group name must be a string: {:?}", key)));
                continue;
            };
            let line = index.group_line(&group_name);
            inventory.ensure_group(&group_name);

            let body = match body {
                serde_yaml::Value::Null => continue,
                serde_yaml::Value::Mapping(body) => body,
                _ => {
                    diagnostics.push(Diagnostic::new(
                        line,
                        format!("group '{}' must be a mapping", group_name),
                    ));
                    continue;
                }
            };

            for (section, value) in body {
                match section.as_str() {
                    Some("hosts") => inventory.parse_hosts(
                        &group_name,
                        value,
                        &index,
                        &mut has_address,
                        &mut diagnostics,
                    ),
                    Some("vars") => match yaml_to_json(&value) {
                        Ok(JsonValue::Object(vars)) => {
                            if let Some(group) = inventory.groups.get_mut(&group_name) {
                                group.vars.extend(vars);
                            }
                        }
                        Ok(JsonValue::Null) => {}
                        Ok(_) => diagnostics.push(Diagnostic::new(
                            line,
                            format!("vars of group '{}' must be a mapping", group_name),
                        )),
                        Err(e) => diagnostics.push(Diagnostic::new(line, e)),
                    },
                    Some("children") => {
                        let children: Vec<String> = match value {
                            serde_yaml::Value::Sequence(items) => items
                                .iter()
                                .filter_map(|c| c.as_str().map(str::to_string))
                                .collect(),
                            serde_yaml::Value::Mapping(items) => items
                                .keys()
                                .filter_map(|c| c.as_str().map(str::to_string))
                                .collect(),
                            serde_yaml::Value::Null => Vec::new(),
                            _ => {
                                diagnostics.push(Diagnostic::new(
                                    line,
                                    format!("children of group '{}' must be a list", group_name),
                                ));
                                Vec::new()
                            }
                        };
                        for child in children {
                            inventory.ensure_group(&child);
                            if let Some(group) = inventory.groups.get_mut(&group_name) {
                                group.add_child(child);
                            }
                        }
                    }
                    _ => diagnostics.push(Diagnostic::new(
                        line,
                        format!(
                            "group '{}' has unknown section {:?}; expected hosts, vars or children",
                            group_name, section
                        ),
                    )),
                }
            }
        }

        let mut missing: Vec<&Host> = inventory
            .hosts
            .values()
            .filter(|h| h.connection.transport == Transport::Ssh && !has_address.contains(&h.name))
            .collect();
        missing.sort_by(|a, b| a.name.cmp(&b.name));
        for host in missing {
            diagnostics.push(Diagnostic::new(
                index.alias_line(&host.name),
                format!("host '{}' is never given an address", host.name),
            ));
        }

        if !diagnostics.is_empty() {
            diagnostics.sort_by_key(|d| d.line);
            return Err(InventoryError::Parse(diagnostics));
        }

        inventory.compute_group_parents();
        Ok(inventory)
    }

    fn parse_hosts(
        &mut self,
        group_name: &str,
        value: serde_yaml::Value,
        index: &LineIndex,
        has_address: &mut HashSet<String>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let entries = match value {
            serde_yaml::Value::Mapping(entries) => entries,
            serde_yaml::Value::Null => return,
            _ => {
                diagnostics.push(Diagnostic::new(
                    index.group_line(group_name),
                    format!("hosts of group '{}' must be a mapping", group_name),
                ));
                return;
            }
        };

        for (alias, attrs) in entries {
            let Some(alias) = alias.as_str().map(str::to_string) else {
                diagnostics.push(Diagnostic::new(
                    index.group_line(group_name),
                    format!("host alias in group '{}' must be a string", group_name),
                ));
                continue;
            };
            let line = index.alias_line(&alias);
            let host = self
                .hosts
                .entry(alias.clone())
                .or_insert_with(|| Host::new(alias.clone()));
            host.add_to_group(group_name);

            match yaml_to_json(&attrs) {
                Ok(JsonValue::Null) => {}
                Ok(JsonValue::Object(map)) => {
                    for (key, value) in map {
                        if key == "address" {
                            has_address.insert(alias.clone());
                        }
                        if let Err(message) = host.apply_key(&key, value) {
                            diagnostics.push(Diagnostic::new(
                                line,
                                format!("host '{}': {}", alias, message),
                            ));
                        }
                    }
                }
                Ok(_) => diagnostics.push(Diagnostic::new(
                    line,
                    format!("host '{}' must map to connection attributes", alias),
                )),
                Err(e) => diagnostics.push(Diagnostic::new(line, e)),
            }

            self.ensure_group(group_name);
            if let Some(group) = self.groups.get_mut(group_name) {
                group.add_host(alias.clone());
            }
            if let Some(all) = self.groups.get_mut(ALL_GROUP) {
                all.add_host(alias);
            }
        }
    }

    fn ensure_group(&mut self, name: &str) {
        if !self.groups.contains_key(name) {
            self.groups.insert(name.to_string(), Group::new(name));
        }
    }

    fn compute_group_parents(&mut self) {
        let edges: Vec<(String, String)> = self
            .groups
            .values()
            .flat_map(|g| g.children.iter().map(move |c| (g.name.clone(), c.clone())))
            .collect();

        for group in self.groups.values_mut() {
            group.parents.clear();
        }
        for (parent, child) in edges {
            if let Some(child) = self.groups.get_mut(&child) {
                child.parents.insert(parent);
            }
        }
    }

    /// Add a host to the inventory, merging with an existing host of the
    /// same name
    pub fn add_host(&mut self, host: Host) {
        let name = host.name.clone();
        for group in &host.groups {
            self.ensure_group(group);
            if let Some(g) = self.groups.get_mut(group) {
                g.add_host(name.clone());
            }
        }
        if let Some(all) = self.groups.get_mut(ALL_GROUP) {
            all.add_host(name.clone());
        }
        match self.hosts.get_mut(&name) {
            Some(existing) => {
                existing.groups.extend(host.groups);
                existing.vars.extend(host.vars);
                existing.connection = host.connection;
                if host.address.is_some() {
                    existing.address = host.address;
                }
            }
            None => {
                self.hosts.insert(name, host);
            }
        }
    }

    /// Add a group to the inventory. Member hosts named by the group must
    /// be added separately.
    pub fn add_group(&mut self, group: Group) {
        for host in &group.hosts {
            if let Some(h) = self.hosts.get_mut(host) {
                h.add_to_group(group.name.clone());
            }
        }
        for child in &group.children {
            self.ensure_group(child);
        }
        self.groups.insert(group.name.clone(), group);
        self.compute_group_parents();
    }

    /// Make `child` a child group of `parent`, creating either when absent
    pub fn add_child(&mut self, parent: &str, child: &str) {
        self.ensure_group(parent);
        self.ensure_group(child);
        if let Some(group) = self.groups.get_mut(parent) {
            group.add_child(child);
        }
        self.compute_group_parents();
    }

    /// Get a host by name
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Get a group by name
    pub fn get_group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All hosts, sorted by name
    pub fn hosts(&self) -> Vec<&Host> {
        let mut hosts: Vec<&Host> = self.hosts.values().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    /// Group names in declaration order
    pub fn group_names(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }

    /// Count total hosts
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Resolve a group to its hosts, including hosts of nested children.
    ///
    /// Hosts are sorted by name. An empty group resolves to no hosts.
    pub fn resolve(&self, group_name: &str) -> InventoryResult<Vec<&Host>> {
        if group_name == ALL_GROUP {
            return Ok(self.hosts());
        }
        let group = self
            .groups
            .get(group_name)
            .ok_or_else(|| InventoryError::UnknownGroup(group_name.to_string()))?;

        let mut names: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        self.collect_hosts(group, &mut names, &mut visited);

        let mut hosts: Vec<&Host> = names.into_iter().filter_map(|n| self.hosts.get(n)).collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }

    fn collect_hosts<'a>(
        &'a self,
        group: &'a Group,
        names: &mut HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) {
        if !visited.insert(group.name.as_str()) {
            return;
        }
        names.extend(group.hosts.iter().map(String::as_str));
        for child in &group.children {
            if let Some(child) = self.groups.get(child) {
                self.collect_hosts(child, names, visited);
            }
        }
    }

    /// Every group the host belongs to, directly or through a parent,
    /// ordered least specific first: `all`, then by depth, then by name.
    pub fn group_hierarchy(&self, host: &Host) -> Vec<&Group> {
        let mut names: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = host.groups.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            if name == ALL_GROUP || !names.insert(name) {
                continue;
            }
            if let Some(group) = self.groups.get(name) {
                stack.extend(group.parents.iter().map(String::as_str));
            }
        }

        let mut depths = BTreeMap::new();
        let mut ordered: Vec<(usize, &str)> = names
            .into_iter()
            .map(|n| (self.depth(n, &mut depths, &mut HashSet::new()), n))
            .collect();
        ordered.sort();

        std::iter::once(ALL_GROUP)
            .chain(ordered.into_iter().map(|(_, n)| n))
            .filter_map(|n| self.groups.get(n))
            .collect()
    }

    fn depth<'a>(
        &'a self,
        name: &'a str,
        memo: &mut BTreeMap<&'a str, usize>,
        visiting: &mut HashSet<&'a str>,
    ) -> usize {
        if let Some(d) = memo.get(name) {
            return *d;
        }
        if !visiting.insert(name) {
            return 1;
        }
        let depth = self
            .groups
            .get(name)
            .map(|g| {
                g.parents
                    .iter()
                    .filter(|p| p.as_str() != ALL_GROUP)
                    .map(|p| self.depth(p, memo, visiting) + 1)
                    .max()
                    .unwrap_or(1)
            })
            .unwrap_or(1);
        visiting.remove(name);
        memo.insert(name, depth);
        depth
    }

    /// Group variables for a host, merged least specific first
    pub fn group_vars_for(&self, host: &Host) -> IndexMap<String, JsonValue> {
        let mut vars = IndexMap::new();
        for group in self.group_hierarchy(host) {
            for (key, value) in &group.vars {
                vars.insert(key.clone(), value.clone());
            }
        }
        vars
    }

    /// Merged variables for a host: group defaults, then host variables,
    /// then `extra`. The `inventory_hostname` and `inventory_address`
    /// aliases are always present.
    pub fn variables_for(
        &self,
        host: &Host,
        extra: &IndexMap<String, JsonValue>,
    ) -> IndexMap<String, JsonValue> {
        let mut vars = self.group_vars_for(host);
        for (key, value) in host.vars.iter().chain(extra.iter()) {
            vars.insert(key.clone(), value.clone());
        }
        vars.insert(
            "inventory_hostname".to_string(),
            JsonValue::String(host.name.clone()),
        );
        vars.insert(
            "inventory_address".to_string(),
            JsonValue::String(host.address().to_string()),
        );
        vars
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> Result<JsonValue, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Line positions of group headers and host aliases, plus duplicate-alias
/// diagnostics, recovered from the raw text. Only block-style YAML is
/// indexed; flow-style entries fall back to line 0.
#[derive(Debug, Default)]
struct LineIndex {
    groups: HashMap<String, usize>,
    aliases: HashMap<String, usize>,
    diagnostics: Vec<Diagnostic>,
}

impl LineIndex {
    fn scan(source: &str) -> Self {
        let mut index = Self::default();
        let mut group: Option<String> = None;
        let mut hosts_indent: Option<usize> = None;
        let mut alias_indent: Option<usize> = None;
        let mut seen: HashSet<String> = HashSet::new();

        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("---") {
                continue;
            }
            let indent = raw.len() - trimmed.len();
            let Some(key) = mapping_key(trimmed) else {
                continue;
            };

            if indent == 0 {
                index.groups.entry(key.clone()).or_insert(line);
                group = Some(key);
                hosts_indent = None;
                alias_indent = None;
                continue;
            }

            if let Some(h) = hosts_indent {
                if indent > h {
                    let a = *alias_indent.get_or_insert(indent);
                    if indent == a {
                        if !seen.insert(key.clone()) {
                            index.diagnostics.push(Diagnostic::new(
                                line,
                                format!(
                                    "duplicate host alias '{}' in group '{}'",
                                    key,
                                    group.as_deref().unwrap_or_default()
                                ),
                            ));
                        }
                        index.aliases.entry(key).or_insert(line);
                    }
                    continue;
                }
                hosts_indent = None;
                alias_indent = None;
            }

            if key == "hosts" && group.is_some() {
                hosts_indent = Some(indent);
                seen.clear();
            }
        }
        index
    }

    fn group_line(&self, name: &str) -> usize {
        self.groups.get(name).copied().unwrap_or(0)
    }

    fn alias_line(&self, name: &str) -> usize {
        self.aliases.get(name).copied().unwrap_or(0)
    }
}

fn mapping_key(trimmed: &str) -> Option<String> {
    if trimmed.starts_with('-') || trimmed.starts_with('{') {
        return None;
    }
    let end = trimmed
        .find(": ")
        .or_else(|| trimmed.strip_suffix(':').map(|k| k.len()))
        .or_else(|| trimmed.find(":\t"))?;
    let key = trimmed[..end].trim().trim_matches(|c| c == '"' || c == '\'');
    (!key.is_empty()).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SAMPLE: &str = r#"
webservers:
  hosts:
    web1: { address: 10.0.0.11, remote_user: deploy, port: 2222, become: true }
    web2: { address: 10.0.0.12, tier: edge }
  vars:
    http_port: 80
    tier: web
  children: [canary]
canary:
  hosts:
    web2:
  vars:
    http_port: 8080
databases:
  hosts:
    db1:
      address: 10.0.1.5
      pg_version: 15
empty:
"#;

    fn names(hosts: Vec<&Host>) -> Vec<&str> {
        hosts.into_iter().map(|h| h.name.as_str()).collect()
    }

    #[test]
    fn test_parse_sample() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        assert_eq!(inv.host_count(), 3);

        let web1 = inv.get_host("web1").unwrap();
        assert_eq!(web1.address(), "10.0.0.11");
        assert_eq!(web1.connection.port, Some(2222));
        assert_eq!(web1.connection.remote_user.as_deref(), Some("deploy"));
        assert_eq!(web1.connection.r#become, Some(true));

        let web2 = inv.get_host("web2").unwrap();
        assert!(web2.in_group("webservers"));
        assert!(web2.in_group("canary"));
    }

    #[test]
    fn test_resolve_includes_children_sorted() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        assert_eq!(names(inv.resolve("webservers").unwrap()), vec!["web1", "web2"]);
        assert_eq!(names(inv.resolve("canary").unwrap()), vec!["web2"]);
        assert_eq!(names(inv.resolve("all").unwrap()), vec!["db1", "web1", "web2"]);
    }

    #[test]
    fn test_resolve_unknown_and_empty_groups() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        assert!(matches!(
            inv.resolve("nope"),
            Err(InventoryError::UnknownGroup(g)) if g == "nope"
        ));
        assert!(inv.resolve("empty").unwrap().is_empty());
    }

    #[test]
    fn test_variable_precedence() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        let web2 = inv.get_host("web2").unwrap();

        let mut extra = IndexMap::new();
        extra.insert("release".to_string(), json!("1.2"));
        let vars = inv.variables_for(web2, &extra);

        // child group beats parent, host beats group
        assert_eq!(vars["http_port"], json!(8080));
        assert_eq!(vars["tier"], json!("edge"));
        assert_eq!(vars["release"], json!("1.2"));
        assert_eq!(vars["inventory_hostname"], json!("web2"));
        assert_eq!(vars["inventory_address"], json!("10.0.0.12"));
    }

    #[test]
    fn test_extra_vars_override_host_vars() {
        let inv = Inventory::from_yaml(SAMPLE).unwrap();
        let db1 = inv.get_host("db1").unwrap();
        let mut extra = IndexMap::new();
        extra.insert("pg_version".to_string(), json!(16));
        assert_eq!(inv.variables_for(db1, &extra)["pg_version"], json!(16));
    }

    #[test]
    fn test_duplicate_alias_reports_line() {
        let source = "web:\n  hosts:\n    web1:\n      address: a\n    web1:\n      address: b\n";
        match Inventory::from_yaml(source) {
            Err(InventoryError::Parse(diags)) => {
                assert_eq!(diags.len(), 1);
                assert_eq!(diags[0].line, 5);
                assert!(diags[0].message.contains("duplicate host alias 'web1'"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_address_reports_line() {
        let source = "web:\n  hosts:\n    web1:\n      remote_user: deploy\n    web2:\n      address: b\n";
        match Inventory::from_yaml(source) {
            Err(InventoryError::Parse(diags)) => {
                assert_eq!(diags.len(), 1);
                assert_eq!(diags[0].line, 3);
                assert!(diags[0].message.contains("web1"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_local_hosts_need_no_address() {
        let inv = Inventory::from_yaml("local:\n  hosts:\n    control: { connection: local }\n")
            .unwrap();
        let host = inv.get_host("control").unwrap();
        assert_eq!(host.connection.transport, Transport::Local);
    }

    #[test]
    fn test_non_mapping_group_body() {
        let source = "web:\n  hosts:\n    web1: { address: a }\nbroken: 42\n";
        match Inventory::from_yaml(source) {
            Err(InventoryError::Parse(diags)) => {
                assert_eq!(diags[0].line, 4);
                assert!(diags[0].message.contains("'broken'"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_syntax_error_has_location() {
        match Inventory::from_yaml("web:\n  hosts: [unclosed\n") {
            Err(InventoryError::Parse(diags)) => assert!(diags[0].line > 0),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_document() {
        let inv = Inventory::from_yaml("").unwrap();
        assert_eq!(inv.host_count(), 0);
        assert!(inv.resolve("all").unwrap().is_empty());
    }

    #[test]
    fn test_builder_api() {
        let mut inv = Inventory::new();
        let mut a = Host::with_address("a", "10.0.0.1");
        a.add_to_group("app");
        inv.add_host(a);
        let mut b = Host::with_address("b", "10.0.0.2");
        b.add_to_group("canary");
        inv.add_host(b);
        inv.add_child("app", "canary");

        let mut app = inv.get_group("app").cloned().unwrap();
        app.set_var("color", json!("blue"));
        inv.add_group(app);

        assert_eq!(names(inv.resolve("app").unwrap()), vec!["a", "b"]);
        let b = inv.get_host("b").unwrap();
        assert_eq!(inv.variables_for(b, &IndexMap::new())["color"], json!("blue"));
        let hierarchy: Vec<&str> = inv
            .group_hierarchy(b)
            .into_iter()
            .map(|g| g.name.as_str())
            .collect();
        assert_eq!(hierarchy, vec!["all", "app", "canary"]);
    }
}
