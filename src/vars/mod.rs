//! Variable scope for one host within one play.
//!
//! Variables come from several sources that override each other in a
//! fixed order. Each source is kept in its own layer; [`VarScope::merged`]
//! flattens the layers, lowest precedence first, into the map the template
//! engine evaluates against. A later layer replaces a key entirely; mappings
//! are not merged key by key.
//!
//! Values are stored as written. Play, inventory and extra vars that contain
//! `{{ }}` are rendered by the template engine when they are used, so they
//! may refer to facts and registered results that did not exist when the
//! play started. Facts, `set_fact` values, registered results and loop items
//! were produced at run time and are data: [`VarScope::merged`] marks them
//! with [`TemplateEngine::literal`] so they are never rendered a second time.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::template::{TemplateEngine, Vars};

/// Variable precedence levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VarPrecedence {
    /// Play defaults (lowest priority)
    Defaults = 1,
    /// Play `vars`
    PlayVars = 2,
    /// Inventory group vars, already merged from `all` down to the host's
    /// most specific group
    GroupVars = 3,
    /// Inventory host vars
    HostVars = 4,
    /// Gathered facts, under the `facts` key
    Facts = 5,
    /// `set_fact` values and registered results
    SetFacts = 6,
    /// The current loop item
    LoopVars = 7,
    /// Extra vars (`-e`) - highest priority
    ExtraVars = 8,
}

impl VarPrecedence {
    /// Get all precedence levels in order (lowest to highest)
    pub fn all() -> impl Iterator<Item = VarPrecedence> {
        [
            VarPrecedence::Defaults,
            VarPrecedence::PlayVars,
            VarPrecedence::GroupVars,
            VarPrecedence::HostVars,
            VarPrecedence::Facts,
            VarPrecedence::SetFacts,
            VarPrecedence::LoopVars,
            VarPrecedence::ExtraVars,
        ]
        .into_iter()
    }

    /// Get the precedence level number
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Whether values at this level hold run-time data rather than
    /// templates written by the user.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            VarPrecedence::Facts | VarPrecedence::SetFacts | VarPrecedence::LoopVars
        )
    }
}

impl fmt::Display for VarPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarPrecedence::Defaults => "defaults",
            VarPrecedence::PlayVars => "play vars",
            VarPrecedence::GroupVars => "inventory group vars",
            VarPrecedence::HostVars => "inventory host vars",
            VarPrecedence::Facts => "facts",
            VarPrecedence::SetFacts => "set_facts",
            VarPrecedence::LoopVars => "loop vars",
            VarPrecedence::ExtraVars => "extra vars",
        };
        write!(f, "{}", name)
    }
}

/// Layered variables for one host.
#[derive(Debug, Clone, Default)]
pub struct VarScope {
    layers: BTreeMap<VarPrecedence, Vars>,
}

impl VarScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable at a specific precedence level
    pub fn set(&mut self, key: impl Into<String>, value: JsonValue, precedence: VarPrecedence) {
        self.layers
            .entry(precedence)
            .or_default()
            .insert(key.into(), value);
    }

    /// Set multiple variables at a precedence level
    pub fn set_many<'a>(
        &mut self,
        vars: impl IntoIterator<Item = (&'a String, &'a JsonValue)>,
        precedence: VarPrecedence,
    ) {
        let layer = self.layers.entry(precedence).or_default();
        for (key, value) in vars {
            layer.insert(key.clone(), value.clone());
        }
    }

    /// Replace a whole layer
    pub fn set_layer(&mut self, precedence: VarPrecedence, vars: Vars) {
        self.layers.insert(precedence, vars);
    }

    /// Clear all variables at a specific precedence level
    pub fn clear_precedence(&mut self, precedence: VarPrecedence) {
        self.layers.remove(&precedence);
    }

    /// The value a key resolves to, considering precedence
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.layers.values().rev().find_map(|layer| layer.get(key))
    }

    /// The level a key resolves from
    pub fn source_of(&self, key: &str) -> Option<VarPrecedence> {
        self.layers
            .iter()
            .rev()
            .find(|(_, layer)| layer.contains_key(key))
            .map(|(p, _)| *p)
    }

    /// Check if a variable exists
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Flatten every layer into one map
    pub fn merged(&self) -> Vars {
        let mut merged = IndexMap::new();
        for (precedence, layer) in &self.layers {
            for (key, value) in layer {
                let value = if precedence.is_literal() {
                    TemplateEngine::literal(value.clone())
                } else {
                    value.clone()
                };
                merged.insert(key.clone(), value);
            }
        }
        merged
    }

    /// Flatten with one extra binding at loop precedence, for a single loop
    /// iteration. The scope itself is left untouched.
    pub fn merged_with_item(&self, loop_var: &str, item: &JsonValue) -> Vars {
        let mut scope = self.clone();
        scope.set(loop_var, item.clone(), VarPrecedence::LoopVars);
        scope.merged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_precedence_order() {
        let mut scope = VarScope::new();
        scope.set("port", json!(8080), VarPrecedence::Defaults);
        scope.set("port", json!(80), VarPrecedence::GroupVars);
        scope.set("port", json!(81), VarPrecedence::HostVars);
        assert_eq!(scope.get("port"), Some(&json!(81)));
        assert_eq!(scope.source_of("port"), Some(VarPrecedence::HostVars));

        scope.set("port", json!(9000), VarPrecedence::ExtraVars);
        assert_eq!(scope.merged()["port"], json!(9000));
    }

    #[test]
    fn test_play_vars_lose_to_inventory() {
        let mut scope = VarScope::new();
        scope.set("env", json!("play"), VarPrecedence::PlayVars);
        scope.set("env", json!("group"), VarPrecedence::GroupVars);
        assert_eq!(scope.get("env"), Some(&json!("group")));
    }

    #[test]
    fn test_mappings_are_replaced_not_merged() {
        let mut scope = VarScope::new();
        scope.set("app", json!({"port": 80, "user": "www"}), VarPrecedence::PlayVars);
        scope.set("app", json!({"port": 81}), VarPrecedence::SetFacts);
        assert_eq!(scope.merged()["app"], json!({"port": 81}));
    }

    #[test]
    fn test_loop_item_is_transient() {
        let mut scope = VarScope::new();
        scope.set("item", json!("from play"), VarPrecedence::PlayVars);
        let vars = scope.merged_with_item("item", &json!("nginx"));
        assert_eq!(vars["item"], json!("nginx"));
        assert_eq!(scope.get("item"), Some(&json!("from play")));
    }

    #[test]
    fn test_run_time_values_are_not_rendered_again() {
        let engine = TemplateEngine::new();
        let mut scope = VarScope::new();
        scope.set("greeting", json!("hi {{ name }}"), VarPrecedence::PlayVars);
        scope.set("name", json!("ops"), VarPrecedence::HostVars);
        scope.set(
            "remote_line",
            json!("{{ lookup('env', 'HOME') }}"),
            VarPrecedence::SetFacts,
        );

        let vars = scope.merged_with_item("item", &json!("{{ name }}"));
        assert_eq!(engine.render_str("{{ greeting }}", &vars).unwrap(), json!("hi ops"));
        assert_eq!(
            engine.render_str("{{ remote_line }}", &vars).unwrap(),
            json!("{{ lookup('env', 'HOME') }}")
        );
        assert_eq!(
            engine.render_str("[{{ item | upper }}]", &vars).unwrap(),
            json!("[{{ NAME }}]")
        );
        assert!(engine
            .evaluate_condition("remote_line is defined and 'lookup' in remote_line", &vars)
            .unwrap());
    }

    #[test]
    fn test_levels_are_ordered() {
        let levels: Vec<u8> = VarPrecedence::all().map(|p| p.level()).collect();
        let mut sorted = levels.clone();
        sorted.sort_unstable();
        assert_eq!(levels, sorted);
        assert_eq!(VarPrecedence::Facts.to_string(), "facts");
    }
}
