//! Playbook definitions and parsing.
//!
//! A playbook is a YAML list of plays. Each play targets an inventory group
//! and carries an ordered list of tasks. A task names exactly one module by
//! using it as a key; every other key is a task keyword:
//!
//! ```yaml
//! - name: Web tier
//!   hosts: webservers
//!   become: true
//!   failure_policy: best_effort
//!   vars:
//!     packages: [nginx, curl]
//!   tasks:
//!     - name: Install packages
//!       package:
//!         name: "{{ item }}"
//!       loop: "{{ packages }}"
//!     - command: nginx -t
//!       register: config_check
//!       changed_when: false
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// What happens on a host after one of its tasks fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the host's remaining tasks in the play.
    #[default]
    Strict,
    /// Record the failure and continue with the next task.
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Strict => f.write_str("strict"),
            FailurePolicy::BestEffort => f.write_str("best_effort"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(FailurePolicy::Strict),
            "best_effort" | "best-effort" => Ok(FailurePolicy::BestEffort),
            other => Err(format!(
                "unknown failure policy '{}' (expected strict or best_effort)",
                other
            )),
        }
    }
}

/// A playbook containing zero or more plays.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Playbook {
    /// Name of the playbook, derived from the file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The plays in this playbook
    pub plays: Vec<Play>,

    /// Path to the playbook file (set during loading)
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Playbook {
    /// Loads a playbook from a YAML file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::playbook_parse(path, format!("Failed to read file: {}", e)))?;

        Self::from_yaml(&content, Some(path.to_path_buf()))
    }

    /// Parses a playbook from a YAML string.
    ///
    /// An empty document, or an empty list, is a playbook with no plays.
    pub fn from_yaml(yaml: &str, source_path: Option<PathBuf>) -> Result<Self> {
        let origin = || {
            source_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("<string>"))
        };

        let plays: Vec<Play> = if yaml.trim().is_empty() {
            Vec::new()
        } else {
            let plays: Option<Vec<Play>> = serde_yaml::from_str(yaml).map_err(|e| {
                let message = match e.location() {
                    Some(loc) => format!("line {}: {}", loc.line(), e),
                    None => e.to_string(),
                };
                Error::playbook_parse(origin(), message)
            })?;
            plays.unwrap_or_default()
        };

        let name = source_path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string());

        Ok(Self {
            name,
            plays,
            source_path,
        })
    }

    /// Directory that relative paths in the playbook resolve against.
    pub fn base_dir(&self) -> PathBuf {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Returns the number of plays.
    pub fn play_count(&self) -> usize {
        self.plays.len()
    }

    /// Returns total number of tasks across all plays.
    pub fn task_count(&self) -> usize {
        self.plays.iter().map(|p| p.tasks.len()).sum()
    }
}

/// A play within a playbook.
///
/// A play maps an inventory group to tasks to be executed on its hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Play {
    /// Name of the play
    #[serde(default)]
    pub name: String,

    /// Inventory group (or `all`) the play targets
    pub hosts: String,

    /// Whether to gather facts; falls back to the executor setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gather_facts: Option<bool>,

    /// Play variables; values may be templates
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub vars: IndexMap<String, JsonValue>,

    /// Lowest-precedence defaults
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub defaults: IndexMap<String, JsonValue>,

    /// Escalate privileges for every task
    #[serde(default, rename = "become", skip_serializing_if = "Option::is_none")]
    pub r#become: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_method: Option<String>,

    /// Behaviour after a failed task; falls back to the executor setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// Tasks in execution order
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Play {
    /// Creates a new play with no tasks.
    pub fn new(name: impl Into<String>, hosts: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: hosts.into(),
            gather_facts: None,
            vars: IndexMap::new(),
            defaults: IndexMap::new(),
            r#become: None,
            become_user: None,
            become_method: None,
            failure_policy: None,
            tasks: Vec::new(),
        }
    }

    /// Appends a task.
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Sets a play variable.
    pub fn with_var(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.vars.insert(key.into(), value);
        self
    }
}

/// Conditional expression.
///
/// A list means all conditions must hold. Booleans are accepted for
/// `changed_when: false` and friends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum When {
    /// Literal truth value
    Bool(bool),
    /// Single condition
    Single(String),
    /// Multiple conditions (AND)
    Multiple(Vec<String>),
}

impl When {
    /// Returns the conditions as expressions.
    pub fn conditions(&self) -> Vec<&str> {
        match self {
            Self::Bool(true) => vec!["true"],
            Self::Bool(false) => vec!["false"],
            Self::Single(s) => vec![s.as_str()],
            Self::Multiple(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for When {
    fn from(s: &str) -> Self {
        When::Single(s.to_string())
    }
}

/// Loop control options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopControl {
    /// Variable name for the current item
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            loop_var: default_loop_var(),
        }
    }
}

fn default_loop_var() -> String {
    "item".to_string()
}

/// A task to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct Task {
    /// Name of the task; defaults to the module name
    pub name: String,

    /// Module to invoke
    pub module: String,

    /// Module arguments; string values may be templates
    pub args: IndexMap<String, JsonValue>,

    /// Conditional execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,

    /// Items to loop over: a list, or a template resolving to one
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_items: Option<JsonValue>,

    pub loop_control: LoopControl,

    /// Register result in variable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,

    #[serde(rename = "become", skip_serializing_if = "Option::is_none")]
    pub r#become: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_method: Option<String>,

    /// Whether a failure aborts the host
    pub ignore_errors: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_when: Option<When>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_when: Option<When>,
}

impl Task {
    /// Creates a new task.
    pub fn new(name: impl Into<String>, module: impl Into<String>, args: JsonValue) -> Self {
        let module = module.into();
        let args = match args {
            JsonValue::Object(map) => map.into_iter().collect(),
            JsonValue::Null => IndexMap::new(),
            other => IndexMap::from([("_raw_params".to_string(), other)]),
        };
        Self {
            name: name.into(),
            module,
            args,
            when: None,
            loop_items: None,
            loop_control: LoopControl::default(),
            register: None,
            r#become: None,
            become_user: None,
            become_method: None,
            ignore_errors: false,
            changed_when: None,
            failed_when: None,
        }
    }

    pub fn with_when(mut self, when: impl Into<When>) -> Self {
        self.when = Some(when.into());
        self
    }

    pub fn with_loop(mut self, items: JsonValue) -> Self {
        self.loop_items = Some(items);
        self
    }

    pub fn with_register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    pub fn with_become(mut self, r#become: bool) -> Self {
        self.r#become = Some(r#become);
        self
    }

    pub fn with_ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn with_changed_when(mut self, when: impl Into<When>) -> Self {
        self.changed_when = Some(when.into());
        self
    }

    pub fn with_failed_when(mut self, when: impl Into<When>) -> Self {
        self.failed_when = Some(when.into());
        self
    }

    /// The name of the loop binding.
    pub fn loop_var(&self) -> &str {
        &self.loop_control.loop_var
    }
}

/// Task as written, before the module key is separated from keywords.
#[derive(Deserialize)]
struct RawTask {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    when: Option<When>,
    #[serde(default, rename = "loop")]
    loop_items: Option<JsonValue>,
    #[serde(default)]
    loop_control: Option<LoopControl>,
    #[serde(default)]
    register: Option<String>,
    #[serde(default, rename = "become")]
    r#become: Option<bool>,
    #[serde(default)]
    become_user: Option<String>,
    #[serde(default)]
    become_method: Option<String>,
    #[serde(default)]
    ignore_errors: bool,
    #[serde(default)]
    changed_when: Option<When>,
    #[serde(default)]
    failed_when: Option<When>,
    /// Extra arguments merged into the module's own
    #[serde(default)]
    args: Option<IndexMap<String, JsonValue>>,
    #[serde(flatten)]
    rest: IndexMap<String, JsonValue>,
}

impl TryFrom<RawTask> for Task {
    type Error = String;

    fn try_from(raw: RawTask) -> std::result::Result<Self, Self::Error> {
        let mut keys = raw.rest.into_iter();
        let (module, value) = match (keys.next(), keys.next()) {
            (Some(first), None) => first,
            (None, _) => {
                return Err(format!(
                    "task '{}' does not name a module",
                    raw.name.unwrap_or_default()
                ))
            }
            (Some((a, _)), Some((b, _))) => {
                return Err(format!(
                    "task names more than one module or unknown keyword: '{}', '{}'",
                    a, b
                ))
            }
        };

        let mut args: IndexMap<String, JsonValue> = match value {
            JsonValue::Object(map) => map.into_iter().collect(),
            JsonValue::Null => IndexMap::new(),
            JsonValue::String(s) => IndexMap::from([("_raw_params".to_string(), JsonValue::String(s))]),
            other => {
                return Err(format!(
                    "arguments of module '{}' must be a mapping or a string, got {}",
                    module, other
                ))
            }
        };
        if let Some(extra) = raw.args {
            for (k, v) in extra {
                args.entry(k).or_insert(v);
            }
        }

        Ok(Task {
            name: raw.name.unwrap_or_else(|| module.clone()),
            module,
            args,
            when: raw.when,
            loop_items: raw.loop_items,
            loop_control: raw.loop_control.unwrap_or_default(),
            register: raw.register,
            r#become: raw.r#become,
            become_user: raw.become_user,
            become_method: raw.become_method,
            ignore_errors: raw.ignore_errors,
            changed_when: raw.changed_when,
            failed_when: raw.failed_when,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
- name: Test Play
  hosts: all
  tasks:
    - name: Echo hello
      command: echo hello
"#;
        let playbook = Playbook::from_yaml(yaml, None).unwrap();
        assert_eq!(playbook.plays.len(), 1);
        assert_eq!(playbook.plays[0].name, "Test Play");

        let task = &playbook.plays[0].tasks[0];
        assert_eq!(task.module, "command");
        assert_eq!(task.args["_raw_params"], json!("echo hello"));
    }

    #[test]
    fn test_task_keywords() {
        let yaml = r#"
- hosts: web
  become: true
  failure_policy: best_effort
  tasks:
    - package:
        name: "{{ item }}"
        state: present
      loop: [nginx, curl]
      loop_control:
        loop_var: pkg
      when:
        - facts.os_family == 'Debian'
        - install | default(true)
      register: installed
      ignore_errors: true
      changed_when: false
"#;
        let playbook = Playbook::from_yaml(yaml, None).unwrap();
        let play = &playbook.plays[0];
        assert_eq!(play.r#become, Some(true));
        assert_eq!(play.failure_policy, Some(FailurePolicy::BestEffort));

        let task = &play.tasks[0];
        assert_eq!(task.name, "package");
        assert_eq!(task.args["state"], json!("present"));
        assert_eq!(task.loop_items, Some(json!(["nginx", "curl"])));
        assert_eq!(task.loop_var(), "pkg");
        assert_eq!(task.when.as_ref().unwrap().conditions().len(), 2);
        assert_eq!(task.register.as_deref(), Some("installed"));
        assert!(task.ignore_errors);
        assert_eq!(task.changed_when, Some(When::Bool(false)));
    }

    #[test]
    fn test_empty_playbook_is_valid() {
        assert_eq!(Playbook::from_yaml("", None).unwrap().play_count(), 0);
        assert_eq!(Playbook::from_yaml("[]\n", None).unwrap().play_count(), 0);
        assert_eq!(Playbook::from_yaml("---\n", None).unwrap().play_count(), 0);
    }

    #[test]
    fn test_task_without_module_is_rejected() {
        let yaml = "- hosts: all\n  tasks:\n    - name: nothing\n";
        let err = Playbook::from_yaml(yaml, Some("site.yml".into())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("site.yml"), "{}", msg);
        assert!(msg.contains("does not name a module"), "{}", msg);
    }

    #[test]
    fn test_two_module_keys_are_rejected() {
        let yaml = "- hosts: all\n  tasks:\n    - command: ls\n      shell: ls\n";
        assert!(Playbook::from_yaml(yaml, None).is_err());
    }

    #[test]
    fn test_unknown_play_keyword_is_rejected() {
        let yaml = "- hosts: all\n  roles: [common]\n";
        assert!(Playbook::from_yaml(yaml, None).is_err());
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("best-effort".parse::<FailurePolicy>().unwrap(), FailurePolicy::BestEffort);
        assert_eq!("STRICT".parse::<FailurePolicy>().unwrap(), FailurePolicy::Strict);
        assert!("lenient".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_base_dir() {
        let pb = Playbook::from_yaml("[]", Some(PathBuf::from("/srv/play/site.yml"))).unwrap();
        assert_eq!(pb.base_dir(), PathBuf::from("/srv/play"));
        assert_eq!(pb.name.as_deref(), Some("site"));
        assert_eq!(Playbook::default().base_dir(), PathBuf::from("."));
    }
}
