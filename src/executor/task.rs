//! Per-task evaluation: conditions, loop items, argument rendering,
//! result overrides and the values written by `register`.
//!
//! Everything here is synchronous and side-effect free; the host worker
//! drives dispatch and owns the scope these functions read.

use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};
use std::fmt;

use crate::inventory::ConnectionParams;
use crate::modules::{ModuleOutput, ModuleParams, ModuleStatus};
use crate::playbook::{Play, Task, When};
use crate::report::{ErrorKind, TaskResult, TaskStatus};
use crate::template::{TemplateEngine, TemplateError, Vars};

use super::ExecutorConfig;

/// Where a (host, task) pair is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Evaluating,
    Skipped,
    Dispatching,
    Ok,
    Changed,
    Failed,
    Unreachable,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskState::Pending | TaskState::Evaluating | TaskState::Dispatching
        )
    }
}

impl From<TaskStatus> for TaskState {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Ok => TaskState::Ok,
            TaskStatus::Changed => TaskState::Changed,
            TaskStatus::Failed => TaskState::Failed,
            TaskStatus::Skipped => TaskState::Skipped,
            TaskStatus::Unreachable => TaskState::Unreachable,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Evaluating => "evaluating",
            TaskState::Skipped => "skipped",
            TaskState::Dispatching => "dispatching",
            TaskState::Ok => "ok",
            TaskState::Changed => "changed",
            TaskState::Failed => "failed",
            TaskState::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// A task that could not be prepared for dispatch
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TaskFailure {
    pub kind: ErrorKind,
    pub msg: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }
}

impl From<TemplateError> for TaskFailure {
    fn from(err: TemplateError) -> Self {
        Self::new(ErrorKind::of_template(&err), err.to_string())
    }
}

/// Every condition holds. Undefined names are false.
pub(crate) fn conditions_hold(
    engine: &TemplateEngine,
    when: Option<&When>,
    vars: &Vars,
) -> Result<bool, TaskFailure> {
    let Some(when) = when else {
        return Ok(true);
    };
    for condition in when.conditions() {
        if !engine.evaluate_condition(condition, vars)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The items a looped task iterates over, rendered against `vars`.
/// `None` when the task has no loop.
pub(crate) fn loop_items(
    engine: &TemplateEngine,
    task: &Task,
    vars: &Vars,
) -> Result<Option<Vec<JsonValue>>, TaskFailure> {
    let Some(source) = &task.loop_items else {
        return Ok(None);
    };
    match engine.render_value(source, vars)? {
        JsonValue::Array(items) => Ok(Some(items)),
        JsonValue::Null => Ok(Some(Vec::new())),
        other => Err(TaskFailure::new(
            ErrorKind::InvalidArguments,
            format!("loop must resolve to a list, got {}", type_name(&other)),
        )),
    }
}

/// Render the task's arguments into module parameters
pub(crate) fn render_args(
    engine: &TemplateEngine,
    args: &IndexMap<String, JsonValue>,
    vars: &Vars,
) -> Result<ModuleParams, TaskFailure> {
    let mut params = ModuleParams::with_capacity(args.len());
    for (key, value) in args {
        params.insert(key.clone(), engine.render_value(value, vars)?);
    }
    Ok(params)
}

/// Escalation settings for one task after task, play, host and config
/// defaults are layered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Escalation {
    pub user: String,
    pub method: String,
}

pub(crate) fn resolve_escalation(
    task: &Task,
    play: &Play,
    host: &ConnectionParams,
    config: &ExecutorConfig,
) -> Option<Escalation> {
    let enabled = task
        .r#become
        .or(play.r#become)
        .or(host.r#become)
        .unwrap_or(config.r#become);
    if !enabled {
        return None;
    }
    let user = task
        .become_user
        .as_ref()
        .or(play.become_user.as_ref())
        .or(host.become_user.as_ref())
        .cloned()
        .unwrap_or_else(|| config.become_user.clone());
    let method = task
        .become_method
        .as_ref()
        .or(play.become_method.as_ref())
        .or(host.become_method.as_ref())
        .cloned()
        .unwrap_or_else(|| config.become_method.clone());
    Some(Escalation { user, method })
}

/// Final status and payload of a module run, after `failed_when` and
/// `changed_when`.
pub(crate) fn judge(
    engine: &TemplateEngine,
    task: &Task,
    output: &ModuleOutput,
    vars: &Vars,
) -> Result<(TaskStatus, serde_json::Map<String, JsonValue>), TaskFailure> {
    let mut payload = output.to_json();
    let mut failed = output.status == ModuleStatus::Failed;
    let mut changed = output.changed;
    payload.insert("changed".to_string(), json!(changed));
    payload.insert("failed".to_string(), json!(failed));

    if task.failed_when.is_some() || task.changed_when.is_some() {
        let mut bound = vars.clone();
        let result = JsonValue::Object(payload.clone());
        if let Some(name) = &task.register {
            bound.insert(name.clone(), result.clone());
        }
        bound.insert("result".to_string(), result);

        if let Some(when) = &task.failed_when {
            failed = conditions_hold(engine, Some(when), &bound)?;
        }
        if let Some(when) = &task.changed_when {
            changed = conditions_hold(engine, Some(when), &bound)?;
        }
        payload.insert("changed".to_string(), json!(changed));
        payload.insert("failed".to_string(), json!(failed));
    }

    let status = if failed {
        TaskStatus::Failed
    } else if changed {
        TaskStatus::Changed
    } else {
        TaskStatus::Ok
    };
    Ok((status, payload))
}

/// The value `register` stores for one result
pub(crate) fn register_value(result: &TaskResult) -> JsonValue {
    let mut map = result.output.clone();
    map.insert(
        "changed".to_string(),
        json!(result.status == TaskStatus::Changed),
    );
    map.insert(
        "failed".to_string(),
        json!(matches!(result.status, TaskStatus::Failed | TaskStatus::Unreachable)),
    );
    map.insert(
        "skipped".to_string(),
        json!(result.status == TaskStatus::Skipped),
    );
    if result.status == TaskStatus::Unreachable {
        map.insert("unreachable".to_string(), json!(true));
    }
    if let Some(msg) = &result.msg {
        map.entry("msg".to_string()).or_insert_with(|| json!(msg));
    }
    JsonValue::Object(map)
}

/// The value `register` stores for a looped task
pub(crate) fn loop_register(results: &[TaskResult], loop_var: &str) -> JsonValue {
    let items: Vec<JsonValue> = results
        .iter()
        .map(|result| {
            let mut value = register_value(result);
            if let (JsonValue::Object(map), Some(item)) = (&mut value, &result.item) {
                map.insert("item".to_string(), item.clone());
                map.insert(loop_var.to_string(), item.clone());
            }
            value
        })
        .collect();

    json!({
        "changed": results.iter().any(|r| r.status == TaskStatus::Changed),
        "failed": results.iter().any(|r| r.is_failure()),
        "skipped": results.iter().all(|r| r.status == TaskStatus::Skipped),
        "results": items,
    })
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "mapping",
    }
}
