//! Run report: per-task results and per-host tallies.
//!
//! Host workers record into a shared [`ReportAggregator`]; it is the only
//! structure they mutate concurrently. The finished [`RunReport`] carries
//! every result plus the ok/changed/failed/skipped/unreachable counts per
//! host, and decides the process exit code.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::modules::ModuleError;
use crate::template::TemplateError;

/// Terminal status of one (host, task, item) execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task ran, nothing needed to change
    Ok,
    /// Task ran and changed the host
    Changed,
    /// Task failed
    Failed,
    /// Condition was false, nothing dispatched
    Skipped,
    /// The host could not be reached
    Unreachable,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Ok | TaskStatus::Changed | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// Class of a failure, so operators can tell "never answered" from
/// "answered but the task could not be applied".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PreconditionFailed,
    PermissionDenied,
    RemoteExecutionError,
    Timeout,
    Cancelled,
    Unreachable,
    LookupError,
    UndefinedVariable,
    ModuleNotFound,
    InvalidArguments,
}

impl ErrorKind {
    /// Classify a module error
    pub fn of_module(err: &ModuleError) -> Self {
        match err {
            ModuleError::NotFound(_) => ErrorKind::ModuleNotFound,
            ModuleError::InvalidParameter(_) | ModuleError::MissingParameter(_) => {
                ErrorKind::InvalidArguments
            }
            ModuleError::PreconditionFailed(_) | ModuleError::Backup(_) => {
                ErrorKind::PreconditionFailed
            }
            ModuleError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ModuleError::RemoteExecution { .. } => ErrorKind::RemoteExecutionError,
            ModuleError::Timeout(_) => ErrorKind::Timeout,
            ModuleError::Connection(e) if e.is_transport() => ErrorKind::Unreachable,
            ModuleError::Connection(_) => ErrorKind::RemoteExecutionError,
        }
    }

    /// Classify a template error raised while preparing a task
    pub fn of_template(err: &TemplateError) -> Self {
        match err {
            TemplateError::UndefinedVariable(_) => ErrorKind::UndefinedVariable,
            TemplateError::Lookup(_) => ErrorKind::LookupError,
            _ => ErrorKind::InvalidArguments,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::RemoteExecutionError => "remote_execution_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::LookupError => "lookup_error",
            ErrorKind::UndefinedVariable => "undefined_variable",
            ErrorKind::ModuleNotFound => "module_not_found",
            ErrorKind::InvalidArguments => "invalid_arguments",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one task on one host, for one loop item when looped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub host: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<JsonValue>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub output: serde_json::Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Failed, but the task asked for errors to be ignored
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

impl TaskResult {
    fn new(host: impl Into<String>, task: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            host: host.into(),
            task: task.into(),
            item: None,
            status,
            output: serde_json::Map::new(),
            msg: None,
            error: None,
            ignored: false,
        }
    }

    pub fn ok(host: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(host, task, TaskStatus::Ok)
    }

    pub fn changed(host: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(host, task, TaskStatus::Changed)
    }

    pub fn skipped(host: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(host, task, TaskStatus::Skipped)
    }

    pub fn failed(
        host: impl Into<String>,
        task: impl Into<String>,
        kind: ErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(host, task, TaskStatus::Failed);
        result.error = Some(kind);
        result.msg = Some(msg.into());
        result
    }

    pub fn unreachable(
        host: impl Into<String>,
        task: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(host, task, TaskStatus::Unreachable);
        result.error = Some(ErrorKind::Unreachable);
        result.msg = Some(msg.into());
        result
    }

    pub fn with_item(mut self, item: Option<JsonValue>) -> Self {
        self.item = item;
        self
    }

    pub fn with_output(mut self, output: serde_json::Map<String, JsonValue>) -> Self {
        self.output = output;
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn with_ignored(mut self, ignored: bool) -> Self {
        self.ignored = ignored && self.status == TaskStatus::Failed;
        self
    }

    /// Whether this result should stop further work on its host
    pub fn is_failure(&self) -> bool {
        match self.status {
            TaskStatus::Failed => !self.ignored,
            TaskStatus::Unreachable => true,
            _ => false,
        }
    }
}

/// Tallies for one host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unreachable: usize,
    pub ignored: usize,
}

impl HostStats {
    pub fn record(&mut self, result: &TaskResult) {
        match result.status {
            TaskStatus::Ok => self.ok += 1,
            TaskStatus::Changed => self.changed += 1,
            TaskStatus::Failed if result.ignored => self.ignored += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Unreachable => self.unreachable += 1,
        }
    }

    pub fn merge(&mut self, other: &HostStats) {
        self.ok += other.ok;
        self.changed += other.changed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.unreachable += other.unreachable;
        self.ignored += other.ignored;
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Tallies per host, sorted by host name
    pub hosts: BTreeMap<String, HostStats>,
    /// Results in the order they were recorded
    pub results: Vec<TaskResult>,
    /// The run was cancelled before every task was dispatched
    #[serde(default)]
    pub cancelled: bool,
}

impl RunReport {
    /// Sum of every host's tallies
    pub fn totals(&self) -> HostStats {
        let mut totals = HostStats::default();
        for stats in self.hosts.values() {
            totals.merge(stats);
        }
        totals
    }

    pub fn stats_for(&self, host: &str) -> Option<&HostStats> {
        self.hosts.get(host)
    }

    pub fn results_for<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a TaskResult> + 'a {
        self.results.iter().filter(move |r| r.host == host)
    }

    pub fn has_failures(&self) -> bool {
        self.hosts.values().any(|s| s.failed > 0)
    }

    pub fn has_unreachable(&self) -> bool {
        self.hosts.values().any(|s| s.unreachable > 0)
    }

    /// No host failed or went unreachable, and the run was not cancelled
    pub fn is_success(&self) -> bool {
        !self.has_failures() && !self.has_unreachable() && !self.cancelled
    }

    /// Process exit code: 0 on success, 2 if any host failed (or the run
    /// was cancelled), 4 if hosts were only unreachable.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() || self.cancelled {
            2
        } else if self.has_unreachable() {
            4
        } else {
            0
        }
    }
}

/// Collects results from concurrent host workers
#[derive(Debug, Default)]
pub struct ReportAggregator {
    inner: Mutex<RunReport>,
}

impl ReportAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a host appears in the report even if nothing is recorded
    /// for it.
    pub fn register_host(&self, host: &str) {
        self.inner.lock().hosts.entry(host.to_string()).or_default();
    }

    pub fn record(&self, result: TaskResult) {
        let mut report = self.inner.lock();
        report
            .hosts
            .entry(result.host.clone())
            .or_default()
            .record(&result);
        report.results.push(result);
    }

    pub fn mark_cancelled(&self) {
        self.inner.lock().cancelled = true;
    }

    /// A copy of the report as it stands
    pub fn snapshot(&self) -> RunReport {
        self.inner.lock().clone()
    }

    pub fn into_report(self) -> RunReport {
        self.inner.into_inner()
    }
}
