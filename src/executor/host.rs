//! One host's pass through a play.
//!
//! A [`HostWorker`] owns everything that belongs to a single host for the
//! duration of a play: its connection, its facts and its variable scope.
//! Tasks run strictly in order; the worker stops at the first result that
//! ends the host's play.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::connection::{Connection, ExecuteOptions};
use crate::facts::Facts;
use crate::inventory::Host;
use crate::modules::{ModuleContext, ModuleOutput, ModuleParams, ModuleRegistry, ModuleResult};
use crate::playbook::{FailurePolicy, Play, Task};
use crate::report::{ErrorKind, ReportAggregator, TaskResult, TaskStatus};
use crate::template::{TemplateEngine, Vars};
use crate::vars::{VarPrecedence, VarScope};

use super::task::{
    conditions_hold, judge, loop_items, loop_register, register_value, render_args,
    resolve_escalation, Escalation, TaskFailure, TaskState,
};
use super::ExecutorConfig;

/// State shared by every host worker of one play
pub(crate) struct PlayRun {
    pub play: Play,
    pub policy: FailurePolicy,
    pub config: ExecutorConfig,
    pub registry: Arc<ModuleRegistry>,
    pub engine: Arc<TemplateEngine>,
    pub report: Arc<ReportAggregator>,
    pub cancel: CancellationToken,
    pub base_dir: PathBuf,
}

/// What happens to the host after a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Abort,
}

/// One executed item plus whether it ends the host's play regardless of
/// failure policy.
struct ItemOutcome {
    result: TaskResult,
    fatal: bool,
}

enum Dispatch {
    Done(ModuleResult<ModuleOutput>),
    TimedOut(u64),
    Cancelled,
}

pub(crate) struct HostWorker {
    host: Host,
    connection: Arc<dyn Connection>,
    facts: Arc<Facts>,
    scope: VarScope,
    escalation: HashMap<Escalation, bool>,
    run: Arc<PlayRun>,
}

impl HostWorker {
    pub fn new(
        host: Host,
        connection: Arc<dyn Connection>,
        facts: Arc<Facts>,
        scope: VarScope,
        run: Arc<PlayRun>,
    ) -> Self {
        Self {
            host,
            connection,
            facts,
            scope,
            escalation: HashMap::new(),
            run,
        }
    }

    /// Run every task of the play on this host, in order
    pub async fn run(mut self) {
        let run = Arc::clone(&self.run);
        for task in &run.play.tasks {
            if run.cancel.is_cancelled() {
                debug!(host = %self.host.name, "cancelled before task '{}'", task.name);
                break;
            }
            if self.run_task(task).await == Flow::Abort {
                debug!(host = %self.host.name, "no further tasks for this host");
                break;
            }
        }
        if let Err(e) = self.connection.close().await {
            trace!(host = %self.host.name, "close failed: {}", e);
        }
    }

    async fn run_task(&mut self, task: &Task) -> Flow {
        debug!(host = %self.host.name, task = %task.name, state = %TaskState::Pending);
        let vars = self.scope.merged();

        let items = match loop_items(&self.run.engine, task, &vars) {
            Ok(items) => items,
            Err(failure) => {
                let outcome = self.failure(task, None, failure);
                return self.finish(task, outcome);
            }
        };

        let Some(items) = items else {
            let outcome = self.run_item(task, &vars, None).await;
            if let Some(name) = &task.register {
                self.scope
                    .set(name, register_value(&outcome.result), VarPrecedence::SetFacts);
            }
            return self.finish(task, outcome);
        };

        if items.is_empty() {
            debug!(host = %self.host.name, task = %task.name, "loop has no items");
        }
        let mut results = Vec::with_capacity(items.len());
        let mut flow = Flow::Continue;
        for item in items {
            if self.run.cancel.is_cancelled() {
                flow = Flow::Abort;
                break;
            }
            let vars = self.scope.merged_with_item(task.loop_var(), &item);
            let outcome = self.run_item(task, &vars, Some(item)).await;
            results.push(outcome.result.clone());
            flow = self.finish(task, outcome);
            if flow == Flow::Abort {
                break;
            }
        }
        if let Some(name) = &task.register {
            self.scope.set(
                name,
                loop_register(&results, task.loop_var()),
                VarPrecedence::SetFacts,
            );
        }
        flow
    }

    /// Record the outcome and decide whether the host carries on
    fn finish(&self, task: &Task, outcome: ItemOutcome) -> Flow {
        let ItemOutcome { result, fatal } = outcome;
        debug!(
            host = %self.host.name,
            task = %task.name,
            state = %TaskState::from(result.status)
        );
        let flow = if fatal || result.status == TaskStatus::Unreachable {
            Flow::Abort
        } else if result.is_failure() && self.run.policy == FailurePolicy::Strict {
            Flow::Abort
        } else {
            Flow::Continue
        };
        match result.status {
            TaskStatus::Failed if !result.ignored => error!(
                host = %self.host.name,
                task = %task.name,
                "failed: {}",
                result.msg.as_deref().unwrap_or_default()
            ),
            TaskStatus::Unreachable => warn!(
                host = %self.host.name,
                task = %task.name,
                "unreachable: {}",
                result.msg.as_deref().unwrap_or_default()
            ),
            _ => {}
        }
        self.run.report.record(result);
        flow
    }

    async fn run_item(&mut self, task: &Task, vars: &Vars, item: Option<JsonValue>) -> ItemOutcome {
        debug!(host = %self.host.name, task = %task.name, state = %TaskState::Evaluating);
        match conditions_hold(&self.run.engine, task.when.as_ref(), vars) {
            Ok(true) => {}
            Ok(false) => {
                let result = TaskResult::skipped(&self.host.name, &task.name)
                    .with_item(item)
                    .with_msg("Conditional result was False");
                return ItemOutcome {
                    result,
                    fatal: false,
                };
            }
            Err(failure) => return self.failure(task, item, failure),
        }

        let params = match render_args(&self.run.engine, &task.args, vars) {
            Ok(params) => params,
            Err(failure) => return self.failure(task, item, failure),
        };

        let options = match self.execute_options(task, item.clone()).await {
            Ok(options) => options,
            Err(outcome) => return outcome,
        };

        debug!(host = %self.host.name, task = %task.name, state = %TaskState::Dispatching);
        let context = ModuleContext::new(self.host.name.clone(), Arc::clone(&self.connection))
            .with_facts(Arc::clone(&self.facts))
            .with_options(options)
            .with_base_dir(self.run.base_dir.clone())
            .with_vars(Arc::new(vars.clone()))
            .with_engine(Arc::clone(&self.run.engine));

        match self.dispatch(task, &params, &context).await {
            Dispatch::Cancelled => {
                let result = TaskResult::failed(
                    &self.host.name,
                    &task.name,
                    ErrorKind::Cancelled,
                    "cancelled while running",
                )
                .with_item(item);
                ItemOutcome {
                    result,
                    fatal: true,
                }
            }
            Dispatch::TimedOut(secs) => self.failure(
                task,
                item,
                TaskFailure::new(ErrorKind::Timeout, format!("timed out after {}s", secs)),
            ),
            Dispatch::Done(Err(e)) if e.is_transport() => ItemOutcome {
                result: TaskResult::unreachable(&self.host.name, &task.name, e.to_string())
                    .with_item(item),
                fatal: true,
            },
            Dispatch::Done(Err(e)) => {
                self.failure(task, item, TaskFailure::new(ErrorKind::of_module(&e), e.to_string()))
            }
            Dispatch::Done(Ok(output)) => self.conclude(task, vars, item, output),
        }
    }

    fn conclude(
        &mut self,
        task: &Task,
        vars: &Vars,
        item: Option<JsonValue>,
        output: ModuleOutput,
    ) -> ItemOutcome {
        let (status, payload) = match judge(&self.run.engine, task, &output, vars) {
            Ok(judged) => judged,
            Err(failure) => return self.failure(task, item, failure),
        };

        let mut result = match status {
            TaskStatus::Changed => TaskResult::changed(&self.host.name, &task.name),
            TaskStatus::Failed => TaskResult::failed(
                &self.host.name,
                &task.name,
                ErrorKind::RemoteExecutionError,
                output.msg.clone(),
            ),
            _ => TaskResult::ok(&self.host.name, &task.name),
        };
        if status != TaskStatus::Failed {
            for (key, value) in &output.set_vars {
                self.scope
                    .set(key.clone(), value.clone(), VarPrecedence::SetFacts);
            }
            result = result.with_msg(output.msg);
        }
        ItemOutcome {
            result: result
                .with_item(item)
                .with_output(payload)
                .with_ignored(task.ignore_errors),
            fatal: false,
        }
    }

    /// Options every command of the task runs with. Escalation is probed
    /// once per user and method, before its first use on this host.
    async fn execute_options(
        &mut self,
        task: &Task,
        item: Option<JsonValue>,
    ) -> Result<ExecuteOptions, ItemOutcome> {
        let mut options = ExecuteOptions::new();
        if let Some(secs) = self.run.config.task_timeout {
            options = options.with_timeout(secs);
        }
        let Some(escalation) =
            resolve_escalation(task, &self.run.play, &self.host.connection, &self.run.config)
        else {
            return Ok(options);
        };
        options = options
            .with_escalation(Some(escalation.user.clone()))
            .with_escalation_method(escalation.method.clone());

        let allowed = match self.escalation.get(&escalation) {
            Some(allowed) => *allowed,
            None => {
                debug!(
                    host = %self.host.name,
                    user = %escalation.user,
                    method = %escalation.method,
                    "probing privilege escalation"
                );
                let allowed = match self.connection.check_escalation(&options).await {
                    Ok(allowed) => allowed,
                    Err(e) if e.is_transport() => {
                        return Err(ItemOutcome {
                            result: TaskResult::unreachable(
                                &self.host.name,
                                &task.name,
                                e.to_string(),
                            )
                            .with_item(item),
                            fatal: true,
                        });
                    }
                    Err(e) => {
                        debug!(host = %self.host.name, "escalation probe failed: {}", e);
                        false
                    }
                };
                self.escalation.insert(escalation.clone(), allowed);
                allowed
            }
        };

        if allowed {
            return Ok(options);
        }
        warn!(
            host = %self.host.name,
            task = %task.name,
            "cannot escalate to '{}' with {}",
            escalation.user,
            escalation.method
        );
        let result = TaskResult::failed(
            &self.host.name,
            &task.name,
            ErrorKind::PermissionDenied,
            format!(
                "privilege escalation to '{}' via {} was refused",
                escalation.user, escalation.method
            ),
        )
        .with_item(item);
        Err(ItemOutcome {
            result,
            fatal: true,
        })
    }

    /// Invoke the module, bounded by the task timeout and raced against
    /// cancellation. A dropped dispatch drops its transport channel.
    async fn dispatch(
        &self,
        task: &Task,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> Dispatch {
        trace!(host = %self.host.name, module = %task.module, ?params, "invoking module");
        let invoke = self.run.registry.invoke(&task.module, params, context);
        let task_timeout = self.run.config.task_timeout;
        let bounded = async move {
            match task_timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), invoke)
                    .await
                    .map_err(|_| secs),
                None => Ok(invoke.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.run.cancel.cancelled() => Dispatch::Cancelled,
            outcome = bounded => match outcome {
                Ok(result) => Dispatch::Done(result),
                Err(secs) => Dispatch::TimedOut(secs),
            },
        }
    }

    fn failure(&self, task: &Task, item: Option<JsonValue>, failure: TaskFailure) -> ItemOutcome {
        ItemOutcome {
            result: TaskResult::failed(&self.host.name, &task.name, failure.kind, failure.msg)
                .with_item(item)
                .with_ignored(task.ignore_errors),
            fatal: false,
        }
    }
}
