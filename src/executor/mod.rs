//! Core execution engine for Converge
//!
//! This module drives a playbook against the inventory:
//! - Fact gathering for every targeted host before any task runs
//! - Parallel execution across hosts, bounded by `forks`
//! - Strictly sequential tasks within a host
//! - Strict or best-effort failure handling per play
//! - Task and play timeouts plus operator cancellation

mod host;
pub mod task;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, ConnectionFactory};
use crate::facts::{FactGatherer, Facts};
use crate::inventory::{Host, Inventory, InventoryError};
use crate::lookup::{LookupContext, LookupRegistry};
use crate::modules::ModuleRegistry;
use crate::playbook::{FailurePolicy, Play, Playbook};
use crate::report::ReportAggregator;
use crate::template::{TemplateEngine, Vars};
use crate::vars::{VarPrecedence, VarScope};

use host::{HostWorker, PlayRun};

pub use crate::report::{ErrorKind, HostStats, RunReport, TaskResult, TaskStatus};
pub use task::TaskState;

/// Task name for results recorded before a host reached its first task
pub const SETUP_TASK: &str = "gathering facts";

/// Errors that stop a run before its tasks can be dispatched
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Configuration for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of hosts worked on at once
    pub forks: usize,
    /// Seconds a single task may run
    pub task_timeout: Option<u64>,
    /// Seconds a whole play may run before it is cancelled
    pub play_timeout: Option<u64>,
    /// Gather facts unless the play says otherwise
    pub gather_facts: bool,
    /// Failure handling unless the play says otherwise
    pub failure_policy: FailurePolicy,
    /// Escalate unless the host, play or task says otherwise
    pub r#become: bool,
    pub become_method: String,
    pub become_user: String,
    /// Variables passed on the command line
    pub extra_vars: Vars,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            forks: 5,
            task_timeout: None,
            play_timeout: None,
            gather_facts: true,
            failure_policy: FailurePolicy::Strict,
            r#become: false,
            become_method: "sudo".to_string(),
            become_user: "root".to_string(),
            extra_vars: Vars::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn with_extra_var(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.extra_vars.insert(key.into(), value);
        self
    }
}

/// A host after connection and fact gathering
enum Prepared {
    Ready(Arc<dyn Connection>, Arc<Facts>),
    Unreachable(String),
    Cancelled,
}

/// The main executor engine
pub struct Executor {
    config: ExecutorConfig,
    inventory: Arc<Inventory>,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<ModuleRegistry>,
    lookups: Arc<LookupRegistry>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Executor {
    /// Create a new executor with the built-in modules and lookups
    pub fn new(
        config: ExecutorConfig,
        inventory: Inventory,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let forks = config.forks.max(1);
        Self {
            config,
            inventory: Arc::new(inventory),
            factory,
            registry: Arc::new(ModuleRegistry::with_builtins()),
            lookups: Arc::new(LookupRegistry::with_builtins()),
            semaphore: Arc::new(Semaphore::new(forks)),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the module registry
    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Replace the lookup registry
    pub fn with_lookups(mut self, lookups: LookupRegistry) -> Self {
        self.lookups = Arc::new(lookups);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Token that aborts the run when cancelled. No task is dispatched
    /// after cancellation; tasks in flight are dropped and recorded failed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a complete playbook, plays in order
    #[instrument(skip(self, playbook), fields(playbook = %playbook.name.as_deref().unwrap_or("-")))]
    pub async fn run_playbook(&self, playbook: &Playbook) -> ExecutorResult<RunReport> {
        info!("Starting playbook with {} play(s)", playbook.play_count());
        let base_dir = playbook.base_dir();
        let report = Arc::new(ReportAggregator::new());

        for play in &playbook.plays {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, skipping play: {}", play.name);
                break;
            }
            self.execute_play(play, &base_dir, &report).await?;
        }

        Ok(self.finish(report))
    }

    /// Run a single play, resolving local paths against the current
    /// directory
    pub async fn run_play(&self, play: &Play) -> ExecutorResult<RunReport> {
        let report = Arc::new(ReportAggregator::new());
        self.execute_play(play, Path::new("."), &report).await?;
        Ok(self.finish(report))
    }

    fn finish(&self, report: Arc<ReportAggregator>) -> RunReport {
        if self.cancel.is_cancelled() {
            report.mark_cancelled();
        }
        match Arc::try_unwrap(report) {
            Ok(aggregator) => aggregator.into_report(),
            Err(shared) => shared.snapshot(),
        }
    }

    #[instrument(skip(self, play, base_dir, report), fields(play = %play.name, hosts = %play.hosts))]
    async fn execute_play(
        &self,
        play: &Play,
        base_dir: &Path,
        report: &Arc<ReportAggregator>,
    ) -> ExecutorResult<()> {
        info!("Starting play: {}", play.name);

        let hosts: Vec<Host> = self
            .inventory
            .resolve(&play.hosts)?
            .into_iter()
            .cloned()
            .collect();
        if hosts.is_empty() {
            warn!("No hosts matched for play: {}", play.name);
            return Ok(());
        }
        for host in &hosts {
            report.register_host(&host.name);
        }
        debug!("Executing on {} hosts", hosts.len());

        let cancel = self.cancel.child_token();
        let timer = self.config.play_timeout.map(|secs| {
            let cancel = cancel.clone();
            let name = play.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                warn!("Play '{}' exceeded its {}s timeout, cancelling", name, secs);
                cancel.cancel();
            })
        });

        let gather = play.gather_facts.unwrap_or(self.config.gather_facts);
        let prepared = join_all(
            hosts
                .into_iter()
                .map(|host| self.prepare_host(host, gather, &cancel)),
        )
        .await;

        let engine = Arc::new(TemplateEngine::with_lookups(
            Arc::clone(&self.lookups),
            LookupContext::new().with_base_dir(base_dir),
        ));
        let run = Arc::new(PlayRun {
            play: play.clone(),
            policy: play.failure_policy.unwrap_or(self.config.failure_policy),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            engine,
            report: Arc::clone(report),
            cancel: cancel.clone(),
            base_dir: PathBuf::from(base_dir),
        });

        let mut handles = Vec::new();
        for (host, prepared) in prepared {
            match prepared {
                Prepared::Ready(connection, facts) => {
                    let scope = self.scope_for(play, &host, &facts);
                    let worker = HostWorker::new(host, connection, facts, scope, Arc::clone(&run));
                    let semaphore = Arc::clone(&self.semaphore);
                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire().await.ok();
                        worker.run().await;
                    }));
                }
                Prepared::Unreachable(reason) => {
                    warn!(host = %host.name, "unreachable: {}", reason);
                    for task in &play.tasks {
                        report.record(TaskResult::unreachable(&host.name, &task.name, &reason));
                    }
                }
                Prepared::Cancelled => {
                    debug!(host = %host.name, "cancelled before facts were gathered");
                    report.record(TaskResult::failed(
                        &host.name,
                        SETUP_TASK,
                        ErrorKind::Cancelled,
                        "cancelled before facts were gathered",
                    ));
                }
            }
        }

        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                error!("Host worker stopped abnormally: {}", e);
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        if cancel.is_cancelled() {
            report.mark_cancelled();
        }

        info!("Play completed: {}", play.name);
        Ok(())
    }

    /// Connect and gather facts, bounded by `forks`
    async fn prepare_host(
        &self,
        host: Host,
        gather: bool,
        cancel: &CancellationToken,
    ) -> (Host, Prepared) {
        let _permit = self.semaphore.acquire().await.ok();
        let connect = async {
            let connection = match self.factory.connect(&host).await {
                Ok(connection) => connection,
                Err(e) => return Prepared::Unreachable(e.to_string()),
            };
            if !gather {
                let facts = Facts::minimal(&host.name, Utc::now());
                return Prepared::Ready(connection, Arc::new(facts));
            }
            let gatherer = FactGatherer::new().with_timeout(self.config.task_timeout);
            match gatherer.gather(connection.as_ref()).await {
                Ok(facts) => Prepared::Ready(connection, Arc::new(facts)),
                Err(e) => {
                    let _ = connection.close().await;
                    Prepared::Unreachable(format!("fact gathering failed: {}", e))
                }
            }
        };
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Prepared::Cancelled,
            prepared = connect => prepared,
        };
        (host, prepared)
    }

    /// The variable scope a host starts the play with
    fn scope_for(&self, play: &Play, host: &Host, facts: &Facts) -> VarScope {
        let mut scope = VarScope::new();
        scope.set_many(&play.defaults, VarPrecedence::Defaults);
        scope.set_many(&play.vars, VarPrecedence::PlayVars);
        scope.set_layer(VarPrecedence::GroupVars, self.inventory.group_vars_for(host));
        let mut host_vars = host.vars.clone();
        host_vars.insert("inventory_hostname".to_string(), JsonValue::from(host.name.as_str()));
        host_vars.insert("inventory_address".to_string(), JsonValue::from(host.address()));
        scope.set_layer(VarPrecedence::HostVars, host_vars);
        scope.set("facts", facts.to_json(), VarPrecedence::Facts);
        scope.set_many(&self.config.extra_vars, VarPrecedence::ExtraVars);
        scope
    }
}
