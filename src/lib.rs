//! # Converge - declarative configuration for fleets of hosts
//!
//! Converge applies a playbook, an ordered list of desired-state tasks, to
//! the hosts of an inventory. Every task is idempotent: running a playbook
//! twice against a converged host reports no changes the second time.
//!
//! ## Core Concepts
//!
//! - **Inventory**: hosts organized into nested groups with variables
//! - **Facts**: per-host attributes (OS family, hostname, time) gathered once per play
//! - **Templates**: `{{ expr }}` placeholders, filters, tests and `lookup()` calls
//! - **Modules**: idempotent units of work (`package`, `file`, `user`, `restore`, ...)
//! - **Playbooks**: plays that bind a host group to a task list
//! - **Executor**: runs hosts in parallel, tasks within a host in order
//! - **Report**: ok/changed/failed/skipped/unreachable tallies per host
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │  Inventory   │──▶│ Fact Gatherer│──▶│ VarScope + Templates │
//! └──────────────┘   └──────────────┘   └──────────────────────┘
//!                                                  │
//!                                                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │    Report    │◀──│   Executor   │◀──│  Playbook / Tasks    │
//! │  Aggregator  │   │ (host workers)│  └──────────────────────┘
//! └──────────────┘   └──────────────┘
//!                           │
//!                           ▼
//!                 ┌──────────────────┐   ┌──────────────────┐
//!                 │ Module Registry  │──▶│ Connection (SSH, │
//!                 │                  │   │ local)           │
//!                 └──────────────────┘   └──────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use converge::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let inventory = Inventory::load("inventory.yml")?;
//!     let playbook = Playbook::from_file("site.yml").await?;
//!
//!     let factory = Arc::new(TransportFactory::default());
//!     let executor = Executor::new(ExecutorConfig::default(), inventory, factory);
//!     let report = executor.run_playbook(&playbook).await?;
//!
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
        ExecuteOptions, LocalConnection, TransferOptions, TransportFactory,
    };
    #[cfg(feature = "russh")]
    pub use crate::connection::RusshConnection;

    pub use crate::error::{Error, Result};
    pub use crate::executor::{Executor, ExecutorConfig, ExecutorError};
    pub use crate::facts::{FactGatherer, Facts};
    pub use crate::inventory::{Group, Host, Inventory};
    pub use crate::modules::{Module, ModuleContext, ModuleOutput, ModuleRegistry, ModuleResult};
    pub use crate::playbook::{FailurePolicy, Play, Playbook, Task};
    pub use crate::report::{ErrorKind, HostStats, RunReport, TaskResult, TaskStatus};
    pub use crate::template::TemplateEngine;
    pub use crate::vars::{VarPrecedence, VarScope};
}

/// Error types and result aliases.
pub mod error;

/// Layered variable scope for one host within one play.
pub mod vars;

/// Playbooks, plays and tasks as parsed from YAML.
pub mod playbook;

/// Transports that run commands and move files on hosts.
pub mod connection;

/// Per-host facts gathered at the start of each play.
pub mod facts;

/// Hosts, nested groups and their variables.
pub mod inventory;

/// Play execution: host workers, task state machine, cancellation.
pub mod executor;

/// Per-task results and per-host tallies.
pub mod report;

/// Built-in modules and the registry that dispatches to them.
pub mod modules;

/// The `{{ expr }}` expression language.
pub mod template;

/// Lookup sources available to templates.
pub mod lookup;

/// Picking the latest archive out of a set of backups.
pub mod backup;

/// Configuration loading and merging.
pub mod config;

pub use error::{Error, Result};
