//! CLI module for Converge
//!
//! Argument parsing, logging setup, extra-variable parsing and the
//! end-of-run recap.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use converge::config::{LogFormat, LoggingConfig};
use converge::executor::ExecutorConfig;
use converge::playbook::FailurePolicy;
use converge::report::{RunReport, TaskStatus};
use converge::template::Vars;
use converge::Error;

/// Converge - declarative, idempotent configuration for fleets of hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Apply a playbook to the hosts of an inventory", long_about = None)]
pub struct Cli {
    /// Playbook to run
    pub playbook: PathBuf,

    /// Path to inventory file
    #[arg(short = 'i', long, env = "CONVERGE_INVENTORY")]
    pub inventory: Option<PathBuf>,

    /// Extra variables (key=value, a JSON/YAML mapping, or @file.yml)
    #[arg(short = 'e', long = "extra-vars", action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,

    /// Number of hosts worked on at once
    #[arg(short = 'f', long)]
    pub forks: Option<usize>,

    /// Per-task timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Whole-play timeout in seconds
    #[arg(long)]
    pub play_timeout: Option<u64>,

    /// Keep running a host's tasks after one fails
    #[arg(long)]
    pub best_effort: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }

    /// Command-line flags win over configuration
    pub fn apply(&self, config: &mut ExecutorConfig) -> Result<()> {
        if let Some(forks) = self.forks {
            config.forks = forks.max(1);
        }
        if self.timeout.is_some() {
            config.task_timeout = self.timeout;
        }
        if self.play_timeout.is_some() {
            config.play_timeout = self.play_timeout;
        }
        if self.best_effort {
            config.failure_policy = FailurePolicy::BestEffort;
        }
        config.extra_vars.extend(parse_extra_vars(&self.extra_vars)?);
        Ok(())
    }
}

/// Parse `-e` arguments, later ones winning
pub fn parse_extra_vars(args: &[String]) -> Result<Vars> {
    let mut vars = Vars::new();
    for arg in args {
        if let Some(path) = arg.strip_prefix('@') {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read extra vars file: {}", path))?;
            vars.extend(
                yaml_mapping(&content)
                    .with_context(|| format!("Extra vars file {} is not a mapping", path))?,
            );
        } else if arg.trim_start().starts_with('{') {
            vars.extend(yaml_mapping(arg)?);
        } else if let Some((key, value)) = arg.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::InvalidExtraVar(arg.clone()).into());
            }
            let value = serde_yaml::from_str::<serde_yaml::Value>(value)
                .ok()
                .and_then(|v| serde_json::to_value(v).ok())
                .unwrap_or_else(|| JsonValue::String(value.to_string()));
            vars.insert(key.to_string(), value);
        } else {
            return Err(Error::InvalidExtraVar(arg.clone()).into());
        }
    }
    Ok(vars)
}

fn yaml_mapping(source: &str) -> Result<Vars> {
    let value: serde_yaml::Value = serde_yaml::from_str(source)?;
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map.into_iter().collect()),
        JsonValue::Null => Ok(Vars::new()),
        _ => Err(Error::InvalidExtraVar(source.to_string()).into()),
    }
}

/// Install the tracing subscriber. `-v` beats the configured level;
/// `RUST_LOG` beats both.
pub fn init_logging(verbosity: u8, logging: &LoggingConfig) {
    let level = match verbosity {
        0 => logging.level.clone().unwrap_or_else(|| "warn".to_string()),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(verbosity >= 3)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn status_label(status: TaskStatus) -> String {
    match status {
        TaskStatus::Ok => "ok".green().to_string(),
        TaskStatus::Changed => "changed".yellow().to_string(),
        TaskStatus::Skipped => "skipping".cyan().to_string(),
        TaskStatus::Failed => "failed".red().bold().to_string(),
        TaskStatus::Unreachable => "unreachable".red().bold().to_string(),
    }
}

/// Print every result followed by the per-host recap
pub fn print_report(report: &RunReport) {
    let mut current_task: Option<&str> = None;
    for result in &report.results {
        if current_task != Some(result.task.as_str()) {
            let header = format!("TASK [{}]", result.task);
            let stars = "*".repeat(80usize.saturating_sub(header.len() + 1));
            println!("\n{} {}", header.bright_white().bold(), stars.bright_black());
            current_task = Some(result.task.as_str());
        }
        let item = result
            .item
            .as_ref()
            .map(|i| format!(" => (item={})", compact(i)))
            .unwrap_or_default();
        let label = if result.ignored {
            format!("{} (ignored)", status_label(result.status))
        } else {
            status_label(result.status)
        };
        match (&result.msg, result.status) {
            (Some(msg), TaskStatus::Failed | TaskStatus::Unreachable) => {
                println!("{}: [{}]{} => {}", label, result.host, item, msg)
            }
            _ => println!("{}: [{}]{}", label, result.host, item),
        }
    }

    let header = "PLAY RECAP";
    let stars = "*".repeat(80 - header.len() - 1);
    println!("\n{} {}", header.bright_white().bold(), stars.bright_black());

    for (host, stats) in &report.hosts {
        let host_colored = if stats.failed > 0 || stats.unreachable > 0 {
            host.red().bold()
        } else if stats.changed > 0 {
            host.yellow()
        } else {
            host.green()
        };
        let fmt_stat = |label: &str, value: usize, color: colored::Color| -> String {
            if value > 0 {
                format!("{}={:<4}", label.color(color), value)
            } else {
                format!("{}={:<4}", label, value).dimmed().to_string()
            }
        };
        println!(
            "{:<30} : {} {} {} {} {} {}",
            host_colored,
            fmt_stat("ok", stats.ok, colored::Color::Green),
            fmt_stat("changed", stats.changed, colored::Color::Yellow),
            fmt_stat("unreachable", stats.unreachable, colored::Color::Red),
            fmt_stat("failed", stats.failed, colored::Color::Red),
            fmt_stat("skipped", stats.skipped, colored::Color::Cyan),
            fmt_stat("ignored", stats.ignored, colored::Color::Blue),
        );
    }

    if report.cancelled {
        println!("\n{}", "Run cancelled.".red().bold());
    } else if report.is_success() {
        println!("\n{}", "Run completed successfully.".green().bold());
    } else {
        println!("\n{}", "Run failed.".red().bold());
    }
}

fn compact(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
