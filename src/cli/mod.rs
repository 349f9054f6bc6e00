//! CLI module for Ansirun
//!
//! Argument parsing and the run logic of the two binaries:
//! - `ansirun` runs one module against a host pattern ([`adhoc`])
//! - `ansirun-playbook` runs a playbook ([`playbook`])
//!
//! Both exit with 0 on success, 2 when any host failed or was unreachable
//! and 1 when the inventory, playbook or configuration could not be loaded.

pub mod adhoc;
pub mod playbook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::error::Error;
use crate::executor::{ExecutorConfig, Stats};
use crate::inventory::Inventory;
use crate::vars::{self, VarMap};

/// Options shared by both binaries
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Inventory file (INI format)
    #[arg(short = 'i', long)]
    pub inventory: Option<PathBuf>,

    /// Extra variables (key=value or @file.yml), repeatable
    #[arg(short = 'e', long = "extra-vars", action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,

    /// Hosts running a task at once (0 = all)
    #[arg(short = 'f', long)]
    pub forks: Option<usize>,

    /// Seconds a task may run on one host
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl CommonArgs {
    /// Load the configuration the binaries start from
    pub fn load_config(&self) -> Result<Config> {
        Config::load(self.config.as_ref())
    }

    /// Executor settings: configuration overridden by flags
    pub fn executor_config(&self, config: &Config) -> ExecutorConfig {
        let mut exec = config.executor_config();
        if let Some(forks) = self.forks {
            exec.forks = forks;
        }
        if let Some(timeout) = self.timeout {
            exec.task_timeout = timeout;
        }
        exec
    }

    /// Load the inventory named by `-i`, or the configured default
    pub fn load_inventory(&self, config: &Config) -> Result<Arc<Inventory>> {
        let path = self
            .inventory
            .clone()
            .unwrap_or_else(|| config.defaults.inventory.clone());
        let inventory = Inventory::load(&path)
            .map_err(Error::from)
            .with_context(|| format!("Unable to load inventory {}", path.display()))?;
        Ok(Arc::new(inventory))
    }

    pub fn no_color(&self, config: &Config) -> bool {
        self.no_color || !config.colors.enabled
    }

    pub fn extra_vars(&self) -> Result<VarMap> {
        parse_extra_vars(&self.extra_vars)
    }
}

/// Parse `-e` values: `key=value` pairs (values typed as YAML scalars) or
/// `@file` YAML mappings. Later values win.
pub fn parse_extra_vars(values: &[String]) -> Result<VarMap> {
    let mut out = VarMap::new();

    for value in values {
        if let Some(file) = value.strip_prefix('@') {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read extra vars file {}", file))?;
            let parsed: serde_yaml::Value = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse extra vars file {}", file))?;
            match vars::yaml_to_json(&parsed) {
                serde_json::Value::Object(map) => vars::merge_into(&mut out, &map),
                serde_json::Value::Null => {}
                _ => {
                    return Err(Error::Config(format!(
                        "extra vars file {} is not a mapping",
                        file
                    ))
                    .into())
                }
            }
        } else {
            for token in shell_words::split(value)
                .with_context(|| format!("Invalid extra vars: {}", value))?
            {
                let Some((key, raw)) = token.split_once('=') else {
                    return Err(Error::Config(format!(
                        "extra vars must be key=value or @file, got '{}'",
                        token
                    ))
                    .into());
                };
                let parsed = serde_yaml::from_str::<serde_yaml::Value>(raw)
                    .map(|v| vars::yaml_to_json(&v))
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
                out.insert(key.to_string(), parsed);
            }
        }
    }

    Ok(out)
}

/// Initialize logging: `RUST_LOG` wins, otherwise the `-v` count
pub fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 3),
        )
        .with(env_filter)
        .try_init();
}

/// `Err(PlayFailed)` unless every host succeeded
pub fn check_stats(stats: &Stats) -> std::result::Result<(), Error> {
    if stats.is_success() {
        Ok(())
    } else {
        Err(Error::PlayFailed {
            hosts: stats.failed_hosts(),
        })
    }
}

/// Exit code of a finished run, printing load errors
pub fn exit_code(result: Result<()>) -> i32 {
    let Err(err) = result else {
        return 0;
    };

    match err.downcast_ref::<Error>() {
        Some(failed @ Error::PlayFailed { .. }) => {
            warn!("{}", failed);
            failed.exit_code()
        }
        other => {
            eprintln!("{} {:#}", "ERROR!".red().bold(), err);
            other.map(Error::exit_code).unwrap_or(1)
        }
    }
}
