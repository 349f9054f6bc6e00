//! # Ansirun - An agentless, Ansible-compatible play runner
//!
//! Ansirun reads an INI inventory and YAML playbooks and runs their tasks on
//! remote hosts over SSH (or locally), with no agent on the target.
//!
//! ## Core Concepts
//!
//! - **Inventory**: hosts organized into groups, with variables
//! - **Playbooks**: ordered plays binding a host pattern to tasks
//! - **Tasks**: one module invocation per host, with `when`, `loop`,
//!   `register`, `notify`, `become` and failure overrides
//! - **Blocks**: task lists with `rescue` and `always` sections
//! - **Handlers**: tasks run at the end of a play (or on
//!   `meta: flush_handlers`) on the hosts that notified them
//! - **Roles**: reusable task, handler and variable bundles on disk
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │          CLI (ansirun / ansirun-playbook, clap)               │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │   Playbook decoder → Task includer / role loader → Executor   │
//! │        (tokio: one worker per host per task, barrier)         │
//! └──────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌────────────────┐  ┌───────────────────┐  ┌──────────────────┐
//! │ Variable scope │  │  Module registry  │  │ Template engine  │
//! │  (inventory,   │  │  (built-in        │  │ (Jinja2-compat   │
//! │ facts, extras) │  │   modules)        │  │  via minijinja)  │
//! └────────────────┘  └───────────────────┘  └──────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │            Connections (russh SSH, local shell)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use ansirun::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let inventory = Arc::new(Inventory::load("inventory.ini")?);
//!     let playbook = Playbook::load("site.yml")?;
//!
//!     let executor = Executor::new(ExecutorConfig::default(), inventory)
//!         .with_callback(Arc::new(DefaultCallback::new()));
//!     let stats = executor.run_playbook(&playbook).await?;
//!     std::process::exit(if stats.is_success() { 0 } else { 2 });
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::callback::{AdhocCallback, DefaultCallback, ExecutionCallback, NullCallback};
    pub use crate::config::Config;
    pub use crate::connection::{
        CommandResult, Connection, ConnectionError, ConnectionParams, Connector, DefaultConnector,
        ExecuteOptions, LocalConnection,
    };
    pub use crate::error::{Error, Result};
    pub use crate::executor::{Executor, ExecutorConfig, FailureKind, HostStats, Stats, TaskResult};
    pub use crate::inventory::{Group, Host, Inventory};
    pub use crate::modules::{Module, ModuleContext, ModuleOutput, ModuleRegistry};
    pub use crate::playbook::{Handler, Play, Playbook, Task};
    pub use crate::roles::Role;
    pub use crate::template::TemplateEngine;
    pub use crate::vars::{JsonValue, VarMap, VariableScope};
}

/// Error types and result aliases for Ansirun operations.
pub mod error;

/// Configuration file and environment handling.
pub mod config;

/// Variable types, precedence and the per-run scope.
pub mod vars;

/// Jinja2-compatible rendering and condition evaluation.
pub mod template;

/// INI inventory parsing and host pattern resolution.
pub mod inventory;

/// Playbook, play and task decoding.
pub mod playbook;

/// Role loading from `roles/<name>` directories.
pub mod roles;

/// Expansion of `import_*` / `include_*` tasks and play roles.
pub mod include;

/// Handler notification tracking.
pub mod handlers;

/// The play runner.
pub mod executor;

/// Built-in modules and the module registry.
pub mod modules;

/// Shell channels to hosts (SSH and local).
pub mod connection;

/// Fact gathering.
pub mod facts;

/// Output callbacks.
pub mod callback;

/// Command-line front ends shared by the binaries.
pub mod cli;

pub use error::{Error, Result};

/// Version of the crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
