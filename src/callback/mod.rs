//! Callback system for Ansirun execution events
//!
//! The play runner reports progress through [`ExecutionCallback`]. Results
//! are delivered after every host finished the task, in host order, so
//! output never interleaves.
//!
//! - [`DefaultCallback`] - Ansible-like colored playbook output and recap
//! - [`AdhocCallback`] - `host | STATUS => {...}` lines for the ad-hoc runner
//! - [`NullCallback`] - No output (useful for testing)
//!
//! # Creating Custom Callbacks
//!
//! ```rust,ignore
//! use ansirun::callback::ExecutionCallback;
//! use ansirun::executor::TaskResult;
//!
//! struct Counter(std::sync::atomic::AtomicUsize);
//!
//! #[async_trait::async_trait]
//! impl ExecutionCallback for Counter {
//!     async fn on_task_complete(&self, result: &TaskResult) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
//!     }
//! }
//! ```

pub mod adhoc;
pub mod default;

use async_trait::async_trait;

use crate::executor::{Stats, TaskResult};

pub use adhoc::AdhocCallback;
pub use default::DefaultCallback;

/// Receives execution events. Every method defaults to a no-op.
#[async_trait]
pub trait ExecutionCallback: Send + Sync {
    /// Called before the first play
    async fn on_playbook_start(&self, name: &str) {
        let _ = name;
    }

    /// Called once a play's hosts are resolved
    async fn on_play_start(&self, name: &str, hosts: &[String]) {
        let _ = (name, hosts);
    }

    /// Called before a task runs on the active hosts
    async fn on_task_start(&self, name: &str, hosts: &[String]) {
        let _ = (name, hosts);
    }

    /// Called before a notified handler runs
    async fn on_handler_start(&self, name: &str, hosts: &[String]) {
        let _ = (name, hosts);
    }

    /// Called with each host's result of a task
    async fn on_task_complete(&self, result: &TaskResult) {
        let _ = result;
    }

    /// Called after the last play with the final statistics
    async fn on_playbook_end(&self, stats: &Stats, success: bool) {
        let _ = (stats, success);
    }
}

/// A callback that discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallback;

#[async_trait]
impl ExecutionCallback for NullCallback {}

/// Pretty JSON of a result's data map
pub(crate) fn result_json(data: &crate::vars::VarMap) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
}
