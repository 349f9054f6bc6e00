//! Task results
//!
//! A [`TaskResult`] is what one task produced on one host: the status flags
//! the recap counts, a message, and the data map a `register` binds. Looped
//! tasks carry one result per item in `iteration_results`.

use serde::Serialize;

use crate::modules::ModuleOutput;
use crate::vars::{JsonValue, VarMap};

/// Why a task failed on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The shell channel could not be opened
    Unreachable,
    /// The module did not finish within the task timeout
    Timeout,
    /// The module reported failure (or `failed_when` said so)
    ModuleFailed,
    /// Rendering or condition evaluation raised
    TemplateError,
    /// Unknown module, missing argument, bad become method
    ConfigError,
}

impl FailureKind {
    /// Whether the host counts as unreachable
    pub fn is_unreachable(self) -> bool {
        matches!(self, FailureKind::Unreachable | FailureKind::Timeout)
    }
}

/// Result of executing a task on a host
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskResult {
    pub host: String,
    pub task: String,
    /// Canonical module name, `None` for skipped blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub changed: bool,
    pub failed: bool,
    pub skipped: bool,
    pub unreachable: bool,
    /// The failure was tolerated by `ignore_errors`
    pub ignored: bool,
    pub message: String,
    /// Result envelope: rc/stdout/stderr, module keys, `ansible_facts`
    pub data: VarMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Loop item this result belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<JsonValue>,
    /// Display label of the loop item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Per-item results of a looped task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_results: Option<Vec<TaskResult>>,
}

impl TaskResult {
    fn new(host: &str, task: &str) -> Self {
        Self {
            host: host.to_string(),
            task: task.to_string(),
            ..Default::default()
        }
    }

    /// A result for a task whose `when` was false
    pub fn skipped(host: &str, task: &str) -> Self {
        let mut result = Self::new(host, task);
        result.skipped = true;
        result.message = "Conditional result was False".to_string();
        result.data.insert("changed".to_string(), JsonValue::Bool(false));
        result.data.insert("skipped".to_string(), JsonValue::Bool(true));
        result.data.insert(
            "skip_reason".to_string(),
            JsonValue::String(result.message.clone()),
        );
        result
    }

    /// A failure raised by the runner rather than the module
    pub fn failure(host: &str, task: &str, kind: FailureKind, msg: impl Into<String>) -> Self {
        let mut result = Self::new(host, task);
        result.failed = true;
        result.unreachable = kind.is_unreachable();
        result.failure = Some(kind);
        result.message = msg.into();
        result.data.insert("changed".to_string(), JsonValue::Bool(false));
        result.data.insert("failed".to_string(), JsonValue::Bool(true));
        if result.unreachable {
            result.data.insert("unreachable".to_string(), JsonValue::Bool(true));
        }
        result
            .data
            .insert("msg".to_string(), JsonValue::String(result.message.clone()));
        result
    }

    /// Wrap what a module returned
    pub fn from_output(host: &str, task: &str, module: &str, output: &ModuleOutput) -> Self {
        let mut result = Self::new(host, task);
        result.module = Some(module.to_string());
        result.changed = output.changed;
        result.failed = output.failed;
        if output.failed {
            result.failure = Some(FailureKind::ModuleFailed);
        }
        result.message = output.msg.clone();
        result.data = output.to_data();
        result
    }

    /// Override the changed flag (`changed_when`)
    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
        self.data.insert("changed".to_string(), JsonValue::Bool(changed));
    }

    /// Override the failed flag (`failed_when`)
    pub fn set_failed(&mut self, failed: bool, msg: Option<String>) {
        self.failed = failed;
        self.failure = failed.then_some(self.failure.unwrap_or(FailureKind::ModuleFailed));
        self.data.insert("failed".to_string(), JsonValue::Bool(failed));
        if let Some(msg) = msg {
            self.data.insert("msg".to_string(), JsonValue::String(msg.clone()));
            self.message = msg;
        }
    }

    /// A failure that removes the host from the play
    pub fn is_fatal(&self) -> bool {
        self.unreachable || (self.failed && !self.ignored)
    }

    /// Facts the module returned, if any
    pub fn facts(&self) -> Option<&VarMap> {
        match self.data.get("ansible_facts") {
            Some(JsonValue::Object(facts)) => Some(facts),
            _ => None,
        }
    }

    /// Combine per-item results into the result of a looped task
    pub fn aggregate(host: &str, task: &str, module: &str, iterations: Vec<TaskResult>) -> Self {
        let mut result = Self::new(host, task);
        result.module = Some(module.to_string());
        result.changed = iterations.iter().any(|r| r.changed);
        result.failed = iterations.iter().any(|r| r.failed && !r.ignored);
        result.ignored = !result.failed && iterations.iter().any(|r| r.ignored);
        result.unreachable = iterations.iter().any(|r| r.unreachable);
        result.skipped = iterations.iter().all(|r| r.skipped);
        result.failure = iterations
            .iter()
            .find(|r| r.failed && !r.ignored)
            .and_then(|r| r.failure);

        result.message = if iterations.is_empty() {
            "No items in the list".to_string()
        } else if result.skipped {
            "All items skipped".to_string()
        } else if result.failed || result.unreachable {
            "One or more items failed".to_string()
        } else if result.changed {
            "All items completed".to_string()
        } else {
            String::new()
        };

        let results: Vec<JsonValue> = iterations
            .iter()
            .map(|r| JsonValue::Object(r.data.clone()))
            .collect();
        result.data.insert("results".to_string(), JsonValue::Array(results));
        result.data.insert("changed".to_string(), JsonValue::Bool(result.changed));
        result.data.insert("failed".to_string(), JsonValue::Bool(result.failed));
        result.data.insert("skipped".to_string(), JsonValue::Bool(result.skipped));
        if !result.message.is_empty() {
            result
                .data
                .insert("msg".to_string(), JsonValue::String(result.message.clone()));
        }
        result.iteration_results = Some(iterations);
        result
    }
}
