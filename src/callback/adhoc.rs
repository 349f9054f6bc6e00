//! One-line-per-host output of the ad-hoc runner
//!
//! ```text
//! web1 | SUCCESS => {
//!   "changed": false,
//!   "ping": "pong"
//! }
//! web2 | CHANGED | rc=0 >>
//! hello
//! ```

use async_trait::async_trait;
use colored::{Color, Colorize};

use super::{result_json, ExecutionCallback};
use crate::executor::{Stats, TaskResult};
use crate::vars::{resolve, JsonValue};

/// Modules whose output is shown as raw stdout rather than JSON
const COMMAND_MODULES: &[&str] = &["command", "shell", "raw"];

/// Output for `ansirun PATTERN -m MODULE`
#[derive(Debug, Clone)]
pub struct AdhocCallback {
    use_color: bool,
}

impl Default for AdhocCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl AdhocCallback {
    pub fn new() -> Self {
        Self {
            use_color: std::env::var("NO_COLOR").is_err(),
        }
    }

    pub fn with_no_color(mut self, no_color: bool) -> Self {
        self.use_color = !no_color && std::env::var("NO_COLOR").is_err();
        self
    }

    pub fn format_result(&self, result: &TaskResult) -> String {
        let (status, color) = if result.unreachable {
            ("UNREACHABLE!", Color::Red)
        } else if result.failed {
            ("FAILED", Color::Red)
        } else if result.skipped {
            ("SKIPPED", Color::Cyan)
        } else if result.changed {
            ("CHANGED", Color::Yellow)
        } else {
            ("SUCCESS", Color::Green)
        };

        let is_command = result
            .module
            .as_deref()
            .is_some_and(|m| COMMAND_MODULES.contains(&m));
        let text = match result.data.get("rc") {
            Some(rc) if is_command && !result.unreachable => {
                let mut text = format!("{} | {} | rc={} >>", result.host, status, rc);
                for key in ["stdout", "stderr"] {
                    let out = result.data.get(key).map(resolve::to_string).unwrap_or_default();
                    if !out.is_empty() {
                        text.push('\n');
                        text.push_str(&out);
                    }
                }
                if result.failed {
                    if let Some(JsonValue::String(msg)) = result.data.get("msg") {
                        text.push('\n');
                        text.push_str(msg);
                    }
                }
                text
            }
            _ => {
                let status = if result.failed && !result.unreachable {
                    "FAILED!"
                } else {
                    status
                };
                format!("{} | {} => {}", result.host, status, result_json(&result.data))
            }
        };

        if self.use_color {
            text.color(color).to_string()
        } else {
            text
        }
    }
}

#[async_trait]
impl ExecutionCallback for AdhocCallback {
    async fn on_task_complete(&self, result: &TaskResult) {
        println!("{}", self.format_result(result));
    }

    async fn on_playbook_end(&self, _stats: &Stats, _success: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CommandResult;
    use crate::executor::FailureKind;
    use crate::modules::ModuleOutput;
    use serde_json::json;

    fn plain() -> AdhocCallback {
        AdhocCallback::new().with_no_color(true)
    }

    #[test]
    fn test_ping_success() {
        let output = ModuleOutput::ok("").with_data("ping", json!("pong"));
        let result = TaskResult::from_output("web1", "ping", "ping", &output);
        let text = plain().format_result(&result);
        assert!(text.starts_with("web1 | SUCCESS => {"));
        assert!(text.contains("\"ping\": \"pong\""));
    }

    #[test]
    fn test_command_output() {
        let output = ModuleOutput::changed("")
            .with_command_output(&CommandResult::success("hello\n", ""));
        let result = TaskResult::from_output("web1", "command", "command", &output);
        assert_eq!(plain().format_result(&result), "web1 | CHANGED | rc=0 >>\nhello");
    }

    #[test]
    fn test_failures() {
        let down = TaskResult::failure("web1", "ping", FailureKind::Unreachable, "refused");
        assert!(plain().format_result(&down).starts_with("web1 | UNREACHABLE! => {"));

        let bad = TaskResult::failure("web1", "copy", FailureKind::ConfigError, "dest required");
        assert!(plain().format_result(&bad).starts_with("web1 | FAILED! => {"));
    }
}
