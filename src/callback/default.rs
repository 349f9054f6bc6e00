//! Default callback producing Ansible-like colored output
//!
//! ```text
//! PLAY [webservers] **************************************************************
//!
//! TASK [Install nginx] ***********************************************************
//! changed: [web1]
//! ok: [web2]
//!
//! PLAY RECAP *********************************************************************
//! web1                       : ok=2    changed=1    unreachable=0    failed=0    skipped=0    rescued=0    ignored=0
//! ```
//!
//! Colors are disabled by `NO_COLOR` or [`DefaultCallback::with_no_color`].

use async_trait::async_trait;
use colored::{Color, Colorize};

use super::{result_json, ExecutionCallback};
use crate::executor::{HostStats, Stats, TaskResult};
use crate::vars::{JsonValue, VarMap};

/// The default width for banners (Ansible standard)
const OUTPUT_WIDTH: usize = 80;

/// Keys left out of the `ok: [host] => {...}` output of `debug`
const DEBUG_HIDDEN_KEYS: &[&str] = &["changed", "failed"];

/// Playbook output in the familiar Ansible format
#[derive(Debug, Clone)]
pub struct DefaultCallback {
    verbosity: u8,
    use_color: bool,
}

impl Default for DefaultCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultCallback {
    pub fn new() -> Self {
        Self {
            verbosity: 0,
            use_color: std::env::var("NO_COLOR").is_err(),
        }
    }

    /// Show result data of ok/changed tasks from verbosity 1 on
    pub fn with_verbosity(mut self, level: u8) -> Self {
        self.verbosity = level;
        self
    }

    pub fn with_no_color(mut self, no_color: bool) -> Self {
        self.use_color = !no_color && std::env::var("NO_COLOR").is_err();
        self
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.use_color {
            text.color(color).to_string()
        } else {
            text.to_string()
        }
    }

    /// `PREFIX [name] ******...` padded to the output width
    pub fn banner(&self, prefix: &str, name: &str) -> String {
        let header = if name.is_empty() {
            prefix.to_string()
        } else {
            format!("{} [{}]", prefix, name)
        };
        let stars = "*".repeat(OUTPUT_WIDTH.saturating_sub(header.len() + 1).max(3));
        if self.use_color {
            format!("\n{} {}", header.bright_white().bold(), stars.bright_black())
        } else {
            format!("\n{} {}", header, stars)
        }
    }

    /// Output lines for one host's result of a task
    pub fn format_result(&self, result: &TaskResult) -> Vec<String> {
        let mut lines = Vec::new();

        match &result.iteration_results {
            Some(iterations) if !iterations.is_empty() => {
                for iteration in iterations {
                    lines.push(self.format_line(iteration));
                }
            }
            _ => lines.push(self.format_line(result)),
        }

        if result.ignored {
            lines.push(self.paint("...ignoring", Color::Cyan));
        }
        lines
    }

    fn format_line(&self, result: &TaskResult) -> String {
        let host = &result.host;
        let item = result
            .label
            .as_ref()
            .map(|label| format!(" (item={})", label))
            .unwrap_or_default();

        if result.unreachable {
            return self.paint(
                &format!(
                    "fatal: [{}]{}: UNREACHABLE! => {}",
                    host,
                    item,
                    result_json(&result.data)
                ),
                Color::Red,
            );
        }

        if result.failed {
            let prefix = if result.item.is_some() {
                format!("failed: [{}]{}", host, item)
            } else {
                format!("fatal: [{}]", host)
            };
            return self.paint(
                &format!("{}: FAILED! => {}", prefix, result_json(&result.data)),
                Color::Red,
            );
        }

        if result.skipped {
            let detail = if result.item.is_some() {
                format!(" =>{}", item)
            } else {
                String::new()
            };
            return self.paint(&format!("skipping: [{}]{}", host, detail), Color::Cyan);
        }

        let (status, color) = if result.changed {
            ("changed", Color::Yellow)
        } else {
            ("ok", Color::Green)
        };
        let mut line = format!("{}: [{}]", status, host);
        if result.item.is_some() {
            line.push_str(&format!(" =>{}", item));
        }

        if result.module.as_deref() == Some("debug") {
            let shown: VarMap = result
                .data
                .iter()
                .filter(|(k, _)| !DEBUG_HIDDEN_KEYS.contains(&k.as_str()) && !is_loop_key(result, k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            line.push_str(&format!(" => {}", result_json(&shown)));
        } else if self.verbosity > 0 {
            line.push_str(&format!(" => {}", result_json(&result.data)));
        }
        self.paint(&line, color)
    }

    /// `host : ok=N changed=N ...` recap line
    pub fn format_recap_line(&self, host: &str, stats: &HostStats) -> String {
        let padded = format!("{:<26}", host);
        let host = if !self.use_color {
            padded
        } else if !stats.is_success() {
            padded.red().bold().to_string()
        } else if stats.changed > 0 {
            padded.yellow().to_string()
        } else {
            padded.green().to_string()
        };

        let stat = |label: &str, value: u32, color: Color| {
            let text = format!("{}={:<4}", label, value);
            if self.use_color && value > 0 {
                text.color(color).to_string()
            } else {
                text
            }
        };

        format!(
            "{} : {} {} {} {} {} {} {}",
            host,
            stat("ok", stats.ok, Color::Green),
            stat("changed", stats.changed, Color::Yellow),
            stat("unreachable", stats.unreachable, Color::Red),
            stat("failed", stats.failed, Color::Red),
            stat("skipped", stats.skipped, Color::Cyan),
            stat("rescued", stats.rescued, Color::Magenta),
            stat("ignored", stats.ignored, Color::Blue),
        )
        .trim_end()
        .to_string()
    }

    /// The whole `PLAY RECAP` block
    pub fn format_recap(&self, stats: &Stats) -> Vec<String> {
        let mut lines = vec![self.banner("PLAY RECAP", "")];
        lines.extend(
            stats
                .hosts()
                .map(|(host, host_stats)| self.format_recap_line(host, host_stats)),
        );
        lines
    }
}

/// The loop variable echoed into a debug result
fn is_loop_key(result: &TaskResult, key: &str) -> bool {
    key == "ansible_loop_var"
        || result
            .data
            .get("ansible_loop_var")
            .and_then(JsonValue::as_str)
            == Some(key)
}

#[async_trait]
impl ExecutionCallback for DefaultCallback {
    async fn on_play_start(&self, name: &str, _hosts: &[String]) {
        println!("{}", self.banner("PLAY", name));
    }

    async fn on_task_start(&self, name: &str, _hosts: &[String]) {
        println!("{}", self.banner("TASK", name));
    }

    async fn on_handler_start(&self, name: &str, _hosts: &[String]) {
        println!("{}", self.banner("RUNNING HANDLER", name));
    }

    async fn on_task_complete(&self, result: &TaskResult) {
        for line in self.format_result(result) {
            println!("{}", line);
        }
    }

    async fn on_playbook_end(&self, stats: &Stats, _success: bool) {
        for line in self.format_recap(stats) {
            println!("{}", line);
        }
        println!();
    }
}
