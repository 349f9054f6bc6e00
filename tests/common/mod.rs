//! Shared test utilities and fixtures for the Ansirun test suite.
//!
//! This module provides:
//! - A scripted [`MockConnector`] handing out [`MockConnection`]s that record
//!   every command and keep a per-host virtual file system
//! - A [`RecordingCallback`] capturing execution events in order
//! - A [`Harness`] writing inventories, playbooks and roles into a temporary
//!   directory and running them through the executor
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tempfile::TempDir;

use ansirun::callback::ExecutionCallback;
use ansirun::connection::{
    wrap_become, BecomeSettings, CommandResult, Connection, ConnectionError, ConnectionParams,
    ConnectionResult, Connector, ExecuteOptions,
};
use ansirun::executor::{Executor, ExecutorConfig, ExecutorResult, Stats, TaskResult};
use ansirun::inventory::Inventory;
use ansirun::playbook::Playbook;
use ansirun::vars::VarMap;

// ============================================================================
// Mock Connection Implementation
// ============================================================================

/// A command as the mock transport received it
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    /// The command the module asked for
    pub command: String,
    /// The command after privilege escalation was applied
    pub wrapped: String,
    pub r#become: BecomeSettings,
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    pattern: String,
    result: CommandResult,
    delay: Option<Duration>,
}

impl Rule {
    fn matches(&self, host: &str, command: &str) -> bool {
        self.host.as_deref().map_or(true, |h| h == host) && command.contains(&self.pattern)
    }
}

/// State of one mock host, shared by every connection opened to it
#[derive(Debug, Default)]
pub struct MockHostState {
    commands: RwLock<Vec<ExecutedCommand>>,
    files: RwLock<HashMap<String, Vec<u8>>>,
}

/// Everything the connector knows, shared with its connections
#[derive(Debug, Default)]
struct MockShared {
    rules: RwLock<Vec<Rule>>,
    hosts: RwLock<HashMap<String, Arc<MockHostState>>>,
    unreachable: RwLock<HashSet<String>>,
    opens: RwLock<HashMap<String, usize>>,
    closes: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    timeline: RwLock<Vec<String>>,
}

impl MockShared {
    fn host(&self, name: &str) -> Arc<MockHostState> {
        if let Some(state) = self.hosts.read().get(name) {
            return Arc::clone(state);
        }
        Arc::clone(self.hosts.write().entry(name.to_string()).or_default())
    }
}

/// Strip the single quotes `shell_quote` adds
fn unquote(s: &str) -> String {
    s.trim()
        .trim_matches('\'')
        .replace("'\\''", "'")
}

/// A scripted connection to one mock host
pub struct MockConnection {
    host: String,
    identifier: String,
    shared: Arc<MockShared>,
    state: Arc<MockHostState>,
    closed: AtomicBool,
}

impl MockConnection {
    fn builtin(&self, command: &str) -> CommandResult {
        if command == "echo pong" {
            return CommandResult::success("pong\n", "");
        }
        // read_remote: `if [ -f 'p' ]; then cat 'p'; else exit 3; fi`
        if let Some(rest) = command.strip_prefix("if [ -f ") {
            if let Some((path, _)) = rest.split_once(" ]") {
                return match self.state.files.read().get(&unquote(path)) {
                    Some(content) => {
                        CommandResult::success(String::from_utf8_lossy(content), "")
                    }
                    None => CommandResult::failure(3, "", ""),
                };
            }
        }
        CommandResult::success("", "")
    }

    async fn run(&self, command: &str, input: Option<&[u8]>, options: ExecuteOptions) -> ConnectionResult<CommandResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        let wrapped = wrap_become(command, &options.r#become)?;
        self.state.commands.write().push(ExecutedCommand {
            command: command.to_string(),
            wrapped,
            r#become: options.r#become.clone(),
        });
        self.shared
            .timeline
            .write()
            .push(format!("{}:{}", self.host, command));

        if let (Some(path), Some(bytes)) = (command.strip_prefix("cat > "), input) {
            self.state.files.write().insert(unquote(path), bytes.to_vec());
            return Ok(CommandResult::success("", ""));
        }

        let rule = self
            .shared
            .rules
            .read()
            .iter()
            .find(|r| r.matches(&self.host, command))
            .cloned();

        let running = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak.fetch_max(running, Ordering::SeqCst);

        let result = match rule {
            Some(rule) => {
                if let Some(delay) = rule.delay {
                    tokio::time::sleep(delay).await;
                }
                rule.result
            }
            None => self.builtin(command),
        };

        self.shared.running.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        self.run(command, input, options.unwrap_or_default()).await
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`MockConnection`]s and remembers what happened on each host
#[derive(Default, Clone)]
pub struct MockConnector {
    shared: Arc<MockShared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any command containing `pattern` returns `result`
    pub fn on(&self, pattern: &str, result: CommandResult) -> &Self {
        self.push_rule(None, pattern, result, None)
    }

    /// Like [`on`](Self::on) but only on `host`
    pub fn on_host(&self, host: &str, pattern: &str, result: CommandResult) -> &Self {
        self.push_rule(Some(host), pattern, result, None)
    }

    /// Commands containing `pattern` succeed after `delay`
    pub fn delay(&self, pattern: &str, delay: Duration) -> &Self {
        self.push_rule(None, pattern, CommandResult::success("", ""), Some(delay))
    }

    fn push_rule(
        &self,
        host: Option<&str>,
        pattern: &str,
        result: CommandResult,
        delay: Option<Duration>,
    ) -> &Self {
        self.shared.rules.write().push(Rule {
            host: host.map(str::to_string),
            pattern: pattern.to_string(),
            result,
            delay,
        });
        self
    }

    /// Refuse connections to `host`
    pub fn unreachable(&self, host: &str) -> &Self {
        self.shared.unreachable.write().insert(host.to_string());
        self
    }

    /// Seed a file on a host's virtual file system
    pub fn put_file(&self, host: &str, path: &str, content: &str) -> &Self {
        self.shared
            .host(host)
            .files
            .write()
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.shared
            .host(host)
            .files
            .read()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Commands run on `host`, in order
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.executed(host).into_iter().map(|c| c.command).collect()
    }

    pub fn executed(&self, host: &str) -> Vec<ExecutedCommand> {
        self.shared.host(host).commands.read().clone()
    }

    /// `host:command` entries across every host, in execution order
    pub fn timeline(&self) -> Vec<String> {
        self.shared.timeline.read().clone()
    }

    /// Channels opened to `host`
    pub fn opens(&self, host: &str) -> usize {
        self.shared.opens.read().get(host).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.shared.opens.read().values().sum()
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Highest number of commands that were running at once
    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, params: &ConnectionParams) -> ConnectionResult<Arc<dyn Connection>> {
        *self
            .shared
            .opens
            .write()
            .entry(params.host.clone())
            .or_insert(0) += 1;

        if self.shared.unreachable.read().contains(&params.host) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "ssh: connect to host {} port {}: Connection refused",
                params.address, params.port
            )));
        }

        Ok(Arc::new(MockConnection {
            host: params.host.clone(),
            identifier: format!("{}@{}:{}", params.user, params.address, params.port),
            shared: Arc::clone(&self.shared),
            state: self.shared.host(&params.host),
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// Recording Callback
// ============================================================================

/// An execution event as seen by a callback
#[derive(Debug, Clone)]
pub enum Event {
    PlaybookStart(String),
    PlayStart(String, Vec<String>),
    TaskStart(String, Vec<String>),
    HandlerStart(String, Vec<String>),
    TaskComplete(TaskResult),
    PlaybookEnd(bool),
}

/// Records every event it receives
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: RwLock<Vec<Event>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Every task result, in delivery order
    pub fn results(&self) -> Vec<TaskResult> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                Event::TaskComplete(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Results of the task named `task`
    pub fn results_for(&self, task: &str) -> Vec<TaskResult> {
        self.results().into_iter().filter(|r| r.task == task).collect()
    }

    /// The last result of `task` on `host`
    pub fn result(&self, task: &str, host: &str) -> Option<TaskResult> {
        self.results()
            .into_iter()
            .rev()
            .find(|r| r.task == task && r.host == host)
    }

    /// Names of started tasks, in order
    pub fn task_starts(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                Event::TaskStart(name, _) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Hosts each task started on, keyed by task name (last start wins)
    pub fn task_hosts(&self, task: &str) -> Option<Vec<String>> {
        self.events.read().iter().rev().find_map(|e| match e {
            Event::TaskStart(name, hosts) if name == task => Some(hosts.clone()),
            _ => None,
        })
    }

    /// Names of started handlers, in order
    pub fn handler_starts(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                Event::HandlerStart(name, _) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// `msg` values printed by `debug` on `host`, in order
    pub fn messages(&self, host: &str) -> Vec<String> {
        self.results()
            .into_iter()
            .filter(|r| r.host == host && r.module.as_deref() == Some("debug"))
            .flat_map(|r| match r.iteration_results {
                Some(items) => items,
                None => vec![r],
            })
            .filter_map(|r| r.data.get("msg").and_then(|m| m.as_str()).map(str::to_string))
            .collect()
    }

    pub fn playbook_success(&self) -> Option<bool> {
        self.events.read().iter().find_map(|e| match e {
            Event::PlaybookEnd(success) => Some(*success),
            _ => None,
        })
    }
}

#[async_trait]
impl ExecutionCallback for RecordingCallback {
    async fn on_playbook_start(&self, name: &str) {
        self.events.write().push(Event::PlaybookStart(name.to_string()));
    }

    async fn on_play_start(&self, name: &str, hosts: &[String]) {
        self.events
            .write()
            .push(Event::PlayStart(name.to_string(), hosts.to_vec()));
    }

    async fn on_task_start(&self, name: &str, hosts: &[String]) {
        self.events
            .write()
            .push(Event::TaskStart(name.to_string(), hosts.to_vec()));
    }

    async fn on_handler_start(&self, name: &str, hosts: &[String]) {
        self.events
            .write()
            .push(Event::HandlerStart(name.to_string(), hosts.to_vec()));
    }

    async fn on_task_complete(&self, result: &TaskResult) {
        self.events.write().push(Event::TaskComplete(result.clone()));
    }

    async fn on_playbook_end(&self, _stats: &Stats, success: bool) {
        self.events.write().push(Event::PlaybookEnd(success));
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Write `content` to `root/relative`, creating parent directories
pub fn write_file(root: &Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture dir");
    }
    std::fs::write(&path, content).expect("write fixture");
    path
}

/// Two web hosts and one db host, all on the mock transport
pub const WEB_DB_INVENTORY: &str = "\
[web]
web1 ansible_host=10.0.0.1
web2 ansible_host=10.0.0.2

[db]
db1 ansible_host=10.0.0.3

[all:vars]
env=test
";

/// A temporary project directory plus the mocks a run is wired to
pub struct Harness {
    pub dir: TempDir,
    pub connector: Arc<MockConnector>,
    pub callback: Arc<RecordingCallback>,
    pub config: ExecutorConfig,
    pub extra_vars: VarMap,
    inventory: String,
}

impl Harness {
    pub fn new(inventory: &str) -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
            connector: Arc::new(MockConnector::new()),
            callback: Arc::new(RecordingCallback::new()),
            config: ExecutorConfig::default(),
            extra_vars: VarMap::new(),
            inventory: inventory.to_string(),
        }
    }

    /// One host named `h1`
    pub fn single() -> Self {
        Self::new("h1 ansible_host=192.0.2.10\n")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file under the project directory
    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        write_file(self.dir.path(), relative, content)
    }

    pub fn executor(&self) -> Executor {
        let inventory = Inventory::parse(&self.inventory).expect("valid inventory");
        Executor::new(self.config.clone(), Arc::new(inventory))
            .with_connector(Arc::clone(&self.connector) as Arc<dyn Connector>)
            .with_callback(Arc::clone(&self.callback) as Arc<dyn ExecutionCallback>)
            .with_extra_vars(self.extra_vars.clone())
    }

    /// Write `playbook` as `site.yml` and run it
    pub async fn try_run(&self, playbook: &str) -> ExecutorResult<Stats> {
        let path = self.write("site.yml", playbook);
        let playbook = Playbook::load(&path).expect("valid playbook");
        self.executor().run_playbook(&playbook).await
    }

    pub async fn run(&self, playbook: &str) -> Stats {
        self.try_run(playbook).await.expect("playbook run")
    }
}
