//! Core execution engine for Ansirun
//!
//! This module runs plays:
//! - Resolves the play's hosts and expands roles and includes
//! - Runs each task on every active host in parallel (bounded by `forks`),
//!   waiting for all hosts before the next task starts
//! - Drops hosts after a non-ignored failure
//! - Handles block/rescue/always, handler notification and flushing
//! - Keeps the per-host statistics shown in the recap

mod block;
pub(crate) mod dispatch;
pub mod stats;
pub mod task;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

use crate::callback::{ExecutionCallback, NullCallback};
use crate::config::SshConfig;
use crate::connection::{Connector, DefaultConnector};
use crate::handlers::{self, NotifiedHandlers};
use crate::include::{IncludeError, TaskIncluder};
use crate::inventory::{Inventory, InventoryError};
use crate::modules::{ModuleParams, ModuleRegistry};
use crate::playbook::{BecomeSpec, Handler, Play, Playbook, Task, TaskAction};
use crate::template::{TemplateEngine, TemplateError};
use crate::vars::{merge_into, VarMap, VariableScope};

use dispatch::{Dispatcher, HostRun};
pub use stats::{HostStats, Stats};
pub use task::{FailureKind, TaskResult};

/// Errors that abort a run before or between tasks.
///
/// Failures on a host are never returned here; they become that host's
/// [`TaskResult`].
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Include(#[from] IncludeError),

    #[error("cannot render hosts pattern: {0}")]
    Template(#[from] TemplateError),
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Settings of the play runner
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hosts running a task at once; 0 means all active hosts
    pub forks: usize,
    /// Seconds a module may run on one host
    pub task_timeout: u64,
    /// Seconds a single remote command may run
    pub command_timeout: u64,
    /// Gather facts for plays that do not say
    pub gather_facts: bool,
    /// Keep facts and registered results from one play to the next
    pub carry_registered_vars: bool,
    pub ssh: SshConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            forks: 0,
            task_timeout: 300,
            command_timeout: 30,
            gather_facts: false,
            carry_registered_vars: true,
            ssh: SshConfig::default(),
        }
    }
}

/// State of the play being run, shared by every host worker
pub(crate) struct PlayContext {
    pub scope: Arc<VariableScope>,
    pub notified: NotifiedHandlers,
    pub handlers: Vec<Handler>,
    pub r#become: BecomeSpec,
    pub stats: Arc<Mutex<Stats>>,
    pub playbook_dir: PathBuf,
}

/// Settings a task inherits from its enclosing blocks
#[derive(Debug, Clone, Default)]
pub(crate) struct Inherited {
    pub r#become: BecomeSpec,
    pub ignore_errors: bool,
    /// A rescue section will settle failures
    pub rescuable: bool,
}

/// The play runner
pub struct Executor {
    config: ExecutorConfig,
    inventory: Arc<Inventory>,
    registry: Arc<ModuleRegistry>,
    connector: Arc<dyn Connector>,
    templates: Arc<TemplateEngine>,
    callback: Arc<dyn ExecutionCallback>,
    extra_vars: VarMap,
}

impl Executor {
    pub fn new(config: ExecutorConfig, inventory: Arc<Inventory>) -> Self {
        Self {
            config,
            inventory,
            registry: Arc::new(ModuleRegistry::with_builtins()),
            connector: Arc::new(DefaultConnector),
            templates: Arc::new(TemplateEngine::new()),
            callback: Arc::new(NullCallback),
            extra_vars: VarMap::new(),
        }
    }

    /// Use another transport (tests inject mock channels here)
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn ExecutionCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Variables given on the command line; they override every other layer
    pub fn with_extra_vars(mut self, vars: VarMap) -> Self {
        self.extra_vars = vars;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run every play of a playbook in order and return the recap
    #[instrument(skip_all, fields(plays = playbook.plays.len()))]
    pub async fn run_playbook(&self, playbook: &Playbook) -> ExecutorResult<Stats> {
        let name = playbook
            .path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.callback.on_playbook_start(&name).await;

        let scope = Arc::new(VariableScope::new(
            Arc::clone(&self.inventory),
            self.extra_vars.clone(),
        ));
        let stats = Arc::new(Mutex::new(Stats::new()));
        let dispatcher = Arc::new(Dispatcher {
            registry: Arc::clone(&self.registry),
            connector: Arc::clone(&self.connector),
            templates: Arc::clone(&self.templates),
            config: self.config.clone(),
        });
        let dir = playbook.dir();

        for play in &playbook.plays {
            self.run_play(play, &scope, &stats, &dispatcher, &dir).await?;
        }

        let stats = stats.lock().clone();
        let success = stats.is_success();
        info!(success, "Playbook finished");
        self.callback.on_playbook_end(&stats, success).await;
        Ok(stats)
    }

    /// Run one module against a host pattern, outside any playbook file
    pub async fn run_adhoc(
        &self,
        pattern: &str,
        module: &str,
        args: ModuleParams,
        r#become: BecomeSpec,
    ) -> ExecutorResult<Stats> {
        let mut play = Play::new("Ansirun Ad-Hoc", pattern);
        play.gather_facts = Some(false);
        play.r#become = r#become;
        play.tasks.push(Task::module(module, module, args));

        let playbook = Playbook {
            path: None,
            plays: vec![play],
        };
        self.run_playbook(&playbook).await
    }

    #[instrument(skip_all, fields(play = %play.display_name()))]
    async fn run_play(
        &self,
        play: &Play,
        scope: &Arc<VariableScope>,
        stats: &Arc<Mutex<Stats>>,
        dispatcher: &Arc<Dispatcher>,
        dir: &Path,
    ) -> ExecutorResult<()> {
        let mut context = play.vars.clone();
        merge_into(&mut context, &self.extra_vars);

        let pattern = self.templates.render_string(&play.hosts, &context)?;
        let hosts: Vec<String> = self
            .inventory
            .resolve(&pattern)?
            .into_iter()
            .map(|h| h.name.clone())
            .collect();
        info!(hosts = hosts.len(), "Starting play");
        self.callback.on_play_start(play.display_name(), &hosts).await;

        let expanded = TaskIncluder::new(dir, &self.templates).expand_play(play, &context)?;

        scope.begin_play(
            expanded.vars,
            Some(dir.to_path_buf()),
            self.config.carry_registered_vars,
        );
        scope.set_active_hosts(hosts.clone());
        {
            let mut stats = stats.lock();
            for host in &hosts {
                stats.track(host);
            }
        }

        let mut tasks = Vec::with_capacity(expanded.tasks.len() + 1);
        if play.gather_facts.unwrap_or(self.config.gather_facts) {
            tasks.push(Task::module("Gathering Facts", "setup", ModuleParams::new()));
        }
        tasks.extend(expanded.tasks);

        let runner = PlayRunner {
            dispatcher: Arc::clone(dispatcher),
            callback: Arc::clone(&self.callback),
            play: Arc::new(PlayContext {
                scope: Arc::clone(scope),
                notified: NotifiedHandlers::new(),
                handlers: expanded.handlers,
                r#become: play.r#become.clone(),
                stats: Arc::clone(stats),
                playbook_dir: dir.to_path_buf(),
            }),
        };

        let failures = runner
            .run_list(&tasks, hosts.clone(), &Inherited::default(), true)
            .await;
        let live: Vec<String> = hosts
            .into_iter()
            .filter(|h| !failures.contains_key(h))
            .collect();

        let handler_failures = runner.flush_handlers(&live).await;
        if !handler_failures.is_empty() {
            scope.set_active_hosts(
                live.into_iter()
                    .filter(|h| !handler_failures.contains_key(h))
                    .collect(),
            );
        }
        runner.play.notified.clear();
        Ok(())
    }
}

/// Runs the task lists of one play
pub(crate) struct PlayRunner {
    dispatcher: Arc<Dispatcher>,
    callback: Arc<dyn ExecutionCallback>,
    play: Arc<PlayContext>,
}

/// Hosts that dropped out of a task list, with the result that dropped them
pub(crate) type Failures = IndexMap<String, TaskResult>;

impl PlayRunner {
    /// Run `tasks` in order on `hosts`, each task a barrier for all hosts.
    ///
    /// With `top_level` the play's active host list follows the dropouts.
    pub(crate) fn run_list<'a>(
        &'a self,
        tasks: &'a [Task],
        hosts: Vec<String>,
        inherited: &'a Inherited,
        top_level: bool,
    ) -> BoxFuture<'a, Failures> {
        async move {
            let mut live = hosts;
            let mut failures = Failures::new();

            for task in tasks {
                if live.is_empty() {
                    debug!("No hosts left, ending task list");
                    break;
                }

                let dropped = if task.is_flush_handlers() {
                    self.flush_handlers(&live).await
                } else {
                    match &task.action {
                        TaskAction::Block { .. } => self.run_block(task, &live, inherited).await,
                        TaskAction::Module { .. } => {
                            self.callback
                                .on_task_start(&task.display_name(), &live)
                                .await;
                            self.run_on_hosts(task, &live, inherited, false)
                                .await
                                .into_iter()
                                .filter(TaskResult::is_fatal)
                                .map(|r| (r.host.clone(), r))
                                .collect()
                        }
                    }
                };

                if !dropped.is_empty() {
                    live.retain(|h| !dropped.contains_key(h));
                    if top_level {
                        self.play.scope.set_active_hosts(live.clone());
                    }
                    failures.extend(dropped);
                }
            }

            failures
        }
        .boxed()
    }

    /// Run one task on `hosts` concurrently and report the results in host
    /// order once every worker has finished.
    async fn run_on_hosts(
        &self,
        task: &Task,
        hosts: &[String],
        inherited: &Inherited,
        handler_mode: bool,
    ) -> Vec<TaskResult> {
        let forks = match self.dispatcher.config.forks {
            0 => hosts.len().max(1),
            n => n,
        };
        let semaphore = Arc::new(Semaphore::new(forks));
        let shared_task = Arc::new(task.clone());
        let hostvars = self.play.scope.hostvars();

        let handles: Vec<_> = hosts
            .iter()
            .map(|host| {
                let run = HostRun {
                    dispatcher: Arc::clone(&self.dispatcher),
                    play: Arc::clone(&self.play),
                    task: Arc::clone(&shared_task),
                    host: host.clone(),
                    hostvars: Arc::clone(&hostvars),
                    inherited: inherited.clone(),
                    handler_mode,
                };
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    run.run().await
                })
            })
            .collect();

        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(hosts.len());
        for (host, outcome) in hosts.iter().zip(joined) {
            let result = outcome.unwrap_or_else(|e| {
                error!(host = %host, error = %e, "Host worker aborted");
                TaskResult::failure(
                    host,
                    &task.display_name(),
                    FailureKind::ModuleFailed,
                    format!("host worker aborted: {}", e),
                )
            });
            self.play.stats.lock().record(&result, inherited.rescuable);
            self.callback.on_task_complete(&result).await;
            results.push(result);
        }
        results
    }

    /// Run pending handlers on `hosts` in declaration order
    async fn flush_handlers(&self, hosts: &[String]) -> Failures {
        let mut failures = Failures::new();
        if self.play.notified.is_empty() {
            return failures;
        }
        let notified = self.play.notified.drain();

        for (handler, targets) in handlers::schedule(&self.play.handlers, &notified, hosts) {
            let targets: Vec<String> = targets
                .into_iter()
                .filter(|h| !failures.contains_key(h))
                .collect();
            if targets.is_empty() {
                continue;
            }

            info!(handler = %handler.task.name, hosts = targets.len(), "Running handler");
            self.callback
                .on_handler_start(&handler.task.display_name(), &targets)
                .await;
            for result in self
                .run_on_hosts(&handler.task, &targets, &Inherited::default(), true)
                .await
            {
                if result.is_fatal() {
                    failures.insert(result.host.clone(), result);
                }
            }
        }
        failures
    }
}
