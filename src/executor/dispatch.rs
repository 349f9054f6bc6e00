//! Per-host task dispatch
//!
//! A [`HostRun`] executes one task on one host: it evaluates `when`,
//! expands the loop, renders arguments, opens the host's channel when the
//! module needs one, runs the module under the task timeout and applies
//! `changed_when` / `failed_when`, `register`, facts and notifications.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::task::{FailureKind, TaskResult};
use super::{ExecutorConfig, Inherited, PlayContext};
use crate::connection::{Connection, ConnectionError, ConnectionParams, Connector};
use crate::modules::debug::VAR_VALUE_KEY;
use crate::modules::template::RENDERED_CONTENT_KEY;
use crate::modules::{
    ModuleClassification, ModuleContext, ModuleError, ModuleParams, ModuleRegistry,
    INCLUDE_MODULES,
};
use crate::playbook::{BecomeSpec, LoopDefinition, Task, TaskAction, TaskLoop};
use crate::template::{TemplateEngine, TemplateError};
use crate::vars::{resolve, JsonValue, VarMap};

/// Escalation methods the connection layer can wrap commands with
const BECOME_METHODS: &[&str] = &["sudo", "su"];

/// Shared services every host worker needs
pub(crate) struct Dispatcher {
    pub registry: Arc<ModuleRegistry>,
    pub connector: Arc<dyn Connector>,
    pub templates: Arc<TemplateEngine>,
    pub config: ExecutorConfig,
}

/// One task on one host
pub(crate) struct HostRun {
    pub dispatcher: Arc<Dispatcher>,
    pub play: Arc<PlayContext>,
    pub task: Arc<Task>,
    pub host: String,
    /// Every host's variables as of the start of the task
    pub hostvars: Arc<VarMap>,
    pub inherited: Inherited,
    /// Handlers never notify
    pub handler_mode: bool,
}

impl HostRun {
    #[instrument(skip(self), fields(host = %self.host, task = %self.task.name))]
    pub async fn run(self) -> TaskResult {
        let ctx = self.play.scope.context_with(&self.host, &self.hostvars);

        let result = match &self.task.loop_spec {
            Some(spec) => self.run_loop(&ctx, spec).await,
            None => {
                let result = self.run_once(&ctx).await;
                self.apply_facts(&result);
                result
            }
        };

        self.register(&result);
        self.notify(&result, &ctx);
        result
    }

    async fn run_loop(&self, base: &VarMap, spec: &TaskLoop) -> TaskResult {
        let templates = &self.dispatcher.templates;
        let mut ctx = base.clone();
        let name = self.task.display_name();
        let module = self.task.module_name().unwrap_or_default().to_string();

        let items = match &spec.items {
            LoopDefinition::Items(items) => items
                .iter()
                .map(|item| templates.render_json(item, &ctx))
                .collect::<Result<Vec<_>, _>>(),
            LoopDefinition::Expression(expr) => {
                templates
                    .render_value(expr, &ctx)
                    .and_then(|value| match value {
                        JsonValue::Array(items) => Ok(items),
                        other => Err(TemplateError::Conversion(format!(
                            "loop expects a list, got {}",
                            other
                        ))),
                    })
            }
        };
        let items = match items {
            Ok(items) => items,
            Err(e) => {
                return TaskResult::failure(&self.host, &name, FailureKind::TemplateError, e.to_string())
            }
        };

        let control = &spec.control;
        let mut iterations = Vec::with_capacity(items.len());
        let count = items.len();

        for (index, item) in items.into_iter().enumerate() {
            let mut iter_ctx = ctx.clone();
            iter_ctx.insert(control.loop_var.clone(), item.clone());
            iter_ctx.insert(
                "ansible_loop_var".to_string(),
                JsonValue::String(control.loop_var.clone()),
            );
            if let Some(index_var) = &control.index_var {
                iter_ctx.insert(index_var.clone(), JsonValue::from(index));
                iter_ctx.insert(
                    "ansible_index_var".to_string(),
                    JsonValue::String(index_var.clone()),
                );
            }

            let mut result = self.run_once(&iter_ctx).await;

            let label = match &control.label {
                Some(label) => templates
                    .render_string(label, &iter_ctx)
                    .unwrap_or_else(|_| label.clone()),
                None => resolve::to_string(&item),
            };
            result.data.insert(control.loop_var.clone(), item.clone());
            result.data.insert(
                "ansible_loop_var".to_string(),
                JsonValue::String(control.loop_var.clone()),
            );
            result.item = Some(item);
            result.label = Some(label);
            result.module.get_or_insert_with(|| module.clone());

            if self.apply_facts(&result) {
                ctx = self.play.scope.context_with(&self.host, &self.hostvars);
            }

            let unreachable = result.unreachable;
            iterations.push(result);
            if unreachable {
                debug!(host = %self.host, "Host unreachable, stopping loop");
                break;
            }

            if let Some(pause) = control.pause.filter(|p| *p > 0.0) {
                if index + 1 < count {
                    tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                }
            }
        }

        TaskResult::aggregate(&self.host, &name, &module, iterations)
    }

    /// Run the module once against a fully built context
    async fn run_once(&self, ctx: &VarMap) -> TaskResult {
        let name = self.task.display_name();
        let fail = |kind, msg: String| self.settle(TaskResult::failure(&self.host, &name, kind, msg));
        let templates = &self.dispatcher.templates;

        match templates.evaluate_all(&self.task.when, ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(host = %self.host, task = %name, "Conditional was false, skipping");
                return TaskResult::skipped(&self.host, &name);
            }
            Err(e) => return fail(FailureKind::TemplateError, e.to_string()),
        }

        let (module_name, raw_args) = match &self.task.action {
            TaskAction::Module { name, args } => (name.as_str(), args),
            TaskAction::Block { .. } => {
                return fail(
                    FailureKind::ConfigError,
                    "a block cannot be dispatched to a module".to_string(),
                )
            }
        };

        if INCLUDE_MODULES.contains(&module_name) {
            return fail(
                FailureKind::ConfigError,
                format!("'{}' must be expanded before the play runs", module_name),
            );
        }

        let registry = &self.dispatcher.registry;
        let Some(module) = registry.get(module_name) else {
            return fail(
                FailureKind::ConfigError,
                format!("The module '{}' was not found", module_name),
            );
        };

        let args = match templates.render_args(raw_args, ctx) {
            Ok(args) => registry.normalize(module_name, args),
            Err(e) => return fail(FailureKind::TemplateError, e.to_string()),
        };
        let args = match self.prepare_args(module_name, args, ctx).await {
            Ok(args) => args,
            Err(result) => return result,
        };

        let local = module.classification() == ModuleClassification::LocalLogic;
        let become_settings = self
            .task
            .r#become
            .overlay(&self.inherited.r#become)
            .overlay(&self.play.r#become)
            .overlay(&BecomeSpec::from_host_vars(ctx))
            .settings();
        if !local && become_settings.enabled && !BECOME_METHODS.contains(&become_settings.method.as_str()) {
            return fail(
                FailureKind::ConfigError,
                format!("Become method '{}' is not supported", become_settings.method),
            );
        }

        let mut module_ctx = ModuleContext::new(self.host.clone())
            .with_become(become_settings)
            .with_command_timeout(self.dispatcher.config.command_timeout);

        let connection = if local {
            None
        } else {
            match self.connect(ctx).await {
                Ok(connection) => Some(connection),
                Err(e) => {
                    warn!(host = %self.host, error = %e, "Host unreachable");
                    return fail(FailureKind::Unreachable, e.to_string());
                }
            }
        };
        if let Some(connection) = &connection {
            module_ctx = module_ctx.with_connection(Arc::clone(connection));
        }

        let execution = registry.execute(module_name, &args, &module_ctx);
        let outcome = match self.dispatcher.config.task_timeout {
            0 => Some(execution.await),
            secs => tokio::time::timeout(Duration::from_secs(secs), execution)
                .await
                .ok(),
        };

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(host = %self.host, error = %e, "Error closing connection");
            }
        }

        let mut result = match outcome {
            None => {
                return fail(
                    FailureKind::Timeout,
                    format!(
                        "Task timed out after {} seconds",
                        self.dispatcher.config.task_timeout
                    ),
                )
            }
            Some(Err(e)) => {
                let kind = classify(&e);
                if kind.is_unreachable() {
                    warn!(host = %self.host, error = %e, "Host unreachable");
                }
                return fail(kind, e.to_string());
            }
            Some(Ok(output)) => TaskResult::from_output(&self.host, &name, module_name, &output),
        };

        if let Err(e) = self.apply_overrides(&mut result, ctx) {
            return fail(FailureKind::TemplateError, e.to_string());
        }
        self.settle(result)
    }

    /// Mark a failure as ignored when `ignore_errors` applies
    fn settle(&self, mut result: TaskResult) -> TaskResult {
        let ignore = self.task.ignore_errors || self.inherited.ignore_errors;
        if result.failed && !result.unreachable && ignore {
            result.ignored = true;
        }
        result
    }

    /// `changed_when` first, then `failed_when`, both seeing the result
    fn apply_overrides(&self, result: &mut TaskResult, ctx: &VarMap) -> Result<(), TemplateError> {
        if self.task.changed_when.is_empty() && self.task.failed_when.is_empty() {
            return Ok(());
        }

        let templates = &self.dispatcher.templates;
        let mut eval_ctx = ctx.clone();
        for key in ["rc", "stdout", "stderr", "stdout_lines", "stderr_lines", "msg"] {
            if let Some(value) = result.data.get(key) {
                eval_ctx.insert(key.to_string(), value.clone());
            }
        }
        let expose = |eval_ctx: &mut VarMap, result: &TaskResult| {
            eval_ctx.insert("changed".to_string(), JsonValue::Bool(result.changed));
            eval_ctx.insert("failed".to_string(), JsonValue::Bool(result.failed));
            if let Some(register) = &self.task.register {
                eval_ctx.insert(register.clone(), JsonValue::Object(result.data.clone()));
            }
        };

        if !self.task.changed_when.is_empty() {
            expose(&mut eval_ctx, result);
            let changed = templates.evaluate_all(&self.task.changed_when, &eval_ctx)?;
            result.set_changed(changed);
        }

        if !self.task.failed_when.is_empty() {
            expose(&mut eval_ctx, result);
            let failed = templates.evaluate_all(&self.task.failed_when, &eval_ctx)?;
            let msg = (failed && !result.failed)
                .then(|| "Failed as requested from task".to_string());
            result.set_failed(failed, msg);
        }
        Ok(())
    }

    /// Module-specific argument preparation done on the control node
    async fn prepare_args(
        &self,
        module: &str,
        mut args: ModuleParams,
        ctx: &VarMap,
    ) -> Result<ModuleParams, TaskResult> {
        let name = self.task.display_name();
        match module {
            "debug" => {
                if let Some(var) = args.get("var").and_then(JsonValue::as_str) {
                    let var = var.trim().to_string();
                    let value = if resolve::is_bare_path(&var) {
                        resolve::resolve_path(ctx, &var).cloned()
                    } else {
                        self.dispatcher
                            .templates
                            .render_value(&format!("{{{{ {} }}}}", var), ctx)
                            .ok()
                    };
                    if let Some(value) = value {
                        args.insert(VAR_VALUE_KEY.to_string(), value);
                    }
                }
            }
            "template" => {
                if let Some(src) = args.get("src").and_then(JsonValue::as_str) {
                    let path = self.locate(src, "templates");
                    let source = tokio::fs::read_to_string(&path).await.map_err(|e| {
                        TaskResult::failure(
                            &self.host,
                            &name,
                            FailureKind::ModuleFailed,
                            format!("Could not find or access '{}': {}", src, e),
                        )
                    })?;
                    let rendered = self
                        .dispatcher
                        .templates
                        .render_string(&source, ctx)
                        .map_err(|e| {
                            TaskResult::failure(
                                &self.host,
                                &name,
                                FailureKind::TemplateError,
                                e.to_string(),
                            )
                        })?;
                    args.insert(RENDERED_CONTENT_KEY.to_string(), JsonValue::String(rendered));
                }
            }
            "copy" => {
                if let Some(src) = args.get("src").and_then(JsonValue::as_str) {
                    let path = self.locate(src, "files");
                    args.insert(
                        "src".to_string(),
                        JsonValue::String(path.display().to_string()),
                    );
                }
            }
            _ => {}
        }
        Ok(args)
    }

    /// Find a control-node file: the role's `subdir`, the playbook's
    /// `subdir`, the playbook directory, then the path as written.
    fn locate(&self, src: &str, subdir: &str) -> PathBuf {
        let written = PathBuf::from(src);
        if written.is_absolute() {
            return written;
        }

        let mut candidates = Vec::new();
        if let Some(role) = &self.task.role {
            candidates.push(role.path.join(subdir).join(src));
        }
        let dir: &Path = &self.play.playbook_dir;
        candidates.push(dir.join(subdir).join(src));
        candidates.push(dir.join(src));

        candidates
            .into_iter()
            .find(|p| p.is_file())
            .unwrap_or(written)
    }

    async fn connect(&self, ctx: &VarMap) -> Result<Arc<dyn Connection>, ConnectionError> {
        let params = ConnectionParams::from_vars(&self.host, ctx, &self.dispatcher.config.ssh);
        self.dispatcher.connector.connect(&params).await
    }

    /// Merge returned facts into the host's scope; true when any were set
    fn apply_facts(&self, result: &TaskResult) -> bool {
        if result.failed {
            return false;
        }
        match result.facts() {
            Some(facts) if !facts.is_empty() => {
                self.play.scope.set_all(&self.host, facts);
                true
            }
            _ => false,
        }
    }

    fn register(&self, result: &TaskResult) {
        let Some(name) = &self.task.register else {
            return;
        };
        if result.failed {
            debug!(host = %self.host, var = %name, "Task failed, not registering");
            return;
        }
        debug!(host = %self.host, var = %name, "Registering result");
        self.play
            .scope
            .set(&self.host, name.clone(), JsonValue::Object(result.data.clone()));
    }

    fn notify(&self, result: &TaskResult, ctx: &VarMap) {
        if self.handler_mode || !result.changed || result.failed {
            return;
        }
        for name in &self.task.notify {
            let name = self
                .dispatcher
                .templates
                .render_string(name, ctx)
                .unwrap_or_else(|_| name.clone());
            self.play.notified.notify(&self.host, &name);
        }
    }
}

/// Map a module error to the failure kind it represents
fn classify(err: &ModuleError) -> FailureKind {
    match err {
        ModuleError::Connection(ConnectionError::Timeout(_)) => FailureKind::Timeout,
        ModuleError::Connection(ConnectionError::UnsupportedBecomeMethod(_)) => {
            FailureKind::ConfigError
        }
        ModuleError::Connection(e) if e.is_unreachable() => FailureKind::Unreachable,
        ModuleError::NotFound(_)
        | ModuleError::InvalidParameter(_)
        | ModuleError::MissingParameter(_)
        | ModuleError::Unsupported(_)
        | ModuleError::NoConnection(_) => FailureKind::ConfigError,
        _ => FailureKind::ModuleFailed,
    }
}
