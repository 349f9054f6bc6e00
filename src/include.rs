//! Task inclusion and role expansion
//!
//! Before a play runs, its role references and every `import_tasks`,
//! `include_tasks`, `import_role` and `include_role` task are expanded into a
//! flat task list. Expansion is static and recursive: an included file may
//! include further files, and blocks are expanded in place.
//!
//! Loading a role also feeds its variables and handlers into the play:
//! role defaults only fill keys the play does not set, role vars overwrite,
//! and caller-supplied vars overwrite role vars.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::modules::ParamExt;
use crate::playbook::{self, Handler, Play, PlaybookError, Task, TaskAction};
use crate::roles::{self, Role, RoleError};
use crate::template::{TemplateEngine, TemplateError};
use crate::vars::{fill_absent, merge_into, JsonValue, VarMap};

/// Nesting limit for includes; deeper chains are treated as a cycle
const MAX_INCLUDE_DEPTH: usize = 32;

/// Errors raised while expanding includes
#[derive(Error, Debug)]
pub enum IncludeError {
    #[error("could not find task file '{file}' (searched in {})", .base.display())]
    NotFound { file: String, base: PathBuf },

    #[error("{module} in task '{task}' needs a file or role name")]
    MissingTarget { module: String, task: String },

    #[error("{module} in task '{task}' cannot loop")]
    Loop { module: String, task: String },

    #[error("includes nested deeper than {MAX_INCLUDE_DEPTH} levels at '{0}'")]
    TooDeep(String),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    Playbook(#[from] PlaybookError),

    #[error("include target: {0}")]
    Template(#[from] TemplateError),
}

/// Result type for include expansion
pub type IncludeResult<T> = Result<T, IncludeError>;

/// A play after role loading and include expansion
#[derive(Debug, Clone, Default)]
pub struct ExpandedPlay {
    /// Flat task list (blocks keep their nested lists, also expanded)
    pub tasks: Vec<Task>,
    /// Role handlers first, then the play's own, in declaration order
    pub handlers: Vec<Handler>,
    /// Play vars with role defaults and vars merged in
    pub vars: VarMap,
}

/// Expands includes and roles against a playbook directory
pub struct TaskIncluder<'a> {
    playbook_dir: PathBuf,
    templates: &'a TemplateEngine,
}

impl<'a> TaskIncluder<'a> {
    pub fn new(playbook_dir: impl Into<PathBuf>, templates: &'a TemplateEngine) -> Self {
        Self {
            playbook_dir: playbook_dir.into(),
            templates,
        }
    }

    /// Load the play's roles and expand every include in its task list.
    ///
    /// Role and include targets may be templated against `context`, the
    /// variables known before any host runs.
    pub fn expand_play(&self, play: &Play, context: &VarMap) -> IncludeResult<ExpandedPlay> {
        let mut out = ExpandedPlay {
            vars: play.vars.clone(),
            ..Default::default()
        };

        for file in &play.vars_files {
            let file = self.templates.render_string(file, context)?;
            let path = self.locate(&file, &self.playbook_dir)?;
            debug!(file = %path.display(), "Loading vars file");
            let vars = playbook::read_yaml::<Option<VarMap>>(&path)?.unwrap_or_default();
            merge_into(&mut out.vars, &vars);
        }

        for role_ref in &play.roles {
            let role = Role::load(&role_ref.name, &self.playbook_dir, role_ref.tasks_from.as_deref())?;
            let tasks = self.apply_role(role, &role_ref.vars, &role_ref.when, &mut out, context, 0)?;
            out.tasks.extend(tasks);
        }

        let tasks = self.expand(&play.tasks, &self.playbook_dir, &mut out, context, 0)?;
        out.tasks.extend(tasks);
        out.handlers.extend(play.handlers.iter().cloned());
        Ok(out)
    }

    /// Expand a task list whose relative include paths resolve against `base`
    pub fn expand(
        &self,
        tasks: &[Task],
        base: &Path,
        out: &mut ExpandedPlay,
        context: &VarMap,
        depth: usize,
    ) -> IncludeResult<Vec<Task>> {
        let mut expanded = Vec::with_capacity(tasks.len());

        for task in tasks {
            match &task.action {
                TaskAction::Block {
                    block,
                    rescue,
                    always,
                } => {
                    let mut task = task.clone();
                    task.action = TaskAction::Block {
                        block: self.expand(block, base, out, context, depth)?,
                        rescue: self.expand(rescue, base, out, context, depth)?,
                        always: self.expand(always, base, out, context, depth)?,
                    };
                    expanded.push(task);
                }
                TaskAction::Module { name, args } => match name.as_str() {
                    "import_tasks" | "include_tasks" => {
                        self.guard(task, name, depth)?;
                        let file = self.target(task, name, args, &["file"], context)?;
                        expanded.extend(self.include_file(task, &file, base, out, context, depth)?);
                    }
                    "import_role" | "include_role" => {
                        self.guard(task, name, depth)?;
                        let role_name = self.target(task, name, args, &["name", "role"], context)?;
                        let tasks_from = args
                            .get_string("tasks_from")
                            .ok()
                            .flatten();
                        let vars = match args.get("vars") {
                            Some(JsonValue::Object(map)) => map.clone(),
                            _ => VarMap::new(),
                        };
                        let role = Role::load(&role_name, &self.playbook_dir, tasks_from.as_deref())?;
                        let mut tasks = self.apply_role(role, &vars, &task.when, out, context, depth + 1)?;
                        for included in &mut tasks {
                            inherit(included, task);
                        }
                        expanded.extend(tasks);
                    }
                    _ => expanded.push(task.clone()),
                },
            }
        }

        Ok(expanded)
    }

    fn guard(&self, task: &Task, module: &str, depth: usize) -> IncludeResult<()> {
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(IncludeError::TooDeep(task.display_name()));
        }
        if task.loop_spec.is_some() {
            return Err(IncludeError::Loop {
                module: module.to_string(),
                task: task.display_name(),
            });
        }
        Ok(())
    }

    /// The file or role an include points at (`_raw_params` or a named key)
    fn target(
        &self,
        task: &Task,
        module: &str,
        args: &crate::modules::ModuleParams,
        keys: &[&str],
        context: &VarMap,
    ) -> IncludeResult<String> {
        let raw = std::iter::once("_raw_params")
            .chain(keys.iter().copied())
            .find_map(|key| args.get(key).and_then(|v| v.as_str()))
            .ok_or_else(|| IncludeError::MissingTarget {
                module: module.to_string(),
                task: task.display_name(),
            })?;
        Ok(self.templates.render_string(raw.trim(), context)?)
    }

    fn include_file(
        &self,
        parent: &Task,
        file: &str,
        base: &Path,
        out: &mut ExpandedPlay,
        context: &VarMap,
        depth: usize,
    ) -> IncludeResult<Vec<Task>> {
        let path = self.locate(file, base)?;
        debug!(file = %path.display(), "Including tasks");

        let content = std::fs::read_to_string(&path).map_err(|source| PlaybookError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let tasks = playbook::parse_tasks(&content, &path.display().to_string())?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| base.to_path_buf());

        let mut tasks = self.expand(&tasks, &dir, out, context, depth + 1)?;
        for task in &mut tasks {
            inherit(task, parent);
        }
        Ok(tasks)
    }

    /// Resolve an include path against `base`, then the playbook directory
    fn locate(&self, file: &str, base: &Path) -> IncludeResult<PathBuf> {
        let path = Path::new(file);
        if path.is_absolute() {
            return match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
                (Some(dir), Some(name)) => roles::find_yaml(dir, name),
                _ => None,
            }
            .ok_or_else(|| IncludeError::NotFound {
                file: file.to_string(),
                base: base.to_path_buf(),
            });
        }

        [base, self.playbook_dir.as_path()]
            .iter()
            .find_map(|dir| roles::find_yaml(dir, file))
            .ok_or_else(|| IncludeError::NotFound {
                file: file.to_string(),
                base: base.to_path_buf(),
            })
    }

    /// Merge a role into the play and return its expanded tasks
    fn apply_role(
        &self,
        role: Role,
        caller_vars: &VarMap,
        when: &[String],
        out: &mut ExpandedPlay,
        context: &VarMap,
        depth: usize,
    ) -> IncludeResult<Vec<Task>> {
        fill_absent(&mut out.vars, &role.defaults);
        merge_into(&mut out.vars, &role.vars);
        merge_into(&mut out.vars, caller_vars);
        out.handlers.extend(role.handlers.iter().cloned());

        let mut tasks = self.expand(&role.tasks, &role.tasks_dir(), out, context, depth)?;
        if !when.is_empty() {
            for task in &mut tasks {
                let mut conditions = when.to_vec();
                conditions.append(&mut task.when);
                task.when = conditions;
            }
        }
        Ok(tasks)
    }
}

/// Included tasks take the include's conditions, become and role
fn inherit(task: &mut Task, parent: &Task) {
    if !parent.when.is_empty() {
        let mut conditions = parent.when.clone();
        conditions.append(&mut task.when);
        task.when = conditions;
    }
    task.r#become = task.r#become.overlay(&parent.r#become);
    if let Some(origin) = &parent.role {
        task.set_role(origin);
    }
}
