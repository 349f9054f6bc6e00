//! Playbook model and YAML decoder
//!
//! A playbook is a YAML sequence of plays. Tasks use the free-form module
//! key convention: besides the reserved task keywords, a task mapping holds
//! exactly one key naming a module, whose value is either a mapping of
//! arguments or a scalar (`key=value` pairs or free-form text).
//!
//! Decoding happens in two steps: serde reads the raw `*Definition`
//! structures, then [`Play::from_definition`] / [`Task::from_definition`]
//! validate them into the typed model the runner executes.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::connection::BecomeSettings;
use crate::modules::{self, ModuleParams};
use crate::vars::{resolve, JsonValue, VarMap};

/// Errors raised while reading or decoding playbooks and task files
#[derive(Error, Debug)]
pub enum PlaybookError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no module found in task: {0}")]
    NoModule(String),

    #[error("conflicting action statements in task '{task}': {first}, {second}")]
    ConflictingActions {
        task: String,
        first: String,
        second: String,
    },

    #[error("'{key}' is not a valid attribute or module for task '{task}'")]
    UnknownKeyword { task: String, key: String },

    #[error("invalid task '{task}': {message}")]
    InvalidTask { task: String, message: String },
}

/// Result type for playbook decoding
pub type PlaybookResult<T> = Result<T, PlaybookError>;

/// Read a YAML file into `T`, attributing errors to `path`
pub(crate) fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> PlaybookResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| PlaybookError::Read {
        path: path.display().to_string(),
        source,
    })?;
    from_yaml(&content, &path.display().to_string())
}

fn from_yaml<T: serde::de::DeserializeOwned>(content: &str, source: &str) -> PlaybookResult<T> {
    serde_yaml::from_str(content).map_err(|source_err| PlaybookError::Yaml {
        path: source.to_string(),
        source: source_err,
    })
}

// ---------------------------------------------------------------------------
// serde helpers
// ---------------------------------------------------------------------------

/// Helper function to deserialize optional flexible booleans (yes/no/true/false/1/0)
fn deserialize_option_flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => resolve::to_bool(&value)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid boolean value: {}", value))),
    }
}

fn deserialize_flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_option_flexible_bool(deserializer)?.unwrap_or(false))
}

/// A string or a list of strings
fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        Single(String),
        List(Vec<String>),
    }

    Ok(match Option::<StringOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrList::Single(s)) => vec![s],
        Some(StringOrList::List(list)) => list,
    })
}

/// A condition: a bare expression, a boolean, or a list of them (AND-ed)
fn deserialize_conditions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let condition = |value: &JsonValue| match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("invalid condition: {}", other))),
    };

    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items.iter().map(condition).collect(),
        Some(value) => Ok(vec![condition(&value)?]),
    }
}

fn default_loop_var() -> String {
    "item".to_string()
}

// ---------------------------------------------------------------------------
// raw definitions
// ---------------------------------------------------------------------------

/// Raw play definition from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct PlayDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub hosts: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_option_flexible_bool")]
    pub gather_facts: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_option_flexible_bool")]
    pub r#become: Option<bool>,
    #[serde(default)]
    pub become_user: Option<String>,
    #[serde(default)]
    pub become_method: Option<String>,
    #[serde(default)]
    pub vars: VarMap,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub vars_files: Vec<String>,
    #[serde(default)]
    pub roles: Vec<RoleDefinition>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub handlers: Vec<TaskDefinition>,
    /// Keys this runner does not understand; reported, then ignored
    #[serde(flatten)]
    pub extra: IndexMap<String, JsonValue>,
}

/// Role reference in a play's `roles:` list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RoleDefinition {
    /// Simple role name
    Name(String),
    /// Role with parameters; unknown keys become role variables
    Full {
        #[serde(alias = "name")]
        role: String,
        #[serde(default)]
        vars: VarMap,
        #[serde(default)]
        tasks_from: Option<String>,
        #[serde(default, deserialize_with = "deserialize_conditions")]
        when: Vec<String>,
        #[serde(flatten)]
        params: VarMap,
    },
}

/// Task (or handler) definition from YAML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_conditions")]
    pub when: Vec<String>,
    #[serde(default)]
    pub register: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub notify: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub listen: Vec<String>,
    #[serde(default, rename = "loop", alias = "with_items", alias = "with_list")]
    pub loop_items: Option<LoopDefinition>,
    #[serde(default)]
    pub loop_control: Option<LoopControl>,
    #[serde(default)]
    pub block: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    pub rescue: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    pub always: Option<Vec<TaskDefinition>>,
    #[serde(default, deserialize_with = "deserialize_option_flexible_bool")]
    pub r#become: Option<bool>,
    #[serde(default)]
    pub become_user: Option<String>,
    #[serde(default)]
    pub become_method: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flexible_bool")]
    pub ignore_errors: bool,
    #[serde(default, deserialize_with = "deserialize_conditions")]
    pub failed_when: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_conditions")]
    pub changed_when: Vec<String>,
    /// Accepted for compatibility; tasks are never selected by tag
    #[serde(default, deserialize_with = "deserialize_string_list")]
    pub tags: Vec<String>,
    /// Extra module arguments merged under the inline ones
    #[serde(default)]
    pub args: Option<VarMap>,
    /// Module name and args (catch-all for module: args format)
    #[serde(flatten)]
    pub module: IndexMap<String, JsonValue>,
}

/// Loop value: a literal list or a template expression yielding one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopDefinition {
    Items(Vec<JsonValue>),
    Expression(String),
}

/// Loop control options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopControl {
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
    #[serde(default)]
    pub index_var: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Seconds to wait between iterations
    #[serde(default)]
    pub pause: Option<f64>,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            loop_var: default_loop_var(),
            index_var: None,
            label: None,
            pause: None,
        }
    }
}

// ---------------------------------------------------------------------------
// typed model
// ---------------------------------------------------------------------------

/// Privilege escalation as written on a play, block or task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BecomeSpec {
    pub enabled: Option<bool>,
    pub user: Option<String>,
    pub method: Option<String>,
}

impl BecomeSpec {
    /// Fields set on `self` win over those of `outer`
    pub fn overlay(&self, outer: &BecomeSpec) -> BecomeSpec {
        BecomeSpec {
            enabled: self.enabled.or(outer.enabled),
            user: self.user.clone().or_else(|| outer.user.clone()),
            method: self.method.clone().or_else(|| outer.method.clone()),
        }
    }

    /// Play-level defaults taken from `ansible_become*` host variables
    pub fn from_host_vars(vars: &VarMap) -> BecomeSpec {
        let string = |key: &str| vars.get(key).filter(|v| !v.is_null()).map(resolve::to_string);
        BecomeSpec {
            enabled: vars.get("ansible_become").and_then(resolve::to_bool),
            user: string("ansible_become_user"),
            method: string("ansible_become_method"),
        }
    }

    /// The settings handed to the connection
    pub fn settings(&self) -> BecomeSettings {
        let defaults = BecomeSettings::default();
        BecomeSettings {
            enabled: self.enabled.unwrap_or(false),
            user: self.user.clone().unwrap_or(defaults.user),
            method: self.method.clone().unwrap_or(defaults.method),
        }
    }
}

/// What a task does
#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// Invoke a module
    Module { name: String, args: ModuleParams },
    /// Run nested task lists with rescue/always semantics
    Block {
        block: Vec<Task>,
        rescue: Vec<Task>,
        always: Vec<Task>,
    },
}

/// How a task loops
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLoop {
    pub items: LoopDefinition,
    pub control: LoopControl,
}

/// A decoded task
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub action: TaskAction,
    pub when: Vec<String>,
    pub failed_when: Vec<String>,
    pub changed_when: Vec<String>,
    pub ignore_errors: bool,
    pub register: Option<String>,
    pub notify: Vec<String>,
    pub loop_spec: Option<TaskLoop>,
    pub r#become: BecomeSpec,
    /// Role the task came from, used for display and file lookups
    pub role: Option<RoleOrigin>,
}

/// The role a task was loaded from
#[derive(Debug, Clone, PartialEq)]
pub struct RoleOrigin {
    pub name: String,
    pub path: PathBuf,
}

/// Reserved task keys that are never module names
pub const TASK_KEYWORDS: &[&str] = &[
    "name",
    "when",
    "register",
    "loop",
    "loop_control",
    "notify",
    "block",
    "rescue",
    "always",
    "become",
    "become_user",
    "become_method",
    "ignore_errors",
    "failed_when",
    "changed_when",
    "tags",
    "args",
];

/// Where a task definition appears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Task,
    Handler,
}

fn module_params(module: &str, value: &JsonValue) -> ModuleParams {
    match value {
        JsonValue::Null => ModuleParams::new(),
        JsonValue::String(s) => modules::parse_kv_args(module, s),
        JsonValue::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        other => {
            let mut params = ModuleParams::new();
            params.insert("_raw_params".to_string(), other.clone());
            params
        }
    }
}

impl Task {
    /// Create a module task with defaults for everything else
    pub fn module(name: impl Into<String>, module: impl Into<String>, args: ModuleParams) -> Self {
        Self {
            name: name.into(),
            action: TaskAction::Module {
                name: module.into(),
                args,
            },
            when: Vec::new(),
            failed_when: Vec::new(),
            changed_when: Vec::new(),
            ignore_errors: false,
            register: None,
            notify: Vec::new(),
            loop_spec: None,
            r#become: BecomeSpec::default(),
            role: None,
        }
    }

    /// Validate a raw definition into a task
    pub fn from_definition(def: TaskDefinition, kind: TaskKind) -> PlaybookResult<Self> {
        let label = def.name.clone().unwrap_or_default();
        let invalid = |message: &str| PlaybookError::InvalidTask {
            task: label.clone(),
            message: message.to_string(),
        };

        if kind == TaskKind::Task && !def.listen.is_empty() {
            return Err(PlaybookError::UnknownKeyword {
                task: label,
                key: "listen".to_string(),
            });
        }

        let mut module: Option<(String, String, JsonValue)> = None;
        for (key, value) in def.module {
            if !modules::is_known_module(&key) {
                return Err(PlaybookError::UnknownKeyword { task: label, key });
            }
            if let Some((first, _, _)) = &module {
                return Err(PlaybookError::ConflictingActions {
                    task: label,
                    first: first.clone(),
                    second: key,
                });
            }
            module = Some((key.clone(), modules::canonical_name(&key).to_string(), value));
        }

        let action = match (def.block, module) {
            (Some(_), Some((written, _, _))) => {
                return Err(PlaybookError::ConflictingActions {
                    task: label,
                    first: "block".to_string(),
                    second: written,
                })
            }
            (Some(block), None) => {
                if kind == TaskKind::Handler {
                    return Err(invalid("handlers cannot be blocks"));
                }
                if def.loop_items.is_some() {
                    return Err(invalid("blocks cannot loop"));
                }
                let decode = |tasks: Option<Vec<TaskDefinition>>| -> PlaybookResult<Vec<Task>> {
                    tasks
                        .unwrap_or_default()
                        .into_iter()
                        .map(|t| Task::from_definition(t, TaskKind::Task))
                        .collect()
                };
                TaskAction::Block {
                    block: decode(Some(block))?,
                    rescue: decode(def.rescue)?,
                    always: decode(def.always)?,
                }
            }
            (None, Some((_, canonical, value))) => {
                if def.rescue.is_some() || def.always.is_some() {
                    return Err(invalid("rescue/always require a block"));
                }
                let mut args = ModuleParams::new();
                if let Some(extra) = def.args {
                    args.extend(extra);
                }
                args.extend(module_params(&canonical, &value));
                TaskAction::Module {
                    name: canonical,
                    args,
                }
            }
            (None, None) => return Err(PlaybookError::NoModule(label)),
        };

        let loop_spec = match def.loop_items {
            Some(_) if kind == TaskKind::Handler => {
                return Err(invalid("handlers cannot loop"));
            }
            Some(items) => Some(TaskLoop {
                items,
                control: def.loop_control.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Task {
            name: label,
            action,
            when: def.when,
            failed_when: def.failed_when,
            changed_when: def.changed_when,
            ignore_errors: def.ignore_errors,
            register: def.register,
            notify: def.notify,
            loop_spec,
            r#become: BecomeSpec {
                enabled: def.r#become,
                user: def.become_user,
                method: def.become_method,
            },
            role: None,
        })
    }

    /// The canonical module name, or `None` for blocks
    pub fn module_name(&self) -> Option<&str> {
        match &self.action {
            TaskAction::Module { name, .. } => Some(name),
            TaskAction::Block { .. } => None,
        }
    }

    /// The name printed in task banners
    pub fn display_name(&self) -> String {
        let base = if self.name.is_empty() {
            self.module_name().unwrap_or("block").to_string()
        } else {
            self.name.clone()
        };
        match &self.role {
            Some(role) => format!("{} : {}", role.name, base),
            None => base,
        }
    }

    /// Whether this is `meta: flush_handlers`
    pub fn is_flush_handlers(&self) -> bool {
        match &self.action {
            TaskAction::Module { name, args } if name == "meta" => args
                .get("_raw_params")
                .or_else(|| args.get("action"))
                .and_then(|v| v.as_str())
                == Some("flush_handlers"),
            _ => false,
        }
    }

    /// Attach a role origin to this task and every nested task
    pub fn set_role(&mut self, origin: &RoleOrigin) {
        if self.role.is_none() {
            self.role = Some(origin.clone());
        }
        if let TaskAction::Block {
            block,
            rescue,
            always,
        } = &mut self.action
        {
            for task in block.iter_mut().chain(rescue).chain(always) {
                task.set_role(origin);
            }
        }
    }
}

/// A handler: a task that runs only when notified
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub task: Task,
    /// Extra notification topics
    pub listen: Vec<String>,
}

impl Handler {
    pub fn from_definition(mut def: TaskDefinition) -> PlaybookResult<Self> {
        let listen = std::mem::take(&mut def.listen);
        Ok(Self {
            task: Task::from_definition(def, TaskKind::Handler)?,
            listen,
        })
    }

    /// Whether a notification names this handler or one of its topics
    pub fn answers(&self, notification: &str) -> bool {
        self.task.name == notification || self.listen.iter().any(|l| l == notification)
    }
}

/// A role reference on a play
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRef {
    pub name: String,
    /// Caller-supplied variables; override role vars
    pub vars: VarMap,
    pub tasks_from: Option<String>,
    /// Conditions added to every task of the role
    pub when: Vec<String>,
}

impl From<RoleDefinition> for RoleRef {
    fn from(def: RoleDefinition) -> Self {
        match def {
            RoleDefinition::Name(name) => RoleRef {
                name,
                vars: VarMap::new(),
                tasks_from: None,
                when: Vec::new(),
            },
            RoleDefinition::Full {
                role,
                vars,
                tasks_from,
                when,
                mut params,
            } => {
                // `tags` and `become` are keywords, not parameters
                params.remove("tags");
                params.remove("become");
                crate::vars::merge_into(&mut params, &vars);
                RoleRef {
                    name: role,
                    vars: params,
                    tasks_from,
                    when,
                }
            }
        }
    }
}

/// A play within a playbook
#[derive(Debug, Clone, PartialEq)]
pub struct Play {
    pub name: String,
    /// Host pattern (list entries joined with `,`)
    pub hosts: String,
    /// `None` when the play does not say; the runner's default applies
    pub gather_facts: Option<bool>,
    pub vars: VarMap,
    /// YAML files whose variables are laid over `vars`
    pub vars_files: Vec<String>,
    pub roles: Vec<RoleRef>,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    pub r#become: BecomeSpec,
}

impl Play {
    /// Create an empty play
    pub fn new(name: impl Into<String>, hosts: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: hosts.into(),
            gather_facts: None,
            vars: VarMap::new(),
            vars_files: Vec::new(),
            roles: Vec::new(),
            tasks: Vec::new(),
            handlers: Vec::new(),
            r#become: BecomeSpec::default(),
        }
    }

    pub fn from_definition(def: PlayDefinition) -> PlaybookResult<Self> {
        for key in def.extra.keys() {
            warn!(play = %def.name, key = %key, "Ignoring unsupported play keyword");
        }

        if def.hosts.is_empty() {
            return Err(PlaybookError::InvalidTask {
                task: def.name,
                message: "play has no 'hosts'".to_string(),
            });
        }

        Ok(Self {
            hosts: def.hosts.join(","),
            gather_facts: def.gather_facts,
            vars: def.vars,
            vars_files: def.vars_files,
            roles: def.roles.into_iter().map(RoleRef::from).collect(),
            tasks: def
                .tasks
                .into_iter()
                .map(|t| Task::from_definition(t, TaskKind::Task))
                .collect::<PlaybookResult<_>>()?,
            handlers: def
                .handlers
                .into_iter()
                .map(Handler::from_definition)
                .collect::<PlaybookResult<_>>()?,
            r#become: BecomeSpec {
                enabled: def.r#become,
                user: def.become_user,
                method: def.become_method,
            },
            name: def.name,
        })
    }

    /// The name printed in the play banner
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.hosts
        } else {
            &self.name
        }
    }
}

/// A complete playbook containing multiple plays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playbook {
    /// Path to the playbook file
    pub path: Option<PathBuf>,
    /// Plays in this playbook
    pub plays: Vec<Play>,
}

impl Playbook {
    /// Load a playbook from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> PlaybookResult<Self> {
        let path = path.as_ref();
        let definitions: Vec<PlayDefinition> = read_yaml(path)?;
        Self::from_definitions(definitions, Some(path.to_path_buf()))
    }

    /// Parse a playbook from YAML content
    pub fn parse(content: &str, path: Option<PathBuf>) -> PlaybookResult<Self> {
        let source = path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<playbook>".to_string());
        let definitions: Vec<PlayDefinition> = from_yaml(content, &source)?;
        Self::from_definitions(definitions, path)
    }

    fn from_definitions(definitions: Vec<PlayDefinition>, path: Option<PathBuf>) -> PlaybookResult<Self> {
        Ok(Self {
            plays: definitions
                .into_iter()
                .map(Play::from_definition)
                .collect::<PlaybookResult<_>>()?,
            path,
        })
    }

    /// Directory relative paths are resolved against
    pub fn dir(&self) -> PathBuf {
        self.path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Decode a task file (a YAML list of tasks)
pub fn parse_tasks(content: &str, source: &str) -> PlaybookResult<Vec<Task>> {
    let definitions: Option<Vec<TaskDefinition>> = from_yaml(content, source)?;
    definitions
        .unwrap_or_default()
        .into_iter()
        .map(|t| Task::from_definition(t, TaskKind::Task))
        .collect()
}

/// Decode a handler file (a YAML list of handlers)
pub fn parse_handlers(content: &str, source: &str) -> PlaybookResult<Vec<Handler>> {
    let definitions: Option<Vec<TaskDefinition>> = from_yaml(content, source)?;
    definitions
        .unwrap_or_default()
        .into_iter()
        .map(Handler::from_definition)
        .collect()
}
