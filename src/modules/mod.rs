//! Module system for Ansirun
//!
//! This module provides the core traits, types, and registry for the module
//! system. Modules are the building blocks that perform actual work on
//! target systems; the runner hands each one already-templated arguments and
//! an exclusive connection to the host.

pub mod command;
pub mod copy;
pub mod debug;
pub mod fail;
pub mod file;
pub mod lineinfile;
pub mod meta;
pub mod ping;
pub mod service;
pub mod set_fact;
pub mod setup;
pub mod shell;
pub mod template;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::connection::{BecomeSettings, CommandResult, Connection, ConnectionError, ExecuteOptions};
use crate::vars::{JsonValue, VarMap};

/// Errors that can occur during module execution
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("module '{0}' needs a connection to the host")]
    NoConnection(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type for module operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Classification of modules based on their execution characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModuleClassification {
    /// Runs entirely on the control node; no channel is opened.
    /// Examples: debug, set_fact, fail, meta
    LocalLogic,

    /// Modules that run commands or move files over the connection.
    /// Examples: command, copy, service
    #[default]
    RemoteCommand,
}

impl fmt::Display for ModuleClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleClassification::LocalLogic => write!(f, "local_logic"),
            ModuleClassification::RemoteCommand => write!(f, "remote_command"),
        }
    }
}

/// Result of a module execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// Whether the module changed anything
    pub changed: bool,
    /// Whether the module failed
    pub failed: bool,
    /// Human-readable message about what happened
    pub msg: String,
    /// Additional data returned by the module
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub data: VarMap,
    /// Standard output (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Standard error (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Return code (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    /// Facts to merge into the host's scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<VarMap>,
}

impl ModuleOutput {
    /// Create a new successful output with no changes
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            ..Default::default()
        }
    }

    /// Create a new successful output with changes
    pub fn changed(msg: impl Into<String>) -> Self {
        Self {
            changed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    /// Create a failed output
    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            failed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    /// Add data to the output
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Add facts to the output
    pub fn with_facts(mut self, facts: VarMap) -> Self {
        self.facts = Some(facts);
        self
    }

    /// Add stdout/stderr/rc for command outputs
    pub fn with_command_output(mut self, result: &CommandResult) -> Self {
        self.stdout = Some(result.stdout.trim_end_matches('\n').to_string());
        self.stderr = Some(result.stderr.trim_end_matches('\n').to_string());
        self.rc = Some(result.exit_code);
        self
    }

    /// The result mapping stored by `register` and printed by callbacks
    pub fn to_data(&self) -> VarMap {
        let mut data = VarMap::new();
        data.insert("changed".into(), JsonValue::Bool(self.changed));
        data.insert("failed".into(), JsonValue::Bool(self.failed));
        if !self.msg.is_empty() {
            data.insert("msg".into(), JsonValue::String(self.msg.clone()));
        }
        if let Some(rc) = self.rc {
            data.insert("rc".into(), JsonValue::from(rc));
        }
        for (key, text) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if let Some(text) = text {
                data.insert(key.into(), JsonValue::String(text.clone()));
                data.insert(
                    format!("{}_lines", key),
                    JsonValue::from(text.lines().map(str::to_string).collect::<Vec<_>>()),
                );
            }
        }
        for (key, value) in &self.data {
            data.insert(key.clone(), value.clone());
        }
        if let Some(facts) = &self.facts {
            data.insert("ansible_facts".into(), JsonValue::Object(facts.clone()));
        }
        data
    }
}

/// Parameters passed to a module
pub type ModuleParams = IndexMap<String, JsonValue>;

/// Context for module execution
#[derive(Clone)]
pub struct ModuleContext {
    /// Inventory name of the target host
    pub host: String,
    /// Connection to the host; absent for local-logic modules
    pub connection: Option<Arc<dyn Connection>>,
    /// Effective privilege escalation
    pub r#become: BecomeSettings,
    /// Timeout for each command, in seconds
    pub command_timeout: u64,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("host", &self.host)
            .field("connection", &self.connection.as_ref().map(|c| c.identifier()))
            .field("become", &self.r#become)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl ModuleContext {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connection: None,
            r#become: BecomeSettings::default(),
            command_timeout: 30,
        }
    }

    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_become(mut self, settings: BecomeSettings) -> Self {
        self.r#become = settings;
        self
    }

    pub fn with_command_timeout(mut self, secs: u64) -> Self {
        self.command_timeout = secs;
        self
    }

    /// The connection, or an error naming the module that needed it
    pub fn connection(&self, module: &str) -> ModuleResult<&dyn Connection> {
        self.connection
            .as_deref()
            .ok_or_else(|| ModuleError::NoConnection(module.to_string()))
    }

    /// Execution options carrying the context's escalation and timeout
    pub fn options(&self) -> ExecuteOptions {
        ExecuteOptions::new()
            .with_timeout(self.command_timeout)
            .with_become(self.r#become.clone())
    }

    /// Run a command with the context's escalation and timeout
    pub async fn run(&self, module: &str, command: &str) -> ModuleResult<CommandResult> {
        Ok(self
            .connection(module)?
            .execute(command, Some(self.options()))
            .await?)
    }

    /// Write a file with the context's escalation and timeout
    pub async fn put_content(&self, module: &str, content: &[u8], dest: &str) -> ModuleResult<()> {
        Ok(self
            .connection(module)?
            .put_content(content, dest, Some(self.options()))
            .await?)
    }
}

/// Trait that all modules must implement
#[async_trait]
pub trait Module: Send + Sync {
    /// Returns the name of the module
    fn name(&self) -> &'static str;

    /// Returns the classification of this module.
    ///
    /// `LocalLogic` modules run without a connection to the host.
    fn classification(&self) -> ModuleClassification {
        ModuleClassification::RemoteCommand
    }

    /// The argument a free-form `_raw_params` value is moved into
    fn free_form_arg(&self) -> Option<&'static str> {
        None
    }

    /// Execute the module with the given parameters
    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput>;

    /// Validate the parameters before execution
    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let _ = params;
        Ok(())
    }

    /// Returns the list of required parameters
    fn required_params(&self) -> &[&'static str] {
        &[]
    }
}

/// Helper trait for extracting parameters
pub trait ParamExt {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>>;
    fn get_bool_or(&self, key: &str, default: bool) -> bool;
    fn get_i64(&self, key: &str) -> ModuleResult<Option<i64>>;
    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>>;
}

impl ParamExt for ModuleParams {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            Some(JsonValue::String(s)) => Ok(Some(s.clone())),
            Some(JsonValue::Null) | None => Ok(None),
            Some(v) => Ok(Some(v.to_string())),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(v) => crate::vars::resolve::to_bool(v)
                .map(Some)
                .ok_or_else(|| ModuleError::InvalidParameter(format!("{} must be a boolean", key))),
        }
    }

    fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(default)
    }

    fn get_i64(&self, key: &str) -> ModuleResult<Option<i64>> {
        match self.get(key) {
            Some(JsonValue::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                ModuleError::InvalidParameter(format!("{} must be an integer", key))
            }),
            Some(JsonValue::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ModuleError::InvalidParameter(format!("{} must be an integer", key))),
            None | Some(JsonValue::Null) => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be an integer",
                key
            ))),
        }
    }

    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>> {
        match self.get(key) {
            Some(JsonValue::Array(arr)) => Ok(Some(
                arr.iter().map(crate::vars::resolve::to_string).collect(),
            )),
            Some(JsonValue::String(s)) => {
                Ok(Some(s.split(',').map(|s| s.trim().to_string()).collect()))
            }
            None | Some(JsonValue::Null) => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a list",
                key
            ))),
        }
    }
}

/// Modules expanded by the includer before dispatch
pub const INCLUDE_MODULES: &[&str] = &["import_tasks", "include_tasks", "import_role", "include_role"];

/// Every module name the task decoder accepts, in canonical form
pub const KNOWN_MODULES: &[&str] = &[
    "ping",
    "command",
    "shell",
    "raw",
    "copy",
    "debug",
    "set_fact",
    "fail",
    "file",
    "template",
    "lineinfile",
    "service",
    "systemd",
    "setup",
    "meta",
    "import_tasks",
    "include_tasks",
    "import_role",
    "include_role",
];

/// Strip the `ansible.builtin.` / `ansible.legacy.` prefix
pub fn canonical_name(name: &str) -> &str {
    name.strip_prefix("ansible.builtin.")
        .or_else(|| name.strip_prefix("ansible.legacy."))
        .unwrap_or(name)
}

/// Whether `name` (canonical or prefixed) is a module the decoder accepts
pub fn is_known_module(name: &str) -> bool {
    KNOWN_MODULES.contains(&canonical_name(name))
}

/// Options of command-like modules that may appear inline in the free-form string
const COMMAND_INLINE_OPTIONS: &[&str] = &["chdir", "creates", "removes", "executable", "warn"];

/// Split a free-form argument string on whitespace, keeping quoted strings
/// and `{{ }}` / `{% %}` expressions together.
pub fn split_args(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' if depth == 0 => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    _ => {}
                }
                current.push(c);
            }
            '{' if matches!(chars.peek(), Some('{') | Some('%')) => {
                depth += 1;
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '}' | '%' if depth > 0 && chars.peek() == Some(&'}') => {
                depth -= 1;
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && quote.is_none() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn split_kv(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    let mut chars = key.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some((key, value))
}

/// Parse a scalar module value (`key=value ...` or a free-form string).
///
/// Command-like modules keep the whole string as `_raw_params` except for
/// their inline options (`chdir=`, `creates=`, ...). Other modules turn
/// `key=value` tokens into arguments; a bare word after a pair continues
/// that pair's value (`msg=hello world`), and bare words before any pair
/// become `_raw_params`.
pub fn parse_kv_args(module: &str, input: &str) -> ModuleParams {
    let mut params = ModuleParams::new();
    let command_like = matches!(canonical_name(module), "command" | "shell" | "raw");
    let tokens = split_args(input);

    let mut raw = Vec::new();
    let mut last_key: Option<&str> = None;
    for token in &tokens {
        match split_kv(token) {
            Some((key, value))
                if !command_like || COMMAND_INLINE_OPTIONS.contains(&key) =>
            {
                params.insert(key.to_string(), JsonValue::String(unquote(value).to_string()));
                last_key = Some(key);
            }
            _ => match last_key.filter(|_| !command_like) {
                Some(key) => {
                    if let Some(JsonValue::String(value)) = params.get_mut(key) {
                        value.push(' ');
                        value.push_str(unquote(token));
                    }
                }
                None => raw.push(token.as_str()),
            },
        }
    }

    if !raw.is_empty() {
        let raw = if raw.len() == tokens.len() {
            input.trim().to_string()
        } else {
            raw.join(" ")
        };
        params.insert("_raw_params".to_string(), JsonValue::String(raw));
    }
    params
}

/// Registry for looking up modules by name
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Create a registry with all built-in modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // Core command modules
        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(shell::ShellModule));
        registry.register(Arc::new(shell::RawModule));
        registry.register(Arc::new(ping::PingModule));

        // File/transport modules
        registry.register(Arc::new(copy::CopyModule));
        registry.register(Arc::new(file::FileModule));
        registry.register(Arc::new(lineinfile::LineinfileModule));
        registry.register(Arc::new(template::TemplateModule));

        // System management modules
        registry.register(Arc::new(service::ServiceModule));
        registry.register(Arc::new(service::SystemdModule));
        registry.register(Arc::new(setup::SetupModule));

        // Logic/utility modules
        registry.register(Arc::new(debug::DebugModule));
        registry.register(Arc::new(fail::FailModule));
        registry.register(Arc::new(meta::MetaModule));
        registry.register(Arc::new(set_fact::SetFactModule));

        registry
    }

    /// Register a module
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Get a module by canonical or prefixed name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(canonical_name(name)).cloned()
    }

    /// Move `_raw_params` into the module's free-form slot unless the slot
    /// is already set.
    pub fn normalize(&self, name: &str, mut params: ModuleParams) -> ModuleParams {
        let slot = self.get(name).and_then(|m| m.free_form_arg());
        if let Some(slot) = slot {
            if !params.contains_key(slot) {
                if let Some(raw) = params.shift_remove("_raw_params") {
                    params.insert(slot.to_string(), raw);
                }
            }
        }
        params
    }

    /// Execute a module by name
    pub async fn execute(
        &self,
        name: &str,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let module = self
            .get(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        module.validate_params(params)?;

        for param in module.required_params() {
            if !params.contains_key(*param) {
                return Err(ModuleError::MissingParameter((*param).to_string()));
            }
        }

        module.execute(params, context).await
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestModule;

    #[async_trait]
    impl Module for TestModule {
        fn name(&self) -> &'static str {
            "test"
        }


        fn free_form_arg(&self) -> Option<&'static str> {
            Some("msg")
        }

        async fn execute(
            &self,
            params: &ModuleParams,
            _context: &ModuleContext,
        ) -> ModuleResult<ModuleOutput> {
            let msg = params
                .get_string("msg")?
                .unwrap_or_else(|| "Hello".to_string());
            Ok(ModuleOutput::changed(msg))
        }

        fn required_params(&self) -> &[&'static str] {
            &["msg"]
        }
    }

    #[test]
    fn test_module_registry() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(TestModule));

        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.get("test").unwrap().name(), "test");
    }

    #[test]
    fn test_builtins_cover_known_modules() {
        let registry = ModuleRegistry::with_builtins();
        for name in KNOWN_MODULES {
            assert!(
                registry.get(name).is_some() || INCLUDE_MODULES.contains(name),
                "{} is not registered",
                name
            );
        }
        assert!(registry.get("ansible.builtin.shell").is_some());
    }

    #[test]
    fn test_normalize_and_execute() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(TestModule));

        let params = registry.normalize("test", parse_kv_args("test", "hello there"));
        assert_eq!(params["msg"], json!("hello there"));

        let output = tokio_test::block_on(registry.execute("test", &params, &ModuleContext::new("h")))
            .unwrap();
        assert!(output.changed);
        assert_eq!(output.msg, "hello there");

        let missing = tokio_test::block_on(registry.execute(
            "test",
            &ModuleParams::new(),
            &ModuleContext::new("h"),
        ));
        assert!(matches!(missing, Err(ModuleError::MissingParameter(_))));
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("ansible.builtin.copy"), "copy");
        assert_eq!(canonical_name("ansible.legacy.shell"), "shell");
        assert_eq!(canonical_name("debug"), "debug");
        assert!(is_known_module("ansible.builtin.include_role"));
        assert!(!is_known_module("apt"));
    }

    #[test]
    fn test_split_args() {
        assert_eq!(
            split_args(r#"msg="hello world" var={{ a | default('x y') }}"#),
            vec![r#"msg="hello world""#, "var={{ a | default('x y') }}"]
        );
    }

    #[test]
    fn test_parse_kv_args() {
        let params = parse_kv_args("copy", "dest=/tmp/x content='a b' mode=0644");
        assert_eq!(params["dest"], json!("/tmp/x"));
        assert_eq!(params["content"], json!("a b"));
        assert_eq!(params["mode"], json!("0644"));

        let params = parse_kv_args("debug", "hello world");
        assert_eq!(params["_raw_params"], json!("hello world"));

        let params = parse_kv_args("debug", "msg=hello big world");
        assert_eq!(params["msg"], json!("hello big world"));
        assert!(!params.contains_key("_raw_params"));

        let params = parse_kv_args("fail", "msg=disk full on '/var' host=db1");
        assert_eq!(params["msg"], json!("disk full on /var"));
        assert_eq!(params["host"], json!("db1"));

        let params = parse_kv_args("shell", "chdir=/srv echo a=b | tee out");
        assert_eq!(params["chdir"], json!("/srv"));
        assert_eq!(params["_raw_params"], json!("echo a=b | tee out"));
    }

    #[test]
    fn test_output_data() {
        let result = CommandResult::failure(2, "a\nb\n", "");
        let data = ModuleOutput::failed("non-zero return code")
            .with_command_output(&result)
            .to_data();
        assert_eq!(data["rc"], json!(2));
        assert_eq!(data["stdout"], json!("a\nb"));
        assert_eq!(data["stdout_lines"], json!(["a", "b"]));
        assert_eq!(data["failed"], json!(true));
    }
}
