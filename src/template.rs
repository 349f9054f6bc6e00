//! Template gateway for Ansirun.
//!
//! Every string that reaches a module, a condition or a loop goes through a
//! single shared [`TemplateEngine`]. It wraps a `minijinja` environment with
//! strict undefined handling and the Ansible filters playbooks commonly use:
//!
//! | kind | names |
//! |---|---|
//! | filters | `to_json`, `to_nice_json`, `from_json`, `to_yaml`, `bool`, `regex_replace`, `regex_search`, `basename`, `dirname`, `b64encode`, `b64decode`, `mandatory`, `ternary`, `quote`, `combine` |
//! | tests | `succeeded`, `success`, `failed`, `changed`, `skipped`, `match`, `search` |
//! | globals | `lookup('file', path)`, `lookup('env', name)` |
//!
//! Booleans print as `true` / `false` (JSON spelling, not Python's `True`),
//! so `"{{ x is defined }}"` and `{{ flag }}` inside text agree with the
//! values a registered result holds.
//!
//! The environment is `Send + Sync`; renders from concurrent host workers
//! need no extra locking.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use indexmap::IndexMap;
use minijinja::value::{Kwargs, Rest, ValueKind};
use minijinja::{Environment, Error, ErrorKind, Output, State, UndefinedBehavior, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;

use crate::vars::{resolve, JsonValue, VarMap};

/// Errors raised while rendering templates
#[derive(Debug, ThisError)]
pub enum TemplateError {
    #[error("template error while rendering '{template}': {source}")]
    Render {
        template: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("'{0}' is undefined")]
    Undefined(String),

    #[error("failed to convert template result: {0}")]
    Conversion(String),
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Shared template engine
#[derive(Debug)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create the engine with Ansible-compatible settings and plugins
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_keep_trailing_newline(true);
        env.set_formatter(format_value);

        register_filters(&mut env);
        register_tests(&mut env);
        env.add_function("lookup", lookup);

        Self { env }
    }

    /// Whether `s` contains template delimiters
    pub fn is_template(s: &str) -> bool {
        s.contains("{{") || s.contains("{%")
    }

    /// Render a template to text.
    ///
    /// Strings without delimiters are returned unchanged.
    pub fn render_string(&self, template: &str, ctx: &VarMap) -> TemplateResult<String> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }

        self.env
            .render_str(template, ctx)
            .map_err(|source| TemplateError::Render {
                template: template.to_string(),
                source,
            })
    }

    /// Render a template string keeping the native type of a lone expression.
    ///
    /// `"{{ packages }}"` yields the list itself and `"{{ acc + [item] }}"`
    /// yields the concatenated list; anything else renders to text.
    pub fn render_value(&self, template: &str, ctx: &VarMap) -> TemplateResult<JsonValue> {
        let Some(expr) = single_expression(template) else {
            return self.render_string(template, ctx).map(JsonValue::String);
        };

        if resolve::is_bare_path(expr) {
            return resolve::resolve_path(ctx, expr)
                .cloned()
                .ok_or_else(|| TemplateError::Undefined(expr.to_string()));
        }

        let render_err = |source| TemplateError::Render {
            template: template.to_string(),
            source,
        };
        let compiled = self.env.compile_expression(expr).map_err(render_err)?;
        let value = compiled.eval(ctx).map_err(render_err)?;
        if value.is_undefined() {
            return Err(TemplateError::Undefined(expr.to_string()));
        }

        serde_json::to_value(&value).map_err(|e| TemplateError::Conversion(e.to_string()))
    }

    /// Render every string leaf of a value
    pub fn render_json(&self, value: &JsonValue, ctx: &VarMap) -> TemplateResult<JsonValue> {
        match value {
            JsonValue::String(s) => self.render_value(s, ctx),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.render_json(item, ctx))
                .collect::<TemplateResult<Vec<_>>>()
                .map(JsonValue::Array),
            JsonValue::Object(map) => {
                let mut out = VarMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.render_json(item, ctx)?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Render module arguments; non-string leaves pass through
    pub fn render_args(
        &self,
        args: &IndexMap<String, JsonValue>,
        ctx: &VarMap,
    ) -> TemplateResult<IndexMap<String, JsonValue>> {
        args.iter()
            .map(|(key, value)| Ok((key.clone(), self.render_json(value, ctx)?)))
            .collect()
    }

    /// Evaluate a conditional expression; an empty expression is true
    pub fn evaluate_condition(&self, expression: &str, ctx: &VarMap) -> TemplateResult<bool> {
        let expression = expression.trim();
        let expression = single_expression(expression).unwrap_or(expression);
        if expression.is_empty() {
            return Ok(true);
        }

        let test = format!("{{% if {} %}}true{{% else %}}false{{% endif %}}", expression);
        let rendered = self
            .env
            .render_str(&test, ctx)
            .map_err(|source| TemplateError::Render {
                template: expression.to_string(),
                source,
            })?;
        Ok(rendered.trim() == "true")
    }

    /// Evaluate a list of conditions joined with `and`
    pub fn evaluate_all(&self, conditions: &[String], ctx: &VarMap) -> TemplateResult<bool> {
        for condition in conditions {
            if !self.evaluate_condition(condition, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// The inner expression of a string that is exactly one `{{ ... }}`
fn single_expression(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, msg.into())
}

/// Default formatting, except booleans in their JSON spelling
fn format_value(out: &mut Output<'_>, state: &State<'_, '_>, value: &Value) -> Result<(), Error> {
    if value.kind() == ValueKind::Bool {
        let text = if value.is_true() { "true" } else { "false" };
        return out
            .write_str(text)
            .map_err(|e| Error::new(ErrorKind::WriteFailure, e.to_string()));
    }
    minijinja::escape_formatter(out, state, value)
}

fn to_json_value(value: &Value) -> Result<JsonValue, Error> {
    serde_json::to_value(value).map_err(|e| invalid(e.to_string()))
}

fn register_filters(env: &mut Environment<'static>) {
    env.add_filter("to_json", |v: Value| -> Result<String, Error> {
        serde_json::to_string(&to_json_value(&v)?).map_err(|e| invalid(e.to_string()))
    });
    env.add_filter("to_nice_json", |v: Value| -> Result<String, Error> {
        let json = to_json_value(&v)?;
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(&json, &mut ser).map_err(|e| invalid(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| invalid(e.to_string()))
    });
    env.add_filter("from_json", |s: String| -> Result<Value, Error> {
        let json: JsonValue = serde_json::from_str(&s).map_err(|e| invalid(e.to_string()))?;
        Ok(Value::from_serialize(&json))
    });
    env.add_filter("to_yaml", |v: Value| -> Result<String, Error> {
        serde_yaml::to_string(&to_json_value(&v)?).map_err(|e| invalid(e.to_string()))
    });
    env.add_filter("bool", |v: Value| -> bool {
        resolve::to_bool(&serde_json::to_value(&v).unwrap_or(JsonValue::Null)).unwrap_or(false)
    });

    env.add_filter("regex_replace", regex_replace);
    env.add_filter("regex_search", regex_search);

    env.add_filter("basename", |path: String| {
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    env.add_filter("dirname", |path: String| {
        Path::new(&path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    env.add_filter("b64encode", |s: String| STANDARD.encode(s.as_bytes()));
    env.add_filter("b64decode", |s: String| -> Result<String, Error> {
        let bytes = STANDARD
            .decode(s.trim().as_bytes())
            .map_err(|e| invalid(format!("b64decode: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| invalid(format!("b64decode: {}", e)))
    });

    env.add_filter("mandatory", |v: Value, msg: Option<String>| -> Result<Value, Error> {
        if v.is_undefined() {
            return Err(Error::new(
                ErrorKind::UndefinedError,
                msg.unwrap_or_else(|| "Mandatory variable not defined.".to_string()),
            ));
        }
        Ok(v)
    });
    env.add_filter("ternary", |v: Value, yes: Value, no: Value| {
        if v.is_true() {
            yes
        } else {
            no
        }
    });
    env.add_filter("quote", |s: String| shell_words::quote(&s).into_owned());
    env.add_filter("combine", combine);
}

/// Python-style backreferences: `\1` becomes `${1}`
static BACKREFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(\d+)").expect("valid backreference regex"));

fn regex_replace(
    input: String,
    pattern: String,
    replacement: Option<String>,
) -> Result<String, Error> {
    let re = Regex::new(&pattern).map_err(|e| invalid(format!("regex_replace: {}", e)))?;
    let replacement = replacement.unwrap_or_default();
    let replacement = BACKREFERENCE.replace_all(&replacement, "$${$1}");
    Ok(re.replace_all(&input, replacement.as_ref()).into_owned())
}

fn regex_search(input: String, pattern: String) -> Result<Value, Error> {
    let re = Regex::new(&pattern).map_err(|e| invalid(format!("regex_search: {}", e)))?;
    Ok(re
        .find(&input)
        .map(|m| Value::from(m.as_str()))
        .unwrap_or_else(|| Value::from(())))
}

fn combine(base: Value, others: Rest<Value>, kwargs: Kwargs) -> Result<Value, Error> {
    let recursive = kwargs.get::<Option<bool>>("recursive")?.unwrap_or(false);
    kwargs.assert_all_used()?;

    let mut merged = to_json_value(&base)?;
    for other in others.iter() {
        let other = to_json_value(other)?;
        merge_json(&mut merged, other, recursive);
    }
    Ok(Value::from_serialize(&merged))
}

fn merge_json(base: &mut JsonValue, other: JsonValue, recursive: bool) {
    match (base, other) {
        (JsonValue::Object(base), JsonValue::Object(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) if recursive && existing.is_object() && value.is_object() => {
                        merge_json(existing, value, true);
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}

fn result_flag(v: &Value, key: &str) -> bool {
    v.get_attr(key).map(|flag| flag.is_true()).unwrap_or(false)
}

fn register_tests(env: &mut Environment<'static>) {
    env.add_test("succeeded", |v: Value| !result_flag(&v, "failed"));
    env.add_test("success", |v: Value| !result_flag(&v, "failed"));
    env.add_test("failed", |v: Value| result_flag(&v, "failed"));
    env.add_test("changed", |v: Value| result_flag(&v, "changed"));
    env.add_test("skipped", |v: Value| result_flag(&v, "skipped"));
    env.add_test("match", |s: String, pattern: String| -> Result<bool, Error> {
        let re = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| invalid(e.to_string()))?;
        Ok(re.is_match(&s))
    });
    env.add_test("search", |s: String, pattern: String| -> Result<bool, Error> {
        let re = Regex::new(&pattern).map_err(|e| invalid(e.to_string()))?;
        Ok(re.is_match(&s))
    });
}

/// `lookup('file', path)` and `lookup('env', name)`
fn lookup(state: &State, plugin: String, arg: String) -> Result<Value, Error> {
    match plugin.as_str() {
        "env" => Ok(Value::from(std::env::var(&arg).unwrap_or_default())),
        "file" => {
            let mut path = PathBuf::from(&arg);
            if path.is_relative() {
                if let Some(dir) = state.lookup("playbook_dir").and_then(|d| d.as_str().map(PathBuf::from)) {
                    path = dir.join(path);
                }
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| invalid(format!("lookup('file', '{}'): {}", arg, e)))?;
            Ok(Value::from(content.trim_end_matches('\n').to_string()))
        }
        other => Err(invalid(format!("lookup plugin '{}' is not supported", other))),
    }
}
