//! File module - File/directory state management
//!
//! This module manages file and directory state including creation, deletion,
//! permissions, ownership, and symbolic links. Everything happens through
//! shell commands on the host, so the same code serves ssh and local hosts.

use async_trait::async_trait;

use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams,
    ModuleResult, ParamExt,
};
use crate::connection::shell_quote;
use crate::vars::JsonValue;

/// Desired state for a file/directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// File should exist
    File,
    /// Directory should exist
    Directory,
    /// Symbolic link should exist
    Link,
    /// Path should not exist
    Absent,
    /// Create if missing and update the timestamps
    Touch,
}

impl FileState {
    fn parse(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "file" => Ok(FileState::File),
            "directory" | "dir" => Ok(FileState::Directory),
            "link" | "symlink" => Ok(FileState::Link),
            "absent" => Ok(FileState::Absent),
            "touch" => Ok(FileState::Touch),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: file, directory, link, absent, touch",
                s
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FileState::File => "file",
            FileState::Directory => "directory",
            FileState::Link => "link",
            FileState::Absent => "absent",
            FileState::Touch => "touch",
        }
    }
}

/// Normalize an octal mode (`0644`, `644`, `"0o755"`) to the form `stat -c %a` prints
fn normalize_mode(mode: &str) -> String {
    let digits = mode.trim().trim_start_matches("0o");
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        "0".to_string()
    } else {
        digits.to_string()
    }
}

fn is_octal(mode: &str) -> bool {
    let mode = mode.trim().trim_start_matches("0o");
    !mode.is_empty() && mode.chars().all(|c| ('0'..='7').contains(&c))
}

/// What kind of object is at `path`: `file`, `directory`, `link` or `absent`
pub(crate) async fn remote_state(
    module: &str,
    context: &ModuleContext,
    path: &str,
) -> ModuleResult<&'static str> {
    let q = shell_quote(path);
    let lookup = format!(
        "if [ -L {q} ]; then echo link; elif [ -d {q} ]; then echo directory; \
         elif [ -e {q} ]; then echo file; else echo absent; fi"
    );
    let result = context.run(module, &lookup).await?;
    Ok(match result.stdout.trim() {
        "link" => "link",
        "directory" => "directory",
        "file" => "file",
        _ => "absent",
    })
}

async fn run_checked(module: &str, context: &ModuleContext, command: &str) -> ModuleResult<String> {
    let result = context.run(module, command).await?;
    if result.success {
        Ok(result.stdout.trim().to_string())
    } else {
        Err(ModuleError::ExecutionFailed(format!(
            "'{}' failed: {}",
            command,
            result.stderr.trim()
        )))
    }
}

/// Apply `mode`, `owner` and `group` to `path`; returns whether anything changed
pub(crate) async fn apply_attributes(
    module: &str,
    context: &ModuleContext,
    path: &str,
    params: &ModuleParams,
    recurse: bool,
) -> ModuleResult<bool> {
    let q = shell_quote(path);
    let flag = if recurse { "-R " } else { "" };
    let mut changed = false;

    if let Some(mode) = params.get_string("mode")? {
        let before = run_checked(module, context, &format!("stat -c %a {}", q)).await?;
        let wanted = is_octal(&mode).then(|| normalize_mode(&mode));
        if wanted.as_deref() != Some(before.as_str()) || recurse {
            let arg = wanted.unwrap_or_else(|| mode.clone());
            run_checked(module, context, &format!("chmod {}{} {}", flag, shell_quote(&arg), q)).await?;
            let after = run_checked(module, context, &format!("stat -c %a {}", q)).await?;
            changed |= after != before;
        }
    }

    for (param, format, tool) in [("owner", "%U", "chown"), ("group", "%G", "chgrp")] {
        if let Some(wanted) = params.get_string(param)? {
            let current = run_checked(module, context, &format!("stat -c {} {}", format, q)).await?;
            if current != wanted {
                run_checked(
                    module,
                    context,
                    &format!("{} {}{} {}", tool, flag, shell_quote(&wanted), q),
                )
                .await?;
                changed = true;
            }
        }
    }

    Ok(changed)
}

/// Module for file/directory management
pub struct FileModule;

impl FileModule {
    async fn ensure(
        &self,
        state: FileState,
        path: &str,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let name = self.name();
        let q = shell_quote(path);
        let current = remote_state(name, context, path).await?;

        let changed = match state {
            FileState::Absent => {
                if current == "absent" {
                    false
                } else {
                    run_checked(name, context, &format!("rm -rf {}", q)).await?;
                    true
                }
            }
            FileState::Directory => {
                let created = match current {
                    "directory" => false,
                    "absent" => {
                        run_checked(name, context, &format!("mkdir -p {}", q)).await?;
                        true
                    }
                    other => {
                        return Ok(ModuleOutput::failed(format!(
                            "{} already exists as a {}",
                            path, other
                        )))
                    }
                };
                let recurse = params.get_bool_or("recurse", false);
                created | apply_attributes(name, context, path, params, recurse).await?
            }
            FileState::File => {
                if current == "absent" {
                    return Ok(ModuleOutput::failed(format!(
                        "file ({}) is absent, cannot continue",
                        path
                    )));
                }
                apply_attributes(name, context, path, params, false).await?
            }
            FileState::Touch => {
                run_checked(name, context, &format!("touch {}", q)).await?;
                apply_attributes(name, context, path, params, false).await?;
                true
            }
            FileState::Link => {
                let src = params.get_string("src")?.ok_or_else(|| {
                    ModuleError::MissingParameter("src is required for state=link".to_string())
                })?;
                let target = if current == "link" {
                    Some(run_checked(name, context, &format!("readlink {}", q)).await?)
                } else {
                    None
                };
                if target.as_deref() == Some(src.as_str()) {
                    false
                } else if current == "directory" {
                    return Ok(ModuleOutput::failed(format!(
                        "refusing to replace directory {} with a link",
                        path
                    )));
                } else {
                    run_checked(
                        name,
                        context,
                        &format!("ln -sfn {} {}", shell_quote(&src), q),
                    )
                    .await?;
                    true
                }
            }
        };

        let output = if changed {
            ModuleOutput::changed("")
        } else {
            ModuleOutput::ok("")
        };
        Ok(output
            .with_data("path", JsonValue::String(path.to_string()))
            .with_data("state", JsonValue::String(state.as_str().to_string())))
    }
}

#[async_trait]
impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }


    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;

        let state = match params.get_string("state")? {
            Some(s) => FileState::parse(&s)?,
            None => match remote_state(self.name(), context, &path).await? {
                "directory" => FileState::Directory,
                "link" => FileState::Link,
                _ => FileState::File,
            },
        };

        self.ensure(state, &path, params, context).await
    }
}
