//! Shell module - Execute shell commands
//!
//! `shell` executes commands through a shell, enabling shell features like
//! pipes, redirects and environment variable expansion. `raw` sends its
//! string to the host untouched.

use async_trait::async_trait;

use super::command::{check_creates_removes, command_output, with_chdir};
use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

/// Module for executing shell commands
pub struct ShellModule;

impl ShellModule {
    fn build_command(&self, params: &ModuleParams) -> ModuleResult<String> {
        let cmd = params.get_string_required("cmd")?;
        let executable = params
            .get_string("executable")?
            .unwrap_or_else(|| "/bin/sh".to_string());

        with_chdir(params, format!("{} -c {}", executable, shell_quote(&cmd)))
    }
}

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }


    fn free_form_arg(&self) -> Option<&'static str> {
        Some("cmd")
    }

    fn required_params(&self) -> &[&'static str] {
        &["cmd"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(output) = check_creates_removes(self.name(), params, context).await? {
            return Ok(output);
        }

        let command = self.build_command(params)?;
        let stdin = params.get_string("stdin")?;
        let result = context
            .connection(self.name())?
            .execute_with_input(
                &command,
                stdin.as_deref().map(str::as_bytes),
                Some(context.options()),
            )
            .await?;

        let cmd = params.get_string_required("cmd")?;
        Ok(command_output(&cmd, &result))
    }
}

/// Module for running a command string verbatim
pub struct RawModule;

#[async_trait]
impl Module for RawModule {
    fn name(&self) -> &'static str {
        "raw"
    }


    fn free_form_arg(&self) -> Option<&'static str> {
        Some("cmd")
    }

    fn required_params(&self) -> &[&'static str] {
        &["cmd"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let cmd = params.get_string_required("cmd")?;
        let command = match params.get_string("executable")? {
            Some(executable) => format!("{} -c {}", executable, shell_quote(&cmd)),
            None => cmd.clone(),
        };
        let result = context.run(self.name(), &command).await?;
        Ok(command_output(&cmd, &result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnection;
    use serde_json::json;
    use std::sync::Arc;

    fn local() -> ModuleContext {
        ModuleContext::new("localhost").with_connection(Arc::new(LocalConnection::new("localhost")))
    }

    #[tokio::test]
    async fn test_shell_pipe() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("printf 'b\\na\\n' | sort"));

        let result = ShellModule.execute(&params, &local()).await.unwrap();
        assert!(result.changed);
        assert_eq!(result.stdout.as_deref(), Some("a\nb"));
        assert_eq!(result.to_data()["stdout_lines"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_shell_stdin() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("tr a-z A-Z"));
        params.insert("stdin".to_string(), json!("shout"));

        let result = ShellModule.execute(&params, &local()).await.unwrap();
        assert_eq!(result.stdout.as_deref(), Some("SHOUT"));
    }

    #[tokio::test]
    async fn test_shell_failure() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("echo err >&2; exit 4"));

        let result = ShellModule.execute(&params, &local()).await.unwrap();
        assert!(result.failed);
        assert_eq!(result.rc, Some(4));
        assert_eq!(result.stderr.as_deref(), Some("err"));
    }

    #[tokio::test]
    async fn test_raw() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("echo $((1 + 2))"));

        let result = RawModule.execute(&params, &local()).await.unwrap();
        assert_eq!(result.stdout.as_deref(), Some("3"));
    }
}
