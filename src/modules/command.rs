//! Command module - Execute arbitrary commands
//!
//! This module executes commands without shell interpretation: the command
//! line is split into words and each word is quoted before it reaches the
//! remote shell. For pipes, redirects and the like, use the shell module.

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::{shell_quote, CommandResult};

/// Module for executing commands directly
pub struct CommandModule;

impl CommandModule {
    fn build_command(&self, params: &ModuleParams) -> ModuleResult<String> {
        let argv = match params.get_vec_string("argv")? {
            Some(argv) => argv,
            None => {
                let cmd = params.get_string_required("cmd")?;
                shell_words::split(&cmd).map_err(|e| {
                    ModuleError::InvalidParameter(format!("cannot split '{}': {}", cmd, e))
                })?
            }
        };

        if argv.is_empty() {
            return Err(ModuleError::InvalidParameter(
                "no command given".to_string(),
            ));
        }

        let words: Vec<String> = argv.iter().map(|w| quote_word(w)).collect();
        with_chdir(params, words.join(" "))
    }
}

/// Quote a word unless it is made only of characters the shell leaves alone
fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        shell_quote(word)
    }
}

/// Prefix `command` with `cd DIR &&` when `chdir` is set
pub(crate) fn with_chdir(params: &ModuleParams, command: String) -> ModuleResult<String> {
    Ok(match params.get_string("chdir")? {
        Some(dir) => format!("cd {} && {}", shell_quote(&dir), command),
        None => command,
    })
}

/// Honor `creates` / `removes` by testing the paths on the host
pub(crate) async fn check_creates_removes(
    module: &str,
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<Option<ModuleOutput>> {
    // Check 'creates' - skip if file exists
    if let Some(creates) = params.get_string("creates")? {
        let test = context
            .run(module, &format!("test -e {}", shell_quote(&creates)))
            .await?;
        if test.success {
            return Ok(Some(
                ModuleOutput::ok(format!("skipped, since {} exists", creates)).with_data("rc", 0.into()),
            ));
        }
    }

    // Check 'removes' - skip if file doesn't exist
    if let Some(removes) = params.get_string("removes")? {
        let test = context
            .run(module, &format!("test -e {}", shell_quote(&removes)))
            .await?;
        if !test.success {
            return Ok(Some(
                ModuleOutput::ok(format!("skipped, since {} does not exist", removes))
                    .with_data("rc", 0.into()),
            ));
        }
    }

    Ok(None)
}

/// Turn a finished command into the envelope shared by command-like modules
pub(crate) fn command_output(command: &str, result: &CommandResult) -> ModuleOutput {
    let output = if result.success {
        ModuleOutput::changed("")
    } else {
        ModuleOutput::failed("non-zero return code")
    };
    output
        .with_command_output(result)
        .with_data("cmd", command.into())
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }


    fn free_form_arg(&self) -> Option<&'static str> {
        Some("cmd")
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        // Must have either cmd or argv
        if params.get("cmd").is_none() && params.get("argv").is_none() {
            return Err(ModuleError::MissingParameter(
                "Either 'cmd' or 'argv' must be provided".to_string(),
            ));
        }
        Ok(())
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
        let result = context.run(self.name(), &command).await?;
        Ok(command_output(&command, &result))
    }
}
