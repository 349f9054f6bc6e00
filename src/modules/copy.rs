//! Copy module - Copy files to destination
//!
//! This module writes inline `content` or a control-node file (`src`) to
//! `dest` on the host. The destination is only rewritten when its content
//! differs, after which `mode`, `owner` and `group` are applied.

use async_trait::async_trait;
use std::path::Path;

use super::file::{apply_attributes, remote_state};
use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams,
    ModuleResult, ParamExt,
};
use crate::connection::shell_quote;
use crate::vars::JsonValue;

/// Read a file on the host; `None` when it does not exist
pub(crate) async fn read_remote(
    module: &str,
    context: &ModuleContext,
    path: &str,
) -> ModuleResult<Option<Vec<u8>>> {
    let q = shell_quote(path);
    let result = context
        .run(module, &format!("if [ -f {q} ]; then cat {q}; else exit 3; fi"))
        .await?;
    match result.exit_code {
        0 => Ok(Some(result.stdout.into_bytes())),
        3 => Ok(None),
        _ => Err(ModuleError::ExecutionFailed(format!(
            "cannot read {}: {}",
            path,
            result.stderr.trim()
        ))),
    }
}

/// Write `content` to `dest` unless it already holds exactly that content.
///
/// With `validate` (a command containing `%s`), the content is first written
/// to a temporary file and only moved into place when the command succeeds.
pub(crate) async fn write_content(
    module: &str,
    context: &ModuleContext,
    content: &[u8],
    dest: &str,
    params: &ModuleParams,
) -> ModuleResult<ModuleOutput> {
    let current = read_remote(module, context, dest).await?;
    let mut changed = current.as_deref() != Some(content);

    if changed {
        match params.get_string("validate")? {
            Some(validate) => {
                let tmp = format!("{}.ansirun-tmp", dest);
                context.put_content(module, content, &tmp).await?;
                let check = context
                    .run(module, &validate.replace("%s", &shell_quote(&tmp)))
                    .await?;
                if !check.success {
                    context
                        .run(module, &format!("rm -f {}", shell_quote(&tmp)))
                        .await?;
                    return Ok(ModuleOutput::failed(format!(
                        "failed to validate: {}",
                        check.stderr.trim()
                    ))
                    .with_command_output(&check));
                }
                let mv = context
                    .run(module, &format!("mv -f {} {}", shell_quote(&tmp), shell_quote(dest)))
                    .await?;
                if !mv.success {
                    return Err(ModuleError::ExecutionFailed(mv.stderr.trim().to_string()));
                }
            }
            None => context.put_content(module, content, dest).await?,
        }
    }

    changed |= apply_attributes(module, context, dest, params, false).await?;

    let output = if changed {
        ModuleOutput::changed("")
    } else {
        ModuleOutput::ok("")
    };
    Ok(output
        .with_data("dest", JsonValue::String(dest.to_string()))
        .with_data("size", JsonValue::from(content.len())))
}

/// Module for copying files
pub struct CopyModule;

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }


    fn required_params(&self) -> &[&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        match (params.get("src"), params.get("content")) {
            (None, None) => Err(ModuleError::MissingParameter(
                "src or content is required".to_string(),
            )),
            (Some(_), Some(_)) => Err(ModuleError::InvalidParameter(
                "src and content are mutually exclusive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let mut dest = params.get_string_required("dest")?;

        let content = match params.get("content") {
            Some(JsonValue::String(s)) => s.clone().into_bytes(),
            Some(other) => serde_json::to_string(other)
                .map_err(|e| ModuleError::InvalidParameter(e.to_string()))?
                .into_bytes(),
            None => {
                let src = params.get_string_required("src")?;
                let bytes = tokio::fs::read(&src).await.map_err(|e| {
                    ModuleError::ExecutionFailed(format!("could not read src {}: {}", src, e))
                })?;

                // copying into a directory keeps the source's file name
                if dest.ends_with('/') || remote_state(self.name(), context, &dest).await? == "directory" {
                    let file_name = Path::new(&src)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    dest = format!("{}/{}", dest.trim_end_matches('/'), file_name);
                }
                bytes
            }
        };

        write_content(self.name(), context, &content, &dest, params).await
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
    async fn test_copy_content_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("motd");
        let mut params = ModuleParams::new();
        params.insert("dest".to_string(), json!(dest.to_str().unwrap()));
        params.insert("content".to_string(), json!("welcome\n"));

        let first = CopyModule.execute(&params, &local()).await.unwrap();
        assert!(first.changed);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "welcome\n");

        let second = CopyModule.execute(&params, &local()).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_copy_src_into_directory() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("app.conf");
        std::fs::write(&src, "key=value\n").unwrap();
        let dest_dir = temp.path().join("etc");
        std::fs::create_dir(&dest_dir).unwrap();

        let mut params = ModuleParams::new();
        params.insert("src".to_string(), json!(src.to_str().unwrap()));
        params.insert("dest".to_string(), json!(dest_dir.to_str().unwrap()));

        let result = CopyModule.execute(&params, &local()).await.unwrap();
        assert!(result.changed);
        assert_eq!(
            std::fs::read_to_string(dest_dir.join("app.conf")).unwrap(),
            "key=value\n"
        );
    }

    #[tokio::test]
    async fn test_copy_validate_rejects() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("conf");
        let mut params = ModuleParams::new();
        params.insert("dest".to_string(), json!(dest.to_str().unwrap()));
        params.insert("content".to_string(), json!("bad"));
        params.insert("validate".to_string(), json!("grep -q good %s"));

        let result = CopyModule.execute(&params, &local()).await.unwrap();
        assert!(result.failed);
        assert!(!dest.exists());
    }

    #[test]
    fn test_copy_requires_source() {
        let mut params = ModuleParams::new();
        params.insert("dest".to_string(), json!("/tmp/x"));
        assert!(CopyModule.validate_params(&params).is_err());
    }
}
