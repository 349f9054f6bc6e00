//! Template module - Write rendered templates to the host
//!
//! The play runner reads the control-node template named by `src`, renders
//! it with the host's variables and passes the text as `_rendered_content`.
//! This module only writes it to `dest`, idempotently.
//!
//! Templates are rendered by minijinja with these additions to its builtins:
//! filters `to_json`, `to_nice_json`, `from_json`, `to_yaml`, `bool`,
//! `regex_replace`, `regex_search`, `basename`, `dirname`, `b64encode`,
//! `b64decode`, `mandatory`, `ternary`, `quote`, `combine`; tests
//! `succeeded`, `success`, `failed`, `changed`, `skipped`, `match`,
//! `search`; and `lookup('file' | 'env', ...)`.

use async_trait::async_trait;

use super::copy::write_content;
use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams,
    ModuleResult, ParamExt,
};

/// Key under which the runner passes the rendered template
pub const RENDERED_CONTENT_KEY: &str = "_rendered_content";

/// Module for writing rendered templates
pub struct TemplateModule;

#[async_trait]
impl Module for TemplateModule {
    fn name(&self) -> &'static str {
        "template"
    }


    fn required_params(&self) -> &[&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if !params.contains_key(RENDERED_CONTENT_KEY) {
            return Err(ModuleError::MissingParameter("src".to_string()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let dest = params.get_string_required("dest")?;
        let content = params.get_string_required(RENDERED_CONTENT_KEY)?;
        let output = write_content(self.name(), context, content.as_bytes(), &dest, params).await?;
        Ok(match params.get_string("src")? {
            Some(src) => output.with_data("src", src.into()),
            None => output,
        })
    }
}
