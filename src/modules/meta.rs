//! Meta module - Run-control actions
//!
//! `flush_handlers` is carried out by the play runner before dispatch; the
//! module itself only acknowledges the supported actions.

use async_trait::async_trait;

use super::{
    Module, ModuleClassification, ModuleContext, ModuleError, ModuleOutput, ModuleParams,
    ModuleResult, ParamExt,
};

/// Actions the runner understands
pub const META_ACTIONS: &[&str] = &["flush_handlers", "noop"];

/// Module for run-control actions
pub struct MetaModule;

#[async_trait]
impl Module for MetaModule {
    fn name(&self) -> &'static str {
        "meta"
    }


    fn classification(&self) -> ModuleClassification {
        ModuleClassification::LocalLogic
    }

    fn free_form_arg(&self) -> Option<&'static str> {
        Some("action")
    }

    fn required_params(&self) -> &[&'static str] {
        &["action"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        match params.get_string("action")? {
            Some(action) if !META_ACTIONS.contains(&action.as_str()) => Err(
                ModuleError::Unsupported(format!("meta action '{}'", action)),
            ),
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let action = params.get_string_required("action")?;
        Ok(ModuleOutput::ok(format!("meta: {}", action)))
    }
}
