//! Fail module - Fail with a custom message

use async_trait::async_trait;

use super::{Module, ModuleClassification, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

/// Module that always fails
pub struct FailModule;

#[async_trait]
impl Module for FailModule {
    fn name(&self) -> &'static str {
        "fail"
    }


    fn classification(&self) -> ModuleClassification {
        ModuleClassification::LocalLogic
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
            .unwrap_or_else(|| "Failed as requested from task".to_string());
        Ok(ModuleOutput::failed(msg))
    }
}
