//! Set_fact module - Set host variables dynamically during playbook execution
//!
//! Every argument except `cacheable` becomes a fact on the host. The runner
//! merges the returned `ansible_facts` into the host's scope. The result is
//! always reported as changed since the host's scope was written.

use async_trait::async_trait;

use super::{
    Module, ModuleClassification, ModuleContext, ModuleError, ModuleOutput, ModuleParams,
    ModuleResult,
};
use crate::vars::VarMap;

/// Module for setting host facts/variables dynamically
pub struct SetFactModule;

#[async_trait]
impl Module for SetFactModule {
    fn name(&self) -> &'static str {
        "set_fact"
    }


    fn classification(&self) -> ModuleClassification {
        ModuleClassification::LocalLogic
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.keys().all(|k| k == "cacheable") {
            return Err(ModuleError::InvalidParameter(
                "set_fact requires at least one key=value pair to set".to_string(),
            ));
        }
        if let Some(bad) = params.keys().find(|k| k.as_str() == "_raw_params") {
            return Err(ModuleError::InvalidParameter(format!(
                "set_fact takes key=value pairs, got free-form '{}'",
                params[bad.as_str()]
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let facts: VarMap = params
            .iter()
            .filter(|(k, _)| k.as_str() != "cacheable")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(ModuleOutput::changed("").with_facts(facts))
    }
}
