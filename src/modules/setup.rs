//! Setup module - Gather facts about the host

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::facts;

/// Module that gathers facts about remote hosts
pub struct SetupModule;

#[async_trait]
impl Module for SetupModule {
    fn name(&self) -> &'static str {
        "setup"
    }


    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let gathered = facts::gather(context.connection(self.name())?, Some(context.options())).await?;
        let mut vars = gathered.to_vars();

        // `filter` keeps only matching fact names (glob-style `*`)
        if let Some(filter) = params.get_string("filter")? {
            let pattern = format!("^{}$", regex::escape(&filter).replace(r"\*", ".*"));
            if let Ok(re) = regex::Regex::new(&pattern) {
                vars.retain(|k, _| re.is_match(k));
            }
        }

        Ok(ModuleOutput::ok("").with_facts(vars))
    }
}
