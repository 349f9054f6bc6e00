//! `ansirun`: run one module against the hosts matching a pattern

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use super::{check_stats, CommonArgs};
use crate::callback::AdhocCallback;
use crate::error::Error;
use crate::executor::Executor;
use crate::modules::{self, ModuleParams};
use crate::playbook::BecomeSpec;

/// Run a single module against inventory hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "ansirun", version, about = "Run a single module against inventory hosts", long_about = None)]
pub struct AdhocCli {
    /// Host pattern (e.g. `all`, `web`, `web:!web3`)
    pub pattern: String,

    /// Module to run
    #[arg(short = 'm', long = "module-name", default_value = "ping")]
    pub module: String,

    /// Module arguments (`key=value ...` or a free-form command)
    #[arg(short = 'a', long = "args", default_value = "")]
    pub args: String,

    /// Run operations with become
    #[arg(short = 'b', long = "become")]
    pub escalate: bool,

    /// User to become
    #[arg(long = "become-user")]
    pub become_user: Option<String>,

    /// Privilege escalation method (sudo or su)
    #[arg(long = "become-method")]
    pub become_method: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl AdhocCli {
    /// Module arguments parsed from `-a`
    pub fn module_args(&self) -> ModuleParams {
        modules::parse_kv_args(&self.module, &self.args)
    }

    fn become_spec(&self) -> BecomeSpec {
        BecomeSpec {
            enabled: self.escalate.then_some(true),
            user: self.become_user.clone(),
            method: self.become_method.clone(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let module = modules::canonical_name(&self.module).to_string();
        if !modules::is_known_module(&module) || modules::INCLUDE_MODULES.contains(&module.as_str()) {
            return Err(Error::Config(format!("unknown module '{}'", self.module)).into());
        }

        let config = self.common.load_config()?;
        let inventory = self.common.load_inventory(&config)?;
        let callback = AdhocCallback::new().with_no_color(self.common.no_color(&config));

        let executor = Executor::new(self.common.executor_config(&config), inventory)
            .with_callback(Arc::new(callback))
            .with_extra_vars(self.common.extra_vars()?);

        info!(pattern = %self.pattern, module = %module, "Running ad-hoc command");
        let stats = executor
            .run_adhoc(&self.pattern, &module, self.module_args(), self.become_spec())
            .await?;
        check_stats(&stats)?;
        Ok(())
    }
}
