//! `ansirun-playbook`: run a playbook against the inventory

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use super::{check_stats, CommonArgs};
use crate::callback::DefaultCallback;
use crate::error::Error;
use crate::executor::Executor;
use crate::playbook::Playbook;

/// Run an Ansible-compatible playbook
#[derive(Parser, Debug, Clone)]
#[command(name = "ansirun-playbook", version, about = "Run an Ansible-compatible playbook", long_about = None)]
pub struct PlaybookCli {
    /// Playbook file
    pub playbook: PathBuf,

    /// Gather facts in plays that do not set `gather_facts`
    #[arg(long)]
    pub gather_facts: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl PlaybookCli {
    pub async fn run(&self) -> Result<()> {
        let config = self.common.load_config()?;
        let inventory = self.common.load_inventory(&config)?;
        let playbook = Playbook::load(&self.playbook)
            .map_err(Error::from)
            .with_context(|| format!("Unable to load playbook {}", self.playbook.display()))?;

        let mut exec_config = self.common.executor_config(&config);
        if self.gather_facts {
            exec_config.gather_facts = true;
        }

        let callback = DefaultCallback::new()
            .with_verbosity(self.common.verbose)
            .with_no_color(self.common.no_color(&config));

        let executor = Executor::new(exec_config, inventory)
            .with_callback(Arc::new(callback))
            .with_extra_vars(self.common.extra_vars()?);

        info!(playbook = %self.playbook.display(), plays = playbook.plays.len(), "Running playbook");
        let stats = executor.run_playbook(&playbook).await.map_err(Error::from)?;
        check_stats(&stats)?;
        Ok(())
    }
}
