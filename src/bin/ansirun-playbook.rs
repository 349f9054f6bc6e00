//! `ansirun-playbook` - run a playbook
//!
//! ```text
//! ansirun-playbook -i inventory.ini -e version=1.2 site.yml
//! ```

use ansirun::cli::{self, playbook::PlaybookCli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = PlaybookCli::parse();
    cli::init_logging(cli.common.verbose);

    let code = cli::exit_code(cli.run().await);
    std::process::exit(code);
}
