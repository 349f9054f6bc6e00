//! `ansirun` - run a single module against inventory hosts
//!
//! ```text
//! ansirun -i inventory.ini -m command -a "uptime" webservers
//! ```

use ansirun::cli::{self, adhoc::AdhocCli};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = AdhocCli::parse();
    cli::init_logging(cli.common.verbose);

    let code = cli::exit_code(cli.run().await);
    std::process::exit(code);
}
