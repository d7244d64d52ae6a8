//! Command-line front end for rocktune.

use anyhow::Result;
use clap::Parser;
use rocktune_driver::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
