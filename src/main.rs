mod cli;
mod drivers;
mod error;
mod manifest;
mod ops;
mod registry;
mod resolver;
mod storage;
mod utils;

use clap::Parser;

use cli::{Cli, Commands};
use error::Result;
use ops::RuntimeOpts;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let opts = RuntimeOpts::new(cli.timeout_secs, cli.retries)?;

    match cli.command {
        Commands::Stash { source, bucket, tags, config } => {
            ops::do_stash(&opts, &source, &bucket, &tags, config)?;
        }
        Commands::Restore { dump_ref, target, bucket } => {
            ops::do_restore(&opts, &dump_ref, &target, &bucket)?;
        }
        Commands::List { bucket } => {
            ops::do_list(&opts, &bucket)?;
        }
        Commands::Version => {
            ops::do_version();
        }
    }

    Ok(())
}
