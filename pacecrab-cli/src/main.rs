mod config;
mod report;
mod run;
mod worker;

use anyhow::{Result, anyhow};
use clap::Parser;

use crate::config::{Cli, Command};

fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let cli = Cli::parse();

    if cli.list_env_vars {
        Cli::print_env_vars();
        return Ok(());
    }

    // Initialize logging; stdout carries the JSON reports
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("pacecrab={}", cli.log_level).parse()?),
        )
        .init();

    match cli.command {
        Some(Command::Run { pacer, workers }) => {
            pacer.validate()?;
            let summary = run::run(&pacer, workers, &cli.log_level)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Some(Command::Worker {
            pacer,
            worker_id,
            workers,
        }) => {
            pacer.validate()?;
            let dir = pacer
                .dir
                .clone()
                .ok_or_else(|| anyhow!("worker requires --dir"))?;
            let report = worker::run_worker(&pacer, &dir, &worker_id, workers)?;
            println!("{}", serde_json::to_string(&report)?);
        }
        None => {
            return Err(anyhow!(
                "No command specified. Use `pacecrab run` to start workers, or --help for usage"
            ));
        }
    }

    Ok(())
}
