//! Command-line arguments
//!
//! Every option can also be given through an environment variable with the
//! `PACECRAB_` prefix. CLI arguments take precedence over environment
//! variables, which take precedence over defaults.
//!
//! # Example Usage
//!
//! ```bash
//! # Four processes sharing 10 calls per second
//! pacecrab run --name api --per-second 10 --workers 4 --calls 25
//!
//! # Same, configured through the environment
//! export PACECRAB_PER_SECOND=10
//! export PACECRAB_WORKERS=4
//! pacecrab run --name api
//! ```

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "pacecrab",
    about = "Drive a shared pacer from several processes",
    long_about = "Spawns worker processes that pace their calls through one shared JSON document and reports the combined rate.\n\nEnvironment variables with PACECRAB_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "PACECRAB_LOG_LEVEL"
    )]
    pub log_level: String,

    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Spawn the workers and print the combined summary as JSON
    Run {
        #[command(flatten)]
        pacer: PacerArgs,
        #[arg(
            long,
            value_name = "COUNT",
            help = "Number of worker processes",
            default_value_t = 4,
            env = "PACECRAB_WORKERS"
        )]
        workers: usize,
    },
    /// Run a single worker and print its report as JSON
    Worker {
        #[command(flatten)]
        pacer: PacerArgs,
        #[arg(long, value_name = "ID", help = "Unique worker id", env = "PACECRAB_WORKER_ID")]
        worker_id: String,
        #[arg(
            long,
            value_name = "COUNT",
            help = "Number of workers sharing the pacer",
            default_value_t = 1,
            env = "PACECRAB_WORKERS"
        )]
        workers: usize,
    },
}

/// Pacer settings shared by `run` and `worker`
#[derive(Args, Debug, Clone)]
pub struct PacerArgs {
    #[arg(
        long,
        value_name = "NAME",
        help = "Pacer name",
        default_value = "demo",
        env = "PACECRAB_NAME"
    )]
    pub name: String,
    #[arg(
        long,
        value_name = "RATE",
        help = "Target calls per second across all workers",
        default_value_t = 10.0,
        env = "PACECRAB_PER_SECOND"
    )]
    pub per_second: f64,
    #[arg(
        long,
        value_name = "TOKENS",
        help = "Burst capacity (default: 10% of the hourly rate)",
        env = "PACECRAB_BURST"
    )]
    pub burst: Option<u64>,
    #[arg(
        long,
        value_name = "COUNT",
        help = "Calls made by each worker",
        default_value_t = 20,
        env = "PACECRAB_CALLS"
    )]
    pub calls: u64,
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory holding the shared files (default: a fresh temporary directory)",
        env = "PACECRAB_DIR"
    )]
    pub dir: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Give up on a call whose wait would exceed this",
        env = "PACECRAB_TIMEOUT"
    )]
    pub timeout: Option<f64>,
    #[arg(
        long,
        value_name = "FRACTION",
        help = "Maximum drift from the target rate before warning",
        default_value_t = 0.1,
        env = "PACECRAB_MAX_DRIFT"
    )]
    pub max_drift: f64,
    #[arg(
        long,
        value_name = "CALLS",
        help = "Calls between rate checks",
        default_value_t = 10,
        env = "PACECRAB_CHECK_EVERY"
    )]
    pub check_every: u64,
    #[arg(
        long,
        value_name = "MILLIS",
        help = "Simulated work inside each call",
        default_value_t = 0,
        env = "PACECRAB_WORK_MS"
    )]
    pub work_ms: u64,
}

impl PacerArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.per_second.is_finite() || self.per_second <= 0.0 {
            return Err(anyhow!(
                "--per-second must be positive, got {}",
                self.per_second
            ));
        }
        if let Some(timeout) = self.timeout {
            if !timeout.is_finite() || timeout < 0.0 {
                return Err(anyhow!("--timeout must be non-negative, got {}", timeout));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs_f64)
    }

    /// The same settings as arguments for a `worker` subcommand
    pub fn to_args(&self, dir: &std::path::Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--name".into(),
            self.name.clone().into(),
            "--per-second".into(),
            self.per_second.to_string().into(),
            "--calls".into(),
            self.calls.to_string().into(),
            "--dir".into(),
            dir.into(),
            "--max-drift".into(),
            self.max_drift.to_string().into(),
            "--check-every".into(),
            self.check_every.to_string().into(),
            "--work-ms".into(),
            self.work_ms.to_string().into(),
        ];
        if let Some(burst) = self.burst {
            args.push("--burst".into());
            args.push(burst.to_string().into());
        }
        if let Some(timeout) = self.timeout {
            args.push("--timeout".into());
            args.push(timeout.to_string().into());
        }
        args
    }
}

impl Cli {
    pub fn print_env_vars() {
        println!("pacecrab environment variables:");
        println!();
        for (name, help) in [
            ("PACECRAB_LOG_LEVEL", "Log level (default: info)"),
            ("PACECRAB_NAME", "Pacer name (default: demo)"),
            ("PACECRAB_PER_SECOND", "Target calls per second (default: 10)"),
            ("PACECRAB_BURST", "Burst capacity (default: 10% of the hourly rate)"),
            ("PACECRAB_CALLS", "Calls per worker (default: 20)"),
            ("PACECRAB_WORKERS", "Number of workers (default: 4)"),
            ("PACECRAB_DIR", "Directory for the shared files"),
            ("PACECRAB_TIMEOUT", "Per-call wait limit in seconds"),
            ("PACECRAB_MAX_DRIFT", "Maximum drift fraction (default: 0.1)"),
            ("PACECRAB_CHECK_EVERY", "Calls between rate checks (default: 10)"),
            ("PACECRAB_WORK_MS", "Simulated work per call (default: 0)"),
            ("PACECRAB_WORKER_ID", "Worker id (worker subcommand only)"),
        ] {
            println!("  {name:<22} {help}");
        }
    }
}
