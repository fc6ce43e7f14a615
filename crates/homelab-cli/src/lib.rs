//! homelab CLI library

pub mod commands;
pub mod config;
pub mod error;

use std::process::ExitCode;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// Exit code when the run could not start (bad config, lock held)
pub const EXIT_STARTUP_ERROR: u8 = 2;

/// homelab - converge a single-node cluster host to a declared state
#[derive(Parser, Debug)]
#[command(name = "homelab")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Converge host and cluster; exits 1 when a step fails fatally
    Run(commands::run::RunArgs),
    /// Print the ordered steps without touching anything
    Plan(commands::plan::PlanArgs),
    /// Probe every resource and report drift; exits 1 on drift
    Check(commands::check::CheckArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run(args) => commands::run::run(args).await,
            Commands::Plan(args) => commands::plan::run(args).await,
            Commands::Check(args) => commands::check::run(args).await,
        }
    }
}

/// Process exit code for a report's numeric code
pub(crate) fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
