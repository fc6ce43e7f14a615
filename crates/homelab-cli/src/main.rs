//! homelab CLI
//!
//! Converges a single-node homelab to the state declared in one YAML document.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use homelab_cli::{Cli, EXIT_STARTUP_ERROR};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // logs go to stderr so stdout carries only the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(EXIT_STARTUP_ERROR)
        }
    }
}
