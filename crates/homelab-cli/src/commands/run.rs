//! Run command - converge the host and cluster to the desired state

use std::process::ExitCode;

use clap::Args;
use tracing::info;

use crate::config::{ConfigArgs, WaitArgs};
use crate::Result;

/// Converge everything declared in the desired state
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub waits: WaitArgs,
}

pub async fn run(args: RunArgs) -> Result<ExitCode> {
    let desired = args.config.load()?;
    let collab = super::system_collaborators(&args.config, &desired);
    let options = args.waits.run_options(&args.config.state_dir);

    info!(config = %args.config.config.display(), "Converging");
    let report = homelab_engine::run(&desired, &collab, &options).await?;

    print!("{}", report.render());
    Ok(crate::exit_code(report.exit_code()))
}
