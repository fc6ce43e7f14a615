//! Check command - probe every resource and report drift without changing it

use std::process::ExitCode;

use clap::Args;
use homelab_engine::{steps, RunOptions};

use crate::config::ConfigArgs;
use crate::Result;

/// Report which resources differ from the desired state; exits 1 on drift
#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: CheckArgs) -> Result<ExitCode> {
    let desired = args.config.load()?;
    let collab = super::system_collaborators(&args.config, &desired);
    let options = RunOptions::new(&args.config.state_dir);

    let plan = steps::plan(&desired, &collab, &options)?;
    let inspections = homelab_engine::inspect(&plan).await;
    print!("{}", homelab_engine::render_inspection(&inspections));

    Ok(if inspections.iter().all(|i| i.is_matching()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
