//! Plan command - print the ordered steps without touching anything

use std::process::ExitCode;

use clap::Args;
use homelab_engine::{steps, RunOptions};

use crate::config::ConfigArgs;
use crate::Result;

/// Show the steps a run would execute, in order
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: PlanArgs) -> Result<ExitCode> {
    let desired = args.config.load()?;
    let collab = super::system_collaborators(&args.config, &desired);
    let options = RunOptions::new(&args.config.state_dir);

    let plan = steps::plan(&desired, &collab, &options)?;
    print!("{}", plan.render());
    Ok(ExitCode::SUCCESS)
}
