//! Where the desired state and engine state live.
//!
//! Resolution for every setting, highest priority first:
//! 1. Explicit flag
//! 2. `HOMELAB_*` environment variable
//! 3. Built-in default
//!
//! The kubeconfig defaults to `cluster.kubeconfig` from the desired state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use homelab_common::retry::RetryConfig;
use homelab_common::DEFAULT_STATE_DIR;
use homelab_engine::{DesiredState, RunOptions};

use crate::{Error, Result};

/// Default location of the desired-state document
pub const DEFAULT_CONFIG: &str = "/etc/homelab/homelab.yaml";

const READINESS_POLL: Duration = Duration::from_secs(5);
const ROLLOUT_POLL: Duration = Duration::from_secs(3);

/// Arguments shared by every command
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Desired-state YAML document
    #[arg(short = 'f', long = "config", env = "HOMELAB_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Directory for the run lock and certificate authority
    #[arg(long, env = "HOMELAB_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Kubeconfig for cluster access (defaults to cluster.kubeconfig)
    #[arg(long, env = "HOMELAB_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl ConfigArgs {
    /// Load and validate the desired state
    pub fn load(&self) -> Result<DesiredState> {
        load_desired(&self.config)
    }

    /// Kubeconfig to use for `desired`
    pub fn kubeconfig_for(&self, desired: &DesiredState) -> PathBuf {
        self.kubeconfig
            .clone()
            .unwrap_or_else(|| desired.cluster.kubeconfig.clone())
    }
}

/// Wait budgets for a run
#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Seconds to wait for the node and the ingress controller to become ready
    #[arg(long, env = "HOMELAB_READY_TIMEOUT", default_value = "300")]
    pub ready_timeout_secs: u64,

    /// Seconds to wait for each workload rollout
    #[arg(long, env = "HOMELAB_ROLLOUT_TIMEOUT", default_value = "120")]
    pub rollout_timeout_secs: u64,
}

impl WaitArgs {
    /// Engine options for a run rooted at `state_dir`
    pub fn run_options(&self, state_dir: &Path) -> RunOptions {
        let mut options = RunOptions::new(state_dir);
        let ready = polls(self.ready_timeout_secs, READINESS_POLL);
        options.cluster_ready = ready.clone();
        options.controller_ready = ready;
        options.rollout = polls(self.rollout_timeout_secs, ROLLOUT_POLL);
        options
    }
}

/// Fixed-interval policy covering roughly `timeout_secs`, at least one attempt
fn polls(timeout_secs: u64, interval: Duration) -> RetryConfig {
    let attempts = (timeout_secs / interval.as_secs()).max(1);
    RetryConfig::fixed(u32::try_from(attempts).unwrap_or(u32::MAX), interval)
}

/// Read, parse and validate a desired-state document
pub fn load_desired(path: &Path) -> Result<DesiredState> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let desired = DesiredState::load(path).map_err(Error::Invalid)?;
    desired.validate().map_err(Error::Invalid)?;
    Ok(desired)
}
