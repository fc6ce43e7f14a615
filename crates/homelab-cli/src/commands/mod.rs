//! CLI commands

pub mod check;
pub mod plan;
pub mod run;

use homelab_engine::{Collaborators, DesiredState};

use crate::config::ConfigArgs;

/// Real collaborators against this host and its cluster
fn system_collaborators(config: &ConfigArgs, desired: &DesiredState) -> Collaborators {
    Collaborators::system(config.kubeconfig_for(desired))
}
