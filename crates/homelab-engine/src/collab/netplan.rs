//! Network configuration through netplan.
//!
//! The network step owns the file; this backend only asks netplan to apply
//! what's on disk.

use async_trait::async_trait;
use homelab_common::command::run_command;

use super::NetworkBackend;
use crate::error::ApplyError;

/// [`NetworkBackend`] running `netplan generate` then `netplan apply`
#[derive(Debug, Clone, Default)]
pub struct Netplan;

impl Netplan {
    /// Netplan backend
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkBackend for Netplan {
    async fn apply(&self) -> Result<(), ApplyError> {
        // generate validates the whole config set before anything is applied
        run_command("netplan", &["generate"], &[]).await?;
        run_command("netplan", &["apply"], &[]).await?;
        Ok(())
    }
}
