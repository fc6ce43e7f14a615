//! Swap file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collab::HostOps;
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::Step;

/// Swap file of a fixed size, enabled now and on boot
pub struct SwapStep {
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) path: PathBuf,
    pub(crate) size_mib: u64,
}

#[async_trait]
impl Step for SwapStep {
    fn category(&self) -> StepCategory {
        StepCategory::Swap
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::SwapFile, self.path.display().to_string())
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let Some(state) = self.host.swap_state(&self.path).await? else {
            return Ok(ProbeResult::Absent);
        };
        if state.size_mib == self.size_mib && state.active && state.persistent {
            return Ok(ProbeResult::PresentMatching);
        }
        Ok(ProbeResult::diverging(format!(
            "{} MiB, {}, {}",
            state.size_mib,
            if state.active { "active" } else { "inactive" },
            if state.persistent { "in fstab" } else { "not in fstab" },
        )))
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        self.host.ensure_swap(&self.path, self.size_mib).await
    }
}
