//! DNS sanity checks. Records live on an external resolver, so these only observe.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collab::NameResolver;
use crate::error::ProbeError;
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{Criticality, Step, StepMode};

/// Route hostname resolves to the node address
pub struct DnsRecordStep {
    pub(crate) resolver: Arc<dyn NameResolver>,
    pub(crate) hostname: String,
    pub(crate) expected: IpAddr,
}

#[async_trait]
impl Step for DnsRecordStep {
    fn category(&self) -> StepCategory {
        StepCategory::DnsSanity
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::DnsRecord, &self.hostname)
    }

    fn mode(&self) -> StepMode {
        StepMode::Observe
    }

    fn criticality(&self) -> Criticality {
        Criticality::Advisory
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let addresses = self.resolver.resolve(&self.hostname).await?;
        if addresses.is_empty() {
            return Ok(ProbeResult::Absent);
        }
        if addresses.contains(&self.expected) {
            return Ok(ProbeResult::PresentMatching);
        }
        let found: Vec<String> = addresses.iter().map(IpAddr::to_string).collect();
        Ok(ProbeResult::diverging(format!(
            "resolves to {} (expected {})",
            found.join(", "),
            self.expected
        )))
    }
}
