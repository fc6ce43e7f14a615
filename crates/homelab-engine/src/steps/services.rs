//! Namespaces, chart releases and the ingress controller gate.

use std::sync::Arc;

use async_trait::async_trait;
use homelab_common::retry::RetryConfig;

use crate::collab::{ChartInstaller, ClusterApi, ReleaseState};
use crate::desired::ChartRelease;
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{Step, StepMode};

const RELEASE_DEPLOYED: &str = "deployed";

/// Namespace labelled as managed
pub struct NamespaceStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) name: String,
}

#[async_trait]
impl Step for NamespaceStep {
    fn category(&self) -> StepCategory {
        StepCategory::CoreServices
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::Namespace, &self.name)
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        Ok(if self.cluster.namespace_exists(&self.name).await? {
            ProbeResult::PresentMatching
        } else {
            ProbeResult::Absent
        })
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        self.cluster.apply_namespace(&self.name).await
    }
}

/// Chart release at a pinned version with a fixed parameter set
pub struct ReleaseStep {
    pub(crate) charts: Arc<dyn ChartInstaller>,
    pub(crate) release: ChartRelease,
}

impl ReleaseStep {
    /// What differs between the installed release and the desired one
    fn mismatches(&self, state: &ReleaseState) -> Vec<String> {
        let mut found = Vec::new();
        if state.chart != self.release.chart {
            found.push(format!("chart {}", state.chart));
        }
        if let Some(version) = &self.release.version {
            if &state.version != version {
                found.push(format!("version {}", state.version));
            }
        }
        if state.status != RELEASE_DEPLOYED {
            found.push(format!("status {}", state.status));
        }
        if state.values != self.release.values {
            found.push("values differ".to_string());
        }
        found
    }
}

#[async_trait]
impl Step for ReleaseStep {
    fn category(&self) -> StepCategory {
        StepCategory::CoreServices
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(
            ResourceKind::ChartRelease,
            &self.release.namespace,
            &self.release.name,
        )
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let Some(state) = self
            .charts
            .get_release(&self.release.namespace, &self.release.name)
            .await?
        else {
            return Ok(ProbeResult::Absent);
        };
        let mismatches = self.mismatches(&state);
        Ok(if mismatches.is_empty() {
            ProbeResult::PresentMatching
        } else {
            ProbeResult::diverging(mismatches.join(", "))
        })
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        self.charts.install_or_upgrade(&self.release).await
    }
}

/// Waits for the ingress controller deployment to become available
pub struct IngressControllerStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) namespace: String,
    pub(crate) deployment: String,
    pub(crate) policy: RetryConfig,
}

#[async_trait]
impl Step for IngressControllerStep {
    fn category(&self) -> StepCategory {
        StepCategory::IngressControllerReady
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(ResourceKind::Deployment, &self.namespace, &self.deployment)
    }

    fn mode(&self) -> StepMode {
        StepMode::AwaitReady(self.policy.clone())
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        Ok(
            match self
                .cluster
                .deployment_available(&self.namespace, &self.deployment)
                .await?
            {
                None => ProbeResult::Absent,
                Some(true) => ProbeResult::PresentMatching,
                Some(false) => ProbeResult::diverging("not available"),
            },
        )
    }
}
