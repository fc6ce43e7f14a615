//! Application workloads and their ingress routes.

use std::sync::Arc;

use async_trait::async_trait;
use homelab_common::retry::RetryConfig;

use crate::collab::{ClusterApi, IngressState, WorkloadState};
use crate::desired::{IngressPolicy, IngressRoute, Workload};
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{Criticality, Step};

/// Deployment and service for one workload, verified until the rollout is available
pub struct WorkloadStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) workload: Workload,
    pub(crate) rollout: RetryConfig,
}

impl WorkloadStep {
    fn mismatches(&self, state: &WorkloadState) -> Vec<String> {
        let w = &self.workload;
        let mut found = Vec::new();
        if state.image != w.image {
            found.push(format!("image {}", state.image));
        }
        if state.replicas != w.replicas {
            found.push(format!("replicas {}", state.replicas));
        }
        if state.container_port != Some(w.port) {
            found.push(match state.container_port {
                Some(port) => format!("container port {}", port),
                None => "no container port".to_string(),
            });
        }
        if !w.resources.matches(&state.resources) {
            found.push("resources differ".to_string());
        }
        match state.service_port {
            None => found.push("no service".to_string()),
            Some(port) if port != w.port => found.push(format!("service port {}", port)),
            Some(_) => {}
        }
        if !state.available {
            found.push("rollout not available".to_string());
        }
        found
    }
}

#[async_trait]
impl Step for WorkloadStep {
    fn category(&self) -> StepCategory {
        StepCategory::ApplicationWorkloads
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(
            ResourceKind::Deployment,
            &self.workload.namespace,
            &self.workload.name,
        )
    }

    fn settle(&self) -> Option<RetryConfig> {
        Some(self.rollout.clone())
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let Some(state) = self
            .cluster
            .get_workload(&self.workload.namespace, &self.workload.name)
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
        self.cluster.apply_workload(&self.workload).await
    }
}

/// Host rule routing a hostname to a service.
///
/// The TLS section is owned by a later step and ignored here. Under
/// [`IngressPolicy::Preserve`] an existing ingress that routes elsewhere is
/// left alone and reported as a warning.
pub struct IngressRouteStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) route: IngressRoute,
    pub(crate) policy: IngressPolicy,
}

fn route_mismatch(route: &IngressRoute, state: &IngressState) -> Option<String> {
    if state.host == route.hostname && state.service == route.service && state.port == route.port
    {
        return None;
    }
    Some(format!(
        "{} -> {}:{}",
        state.host, state.service, state.port
    ))
}

#[async_trait]
impl Step for IngressRouteStep {
    fn category(&self) -> StepCategory {
        StepCategory::ApplicationWorkloads
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(
            ResourceKind::Ingress,
            &self.route.namespace,
            self.route.ingress_name(),
        )
    }

    fn criticality(&self) -> Criticality {
        match self.policy {
            IngressPolicy::Overwrite => Criticality::Required,
            IngressPolicy::Preserve => Criticality::Advisory,
        }
    }

    fn replaces_diverging(&self) -> bool {
        self.policy == IngressPolicy::Overwrite
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let Some(state) = self
            .cluster
            .get_ingress(&self.route.namespace, &self.route.ingress_name())
            .await?
        else {
            return Ok(ProbeResult::Absent);
        };
        Ok(match route_mismatch(&self.route, &state) {
            None => ProbeResult::PresentMatching,
            Some(actual) => ProbeResult::diverging(actual),
        })
    }

    async fn mutate(&self) -> Result<(), ApplyError> {
        self.cluster.apply_ingress_route(&self.route).await
    }
}
