//! Post-convergence health: the API answers `/readyz`, bundled pods are ready,
//! and every route answers through the ingress. Observations only.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collab::HealthChecks;
use crate::error::ProbeError;
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{Criticality, Step, StepMode};

/// API server `/readyz` answers `ok`
pub struct ApiReadyStep {
    pub(crate) health: Arc<dyn HealthChecks>,
}

#[async_trait]
impl Step for ApiReadyStep {
    fn category(&self) -> StepCategory {
        StepCategory::StackHealth
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::ApiEndpoint, "/readyz")
    }

    fn mode(&self) -> StepMode {
        StepMode::Observe
    }

    fn criticality(&self) -> Criticality {
        Criticality::Advisory
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let body = self.health.api_readyz().await?;
        let body = body.trim();
        if body.eq_ignore_ascii_case("ok") {
            Ok(ProbeResult::PresentMatching)
        } else {
            Ok(ProbeResult::diverging(body.lines().last().unwrap_or("empty answer")))
        }
    }
}

/// Some pod of a bundled component is running and ready
pub struct CorePodStep {
    pub(crate) health: Arc<dyn HealthChecks>,
    pub(crate) namespace: String,
    pub(crate) component: String,
}

#[async_trait]
impl Step for CorePodStep {
    fn category(&self) -> StepCategory {
        StepCategory::StackHealth
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::namespaced(ResourceKind::CorePod, &self.namespace, &self.component)
    }

    fn mode(&self) -> StepMode {
        StepMode::Observe
    }

    fn criticality(&self) -> Criticality {
        Criticality::Advisory
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let pods = self.health.pods(&self.namespace, &self.component).await?;
        if pods.is_empty() {
            return Ok(ProbeResult::Absent);
        }
        if pods.iter().any(|p| p.is_healthy()) {
            return Ok(ProbeResult::PresentMatching);
        }
        let states: Vec<String> = pods
            .iter()
            .map(|p| {
                let ready = if p.ready { "ready" } else { "not ready" };
                format!("{} {} {}", p.name, p.phase, ready)
            })
            .collect();
        Ok(ProbeResult::diverging(states.join(", ")))
    }
}

/// Route answers through the ingress at the node address
pub struct RouteReachableStep {
    pub(crate) health: Arc<dyn HealthChecks>,
    pub(crate) address: IpAddr,
    pub(crate) hostname: String,
    pub(crate) https: bool,
}

#[async_trait]
impl Step for RouteReachableStep {
    fn category(&self) -> StepCategory {
        StepCategory::StackHealth
    }

    fn resource(&self) -> ResourceRef {
        let scheme = if self.https { "https" } else { "http" };
        ResourceRef::new(
            ResourceKind::Route,
            format!("{}://{}", scheme, self.hostname),
        )
    }

    fn mode(&self) -> StepMode {
        StepMode::Observe
    }

    fn criticality(&self) -> Criticality {
        Criticality::Advisory
    }

    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let status = self
            .health
            .route_status(self.address, &self.hostname, self.https)
            .await?;
        // anything below 500 means the backend was reached
        if (100..500).contains(&status) {
            Ok(ProbeResult::PresentMatching)
        } else {
            Ok(ProbeResult::diverging(format!("HTTP {}", status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MockHealthChecks, PodHealth};

    fn pod(name: &str, phase: &str, ready: bool) -> PodHealth {
        PodHealth {
            name: name.to_string(),
            phase: phase.to_string(),
            ready,
        }
    }

    fn core_pod(pods: Vec<PodHealth>) -> CorePodStep {
        let mut health = MockHealthChecks::new();
        health
            .expect_pods()
            .withf(|ns, prefix| ns == "kube-system" && prefix == "coredns")
            .returning(move |_, _| Ok(pods.clone()));
        CorePodStep {
            health: Arc::new(health),
            namespace: "kube-system".to_string(),
            component: "coredns".to_string(),
        }
    }

    fn route(answer: Result<u16, ProbeError>) -> RouteReachableStep {
        let mut health = MockHealthChecks::new();
        health
            .expect_route_status()
            .withf(|address, host, https| {
                address.to_string() == "192.168.2.60" && host == "whoami.pizza" && !https
            })
            .returning(move |_, _, _| answer.clone());
        RouteReachableStep {
            health: Arc::new(health),
            address: "192.168.2.60".parse().unwrap(),
            hostname: "whoami.pizza".to_string(),
            https: false,
        }
    }

    #[tokio::test]
    async fn readyz_ok_matches() {
        let mut health = MockHealthChecks::new();
        health.expect_api_readyz().returning(|| Ok("ok".to_string()));
        let step = ApiReadyStep {
            health: Arc::new(health),
        };
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn failing_readyz_reports_last_line() {
        let mut health = MockHealthChecks::new();
        health.expect_api_readyz().returning(|| {
            Ok("[+]ping ok\n[-]etcd failed: reason withheld\nreadyz check failed\n".to_string())
        });
        let step = ApiReadyStep {
            health: Arc::new(health),
        };
        assert_eq!(
            step.probe().await.unwrap(),
            ProbeResult::diverging("readyz check failed")
        );
    }

    #[tokio::test]
    async fn one_ready_replica_is_enough() {
        let step = core_pod(vec![
            pod("coredns-a", "Pending", false),
            pod("coredns-b", "Running", true),
        ]);
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn missing_component_is_absent() {
        assert_eq!(core_pod(vec![]).probe().await.unwrap(), ProbeResult::Absent);
    }

    #[tokio::test]
    async fn unready_component_lists_its_pods() {
        let step = core_pod(vec![pod("coredns-a", "Running", false)]);
        assert_eq!(
            step.probe().await.unwrap(),
            ProbeResult::diverging("coredns-a Running not ready")
        );
    }

    #[tokio::test]
    async fn client_errors_still_mean_reachable() {
        for status in [200, 301, 404] {
            assert!(route(Ok(status)).probe().await.unwrap().is_matching());
        }
    }

    #[tokio::test]
    async fn server_errors_diverge() {
        assert_eq!(
            route(Ok(502)).probe().await.unwrap(),
            ProbeResult::diverging("HTTP 502")
        );
    }

    #[tokio::test]
    async fn unreachable_route_is_a_probe_error() {
        let err = ProbeError::Tool {
            tool: "GET http://192.168.2.60/ (Host: whoami.pizza)".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(route(Err(err.clone())).probe().await.unwrap_err(), err);
    }

    #[test]
    fn health_steps_only_observe() {
        let step = route(Ok(200));
        assert_eq!(step.mode(), StepMode::Observe);
        assert_eq!(step.criticality(), Criticality::Advisory);
        assert_eq!(step.resource().name, "http://whoami.pizza");
    }
}
