//! Health endpoints: API `/readyz`, bundled pods, and routes through the ingress.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tokio::sync::OnceCell;
use tracing::debug;

use super::cluster::{probe_err, KubeClusterApi};
use super::{HealthChecks, PodHealth};
use crate::error::ProbeError;

const ROUTE_TIMEOUT: Duration = Duration::from_secs(6);
const USER_AGENT: &str = concat!("homelab/", env!("CARGO_PKG_VERSION"));

/// [`HealthChecks`] sharing the cluster's lazily built kube client.
///
/// Routes are requested at the node address with the route's `Host` header,
/// so they can be checked before DNS points at the node.
pub struct StackHealth {
    cluster: Arc<KubeClusterApi>,
    http: OnceCell<reqwest::Client>,
}

impl StackHealth {
    /// Health checks against the cluster behind `cluster`
    pub fn new(cluster: Arc<KubeClusterApi>) -> Self {
        Self {
            cluster,
            http: OnceCell::new(),
        }
    }

    async fn http(&self) -> Result<&reqwest::Client, ProbeError> {
        self.http
            .get_or_try_init(|| async {
                // the leaf is self-signed and redirects to HTTPS count as answers
                reqwest::Client::builder()
                    .danger_accept_invalid_certs(true)
                    .redirect(reqwest::redirect::Policy::none())
                    .user_agent(USER_AGENT)
                    .timeout(ROUTE_TIMEOUT)
                    .build()
                    .map_err(|e| ProbeError::Other(format!("failed to build HTTP client: {}", e)))
            })
            .await
    }
}

/// Base URL of the ingress at `address`
pub fn ingress_url(address: IpAddr, https: bool) -> String {
    let scheme = if https { "https" } else { "http" };
    match address {
        IpAddr::V4(v4) => format!("{}://{}/", scheme, v4),
        IpAddr::V6(v6) => format!("{}://[{}]/", scheme, v6),
    }
}

fn pod_health(pod: &Pod) -> PodHealth {
    let status = pod.status.as_ref();
    let containers = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or_default();
    PodHealth {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        ready: !containers.is_empty() && containers.iter().all(|c| c.ready),
    }
}

#[async_trait]
impl HealthChecks for StackHealth {
    async fn api_readyz(&self) -> Result<String, ProbeError> {
        let client = self.cluster.probe_client().await?;
        let request = http::Request::get("/readyz")
            .body(Vec::new())
            .map_err(|e| ProbeError::Other(format!("failed to build /readyz request: {}", e)))?;
        client.request_text(request).await.map_err(probe_err)
    }

    async fn pods(&self, namespace: &str, prefix: &str) -> Result<Vec<PodHealth>, ProbeError> {
        let api: Api<Pod> = Api::namespaced(self.cluster.probe_client().await?, namespace);
        let pods = api.list(&ListParams::default()).await.map_err(probe_err)?;
        Ok(pods
            .items
            .iter()
            .filter(|p| p.metadata.name.as_deref().is_some_and(|n| n.starts_with(prefix)))
            .map(pod_health)
            .collect())
    }

    async fn route_status(
        &self,
        address: IpAddr,
        host: &str,
        https: bool,
    ) -> Result<u16, ProbeError> {
        let url = ingress_url(address, https);
        debug!(url = %url, host, "Requesting route");
        let response = self
            .http()
            .await?
            .get(&url)
            .header(reqwest::header::HOST, host)
            .send()
            .await
            .map_err(|e| ProbeError::Tool {
                tool: format!("GET {} (Host: {})", url, host),
                message: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}
