//! Host identity and interface addressing.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use homelab_common::fs::{clear_pending, is_pending, read_optional, stage_change};
use homelab_common::{Error, Result};
use tracing::info;

use crate::collab::{HostOps, NetworkBackend};
use crate::desired::NetworkSpec;
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::Step;

/// netplan refuses world-readable configs
const NETPLAN_MODE: u32 = 0o600;

/// Static hostname
pub struct HostnameStep {
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) hostname: String,
}

#[async_trait]
impl Step for HostnameStep {
    fn category(&self) -> StepCategory {
        StepCategory::Network
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::Hostname, &self.hostname)
    }

    async fn probe(&self) -> std::result::Result<ProbeResult, ProbeError> {
        let current = self.host.hostname().await?;
        // an unset static hostname reads back empty
        let current = Some(current).filter(|h| !h.is_empty());
        Ok(ProbeResult::of_value(current, &self.hostname))
    }

    async fn mutate(&self) -> std::result::Result<(), ApplyError> {
        self.host.set_hostname(&self.hostname).await
    }
}

/// Netplan file for the primary interface, applied when it changes.
///
/// A written file stays pending until `netplan apply` succeeds, so a failed
/// or interrupted apply is retried by the next run.
pub struct NetworkConfigStep {
    pub(crate) backend: Arc<dyn NetworkBackend>,
    pub(crate) path: PathBuf,
    pub(crate) contents: String,
}

impl NetworkConfigStep {
    /// Step writing `spec` rendered as netplan YAML
    pub fn new(backend: Arc<dyn NetworkBackend>, spec: &NetworkSpec) -> Result<Self> {
        Ok(Self {
            backend,
            path: spec.config_path.clone(),
            contents: render_netplan(spec)?,
        })
    }
}

#[async_trait]
impl Step for NetworkConfigStep {
    fn category(&self) -> StepCategory {
        StepCategory::Network
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::NetworkConfig, self.path.display().to_string())
    }

    async fn probe(&self) -> std::result::Result<ProbeResult, ProbeError> {
        let current = read_optional(&self.path)?;
        let result = ProbeResult::of_content(current.as_deref(), &self.contents);
        if result.is_matching() && is_pending(&self.path)? {
            return Ok(ProbeResult::diverging("written, not applied"));
        }
        Ok(result)
    }

    async fn mutate(&self) -> std::result::Result<(), ApplyError> {
        if stage_change(&self.path, &self.contents, Some(NETPLAN_MODE))? {
            info!(path = %self.path.display(), "Applying network configuration");
            self.backend.apply().await?;
            clear_pending(&self.path)?;
        }
        Ok(())
    }
}

/// Render netplan v2 YAML for a single statically addressed ethernet
pub fn render_netplan(spec: &NetworkSpec) -> Result<String> {
    let (dhcp4, dhcp6) = match spec.address {
        IpAddr::V4(_) => ("dhcp4", "dhcp6"),
        IpAddr::V6(_) => ("dhcp6", "dhcp4"),
    };
    let mut nameservers = serde_json::json!({
        "addresses": spec.nameservers.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
    });
    if !spec.search_domains.is_empty() {
        nameservers["search"] = serde_json::json!(spec.search_domains);
    }

    let doc = serde_json::json!({
        "network": {
            "version": 2,
            "renderer": "networkd",
            "ethernets": {
                spec.interface.clone(): {
                    dhcp4: false,
                    dhcp6: false,
                    "addresses": [format!("{}/{}", spec.address, spec.prefix_length)],
                    "routes": [{ "to": "default", "via": spec.gateway.to_string() }],
                    "nameservers": nameservers
                }
            }
        }
    });

    let yaml = serde_yaml::to_string(&doc)
        .map_err(|e| Error::serialization(format!("failed to render netplan: {}", e)))?;
    Ok(format!("# Managed by homelab. Local edits are overwritten.\n{}", yaml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MockHostOps, MockNetworkBackend};
    use crate::desired::tests::sample;
    use crate::error::StepError;
    use crate::executor::StepExecutor;
    use crate::step::StepOutcome;
    use homelab_common::fs::list_backups;

    fn netplan_step(dir: &std::path::Path, backend: MockNetworkBackend) -> NetworkConfigStep {
        let mut spec = sample().network;
        spec.config_path = dir.join("60-homelab.yaml");
        NetworkConfigStep::new(Arc::new(backend), &spec).unwrap()
    }

    #[test]
    fn netplan_render_is_static() {
        let yaml = render_netplan(&sample().network).unwrap();
        assert!(yaml.starts_with("# Managed by homelab"));
        assert!(yaml.contains("eth0:"));
        assert!(yaml.contains("192.168.2.60/24"));
        assert!(yaml.contains("via: 192.168.2.1"));
        assert!(yaml.contains("dhcp4: false"));
        assert!(!yaml.contains("search"));
    }

    #[test]
    fn netplan_render_is_deterministic() {
        let spec = sample().network;
        assert_eq!(render_netplan(&spec).unwrap(), render_netplan(&spec).unwrap());
    }

    #[tokio::test]
    async fn hostname_mismatch_is_diverging() {
        let mut host = MockHostOps::new();
        host.expect_hostname()
            .returning(|| Ok("ubuntu".to_string()));
        let step = HostnameStep {
            host: Arc::new(host),
            hostname: "pi-node".to_string(),
        };
        assert_eq!(step.probe().await.unwrap(), ProbeResult::diverging("ubuntu"));
    }

    #[tokio::test]
    async fn unchanged_netplan_is_matching() {
        let dir = tempfile::tempdir().unwrap();
        let step = netplan_step(dir.path(), MockNetworkBackend::new());
        std::fs::write(&step.path, &step.contents).unwrap();
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn changed_netplan_is_backed_up_and_applied_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockNetworkBackend::new();
        backend.expect_apply().times(1).returning(|| Ok(()));
        let step = netplan_step(dir.path(), backend);
        std::fs::write(&step.path, "network: {version: 2}\n").unwrap();

        assert!(matches!(
            step.probe().await.unwrap(),
            ProbeResult::PresentDiverging { .. }
        ));
        step.mutate().await.unwrap();

        assert_eq!(std::fs::read_to_string(&step.path).unwrap(), step.contents);
        let backups = list_backups(&step.path).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&backups[0]).unwrap(),
            "network: {version: 2}\n"
        );
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn failed_netplan_apply_is_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockNetworkBackend::new();
        let mut calls = 0;
        backend.expect_apply().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Err(ApplyError::Other("netplan apply failed".to_string()))
            } else {
                Ok(())
            }
        });
        let step = netplan_step(dir.path(), backend);
        let executor = StepExecutor::new();

        assert!(matches!(
            executor.apply(&step).await,
            StepOutcome::Failed(StepError::Apply(_))
        ));
        // file already holds the new content but the change never took effect
        assert_eq!(std::fs::read_to_string(&step.path).unwrap(), step.contents);
        assert_eq!(
            step.probe().await.unwrap(),
            ProbeResult::diverging("written, not applied")
        );

        assert_eq!(executor.apply(&step).await, StepOutcome::Applied);
        assert_eq!(executor.apply(&step).await, StepOutcome::AlreadySatisfied);
    }
}
