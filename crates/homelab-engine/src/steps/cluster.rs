//! Single-node cluster installation.
//!
//! The config file is written before the installer runs so the first start
//! already binds to the node address. The kubeconfig the installer leaves
//! behind points at loopback and is rewritten so it works from other hosts.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use homelab_common::fs::{
    clear_pending, is_pending, read_optional, stage_change, write_with_backup,
};
use homelab_common::retry::RetryConfig;
use homelab_common::{Error, Result};
use tracing::info;

use crate::collab::{ClusterApi, HostOps};
use crate::desired::{DesiredState, API_SERVER_PORT};
use crate::error::{ApplyError, ProbeError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{Step, StepMode};

const PRIVATE_MODE: u32 = 0o600;

/// API server URL reachable from the LAN
pub fn node_server(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => format!("https://{}:{}", v4, API_SERVER_PORT),
        IpAddr::V6(v6) => format!("https://[{}]:{}", v6, API_SERVER_PORT),
    }
}

/// Render the cluster config file from the desired state
pub fn render_cluster_config(desired: &DesiredState) -> Result<String> {
    let node_ip = desired.node_address().to_string();
    let bind = desired
        .cluster
        .bind_address
        .unwrap_or_else(|| desired.node_address())
        .to_string();

    let mut tls_sans: Vec<String> = desired.cluster.tls_sans.clone();
    if !tls_sans.contains(&node_ip) {
        tls_sans.push(node_ip.clone());
    }

    let mut config: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    config.insert("node-name".into(), desired.cluster.node_name.clone().into());
    config.insert("node-ip".into(), node_ip.clone().into());
    config.insert("advertise-address".into(), node_ip.into());
    config.insert("bind-address".into(), bind.into());
    config.insert(
        "flannel-iface".into(),
        desired.cluster_interface().to_string().into(),
    );
    config.insert(
        "tls-san".into(),
        serde_yaml::Value::Sequence(tls_sans.into_iter().map(Into::into).collect()),
    );
    config.insert("write-kubeconfig-mode".into(), "0600".into());
    for (key, value) in &desired.cluster.extra_args {
        config.insert(key.clone(), value.clone().into());
    }

    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization(format!("failed to render cluster config: {}", e)))?;
    Ok(format!("# Managed by homelab. Local edits are overwritten.\n{}", yaml))
}

/// Cluster config file; restarts the service when it changes under a running install.
///
/// Stays pending until the restart succeeds. Without an install the change is
/// settled at once since the installer reads the file on first start.
pub struct ClusterConfigStep {
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) path: PathBuf,
    pub(crate) contents: String,
}

#[async_trait]
impl Step for ClusterConfigStep {
    fn category(&self) -> StepCategory {
        StepCategory::ClusterInstall
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::ClusterConfig, self.path.display().to_string())
    }

    async fn probe(&self) -> std::result::Result<ProbeResult, ProbeError> {
        let current = read_optional(&self.path)?;
        let result = ProbeResult::of_content(current.as_deref(), &self.contents);
        if result.is_matching() && is_pending(&self.path)? {
            return Ok(ProbeResult::diverging("written, service not restarted"));
        }
        Ok(result)
    }

    async fn mutate(&self) -> std::result::Result<(), ApplyError> {
        if !stage_change(&self.path, &self.contents, Some(PRIVATE_MODE))? {
            return Ok(());
        }
        if self.host.cluster_version().await?.is_some() {
            info!(path = %self.path.display(), "Cluster config changed, restarting k3s");
            self.host.restart_cluster().await?;
        }
        clear_pending(&self.path)?;
        Ok(())
    }
}

/// Cluster binary, optionally pinned to a version
pub struct ClusterBinaryStep {
    pub(crate) host: Arc<dyn HostOps>,
    pub(crate) version: Option<String>,
}

#[async_trait]
impl Step for ClusterBinaryStep {
    fn category(&self) -> StepCategory {
        StepCategory::ClusterInstall
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceKind::ClusterBinary,
            self.version.as_deref().unwrap_or("k3s"),
        )
    }

    async fn probe(&self) -> std::result::Result<ProbeResult, ProbeError> {
        let installed = self.host.cluster_version().await?;
        Ok(match (installed, &self.version) {
            (None, _) => ProbeResult::Absent,
            (Some(_), None) => ProbeResult::PresentMatching,
            (Some(found), Some(pinned)) => ProbeResult::of_value(Some(found), pinned),
        })
    }

    async fn mutate(&self) -> std::result::Result<(), ApplyError> {
        self.host.install_cluster(self.version.clone()).await
    }
}

/// Waits for the node to report Ready
pub struct ClusterReadyStep {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) node_name: String,
    pub(crate) policy: RetryConfig,
}

#[async_trait]
impl Step for ClusterReadyStep {
    fn category(&self) -> StepCategory {
        StepCategory::ClusterInstall
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::ClusterNode, &self.node_name)
    }

    fn mode(&self) -> StepMode {
        StepMode::AwaitReady(self.policy.clone())
    }

    async fn probe(&self) -> std::result::Result<ProbeResult, ProbeError> {
        Ok(match self.cluster.node_ready(&self.node_name).await? {
            None => ProbeResult::Absent,
            Some(true) => ProbeResult::PresentMatching,
            Some(false) => ProbeResult::diverging("NotReady"),
        })
    }
}

/// Kubeconfig pointing at the node address instead of loopback
pub struct KubeconfigStep {
    pub(crate) path: PathBuf,
    pub(crate) server: String,
}

const SERVER_KEY: &str = "server:";

/// Server URLs found in a kubeconfig, in file order
fn servers(contents: &str) -> Vec<&str> {
    contents
        .lines()
        .filter_map(|l| l.trim_start().strip_prefix(SERVER_KEY))
        .map(str::trim)
        .collect()
}

impl KubeconfigStep {
    /// Point every cluster entry at the node server, keeping indentation
    fn rewrite(&self, contents: &str) -> String {
        let mut out = String::with_capacity(contents.len());
        for line in contents.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with(SERVER_KEY) {
                let indent = &line[..line.len() - trimmed.len()];
                out.push_str(&format!("{}{} {}", indent, SERVER_KEY, self.server));
            } else {
                out.push_str(line);
            }
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl Step for KubeconfigStep {
    fn category(&self) -> StepCategory {
        StepCategory::ClusterInstall
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::Kubeconfig, self.path.display().to_string())
    }

    async fn probe(&self) -> std::result::Result<ProbeResult, ProbeError> {
        let Some(current) = read_optional(&self.path)? else {
            return Ok(ProbeResult::Absent);
        };
        let found = servers(&current);
        if found.is_empty() {
            return Ok(ProbeResult::diverging("no server entry"));
        }
        match found.iter().find(|s| **s != self.server) {
            Some(other) => Ok(ProbeResult::diverging(format!("server {}", other))),
            None => Ok(ProbeResult::PresentMatching),
        }
    }

    async fn mutate(&self) -> std::result::Result<(), ApplyError> {
        let current = read_optional(&self.path)?.ok_or_else(|| {
            ApplyError::Other(format!(
                "{} not written by the cluster yet",
                self.path.display()
            ))
        })?;
        write_with_backup(&self.path, &self.rewrite(&current), Some(PRIVATE_MODE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MockClusterApi, MockHostOps};
    use crate::desired::tests::sample;
    use homelab_common::fs::list_backups;

    const KUBECONFIG: &str = "apiVersion: v1\nclusters:\n- cluster:\n    server: https://127.0.0.1:6443\n  name: default\n";

    #[test]
    fn cluster_config_binds_to_node_address() {
        let config = render_cluster_config(&sample()).unwrap();
        assert!(config.contains("node-ip: 192.168.2.60"));
        assert!(config.contains("advertise-address: 192.168.2.60"));
        assert!(config.contains("bind-address: 192.168.2.60"));
        assert!(config.contains("flannel-iface: eth0"));
        assert!(config.contains("- pi-node.lan"));
        assert!(config.contains("- 192.168.2.60"));
    }

    #[test]
    fn ipv6_servers_are_bracketed() {
        assert_eq!(
            node_server("fd00::10".parse().unwrap()),
            "https://[fd00::10]:6443"
        );
    }

    #[tokio::test]
    async fn unpinned_binary_matches_any_version() {
        let mut host = MockHostOps::new();
        host.expect_cluster_version()
            .returning(|| Ok(Some("v1.30.4+k3s1".to_string())));
        let step = ClusterBinaryStep {
            host: Arc::new(host),
            version: None,
        };
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn pinned_binary_diverges_on_other_version() {
        let mut host = MockHostOps::new();
        host.expect_cluster_version()
            .returning(|| Ok(Some("v1.29.0+k3s1".to_string())));
        let step = ClusterBinaryStep {
            host: Arc::new(host),
            version: Some("v1.30.4+k3s1".to_string()),
        };
        assert_eq!(
            step.probe().await.unwrap(),
            ProbeResult::diverging("v1.29.0+k3s1")
        );
    }

    #[tokio::test]
    async fn config_change_restarts_running_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "node-name: old\n").unwrap();

        let mut host = MockHostOps::new();
        host.expect_cluster_version()
            .returning(|| Ok(Some("v1.30.4+k3s1".to_string())));
        host.expect_restart_cluster().times(1).returning(|| Ok(()));
        let step = ClusterConfigStep {
            host: Arc::new(host),
            path: path.clone(),
            contents: render_cluster_config(&sample()).unwrap(),
        };

        step.mutate().await.unwrap();
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn failed_restart_is_retried_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "node-name: old\n").unwrap();

        let mut host = MockHostOps::new();
        host.expect_cluster_version()
            .returning(|| Ok(Some("v1.30.4+k3s1".to_string())));
        let mut restarts = 0;
        host.expect_restart_cluster().times(2).returning(move || {
            restarts += 1;
            if restarts == 1 {
                Err(ApplyError::Command {
                    command: "systemctl restart k3s".to_string(),
                    message: "job failed".to_string(),
                })
            } else {
                Ok(())
            }
        });
        let step = ClusterConfigStep {
            host: Arc::new(host),
            path,
            contents: render_cluster_config(&sample()).unwrap(),
        };

        assert!(step.mutate().await.is_err());
        assert_eq!(
            step.probe().await.unwrap(),
            ProbeResult::diverging("written, service not restarted")
        );
        step.mutate().await.unwrap();
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn unreadable_cluster_version_fails_the_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = MockHostOps::new();
        host.expect_cluster_version().returning(|| {
            Err(ProbeError::Tool {
                tool: "k3s --version".to_string(),
                message: "permission denied".to_string(),
            })
        });
        host.expect_restart_cluster().never();
        let step = ClusterConfigStep {
            host: Arc::new(host),
            path: dir.path().join("config.yaml"),
            contents: render_cluster_config(&sample()).unwrap(),
        };

        assert!(step.mutate().await.is_err());
        assert!(!step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn node_not_ready_diverges() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_node_ready().returning(|_| Ok(Some(false)));
        let step = ClusterReadyStep {
            cluster: Arc::new(cluster),
            node_name: "pi-node".to_string(),
            policy: RetryConfig::default(),
        };
        assert_eq!(step.probe().await.unwrap(), ProbeResult::diverging("NotReady"));
    }

    #[tokio::test]
    async fn kubeconfig_is_rewritten_to_node_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k3s.yaml");
        std::fs::write(&path, KUBECONFIG).unwrap();
        let step = KubeconfigStep {
            path: path.clone(),
            server: node_server("192.168.2.60".parse().unwrap()),
        };

        assert!(matches!(
            step.probe().await.unwrap(),
            ProbeResult::PresentDiverging { .. }
        ));
        step.mutate().await.unwrap();
        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("server: https://192.168.2.60:6443"));
        assert!(step.probe().await.unwrap().is_matching());
    }

    #[tokio::test]
    async fn kubeconfig_follows_address_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k3s.yaml");
        std::fs::write(&path, KUBECONFIG.replace("127.0.0.1", "192.168.2.50")).unwrap();
        let step = KubeconfigStep {
            path: path.clone(),
            server: node_server("192.168.2.60".parse().unwrap()),
        };

        assert_eq!(
            step.probe().await.unwrap(),
            ProbeResult::diverging("server https://192.168.2.50:6443")
        );
        step.mutate().await.unwrap();
        assert!(step.probe().await.unwrap().is_matching());
        assert_eq!(list_backups(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_kubeconfig_cannot_be_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let step = KubeconfigStep {
            path: dir.path().join("k3s.yaml"),
            server: node_server("192.168.2.60".parse().unwrap()),
        };
        assert_eq!(step.probe().await.unwrap(), ProbeResult::Absent);
        assert!(step.mutate().await.is_err());
    }
}
