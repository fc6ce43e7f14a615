//! Chart releases through the helm CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use homelab_common::command::run_command;
use serde::Deserialize;

use super::{ChartInstaller, ReleaseState};
use crate::desired::ChartRelease;
use crate::error::{ApplyError, ProbeError};

/// How long helm may wait for a release's resources
const HELM_WAIT_TIMEOUT: &str = "10m";

/// [`ChartInstaller`] shelling out to `helm`
#[derive(Debug, Clone)]
pub struct HelmCli {
    kubeconfig: PathBuf,
}

impl HelmCli {
    /// Helm against the cluster behind `kubeconfig`
    pub fn new(kubeconfig: PathBuf) -> Self {
        Self { kubeconfig }
    }

    fn kubeconfig(&self) -> String {
        self.kubeconfig.display().to_string()
    }
}

/// Entry of `helm list -o json`
#[derive(Debug, Deserialize)]
struct ListedRelease {
    name: String,
    chart: String,
    status: String,
}

#[async_trait]
impl ChartInstaller for HelmCli {
    async fn get_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReleaseState>, ProbeError> {
        let kubeconfig = self.kubeconfig();
        let filter = format!("^{}$", name);
        let listed = run_command(
            "helm",
            &[
                "list",
                "--namespace",
                namespace,
                "--filter",
                &filter,
                "--all",
                "--output",
                "json",
                "--kubeconfig",
                &kubeconfig,
            ],
            &[],
        )
        .await?;
        let releases: Vec<ListedRelease> = serde_json::from_str(&listed)
            .map_err(|e| ProbeError::Other(format!("unexpected helm list output: {}", e)))?;
        let Some(release) = releases.into_iter().find(|r| r.name == name) else {
            return Ok(None);
        };

        let values = run_command(
            "helm",
            &[
                "get",
                "values",
                name,
                "--namespace",
                namespace,
                "--output",
                "json",
                "--kubeconfig",
                &kubeconfig,
            ],
            &[],
        )
        .await?;
        let values: serde_json::Value = serde_json::from_str(&values)
            .map_err(|e| ProbeError::Other(format!("unexpected helm values output: {}", e)))?;

        let (chart, version) = split_chart_ref(&release.chart);
        Ok(Some(ReleaseState {
            chart,
            version,
            status: release.status,
            values: flatten_values(&values),
        }))
    }

    async fn install_or_upgrade(&self, release: &ChartRelease) -> Result<(), ApplyError> {
        let kubeconfig = self.kubeconfig();
        let args = upgrade_args(release, &kubeconfig);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_command("helm", &args, &[]).await?;
        Ok(())
    }
}

/// Split `argo-cd-7.3.4` into `("argo-cd", "7.3.4")`
fn split_chart_ref(chart_ref: &str) -> (String, String) {
    let split = chart_ref
        .char_indices()
        .filter(|(_, c)| *c == '-')
        .map(|(i, _)| i)
        .find(|i| {
            chart_ref[i + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        });
    match split {
        Some(i) => (chart_ref[..i].to_string(), chart_ref[i + 1..].to_string()),
        None => (chart_ref.to_string(), String::new()),
    }
}

/// Flatten helm values to the `--set` key syntax
fn flatten_values(values: &serde_json::Value) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    flatten_into(&mut flat, String::new(), values);
    flat
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null if prefix.is_empty() => {}
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(out, path, child);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(out, format!("{}[{}]", prefix, i), child);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(prefix, s.clone());
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}

fn upgrade_args(release: &ChartRelease, kubeconfig: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "upgrade",
        "--install",
        release.name.as_str(),
        release.chart.as_str(),
        "--repo",
        release.repo.as_str(),
        "--namespace",
        release.namespace.as_str(),
        "--create-namespace",
        "--wait",
        "--timeout",
        HELM_WAIT_TIMEOUT,
        "--kubeconfig",
        kubeconfig,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(version) = &release.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    for (key, value) in &release.values {
        args.push("--set".to_string());
        args.push(format!("{}={}", key, value.replace(',', "\\,")));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_ref_splits_at_version() {
        assert_eq!(
            split_chart_ref("argo-cd-7.3.4"),
            ("argo-cd".to_string(), "7.3.4".to_string())
        );
        assert_eq!(
            split_chart_ref("kube-prometheus-stack-61.1.0"),
            ("kube-prometheus-stack".to_string(), "61.1.0".to_string())
        );
        assert_eq!(
            split_chart_ref("loki"),
            ("loki".to_string(), String::new())
        );
    }

    #[test]
    fn values_flatten_to_set_syntax() {
        let values = serde_json::json!({
            "server": { "insecure": true, "replicas": 2 },
            "grafana": { "ingress": { "hosts": ["grafana.pizza"] } },
            "name": "x"
        });
        let flat = flatten_values(&values);
        assert_eq!(flat.get("server.insecure").map(String::as_str), Some("true"));
        assert_eq!(flat.get("server.replicas").map(String::as_str), Some("2"));
        assert_eq!(
            flat.get("grafana.ingress.hosts[0]").map(String::as_str),
            Some("grafana.pizza")
        );
        assert_eq!(flat.get("name").map(String::as_str), Some("x"));
    }

    #[test]
    fn null_values_flatten_to_nothing() {
        assert!(flatten_values(&serde_json::Value::Null).is_empty());
    }

    #[test]
    fn upgrade_args_pin_version_and_escape_commas() {
        let release = ChartRelease {
            name: "argocd".to_string(),
            namespace: "argocd".to_string(),
            chart: "argo-cd".to_string(),
            repo: "https://argoproj.github.io/argo-helm".to_string(),
            version: Some("7.3.4".to_string()),
            values: BTreeMap::from([("configs.params.list".to_string(), "a,b".to_string())]),
        };
        let args = upgrade_args(&release, "/etc/rancher/k3s/k3s.yaml");
        assert_eq!(&args[..4], &["upgrade", "--install", "argocd", "argo-cd"]);
        assert!(args.windows(2).any(|w| w == ["--version", "7.3.4"]));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--set" && w[1] == "configs.params.list=a\\,b"));
    }
}
