//! Per-step outcomes of one run and their rendering.
//!
//! The report is the run's primary output: it always renders, fatal failure
//! or not, and carries one remediation hint per failed step.

use tracing::warn;

use crate::error::{ProbeError, StepError};
use crate::planner::{Disposition, StepCategory};
use crate::resource::{ResourceKind, ResourceRef};
use crate::step::{StepId, StepOutcome};

/// Hint attached to DNS sanity warnings
pub const DNS_HINT: &str = "dependent DNS record not yet resolvable — this is a warning, not a failure, because DNS is an external collaborator";

/// One recorded step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    /// Step id
    pub id: StepId,
    /// Step category
    pub category: StepCategory,
    /// Resource the step owns
    pub resource: ResourceRef,
    /// What happened
    pub outcome: StepOutcome,
    /// How it affected the run
    pub disposition: Disposition,
}

impl ReportEntry {
    /// Remediation hint for failed and skipped steps
    pub fn hint(&self) -> Option<String> {
        let error = self.outcome.error()?;
        if let StepError::DependencyUnmet { category } = error {
            return Some(format!("not attempted: fix {} first", category));
        }
        if let StepError::Probe(ProbeError::ControlPlane(_)) = error {
            return Some(CONTROL_PLANE_HINT.to_string());
        }

        let ns = self.resource.namespace.as_deref().unwrap_or("default");
        let name = &self.resource.name;
        Some(match self.resource.kind {
            ResourceKind::DnsRecord => DNS_HINT.to_string(),
            ResourceKind::ClusterNode | ResourceKind::ClusterBinary => {
                CONTROL_PLANE_HINT.to_string()
            }
            ResourceKind::Kubeconfig => format!(
                "ensure the kubeconfig at {} exists; the installer writes it once the service starts",
                name
            ),
            ResourceKind::NetworkConfig => format!(
                "inspect {} and run `netplan try` by hand; the previous version is kept as a .bak file",
                name
            ),
            ResourceKind::Hostname => "check `hostnamectl status`".to_string(),
            ResourceKind::SwapFile => format!(
                "check free disk space and `swapon --show`; remove a partial {} before re-running",
                name
            ),
            ResourceKind::ClusterConfig => {
                format!("check {} and `journalctl -u k3s` after a restart", name)
            }
            ResourceKind::Namespace => {
                format!("check `kubectl get namespace {}`", name)
            }
            ResourceKind::ChartRelease => format!("check `helm status {} -n {}`", name, ns),
            ResourceKind::Deployment => match error {
                StepError::TimedOut { .. } => format!(
                    "rollout did not finish: `kubectl -n {} describe deployment {}`",
                    ns, name
                ),
                _ => format!("check `kubectl -n {} get deployment {} -o yaml`", ns, name),
            },
            ResourceKind::Ingress => match error {
                StepError::VerificationFailed { .. } => format!(
                    "ingress {}/{} differs from the declared route and was left as is; set ingressPolicy: overwrite to replace it",
                    ns, name
                ),
                _ => format!("check `kubectl -n {} describe ingress {}`", ns, name),
            },
            ResourceKind::RootAuthority => format!(
                "root authority material in {} is unusable; restore it from a backup, or delete both root files to create a new root",
                name
            ),
            ResourceKind::LeafCertificate => {
                format!("check permissions on {}; the leaf is reissued on the next run", name)
            }
            ResourceKind::Secret => {
                format!("check `kubectl -n {} get secret {}`", ns, name)
            }
            ResourceKind::ApiEndpoint => {
                "check `kubectl get --raw='/readyz?verbose'` for the failing check".to_string()
            }
            ResourceKind::CorePod => format!(
                "check `kubectl -n {} get pods` and describe the {} pods",
                ns, name
            ),
            ResourceKind::Route => format!(
                "check `curl -k -H 'Host: <hostname>' <node address>` for {} and the ingress controller logs",
                name
            ),
        })
    }
}

const CONTROL_PLANE_HINT: &str = "control plane not reachable: check `systemctl status k3s` and that the kubeconfig server points at the node address, not https://127.0.0.1:6443";

/// Ordered record of one run
#[derive(Debug, Clone, Default)]
pub struct ConvergenceReport {
    entries: Vec<ReportEntry>,
}

impl ConvergenceReport {
    /// Empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's outcome. A second record for the same id is ignored.
    pub fn record(&mut self, entry: ReportEntry) {
        if self.entries.iter().any(|e| e.id == entry.id) {
            warn!(step = %entry.id, "Outcome already recorded, ignoring duplicate");
            return;
        }
        self.entries.push(entry);
    }

    /// Entries in execution order
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Entry for a step id
    pub fn get(&self, id: &StepId) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Whether any step failed fatally
    pub fn has_failures(&self) -> bool {
        self.count(Disposition::Fatal) > 0
    }

    /// Whether any step failed non-fatally
    pub fn has_warnings(&self) -> bool {
        self.count(Disposition::Warning) > 0
    }

    /// Steps that mutated something
    pub fn applied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == StepOutcome::Applied)
            .count()
    }

    /// Steps that were already satisfied
    pub fn satisfied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == StepOutcome::AlreadySatisfied)
            .count()
    }

    /// Steps skipped because a prerequisite failed
    pub fn skipped(&self) -> usize {
        self.count(Disposition::Blocked)
    }

    fn count(&self, disposition: Disposition) -> usize {
        self.entries
            .iter()
            .filter(|e| e.disposition == disposition)
            .count()
    }

    /// Process exit code: 1 on fatal failure, else 0
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    /// Human-readable report with summary and hints
    pub fn render(&self) -> String {
        let mut out = String::from("homelab convergence report\n");
        for entry in &self.entries {
            let marker = match entry.disposition {
                Disposition::Ok => entry.outcome.label(),
                Disposition::Warning => "warning",
                Disposition::Fatal => "failed",
                Disposition::Blocked => "skipped",
            };
            out.push_str(&format!("  [{:<7}] {}", marker, entry.id));
            if let Some(error) = entry.outcome.error() {
                out.push_str(&format!(": {}", error));
            }
            out.push('\n');
            if let Some(hint) = entry.hint() {
                out.push_str(&format!("            hint: {}\n", hint));
            }
        }
        out.push_str(&format!(
            "summary: {} changed, {} already satisfied, {} warnings, {} failed, {} skipped\n",
            self.applied(),
            self.satisfied(),
            self.count(Disposition::Warning),
            self.count(Disposition::Fatal),
            self.skipped()
        ));
        out.push_str(if self.has_failures() {
            "result: FAILED\n"
        } else if self.has_warnings() {
            "result: converged with warnings\n"
        } else {
            "result: converged\n"
        });
        out
    }
}
