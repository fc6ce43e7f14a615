//! One convergence run: plan, execute in order, record every outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use homelab_common::lock::RunLock;
use homelab_common::retry::RetryConfig;
use homelab_common::{Result, DEFAULT_STATE_DIR};
use tracing::{error, info, warn};

use crate::collab::Collaborators;
use crate::desired::DesiredState;
use crate::error::{ProbeError, StepError};
use crate::executor::StepExecutor;
use crate::planner::{failure_disposition, Disposition, Plan, StepCategory};
use crate::probe::ProbeResult;
use crate::report::{ConvergenceReport, ReportEntry};
use crate::step::{StepId, StepOutcome};
use crate::steps;

/// Knobs of a run that are not part of the desired state
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Directory for the run lock and authority material
    pub state_dir: PathBuf,
    /// Waiting for the node to become Ready
    pub cluster_ready: RetryConfig,
    /// Waiting for the ingress controller deployment
    pub controller_ready: RetryConfig,
    /// Waiting for a workload rollout after applying it
    pub rollout: RetryConfig,
}

impl RunOptions {
    /// Default waits with state under `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            // five minutes: a first k3s start on a Pi pulls images
            cluster_ready: RetryConfig::fixed(60, Duration::from_secs(5)),
            controller_ready: RetryConfig::fixed(60, Duration::from_secs(5)),
            rollout: RetryConfig {
                max_attempts: 30,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(15),
                backoff_multiplier: 1.5,
                jitter: true,
            },
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }
}

/// Validate, lock the state directory and converge the whole plan.
///
/// Errors only when the run cannot start; step failures land in the report.
pub async fn run(
    desired: &DesiredState,
    collab: &Collaborators,
    options: &RunOptions,
) -> Result<ConvergenceReport> {
    desired.validate()?;
    let _lock = RunLock::acquire(RunLock::path_in(&options.state_dir))?;
    let plan = steps::plan(desired, collab, options)?;
    info!(steps = plan.len(), "Starting convergence run");
    Ok(converge(&plan).await)
}

/// Execute `plan` in order.
///
/// A fatal failure blocks every category that depends on the failed one;
/// steps in blocked categories are recorded as skipped without running.
/// Independent branches keep going.
pub async fn converge(plan: &Plan) -> ConvergenceReport {
    let executor = StepExecutor::new();
    let mut report = ConvergenceReport::new();
    // blocked category -> the failed category that blocked it
    let mut blocked: BTreeMap<StepCategory, StepCategory> = BTreeMap::new();

    for (i, step) in plan.steps().iter().enumerate() {
        let category = step.category();

        let (outcome, disposition) = if let Some(cause) = blocked.get(&category) {
            warn!(step = %step.id(), blocked_by = %cause, "Skipping step");
            (
                StepOutcome::Skipped(StepError::DependencyUnmet { category: *cause }),
                Disposition::Blocked,
            )
        } else {
            let outcome = executor.apply(step.as_ref()).await;
            let disposition = match &outcome {
                StepOutcome::Failed(e) => {
                    failure_disposition(step.as_ref(), e, &plan.steps()[i + 1..])
                }
                _ => Disposition::Ok,
            };
            if disposition == Disposition::Fatal {
                error!(step = %step.id(), "Step failed, blocking dependent categories");
                for dependent in category.dependents() {
                    blocked.entry(dependent).or_insert(category);
                }
            }
            (outcome, disposition)
        };

        report.record(ReportEntry {
            id: step.id(),
            category,
            resource: step.resource(),
            outcome,
            disposition,
        });
    }

    info!(
        changed = report.applied(),
        satisfied = report.satisfied(),
        skipped = report.skipped(),
        failed = report.has_failures(),
        "Convergence run finished"
    );
    report
}

/// Probe result of one step in a dry inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    /// Step id
    pub id: StepId,
    /// What the probe found
    pub result: std::result::Result<ProbeResult, ProbeError>,
}

impl Inspection {
    /// Whether the resource already matches
    pub fn is_matching(&self) -> bool {
        matches!(&self.result, Ok(r) if r.is_matching())
    }
}

/// Probe every step of `plan` without mutating anything
pub async fn inspect(plan: &Plan) -> Vec<Inspection> {
    let executor = StepExecutor::new();
    let mut found = Vec::with_capacity(plan.len());
    for step in plan.steps() {
        found.push(Inspection {
            id: step.id(),
            result: executor.inspect(step.as_ref()).await,
        });
    }
    found
}

/// One line per inspected step and a closing drift count
pub fn render_inspection(inspections: &[Inspection]) -> String {
    let mut out = String::new();
    for inspection in inspections {
        let state = match &inspection.result {
            Ok(result) => result.to_string(),
            Err(e) => format!("probe failed: {}", e),
        };
        out.push_str(&format!("  {}: {}\n", inspection.id, state));
    }
    let drifted = inspections.iter().filter(|i| !i.is_matching()).count();
    out.push_str(&format!(
        "{} of {} resources need changes\n",
        drifted,
        inspections.len()
    ));
    out
}
