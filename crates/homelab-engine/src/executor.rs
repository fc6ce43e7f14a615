//! Probe, diff, mutate only if different, verify.

use homelab_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{ProbeError, StepError};
use crate::probe::ProbeResult;
use crate::step::{Step, StepMode, StepOutcome};

/// Applies single steps. Stateless; the only component that calls
/// [`Step::mutate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StepExecutor;

impl StepExecutor {
    /// Create an executor
    pub fn new() -> Self {
        Self
    }

    /// Converge one step and return its outcome
    pub async fn apply(&self, step: &dyn Step) -> StepOutcome {
        let span = info_span!("step", step = %step.id());
        self.apply_inner(step).instrument(span).await
    }

    /// Probe one step without mutating anything
    pub async fn inspect(&self, step: &dyn Step) -> Result<ProbeResult, ProbeError> {
        let span = info_span!("inspect", step = %step.id());
        step.probe().instrument(span).await
    }

    async fn apply_inner(&self, step: &dyn Step) -> StepOutcome {
        let mode = step.mode();

        let observed = match step.probe().await {
            Ok(result) => result,
            // readiness gates treat an unreachable probe as "not ready yet"
            Err(e) if matches!(mode, StepMode::AwaitReady(_)) => {
                debug!(error = %e, "Probe failed, waiting");
                ProbeResult::Absent
            }
            Err(e) => {
                warn!(error = %e, "Probe failed");
                return StepOutcome::Failed(StepError::Probe(e));
            }
        };

        if observed.is_matching() {
            debug!("Already satisfied");
            return StepOutcome::AlreadySatisfied;
        }

        match mode {
            StepMode::Observe => {
                warn!(observed = %observed, "Observation does not match");
                StepOutcome::Failed(StepError::VerificationFailed {
                    actual: observed.to_string(),
                })
            }
            StepMode::AwaitReady(policy) => {
                info!(observed = %observed, "Waiting for readiness");
                // the probe above already counts as the first attempt
                self.wait_until_matching(step, &policy, 1).await
            }
            StepMode::Converge => {
                if let ProbeResult::PresentDiverging { actual } = &observed {
                    if !step.replaces_diverging() {
                        warn!(actual = %actual, "Resource differs and is preserved");
                        return StepOutcome::Failed(StepError::VerificationFailed {
                            actual: actual.clone(),
                        });
                    }
                }

                info!(observed = %observed, "Applying");
                if let Err(e) = step.mutate().await {
                    warn!(error = %e, "Apply failed");
                    return StepOutcome::Failed(StepError::Apply(e));
                }

                match step.settle() {
                    Some(policy) => self.wait_until_matching(step, &policy, 0).await,
                    None => match step.probe().await {
                        Ok(result) if result.is_matching() => {
                            info!("Applied");
                            StepOutcome::Applied
                        }
                        Ok(result) => {
                            warn!(observed = %result, "Postcondition not met after apply");
                            StepOutcome::Failed(StepError::VerificationFailed {
                                actual: result.to_string(),
                            })
                        }
                        Err(e) => StepOutcome::Failed(StepError::Probe(e)),
                    },
                }
            }
        }
    }

    /// Poll until matching; `earlier` probes already made are added to the
    /// reported attempt count
    async fn wait_until_matching(
        &self,
        step: &dyn Step,
        policy: &RetryConfig,
        earlier: u32,
    ) -> StepOutcome {
        let id = step.id();
        let result = retry_with_backoff(policy, id.as_str(), || async move {
            match step.probe().await {
                Ok(result) if result.is_matching() => Ok(()),
                Ok(result) => Err(result.to_string()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!("Ready");
                StepOutcome::Applied
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let attempts = attempts + earlier;
                warn!(attempts, last = %last, "Gave up waiting");
                StepOutcome::Failed(StepError::TimedOut { attempts, last })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApplyError;
    use crate::planner::StepCategory;
    use crate::testing::ScriptedStep;
    use std::time::Duration;

    fn quick(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn matching_probe_never_mutates() {
        let step = ScriptedStep::new("s", StepCategory::Network);
        let outcome = StepExecutor::new().apply(&step).await;
        assert_eq!(outcome, StepOutcome::AlreadySatisfied);
        assert_eq!(step.mutations(), 0);
    }

    #[tokio::test]
    async fn absent_resource_is_created_and_verified() {
        let step = ScriptedStep::new("s", StepCategory::Network)
            .probes([ProbeResult::Absent, ProbeResult::PresentMatching]);
        assert_eq!(StepExecutor::new().apply(&step).await, StepOutcome::Applied);
        assert_eq!(step.mutations(), 1);
    }

    #[tokio::test]
    async fn failed_verification_is_reported() {
        let step = ScriptedStep::new("s", StepCategory::Network)
            .probes([ProbeResult::Absent, ProbeResult::diverging("still old")]);
        assert_eq!(
            StepExecutor::new().apply(&step).await,
            StepOutcome::Failed(StepError::VerificationFailed {
                actual: "diverging: still old".to_string()
            })
        );
    }

    #[tokio::test]
    async fn apply_error_is_reported() {
        let step = ScriptedStep::new("s", StepCategory::Network)
            .probes([ProbeResult::Absent])
            .failing_mutate(ApplyError::Other("boom".to_string()));
        assert_eq!(
            StepExecutor::new().apply(&step).await,
            StepOutcome::Failed(StepError::Apply(ApplyError::Other("boom".to_string())))
        );
    }

    #[tokio::test]
    async fn probe_error_fails_converging_step() {
        let step = ScriptedStep::new("s", StepCategory::CoreServices)
            .probe_error(ProbeError::ControlPlane("connection refused".to_string()));
        let outcome = StepExecutor::new().apply(&step).await;
        assert!(matches!(outcome, StepOutcome::Failed(StepError::Probe(_))));
        assert_eq!(step.mutations(), 0);
    }

    #[tokio::test]
    async fn preserved_divergence_is_left_alone() {
        let step = ScriptedStep::new("s", StepCategory::ApplicationWorkloads)
            .probes([ProbeResult::diverging("host other.pizza")])
            .preserving();
        assert_eq!(
            StepExecutor::new().apply(&step).await,
            StepOutcome::Failed(StepError::VerificationFailed {
                actual: "host other.pizza".to_string()
            })
        );
        assert_eq!(step.mutations(), 0);
    }

    #[tokio::test]
    async fn settle_policy_waits_for_rollout() {
        let step = ScriptedStep::new("s", StepCategory::ApplicationWorkloads)
            .probes([
                ProbeResult::Absent,
                ProbeResult::diverging("0/1 available"),
                ProbeResult::diverging("0/1 available"),
                ProbeResult::PresentMatching,
            ])
            .settling(quick(5));
        assert_eq!(StepExecutor::new().apply(&step).await, StepOutcome::Applied);
        assert_eq!(step.mutations(), 1);
    }

    #[tokio::test]
    async fn await_ready_times_out() {
        let step = ScriptedStep::new("node", StepCategory::ClusterInstall)
            .probes([ProbeResult::diverging("NotReady")])
            .awaiting(quick(3));
        assert_eq!(
            StepExecutor::new().apply(&step).await,
            StepOutcome::Failed(StepError::TimedOut {
                attempts: 4,
                last: "diverging: NotReady".to_string()
            })
        );
        assert_eq!(step.mutations(), 0);
        assert_eq!(step.probe_count(), 4);
    }

    #[tokio::test]
    async fn settle_timeout_counts_only_post_apply_probes() {
        let step = ScriptedStep::new("s", StepCategory::ApplicationWorkloads)
            .probes([ProbeResult::Absent, ProbeResult::diverging("0/1 available")])
            .settling(quick(2));
        assert!(matches!(
            StepExecutor::new().apply(&step).await,
            StepOutcome::Failed(StepError::TimedOut { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn await_ready_counts_probe_errors_as_not_ready() {
        let step = ScriptedStep::new("node", StepCategory::ClusterInstall)
            .probe_sequence(vec![
                Err(ProbeError::ControlPlane("refused".to_string())),
                Err(ProbeError::ControlPlane("refused".to_string())),
                Ok(ProbeResult::PresentMatching),
            ])
            .awaiting(quick(5));
        assert_eq!(StepExecutor::new().apply(&step).await, StepOutcome::Applied);
    }

    #[tokio::test]
    async fn observe_reports_mismatch_without_mutating() {
        let step = ScriptedStep::new("dns", StepCategory::DnsSanity)
            .probes([ProbeResult::Absent])
            .observing();
        assert_eq!(
            StepExecutor::new().apply(&step).await,
            StepOutcome::Failed(StepError::VerificationFailed {
                actual: "absent".to_string()
            })
        );
        assert_eq!(step.mutations(), 0);
    }
}
