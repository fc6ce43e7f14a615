//! The unit of convergence.
//!
//! A step owns exactly one resource. It knows how to inspect it ([`Step::probe`])
//! and, for converging steps, how to drive it to the desired state
//! ([`Step::mutate`]). Deciding *whether* to mutate belongs to the executor.

use std::fmt;

use async_trait::async_trait;
use homelab_common::retry::RetryConfig;

use crate::error::{ApplyError, ProbeError, StepError};
use crate::planner::StepCategory;
use crate::probe::ProbeResult;
use crate::resource::ResourceRef;

/// Stable identifier: `<category>:<resource>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(String);

impl StepId {
    /// Id for a step converging `resource` in `category`
    pub fn of(category: StepCategory, resource: &ResourceRef) -> Self {
        Self(format!("{}:{}", category, resource))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the executor treats a step whose probe doesn't match
#[derive(Debug, Clone, PartialEq)]
pub enum StepMode {
    /// Mutate, then verify
    Converge,
    /// Never mutate; poll the probe under the policy until it matches
    AwaitReady(RetryConfig),
    /// Never mutate; a mismatch is reported as is
    Observe,
}

/// Whether a failure of this step can block anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Failure is handled by the planner's normal rules
    Required,
    /// Failure is always a warning
    Advisory,
}

/// What happened to a step in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Probe matched; nothing was touched
    AlreadySatisfied,
    /// Mutated (or waited) and verified
    Applied,
    /// Did not reach the postcondition
    Failed(StepError),
    /// Never executed
    Skipped(StepError),
}

impl StepOutcome {
    /// Short lowercase label for report lines
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadySatisfied => "ok",
            Self::Applied => "changed",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }

    /// The error carried by a failed or skipped outcome
    pub fn error(&self) -> Option<&StepError> {
        match self {
            Self::Failed(e) | Self::Skipped(e) => Some(e),
            _ => None,
        }
    }
}

/// One idempotent provisioning step
#[async_trait]
pub trait Step: Send + Sync {
    /// Phase this step belongs to
    fn category(&self) -> StepCategory;

    /// Resource this step owns
    fn resource(&self) -> ResourceRef;

    /// Stable id used in logs and the report
    fn id(&self) -> StepId {
        StepId::of(self.category(), &self.resource())
    }

    /// How a mismatch is handled
    fn mode(&self) -> StepMode {
        StepMode::Converge
    }

    /// Whether a failure may block later categories
    fn criticality(&self) -> Criticality {
        Criticality::Required
    }

    /// Retry policy for the post-mutation probe (e.g. waiting for a rollout)
    fn settle(&self) -> Option<RetryConfig> {
        None
    }

    /// Whether an existing, differing resource may be replaced
    fn replaces_diverging(&self) -> bool {
        true
    }

    /// Inspect current state. Must not mutate.
    async fn probe(&self) -> Result<ProbeResult, ProbeError>;

    /// Drive the resource to the desired state
    async fn mutate(&self) -> Result<(), ApplyError> {
        Err(ApplyError::Unsupported(self.id().to_string()))
    }
}
