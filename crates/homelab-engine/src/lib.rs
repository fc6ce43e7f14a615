//! Declarative convergence engine for a single-node homelab.
//!
//! A [`DesiredState`] document is turned into a [`Plan`] of idempotent
//! [`Step`]s, one per managed resource, grouped into categories with a fixed
//! dependency graph. [`run`] executes the plan in order: each step is probed,
//! mutated only when it differs, and verified. Every outcome lands in a
//! [`ConvergenceReport`]; a fatal failure blocks only the categories that
//! depend on it.
//!
//! The engine never talks to the host or cluster directly. All external
//! systems sit behind the traits in [`collab`].

#![deny(missing_docs)]

pub mod collab;
pub mod desired;
pub mod error;
pub mod executor;
pub mod planner;
pub mod probe;
pub mod quantity;
pub mod report;
pub mod resource;
pub mod run;
pub mod step;
pub mod steps;

#[cfg(test)]
pub(crate) mod testing;

pub use collab::Collaborators;
pub use desired::DesiredState;
pub use error::{ApplyError, ProbeError, StepError};
pub use executor::StepExecutor;
pub use planner::{Disposition, Plan, StepCategory};
pub use probe::ProbeResult;
pub use report::ConvergenceReport;
pub use resource::{ResourceKind, ResourceRef};
pub use run::{converge, inspect, render_inspection, run, Inspection, RunOptions};
pub use step::{Step, StepId, StepOutcome};
