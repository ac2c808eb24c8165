//! ---
//! warden_section: "07-resilience-fault-tolerance"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Host health policy and the leadership-gated monitor."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Policy engine and monitor supervisor.
//!
//! The [`supervisor::Monitor`] campaigns for leadership and, while it holds the
//! lease, feeds membership events into the [`policy::PolicyEngine`]. Hosts that
//! the engine deems failed are handed to the [`dispatch::FenceDispatcher`],
//! which powers them off and evacuates their workloads.

pub mod dispatch;
pub mod policy;
pub mod supervisor;

pub use dispatch::{DispatchOutcome, FenceDispatcher};
pub use policy::{CycleReport, DecisionMatrix, PolicyEngine, PolicyError, PolicySettings};
pub use supervisor::{EpochError, Monitor, MonitorHandle};
