//! ---
//! warden_section: "02-leader-election"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Lease-based leader election for redundant controllers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Leader election for redundant Warden controllers.

mod election;

pub use election::{Election, ElectionError, ElectionRole, LeaderLease};
