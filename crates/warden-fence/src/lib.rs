//! ---
//! warden_section: "05-fencing"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Out-of-band power control for failed hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Fencing powers a failed host off through its baseboard management
//! controller so its workloads can be restarted elsewhere without split brain.

mod bmc;
mod fencer;
mod ipmi;
#[cfg(any(test, feature = "test-util"))]
mod scripted;

pub use bmc::{BmcConnector, BmcEndpoint, BmcSession};
pub use fencer::{fence_any, FenceOutcome, Fencer};
pub use ipmi::{IpmiFencer, IpmitoolConnector};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{BmcCall, BmcStep, ScriptedBmc};

/// Errors raised while talking to a management controller.
#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    #[error("failed to open BMC session to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("BMC {address} rejected {action}: {reason}")]
    Command {
        address: String,
        action: &'static str,
        reason: String,
    },
    #[error("failed to close BMC session to {address}: {reason}")]
    Close { address: String, reason: String },
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}
