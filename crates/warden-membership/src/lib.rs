//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Health signals arrive as membership snapshots from one feed per tag
//! (`management`, `storage`, `network`). Collectors turn them into
//! [`MembershipEvent`]s for the policy engine.

mod agent;
mod collector;
mod event;
mod serf;
mod source;
#[cfg(any(test, feature = "test-util"))]
mod static_source;

pub use agent::SerfAgentKeeper;
pub use collector::{source_for, EventCollector};
pub use event::{HealthStatus, MemberStatus, MembershipEvent};
pub use serf::{parse_members, SerfSource};
pub use source::MembershipSource;
#[cfg(any(test, feature = "test-util"))]
pub use static_source::StaticSource;

/// Errors raised while starting or decoding a membership feed.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("membership feeds must be started inside a tokio runtime")]
    NoRuntime,
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} exited with {status}: {stderr}")]
    CommandFailed {
        binary: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("agent rpc address '{0}' is not ip:port")]
    Address(String),
    #[error("unable to decode membership snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}
