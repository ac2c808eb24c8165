//! ---
//! warden_section: "06-remediation"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Workload evacuation from fenced hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Once a host is powered off its compute service is forced down and disabled
//! and its instances are rebuilt elsewhere, either directly through the
//! OpenStack compute API or by handing the host to a Converge controller.

mod compute;
mod converge;
mod nova;
#[cfg(any(test, feature = "test-util"))]
mod recording;
mod worker;

pub use compute::{ComputeApi, ComputeService, Server};
pub use converge::ConvergeClient;
pub use nova::NovaClient;
#[cfg(any(test, feature = "test-util"))]
pub use recording::{ComputeCall, RecordingCompute};
pub use worker::{EvacuationReport, RemediationWorker};

pub type Result<T> = std::result::Result<T, RemediationError>;

/// Errors raised by evacuation backends.
#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("http request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("identity service returned no token")]
    MissingToken,
    #[error("no compute endpoint in the service catalog (region {region:?})")]
    MissingEndpoint { region: Option<String> },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("compute call {call} failed: {reason}")]
    Compute { call: &'static str, reason: String },
}
