//! ---
//! warden_section: "05-fencing"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Out-of-band power control for failed hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{info, warn};
use warden_persistence::{FencerConfig, FencerKind};

use crate::{BmcConnector, BmcEndpoint, FenceError, IpmiFencer};

/// Power-control backend for one configured endpoint.
#[derive(Debug, Clone)]
pub enum Fencer {
    Ipmi(IpmiFencer),
}

impl Fencer {
    /// Build the backend matching a stored fencer configuration.
    pub fn from_config(config: &FencerConfig, ipmi: Arc<dyn BmcConnector>) -> Self {
        match config.kind {
            FencerKind::Ipmi => Fencer::Ipmi(IpmiFencer::new(BmcEndpoint::from_config(config), ipmi)),
        }
    }

    pub async fn fence(&self) -> Result<(), FenceError> {
        match self {
            Fencer::Ipmi(fencer) => fencer.fence().await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Fencer::Ipmi(fencer) => format!("ipmi {}", fencer.endpoint()),
        }
    }
}

/// Result of trying a host's fencers in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The fencer at `index` powered the host down.
    Fenced { index: usize, fencer: String },
    /// Every configured fencer failed.
    Failed { attempts: usize },
    /// The host has no fencer configured.
    NoFencers,
}

impl FenceOutcome {
    pub fn is_fenced(&self) -> bool {
        matches!(self, FenceOutcome::Fenced { .. })
    }

    /// Label used for the fence attempt metric.
    pub fn label(&self) -> &'static str {
        match self {
            FenceOutcome::Fenced { .. } => "fenced",
            FenceOutcome::Failed { .. } => "failed",
            FenceOutcome::NoFencers => "no_fencers",
        }
    }
}

/// Try each fencer in order and stop at the first success.
pub async fn fence_any(host: &str, fencers: &[Fencer]) -> FenceOutcome {
    if fencers.is_empty() {
        warn!(host, "no fencer configured");
        return FenceOutcome::NoFencers;
    }
    for (index, fencer) in fencers.iter().enumerate() {
        let description = fencer.describe();
        match fencer.fence().await {
            Ok(()) => {
                info!(host, fencer = %description, "host fenced");
                return FenceOutcome::Fenced {
                    index,
                    fencer: description,
                };
            }
            Err(err) => {
                warn!(host, fencer = %description, error = %err, "fencer failed, trying next");
            }
        }
    }
    warn!(host, attempts = fencers.len(), "all fencers failed");
    FenceOutcome::Failed {
        attempts: fencers.len(),
    }
}
