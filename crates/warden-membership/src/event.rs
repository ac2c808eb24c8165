//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Health of a host as seen by one feed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Active,
    Failed,
}

/// One member entry of a feed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub hostname: String,
    pub status: HealthStatus,
}

impl MemberStatus {
    pub fn active(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            status: HealthStatus::Active,
        }
    }

    pub fn failed(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            status: HealthStatus::Failed,
        }
    }
}

/// Health observation for a host on a tagged subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub hostname: String,
    pub tag: String,
    pub status: HealthStatus,
}

impl MembershipEvent {
    pub fn new(hostname: impl Into<String>, tag: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            hostname: hostname.into(),
            tag: tag.into(),
            status,
        }
    }

    pub(crate) fn from_member(tag: &str, member: MemberStatus) -> Self {
        Self {
            hostname: member.hostname,
            tag: tag.to_owned(),
            status: member.status,
        }
    }
}
