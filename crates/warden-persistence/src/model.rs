//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Identifier assigned by the store when a host is inserted.
pub type HostId = u64;

/// Lifecycle status of a monitored hypervisor host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HostStatus {
    /// First seen, not yet settled.
    Initial,
    /// All health signals clear.
    Active,
    /// At least one health signal is failing.
    Checking,
    /// A critical signal kept failing through the settle period.
    Failed,
    /// Power-off in progress.
    Fencing,
    /// Powered off and disabled; workloads evacuated.
    Fenced,
}

/// Monitored host record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Store-assigned identifier.
    pub id: HostId,
    /// Unique host name as reported by the membership feed.
    pub name: String,
    /// Current lifecycle status.
    pub status: HostStatus,
    /// Disabled hosts keep their counters frozen and are never fenced.
    pub disabled: bool,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
}

impl Host {
    /// Switch to `status`, stamping the change time.
    pub fn transition(&mut self, status: HostStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Debounced failure counter for one (host, tag) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    /// Store-assigned identifier.
    pub id: u64,
    /// Owning host.
    pub host_id: HostId,
    /// Health-signal channel, e.g. `network`, `storage`, `management`.
    pub tag: String,
    /// Consecutive-ish failure count, decremented by healthy reports.
    pub failed_times: u32,
    /// Time of the last counter update.
    pub updated_at: DateTime<Utc>,
}

impl HostState {
    /// Apply one failed report.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failed_times = self.failed_times.saturating_add(1);
        self.updated_at = now;
    }

    /// Apply one healthy report; the counter never drops below zero.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.failed_times = self.failed_times.saturating_sub(1);
        self.updated_at = now;
    }
}

/// Out-of-band power control backends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FencerKind {
    /// IPMI over LAN.
    Ipmi,
}

/// Power-control endpoint configured for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencerConfig {
    /// Store-assigned identifier.
    pub id: u64,
    /// Owning host.
    pub host_id: HostId,
    /// Backend type.
    pub kind: FencerKind,
    /// BMC address.
    pub address: String,
    /// BMC port.
    pub port: u16,
    /// BMC user.
    pub username: String,
    /// BMC password.
    pub password: String,
}

/// Fencer configuration before the store assigns an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFencer {
    /// Owning host.
    pub host_id: HostId,
    /// Backend type.
    pub kind: FencerKind,
    /// BMC address.
    pub address: String,
    /// BMC port, 623 for standard IPMI.
    pub port: u16,
    /// BMC user.
    pub username: String,
    /// BMC password.
    pub password: String,
}

impl NewFencer {
    /// IPMI endpoint on the standard port.
    pub fn ipmi(
        host_id: HostId,
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host_id,
            kind: FencerKind::Ipmi,
            address: address.into(),
            port: 623,
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Leadership lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    /// Election the lease belongs to.
    pub election_name: String,
    /// Identity currently holding the lease.
    pub leader_name: String,
    /// Last successful claim or refresh.
    pub last_update: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_labels_are_lowercase() {
        assert_eq!(HostStatus::Checking.to_string(), "checking");
        assert_eq!(HostStatus::from_str("fenced").unwrap(), HostStatus::Fenced);
        assert_eq!(
            serde_json::to_string(&HostStatus::Initial).unwrap(),
            "\"initial\""
        );
    }

    #[test]
    fn counter_never_goes_negative() {
        let now = Utc::now();
        let mut state = HostState {
            id: 1,
            host_id: 1,
            tag: "network".into(),
            failed_times: 0,
            updated_at: now,
        };
        state.record_success(now);
        assert_eq!(state.failed_times, 0);
        state.record_failure(now);
        state.record_failure(now);
        state.record_success(now);
        assert_eq!(state.failed_times, 1);
    }
}
