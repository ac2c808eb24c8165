//! ---
//! warden_section: "07-resilience-fault-tolerance"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Host health policy and the leadership-gated monitor."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};
use warden_common::config::PolicyConfig;
use warden_common::time::elapsed_since;
use warden_membership::{HealthStatus, MembershipEvent};
use warden_metrics::MonitorMetrics;
use warden_persistence::{Host, HostId, HostState, HostStatus, PersistenceError, SharedStore};

use crate::dispatch::{DispatchOutcome, FenceDispatcher};

pub const MANAGEMENT: u8 = 0b100;
pub const STORAGE: u8 = 0b010;
pub const NETWORK: u8 = 0b001;

/// Bit a health-signal tag contributes to the fence mask.
pub fn tag_bit(tag: &str) -> u8 {
    match tag {
        "management" | "manage" => MANAGEMENT,
        "storage" => STORAGE,
        "network" => NETWORK,
        _ => 0,
    }
}

/// Tags whose failure alone can take a host from `Checking` to `Failed`.
pub fn is_critical(tag: &str) -> bool {
    matches!(tag, "storage" | "network")
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("storage unavailable for every host in the batch: {0}")]
    Storage(#[from] PersistenceError),
}

/// Fence decision for every combination of failed tags.
///
/// Indexed by mask `management << 2 | storage << 1 | network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionMatrix([bool; 8]);

impl DecisionMatrix {
    /// Fence unless nothing failed or only management failed.
    pub const STANDARD: Self = Self([
        // mgmt storage network
        false, // good good good
        true,  // good good bad
        true,  // good bad  good
        true,  // good bad  bad
        false, // bad  good good
        true,  // bad  good bad
        true,  // bad  bad  good
        true,  // bad  bad  bad
    ]);

    /// Fence on any failure, management alone included.
    pub const FENCE_ON_MANAGEMENT_ONLY: Self =
        Self([false, true, true, true, true, true, true, true]);

    pub fn from_config(config: &PolicyConfig) -> Self {
        if config.fence_on_management_only {
            Self::FENCE_ON_MANAGEMENT_ONLY
        } else {
            Self::STANDARD
        }
    }

    pub fn decide(&self, mask: u8) -> bool {
        self.0[usize::from(mask & 0b111)]
    }

    /// Mask of tags at or over the failure threshold.
    pub fn mask(states: &[HostState], threshold: u32) -> u8 {
        states
            .iter()
            .filter(|state| state.failed_times >= threshold)
            .fold(0, |mask, state| mask | tag_bit(&state.tag))
    }
}

/// Timing and debounce knobs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    pub settle_period: Duration,
    pub failure_threshold: u32,
}

impl PolicySettings {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            settle_period: config.settle_period,
            failure_threshold: config.failure_threshold,
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

/// Status a host moves to given its refreshed counters, if any.
pub fn next_status(
    host: &Host,
    states: &[HostState],
    now: DateTime<Utc>,
    settle_period: Duration,
) -> Option<HostStatus> {
    let any_failed = states.iter().any(|state| state.failed_times > 0);
    let critical_failed = states
        .iter()
        .any(|state| is_critical(&state.tag) && state.failed_times > 0);
    let settled = elapsed_since(now, host.updated_at) >= settle_period;
    match host.status {
        HostStatus::Initial | HostStatus::Active if any_failed => Some(HostStatus::Checking),
        HostStatus::Initial if settled => Some(HostStatus::Active),
        HostStatus::Checking if settled && critical_failed => Some(HostStatus::Failed),
        HostStatus::Checking if settled && !any_failed => Some(HostStatus::Active),
        _ => None,
    }
}

/// Summary of one policy cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub hosts: usize,
    pub errors: usize,
    pub outcomes: Vec<(String, DispatchOutcome)>,
    pub panicked: usize,
}

/// Turns membership events into host status changes and fence dispatches.
#[derive(Debug)]
pub struct PolicyEngine {
    store: SharedStore,
    settings: PolicySettings,
    matrix: DecisionMatrix,
    dispatcher: Arc<FenceDispatcher>,
    metrics: MonitorMetrics,
}

impl PolicyEngine {
    pub fn new(
        store: SharedStore,
        settings: PolicySettings,
        matrix: DecisionMatrix,
        dispatcher: Arc<FenceDispatcher>,
        metrics: MonitorMetrics,
    ) -> Self {
        Self {
            store,
            settings,
            matrix,
            dispatcher,
            metrics,
        }
    }

    pub fn matrix(&self) -> DecisionMatrix {
        self.matrix
    }

    /// Run one cycle over every event gathered from the collectors.
    ///
    /// Storage failures abandon the affected host for this cycle; the call only
    /// fails when no host in a non-empty batch could be processed. Eligible hosts
    /// are fenced concurrently and the cycle returns once all of them finished.
    pub async fn handle_events(
        &self,
        events: Vec<MembershipEvent>,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, PolicyError> {
        let grouped = self.group(events);
        let mut report = CycleReport {
            hosts: grouped.len(),
            ..CycleReport::default()
        };
        let mut eligible = Vec::new();
        let mut last_error = None;
        for (hostname, statuses) in &grouped {
            match self.evaluate_host(hostname, statuses, now).await {
                Ok(Some(host)) => eligible.push(host),
                Ok(None) => {}
                Err(err) => {
                    warn!(host = %hostname, error = %err, "host evaluation abandoned for this cycle");
                    report.errors += 1;
                    last_error = Some(err);
                }
            }
        }
        if report.errors == report.hosts {
            if let Some(err) = last_error {
                return Err(PolicyError::Storage(err));
            }
        }

        let (outcomes, panicked) = self.dispatch(eligible, now).await;
        report.outcomes = outcomes;
        report.panicked = panicked;
        self.metrics.inc_cycle();
        debug!(hosts = report.hosts, dispatched = report.outcomes.len(), "policy cycle finished");
        Ok(report)
    }

    /// Group events by host then tag; the last report for a tag wins.
    fn group(&self, events: Vec<MembershipEvent>) -> IndexMap<String, IndexMap<String, HealthStatus>> {
        let mut grouped: IndexMap<String, IndexMap<String, HealthStatus>> = IndexMap::new();
        for event in events {
            self.metrics.record_event(&event.tag, event.status.as_ref());
            grouped
                .entry(event.hostname)
                .or_default()
                .insert(event.tag, event.status);
        }
        grouped
    }

    /// Update counters and status of one host. Returns the host when it should be fenced.
    async fn evaluate_host(
        &self,
        hostname: &str,
        statuses: &IndexMap<String, HealthStatus>,
        now: DateTime<Utc>,
    ) -> Result<Option<Host>, PersistenceError> {
        let mut host = match self.store.host_by_name(hostname).await? {
            Some(host) => host,
            None => {
                info!(host = hostname, "discovered new host");
                self.store.insert_host(hostname, now).await?
            }
        };

        let mut states = self.store.host_states(host.id).await?;
        for (tag, status) in statuses {
            let index = match states.iter().position(|state| &state.tag == tag) {
                Some(index) => index,
                None => {
                    states.push(self.store.insert_host_state(host.id, tag, now).await?);
                    states.len() - 1
                }
            };
            if host.disabled {
                continue;
            }
            let state = &mut states[index];
            match status {
                HealthStatus::Active => state.record_success(now),
                HealthStatus::Failed => state.record_failure(now),
            }
            self.store.update_host_state(state).await?;
        }

        if host.disabled {
            debug!(host = %host.name, "host disabled, counters frozen");
            return Ok(None);
        }

        if let Some(next) = next_status(&host, &states, now, self.settings.settle_period) {
            info!(host = %host.name, from = %host.status, to = %next, "host status changed");
            host.transition(next, now);
            self.store.update_host(&host).await?;
            self.metrics.record_transition(next.as_ref());
        }

        if host.status != HostStatus::Failed {
            return Ok(None);
        }
        let mask = DecisionMatrix::mask(&states, self.settings.failure_threshold);
        let fence = self.matrix.decide(mask);
        debug!(host = %host.name, mask = %format!("{mask:03b}"), fence, "fence decision");
        Ok(fence.then_some(host))
    }

    /// Fence every eligible host in its own task and wait for all of them.
    async fn dispatch(&self, hosts: Vec<Host>, now: DateTime<Utc>) -> (Vec<(String, DispatchOutcome)>, usize) {
        let keys: Vec<(HostId, String)> = hosts.iter().map(|host| (host.id, host.name.clone())).collect();
        let tasks = hosts.into_iter().map(|host| {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { dispatcher.fence_host(host, now).await })
        });
        let results = join_all(tasks).await;

        let mut outcomes = Vec::new();
        let mut panicked = 0;
        for ((host_id, name), result) in keys.into_iter().zip(results) {
            match result {
                Ok(Ok(outcome)) => outcomes.push((name, outcome)),
                Ok(Err(err)) => {
                    warn!(host = %name, error = %err, "fence dispatch abandoned");
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(host = %name, "fence dispatch panicked");
                    panicked += 1;
                    if let Err(err) = self.dispatcher.revert_interrupted(host_id, now).await {
                        warn!(host = %name, error = %err, "unable to revert interrupted fencing");
                    }
                }
                Err(join_err) => {
                    warn!(host = %name, error = %join_err, "fence dispatch cancelled");
                }
            }
        }
        (outcomes, panicked)
    }
}
