//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{ElectionRecord, FencerConfig, Host, HostId, HostState, NewFencer};
use crate::Result;

/// Shared handle passed to every component that reads or writes state.
pub type SharedStore = Arc<dyn Store>;

/// Storage contract consumed by the controller.
///
/// Implementations must make [`Store::claim_lease`] a single atomic conditional
/// write; everything else is plain CRUD and relies on the single-writer
/// discipline provided by the election.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Look up a host by its unique name.
    async fn host_by_name(&self, name: &str) -> Result<Option<Host>>;

    /// Look up a host by identifier.
    async fn host_by_id(&self, id: HostId) -> Result<Option<Host>>;

    /// Insert a new host in `Initial` status. Fails with `Conflict` on duplicate names.
    async fn insert_host(&self, name: &str, now: DateTime<Utc>) -> Result<Host>;

    /// All known hosts, in insertion order.
    async fn hosts(&self) -> Result<Vec<Host>>;

    /// Persist status, disabled flag and timestamp of an existing host.
    async fn update_host(&self, host: &Host) -> Result<()>;

    /// Counters tracked for a host, one per tag.
    async fn host_states(&self, host_id: HostId) -> Result<Vec<HostState>>;

    /// Create a zeroed counter for (host, tag). Fails with `Conflict` if it exists.
    async fn insert_host_state(
        &self,
        host_id: HostId,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<HostState>;

    /// Persist an existing counter.
    async fn update_host_state(&self, state: &HostState) -> Result<()>;

    /// Fencers configured for a host, in the order they were added.
    async fn fencers_for_host(&self, host_id: HostId) -> Result<Vec<FencerConfig>>;

    /// Register a fencer for a host.
    async fn insert_fencer(&self, fencer: NewFencer) -> Result<FencerConfig>;

    /// Remove a fencer configuration.
    async fn delete_fencer(&self, id: u64) -> Result<()>;

    /// Claim or refresh the lease for `election`.
    ///
    /// Inserts the row when absent, refreshes it when `leader` already holds it and
    /// takes it over when its `last_update` is older than `term`. Returns `false`
    /// when another identity holds a live lease.
    async fn claim_lease(
        &self,
        election: &str,
        leader: &str,
        now: DateTime<Utc>,
        term: Duration,
    ) -> Result<bool>;

    /// Current lease row, stale or not.
    async fn lease(&self, election: &str) -> Result<Option<ElectionRecord>>;

    /// Delete the lease if `leader` holds it. Returns whether a row was removed.
    async fn release_lease(&self, election: &str, leader: &str) -> Result<bool>;
}
