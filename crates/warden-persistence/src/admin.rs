//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Operator actions applied through the same storage contract as the controller.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::model::{Host, HostStatus};
use crate::store::Store;
use crate::{PersistenceError, Result};

async fn require_host(store: &dyn Store, name: &str) -> Result<Host> {
    store
        .host_by_name(name)
        .await?
        .ok_or_else(|| PersistenceError::NotFound {
            kind: "host",
            id: name.to_owned(),
        })
}

/// Exclude a host from counting and fencing.
pub async fn disable_host(store: &dyn Store, name: &str) -> Result<Host> {
    let mut host = require_host(store, name).await?;
    host.disabled = true;
    store.update_host(&host).await?;
    info!(host = %host.name, "host disabled");
    Ok(host)
}

/// Re-enable a host, resetting it to `Initial` with cleared counters.
///
/// This is the only way out of `Fencing` or `Fenced`.
pub async fn enable_host(store: &dyn Store, name: &str, now: DateTime<Utc>) -> Result<Host> {
    let mut host = require_host(store, name).await?;
    host.disabled = false;
    host.transition(HostStatus::Initial, now);
    store.update_host(&host).await?;
    for mut state in store.host_states(host.id).await? {
        state.failed_times = 0;
        state.updated_at = now;
        store.update_host_state(&state).await?;
    }
    info!(host = %host.name, "host enabled");
    Ok(host)
}
