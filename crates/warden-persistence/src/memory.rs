//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;
use warden_common::time::is_expired;

use crate::model::{
    ElectionRecord, FencerConfig, Host, HostId, HostState, HostStatus, NewFencer,
};
use crate::store::Store;
use crate::{PersistenceError, Result};

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    hosts: IndexMap<HostId, Host>,
    states: IndexMap<u64, HostState>,
    fencers: IndexMap<u64, FencerConfig>,
    leases: IndexMap<String, ElectionRecord>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local [`Store`] guarded by a single mutex.
///
/// Every trait call takes the lock once, so the lease claim is atomic with respect to
/// every other caller sharing the same instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn host_by_name(&self, name: &str) -> Result<Option<Host>> {
        let tables = self.tables.lock();
        Ok(tables.hosts.values().find(|host| host.name == name).cloned())
    }

    async fn host_by_id(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.tables.lock().hosts.get(&id).cloned())
    }

    async fn insert_host(&self, name: &str, now: DateTime<Utc>) -> Result<Host> {
        let mut tables = self.tables.lock();
        if tables.hosts.values().any(|host| host.name == name) {
            return Err(PersistenceError::Conflict(format!(
                "host '{}' already exists",
                name
            )));
        }
        let host = Host {
            id: tables.allocate_id(),
            name: name.to_owned(),
            status: HostStatus::Initial,
            disabled: false,
            updated_at: now,
        };
        tables.hosts.insert(host.id, host.clone());
        debug!(host = %host.name, id = host.id, "host inserted");
        Ok(host)
    }

    async fn hosts(&self) -> Result<Vec<Host>> {
        Ok(self.tables.lock().hosts.values().cloned().collect())
    }

    async fn update_host(&self, host: &Host) -> Result<()> {
        let mut tables = self.tables.lock();
        let Some(stored) = tables.hosts.get_mut(&host.id) else {
            return Err(PersistenceError::NotFound {
                kind: "host",
                id: host.id.to_string(),
            });
        };
        stored.status = host.status;
        stored.disabled = host.disabled;
        stored.updated_at = host.updated_at;
        Ok(())
    }

    async fn host_states(&self, host_id: HostId) -> Result<Vec<HostState>> {
        let tables = self.tables.lock();
        Ok(tables
            .states
            .values()
            .filter(|state| state.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn insert_host_state(
        &self,
        host_id: HostId,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<HostState> {
        let mut tables = self.tables.lock();
        if !tables.hosts.contains_key(&host_id) {
            return Err(PersistenceError::NotFound {
                kind: "host",
                id: host_id.to_string(),
            });
        }
        if tables
            .states
            .values()
            .any(|state| state.host_id == host_id && state.tag == tag)
        {
            return Err(PersistenceError::Conflict(format!(
                "state '{}' already exists for host {}",
                tag, host_id
            )));
        }
        let state = HostState {
            id: tables.allocate_id(),
            host_id,
            tag: tag.to_owned(),
            failed_times: 0,
            updated_at: now,
        };
        tables.states.insert(state.id, state.clone());
        Ok(state)
    }

    async fn update_host_state(&self, state: &HostState) -> Result<()> {
        let mut tables = self.tables.lock();
        let Some(stored) = tables.states.get_mut(&state.id) else {
            return Err(PersistenceError::NotFound {
                kind: "host state",
                id: state.id.to_string(),
            });
        };
        stored.failed_times = state.failed_times;
        stored.updated_at = state.updated_at;
        Ok(())
    }

    async fn fencers_for_host(&self, host_id: HostId) -> Result<Vec<FencerConfig>> {
        let tables = self.tables.lock();
        Ok(tables
            .fencers
            .values()
            .filter(|fencer| fencer.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn insert_fencer(&self, fencer: NewFencer) -> Result<FencerConfig> {
        let mut tables = self.tables.lock();
        if !tables.hosts.contains_key(&fencer.host_id) {
            return Err(PersistenceError::NotFound {
                kind: "host",
                id: fencer.host_id.to_string(),
            });
        }
        let config = FencerConfig {
            id: tables.allocate_id(),
            host_id: fencer.host_id,
            kind: fencer.kind,
            address: fencer.address,
            port: fencer.port,
            username: fencer.username,
            password: fencer.password,
        };
        tables.fencers.insert(config.id, config.clone());
        Ok(config)
    }

    async fn delete_fencer(&self, id: u64) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.fencers.shift_remove(&id) {
            Some(_) => Ok(()),
            None => Err(PersistenceError::NotFound {
                kind: "fencer",
                id: id.to_string(),
            }),
        }
    }

    async fn claim_lease(
        &self,
        election: &str,
        leader: &str,
        now: DateTime<Utc>,
        term: Duration,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.leases.get_mut(election) {
            None => {
                tables.leases.insert(
                    election.to_owned(),
                    ElectionRecord {
                        election_name: election.to_owned(),
                        leader_name: leader.to_owned(),
                        last_update: now,
                    },
                );
                Ok(true)
            }
            Some(record) if record.leader_name == leader => {
                // A refresh never moves the lease backwards.
                if now > record.last_update {
                    record.last_update = now;
                }
                Ok(true)
            }
            Some(record) if is_expired(now, record.last_update, term) => {
                debug!(
                    election,
                    previous = %record.leader_name,
                    leader,
                    "taking over expired lease"
                );
                record.leader_name = leader.to_owned();
                record.last_update = now;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn lease(&self, election: &str) -> Result<Option<ElectionRecord>> {
        Ok(self.tables.lock().leases.get(election).cloned())
    }

    async fn release_lease(&self, election: &str, leader: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        let held = tables
            .leases
            .get(election)
            .map(|record| record.leader_name == leader)
            .unwrap_or(false);
        if held {
            tables.leases.shift_remove(election);
        }
        Ok(held)
    }
}
