//! ---
//! warden_section: "02-leader-election"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Lease-based leader election for redundant controllers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_common::config::ElectionConfig;
use warden_persistence::{PersistenceError, SharedStore};

/// Errors surfaced by campaigning or by the lease refresher.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("{candidate} is not leader of {election}; lease held by {holder}")]
    NotLeader {
        election: String,
        candidate: String,
        holder: String,
    },
    #[error("leader changed: {leader} lost the {election} lease")]
    LeaderChanged { election: String, leader: String },
    #[error("lease for {election} lapsed: last refresh {elapsed:?} ago exceeds term {term:?}")]
    LeaseLapsed {
        election: String,
        elapsed: Duration,
        term: Duration,
    },
    #[error("election storage error: {0}")]
    Storage(#[from] PersistenceError),
}

/// Role of this process in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    Candidate,
    Leader,
}

/// Participant in a named election backed by the shared store.
#[derive(Debug)]
pub struct Election {
    election_name: String,
    leader_name: String,
    term: Duration,
    refresh_interval: Duration,
    store: SharedStore,
    role: Mutex<ElectionRole>,
}

impl Election {
    pub fn new(leader_name: impl Into<String>, store: SharedStore, config: &ElectionConfig) -> Self {
        Self {
            election_name: config.name.clone(),
            leader_name: leader_name.into(),
            term: config.term,
            refresh_interval: config.effective_refresh_interval(),
            store,
            role: Mutex::new(ElectionRole::Candidate),
        }
    }

    pub fn leader_name(&self) -> &str {
        &self.leader_name
    }

    pub fn election_name(&self) -> &str {
        &self.election_name
    }

    pub fn term(&self) -> Duration {
        self.term
    }

    pub fn role(&self) -> ElectionRole {
        *self.role.lock()
    }

    fn set_role(&self, role: ElectionRole) {
        let mut current = self.role.lock();
        let previous = *current;
        if previous != role {
            debug!(election = %self.election_name, leader = %self.leader_name, from = ?previous, to = ?role, "election role changed");
            *current = role;
        }
    }

    /// One atomic claim-or-refresh of the lease at `now`.
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<bool, ElectionError> {
        let claimed = self
            .store
            .claim_lease(&self.election_name, &self.leader_name, now, self.term)
            .await?;
        self.set_role(if claimed {
            ElectionRole::Leader
        } else {
            ElectionRole::Candidate
        });
        Ok(claimed)
    }

    /// Claim the lease and start the refresher.
    ///
    /// Fails with [`ElectionError::NotLeader`] when another identity holds a live
    /// lease. The refresher stops when `cancel` fires or after reporting exactly one
    /// error on the returned lease's channel.
    pub async fn campaign(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<LeaderLease, ElectionError> {
        if !self.claim(Utc::now()).await? {
            let holder = self
                .store
                .lease(&self.election_name)
                .await?
                .map(|record| record.leader_name)
                .unwrap_or_else(|| "nobody".to_owned());
            return Err(ElectionError::NotLeader {
                election: self.election_name.clone(),
                candidate: self.leader_name.clone(),
                holder,
            });
        }
        info!(election = %self.election_name, leader = %self.leader_name, term_secs = self.term.as_secs(), "campaign succeeded");

        let (tx, rx) = mpsc::channel(1);
        let election = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Some(err) = election.keep_claim(cancel).await {
                election.set_role(ElectionRole::Candidate);
                warn!(election = %election.election_name, leader = %election.leader_name, error = %err, "leadership lost");
                let _ = tx.try_send(err);
            }
        });
        Ok(LeaderLease { errors: rx, task })
    }

    async fn keep_claim(&self, cancel: CancellationToken) -> Option<ElectionError> {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the lease was just claimed.
        ticker.tick().await;
        let mut last_refresh = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(election = %self.election_name, leader = %self.leader_name, "lease refresher exiting");
                    return None;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = last_refresh.elapsed();
            if elapsed > self.term {
                return Some(ElectionError::LeaseLapsed {
                    election: self.election_name.clone(),
                    elapsed,
                    term: self.term,
                });
            }
            debug!(election = %self.election_name, leader = %self.leader_name, "refreshing lease");
            match self.claim(Utc::now()).await {
                Ok(true) => last_refresh = Instant::now(),
                Ok(false) => {
                    return Some(ElectionError::LeaderChanged {
                        election: self.election_name.clone(),
                        leader: self.leader_name.clone(),
                    })
                }
                Err(err) => return Some(err),
            }
        }
    }

    /// Whether the stored lease names this process, regardless of staleness.
    pub async fn is_leader(&self) -> Result<bool, ElectionError> {
        let lease = self.store.lease(&self.election_name).await?;
        Ok(lease
            .map(|record| record.leader_name == self.leader_name)
            .unwrap_or(false))
    }

    /// Give up the lease so a standby can take over without waiting for expiry.
    pub async fn quit(&self) -> Result<bool, ElectionError> {
        self.set_role(ElectionRole::Candidate);
        let released = self
            .store
            .release_lease(&self.election_name, &self.leader_name)
            .await?;
        if released {
            info!(election = %self.election_name, leader = %self.leader_name, "lease released");
        }
        Ok(released)
    }
}

/// Handle to a won election: the refresher task and its error channel.
#[derive(Debug)]
pub struct LeaderLease {
    errors: mpsc::Receiver<ElectionError>,
    task: JoinHandle<()>,
}

impl LeaderLease {
    /// Wait for the refresher to report a lost lease.
    ///
    /// Resolves to `None` when the refresher exited because it was cancelled.
    pub async fn lost(&mut self) -> Option<ElectionError> {
        self.errors.recv().await
    }

    /// Wait for the refresher task to exit.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "lease refresher join error");
        }
    }
}
