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

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_common::config::AppConfig;
use warden_common::net::missing_monitor_addresses;
use warden_election::{Election, ElectionError, LeaderLease};
use warden_fence::IpmitoolConnector;
use warden_membership::{source_for, EventCollector, MembershipError, MembershipSource};
use warden_metrics::MonitorMetrics;
use warden_persistence::SharedStore;
use warden_remediation::{RemediationError, RemediationWorker};

use crate::dispatch::FenceDispatcher;
use crate::policy::{DecisionMatrix, PolicyEngine, PolicyError, PolicySettings};

/// Reasons a leadership epoch ends early.
#[derive(Debug, thiserror::Error)]
pub enum EpochError {
    #[error(transparent)]
    Election(#[from] ElectionError),
    #[error("lease refresher stopped without reporting an error")]
    RefresherStopped,
    #[error("monitor addresses not bound locally: {}", .0.join(", "))]
    MissingAddresses(Vec<String>),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("{0} exited unexpectedly")]
    ChildExited(&'static str),
}

/// Leader-gated monitor: campaigns, then runs the policy loop while it holds the lease.
#[derive(Debug)]
pub struct Monitor {
    config: Arc<AppConfig>,
    election: Arc<Election>,
    engine: Arc<PolicyEngine>,
    sources: IndexMap<String, Arc<dyn MembershipSource>>,
    metrics: MonitorMetrics,
}

impl Monitor {
    pub fn new(
        leader: impl Into<String>,
        config: AppConfig,
        store: SharedStore,
        engine: Arc<PolicyEngine>,
        sources: IndexMap<String, Arc<dyn MembershipSource>>,
        metrics: MonitorMetrics,
    ) -> Self {
        let election = Arc::new(Election::new(leader, store, &config.election));
        Self {
            config: Arc::new(config),
            election,
            engine,
            sources,
            metrics,
        }
    }

    /// Wire the production collaborators described by `config`.
    pub fn from_config(
        leader: impl Into<String>,
        config: AppConfig,
        store: SharedStore,
        metrics: MonitorMetrics,
    ) -> Result<Self, RemediationError> {
        let worker = RemediationWorker::from_config(&config.remediation)?;
        let dispatcher = Arc::new(FenceDispatcher::new(
            store.clone(),
            Arc::new(IpmitoolConnector::from_config(&config.fence)),
            worker,
            config.fence.clone(),
            metrics.clone(),
        ));
        let engine = Arc::new(PolicyEngine::new(
            store.clone(),
            PolicySettings::from_config(&config.policy),
            DecisionMatrix::from_config(&config.policy),
            dispatcher,
            metrics.clone(),
        ));
        let sources = config
            .monitors
            .iter()
            .map(|(tag, monitor)| (tag.clone(), source_for(monitor)))
            .collect();
        Ok(Self::new(leader, config, store, engine, sources, metrics))
    }

    /// Spawn the monitor loop.
    pub fn start(self) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let monitor = Arc::new(self);
        let task = tokio::spawn(monitor.clone().run(cancel.clone()));
        MonitorHandle { cancel, task }
    }

    async fn run(self: Arc<Self>, root: CancellationToken) {
        info!(leader = %self.election.leader_name(), monitors = self.sources.len(), "monitor starting");
        let mut epoch_id: u64 = 0;
        while !root.is_cancelled() {
            let missing = missing_monitor_addresses(&self.config.monitors);
            if !missing.is_empty() {
                warn!(missing = ?missing, "monitor addresses not bound locally, waiting");
                if backoff(&root, self.config.policy.bind_check_interval).await {
                    break;
                }
                continue;
            }

            let epoch = root.child_token();
            let mut lease = match self.election.campaign(epoch.clone()).await {
                Ok(lease) => lease,
                Err(err) => {
                    debug!(leader = %self.election.leader_name(), error = %err, "campaign failed");
                    if backoff(&root, self.config.policy.restart_backoff).await {
                        break;
                    }
                    continue;
                }
            };
            epoch_id += 1;
            self.metrics.set_leader(true);
            self.metrics.inc_epoch();
            info!(epoch = epoch_id, leader = %self.election.leader_name(), "leadership acquired, starting epoch");

            let (bind_errors, bind_task) = self.spawn_bind_watcher(epoch.clone());
            let (policy_errors, policy_task) = self.spawn_policy_loop(epoch.clone());
            let failure = wait_epoch(&root, &mut lease, bind_errors, policy_errors).await;

            epoch.cancel();
            lease.join().await;
            for (name, task) in [("bind watcher", bind_task), ("policy loop", policy_task)] {
                if let Err(err) = task.await {
                    warn!(epoch = epoch_id, task = name, error = %err, "epoch task join error");
                }
            }
            self.metrics.set_leader(false);
            if let Err(err) = self.election.quit().await {
                warn!(epoch = epoch_id, error = %err, "failed to release lease");
            }

            match failure {
                None => {
                    info!(epoch = epoch_id, "epoch stopped for shutdown");
                    break;
                }
                Some(err) => {
                    warn!(epoch = epoch_id, error = %err, "epoch failed, restarting");
                    if backoff(&root, self.config.policy.restart_backoff).await {
                        break;
                    }
                }
            }
        }
        info!(leader = %self.election.leader_name(), "monitor stopped");
    }

    fn spawn_bind_watcher(
        &self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<EpochError>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(config.policy.bind_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("bind watcher exiting");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let missing = missing_monitor_addresses(&config.monitors);
                if !missing.is_empty() {
                    let _ = tx.try_send(EpochError::MissingAddresses(missing));
                    return;
                }
            }
        });
        (rx, task)
    }

    fn spawn_policy_loop(
        &self,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<EpochError>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let engine = self.engine.clone();
        let drain_interval = self.config.policy.drain_interval;
        let mut collectors: Vec<EventCollector> = self
            .sources
            .iter()
            .map(|(tag, source)| EventCollector::new(tag.clone(), source.clone()))
            .collect();
        let task = tokio::spawn(async move {
            loop {
                for collector in &mut collectors {
                    if let Err(err) = collector.start() {
                        let _ = tx.try_send(err.into());
                        return;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("policy loop exiting");
                        return;
                    }
                    _ = sleep(drain_interval) => {}
                }
                let events: Vec<_> = collectors
                    .iter_mut()
                    .filter_map(EventCollector::drain_events)
                    .flatten()
                    .collect();
                if let Err(err) = engine.handle_events(events, Utc::now()).await {
                    let _ = tx.try_send(err.into());
                    return;
                }
            }
        });
        (rx, task)
    }
}

/// Wait for the first epoch failure, or `None` on shutdown.
async fn wait_epoch(
    root: &CancellationToken,
    lease: &mut LeaderLease,
    mut bind_errors: mpsc::Receiver<EpochError>,
    mut policy_errors: mpsc::Receiver<EpochError>,
) -> Option<EpochError> {
    tokio::select! {
        biased;
        _ = root.cancelled() => None,
        lost = lease.lost() => Some(lost.map(EpochError::from).unwrap_or(EpochError::RefresherStopped)),
        err = child_failure(&mut bind_errors, &mut policy_errors) => Some(err),
    }
}

/// First error reported by an epoch task. A task that drops its sender
/// without reporting, e.g. because it panicked, counts as a failure too.
async fn child_failure(
    bind_errors: &mut mpsc::Receiver<EpochError>,
    policy_errors: &mut mpsc::Receiver<EpochError>,
) -> EpochError {
    tokio::select! {
        err = bind_errors.recv() => err.unwrap_or(EpochError::ChildExited("bind watcher")),
        err = policy_errors.recv() => err.unwrap_or(EpochError::ChildExited("policy loop")),
    }
}

/// Sleep for `delay`; returns true when shutdown interrupted the wait.
async fn backoff(root: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = root.cancelled() => true,
        _ = sleep(delay) => false,
    }
}

/// Handle to a running [`Monitor`].
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel every epoch task, release the lease and wait for in-flight work.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "monitor task join error");
        }
    }
}
