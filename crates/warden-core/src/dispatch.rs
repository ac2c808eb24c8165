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

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use warden_common::config::FenceConfig;
use warden_fence::{fence_any, BmcConnector, FenceOutcome, Fencer};
use warden_metrics::MonitorMetrics;
use warden_persistence::{Host, HostId, HostStatus, PersistenceError, SharedStore};
use warden_remediation::{EvacuationReport, RemediationWorker};

/// What happened to a host handed over for fencing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Fence operations are switched off; the host stays `Failed`.
    Suppressed,
    /// The host ended `Fenced` and disabled and an evacuation pass ran.
    Fenced {
        fence: FenceOutcome,
        evacuation: EvacuationReport,
    },
    /// No fencer succeeded; the host went back to `Failed` for the next cycle.
    Reverted(FenceOutcome),
}

/// Powers off failed hosts and evacuates them.
#[derive(Debug)]
pub struct FenceDispatcher {
    store: SharedStore,
    connector: Arc<dyn BmcConnector>,
    worker: RemediationWorker,
    config: FenceConfig,
    metrics: MonitorMetrics,
}

impl FenceDispatcher {
    pub fn new(
        store: SharedStore,
        connector: Arc<dyn BmcConnector>,
        worker: RemediationWorker,
        config: FenceConfig,
        metrics: MonitorMetrics,
    ) -> Self {
        Self {
            store,
            connector,
            worker,
            config,
            metrics,
        }
    }

    async fn save(&self, host: &mut Host, status: HostStatus, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        host.transition(status, now);
        self.store.update_host(host).await?;
        self.metrics.record_transition(status.as_ref());
        Ok(())
    }

    /// Fence one `Failed` host, then evacuate it once it is marked `Fenced`.
    pub async fn fence_host(&self, mut host: Host, now: DateTime<Utc>) -> Result<DispatchOutcome, PersistenceError> {
        if self.config.disable_fence_ops {
            info!(host = %host.name, "fence operations are disabled, leaving host failed");
            self.metrics.record_fence_attempt("suppressed");
            return Ok(DispatchOutcome::Suppressed);
        }

        let fencers: Vec<Fencer> = self
            .store
            .fencers_for_host(host.id)
            .await?
            .iter()
            .map(|config| Fencer::from_config(config, self.connector.clone()))
            .collect();

        info!(host = %host.name, fencers = fencers.len(), "begin fencing host");
        self.save(&mut host, HostStatus::Fencing, now).await?;

        let outcome = fence_any(&host.name, &fencers).await;
        self.metrics.record_fence_attempt(outcome.label());
        if !outcome.is_fenced() {
            if !self.config.evacuate_on_fence_failure {
                warn!(host = %host.name, outcome = outcome.label(), "fencing failed, host stays failed");
                self.save(&mut host, HostStatus::Failed, now).await?;
                return Ok(DispatchOutcome::Reverted(outcome));
            }
            warn!(host = %host.name, outcome = outcome.label(), "fencing failed, evacuating anyway");
        }

        host.disabled = true;
        self.save(&mut host, HostStatus::Fenced, now).await?;

        let evacuation = self.worker.evacuate_host(&host.name).await;
        self.metrics
            .record_evacuation(self.worker.label(), evacuation.outcome());
        Ok(DispatchOutcome::Fenced {
            fence: outcome,
            evacuation,
        })
    }

    /// Put a host left in `Fencing` by an interrupted attempt back to `Failed`
    /// so the next cycle retries it. Returns whether the host was reverted.
    pub async fn revert_interrupted(&self, host_id: HostId, now: DateTime<Utc>) -> Result<bool, PersistenceError> {
        let Some(mut host) = self.store.host_by_id(host_id).await? else {
            return Ok(false);
        };
        if host.status != HostStatus::Fencing {
            return Ok(false);
        }
        warn!(host = %host.name, "fencing attempt interrupted, host returns to failed");
        self.save(&mut host, HostStatus::Failed, now).await?;
        Ok(true)
    }
}
