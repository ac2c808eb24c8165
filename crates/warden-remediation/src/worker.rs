//! ---
//! warden_section: "06-remediation"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Workload evacuation from fenced hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{info, warn};
use warden_common::config::{RemediationBackend, RemediationConfig};

use crate::{ComputeApi, ConvergeClient, NovaClient, Result};

/// What an evacuation pass managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvacuationReport {
    pub services_disabled: usize,
    pub servers_evacuated: usize,
    pub failures: usize,
}

impl EvacuationReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }

    /// Label used for the evacuation metric.
    pub fn outcome(&self) -> &'static str {
        if self.is_clean() {
            "success"
        } else {
            "partial"
        }
    }
}

/// Evacuation strategy, fixed when the controller starts.
#[derive(Debug, Clone)]
pub enum RemediationWorker {
    /// Drive the compute API directly.
    Openstack {
        compute: Arc<dyn ComputeApi>,
        disable_reason: String,
    },
    /// Delegate to a Converge controller.
    Converge(ConvergeClient),
}

impl RemediationWorker {
    pub fn from_config(config: &RemediationConfig) -> Result<Self> {
        Ok(match config.backend {
            RemediationBackend::Openstack => RemediationWorker::Openstack {
                compute: Arc::new(NovaClient::new(config.openstack.clone())?),
                disable_reason: config.openstack.disable_reason.clone(),
            },
            RemediationBackend::Converge => {
                RemediationWorker::Converge(ConvergeClient::new(&config.converge)?)
            }
        })
    }

    pub fn openstack(compute: Arc<dyn ComputeApi>, disable_reason: impl Into<String>) -> Self {
        RemediationWorker::Openstack {
            compute,
            disable_reason: disable_reason.into(),
        }
    }

    pub fn backend(&self) -> RemediationBackend {
        match self {
            RemediationWorker::Openstack { .. } => RemediationBackend::Openstack,
            RemediationWorker::Converge(_) => RemediationBackend::Converge,
        }
    }

    /// Backend name used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self.backend() {
            RemediationBackend::Openstack => "openstack",
            RemediationBackend::Converge => "converge",
        }
    }

    /// Move every workload off a fenced host.
    ///
    /// Every failing call is logged and counted; none of them stops the rest.
    pub async fn evacuate_host(&self, host: &str) -> EvacuationReport {
        match self {
            RemediationWorker::Openstack {
                compute,
                disable_reason,
            } => evacuate_via_compute(compute.as_ref(), host, disable_reason).await,
            RemediationWorker::Converge(client) => {
                let mut report = EvacuationReport::default();
                if let Err(err) = client.evacuate_host(host).await {
                    warn!(host, error = %err, "converge evacuation failed");
                    report.failures += 1;
                }
                report
            }
        }
    }
}

async fn evacuate_via_compute(
    compute: &dyn ComputeApi,
    host: &str,
    disable_reason: &str,
) -> EvacuationReport {
    let mut report = EvacuationReport::default();

    match compute.list_services().await {
        Ok(services) => {
            for service in services.iter().filter(|service| service.is_compute_on(host)) {
                if let Err(err) = compute.force_down_service(service).await {
                    warn!(host, binary = %service.binary, error = %err, "force-down failed");
                    report.failures += 1;
                }
                match compute.disable_service(service, disable_reason).await {
                    Ok(()) => report.services_disabled += 1,
                    Err(err) => {
                        warn!(host, binary = %service.binary, error = %err, "disable service failed");
                        report.failures += 1;
                    }
                }
            }
        }
        Err(err) => {
            warn!(host, error = %err, "unable to list compute services");
            report.failures += 1;
        }
    }

    let servers = match compute.list_servers(host).await {
        Ok(servers) => servers,
        Err(err) => {
            warn!(host, error = %err, "unable to list instances");
            report.failures += 1;
            return report;
        }
    };
    for server in &servers {
        info!(host, instance = %server.id, "evacuating instance");
        match compute.evacuate(&server.id).await {
            Ok(()) => report.servers_evacuated += 1,
            Err(err) => {
                warn!(host, instance = %server.id, error = %err, "evacuate failed");
                report.failures += 1;
            }
        }
    }
    info!(
        host,
        evacuated = report.servers_evacuated,
        failures = report.failures,
        "evacuation pass finished"
    );
    report
}
