//! ---
//! warden_section: "06-remediation"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Workload evacuation from fenced hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A compute control-plane service registered for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeService {
    #[serde(default)]
    pub id: serde_json::Value,
    pub binary: String,
    pub host: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub state: String,
}

impl ComputeService {
    pub fn new(binary: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: serde_json::Value::Null,
            binary: binary.into(),
            host: host.into(),
            status: "enabled".to_owned(),
            state: "up".to_owned(),
        }
    }

    /// Whether this is the hypervisor agent running on `host`.
    pub fn is_compute_on(&self, host: &str) -> bool {
        self.host == host && self.binary == "nova-compute"
    }
}

/// An instance scheduled on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

impl Server {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            status: "ACTIVE".to_owned(),
        }
    }
}

/// Compute control-plane operations needed to evacuate a host.
#[async_trait]
pub trait ComputeApi: Send + Sync + Debug {
    async fn list_services(&self) -> Result<Vec<ComputeService>>;

    /// Mark the service down without waiting for its heartbeat to expire.
    async fn force_down_service(&self, service: &ComputeService) -> Result<()>;

    async fn disable_service(&self, service: &ComputeService, reason: &str) -> Result<()>;

    /// Instances on `host`, across all projects.
    async fn list_servers(&self, host: &str) -> Result<Vec<Server>>;

    /// Rebuild the instance on another host.
    async fn evacuate(&self, server_id: &str) -> Result<()>;
}
