//! ---
//! warden_section: "06-remediation"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Workload evacuation from fenced hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! In-process compute API that records calls, compiled for tests and the
//! `test-util` feature.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{ComputeApi, ComputeService, RemediationError, Result, Server};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeCall {
    ListServices,
    /// Host of the service forced down.
    ForceDown(String),
    /// Host of the service disabled, and the reason.
    Disable(String, String),
    ListServers(String),
    Evacuate(String),
}

#[derive(Debug, Default)]
struct State {
    services: Vec<ComputeService>,
    servers: Vec<(String, Server)>,
    calls: Vec<ComputeCall>,
    fail_list_services: bool,
    fail_list_servers: bool,
    fail_evacuate: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct RecordingCompute {
    state: Mutex<State>,
}

impl RecordingCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service: ComputeService) -> Self {
        self.state.lock().services.push(service);
        self
    }

    pub fn with_server(self, host: &str, server: Server) -> Self {
        self.state.lock().servers.push((host.to_owned(), server));
        self
    }

    pub fn fail_list_services(&self) {
        self.state.lock().fail_list_services = true;
    }

    pub fn fail_list_servers(&self) {
        self.state.lock().fail_list_servers = true;
    }

    pub fn fail_evacuate(&self, server_id: &str) {
        self.state.lock().fail_evacuate.insert(server_id.to_owned());
    }

    pub fn calls(&self) -> Vec<ComputeCall> {
        self.state.lock().calls.clone()
    }

    /// Instances an evacuation was requested for, in call order.
    pub fn evacuated(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ComputeCall::Evacuate(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

fn scripted_failure(call: &'static str) -> RemediationError {
    RemediationError::Compute {
        call,
        reason: "scripted failure".to_owned(),
    }
}

#[async_trait]
impl ComputeApi for RecordingCompute {
    async fn list_services(&self) -> Result<Vec<ComputeService>> {
        let mut state = self.state.lock();
        state.calls.push(ComputeCall::ListServices);
        if state.fail_list_services {
            return Err(scripted_failure("list services"));
        }
        Ok(state.services.clone())
    }

    async fn force_down_service(&self, service: &ComputeService) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(ComputeCall::ForceDown(service.host.clone()));
        Ok(())
    }

    async fn disable_service(&self, service: &ComputeService, reason: &str) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(ComputeCall::Disable(service.host.clone(), reason.to_owned()));
        Ok(())
    }

    async fn list_servers(&self, host: &str) -> Result<Vec<Server>> {
        let mut state = self.state.lock();
        state.calls.push(ComputeCall::ListServers(host.to_owned()));
        if state.fail_list_servers {
            return Err(scripted_failure("list servers"));
        }
        Ok(state
            .servers
            .iter()
            .filter(|(owner, _)| owner == host)
            .map(|(_, server)| server.clone())
            .collect())
    }

    async fn evacuate(&self, server_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ComputeCall::Evacuate(server_id.to_owned()));
        if state.fail_evacuate.contains(server_id) {
            return Err(scripted_failure("evacuate"));
        }
        Ok(())
    }
}
