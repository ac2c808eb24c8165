//! ---
//! warden_section: "05-fencing"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Out-of-band power control for failed hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use warden_common::config::FenceConfig;

use crate::{BmcConnector, BmcEndpoint, BmcSession, FenceError};

/// Talks IPMI over LAN by shelling out to `ipmitool`.
///
/// The password travels through `IPMI_PASSWORD` (`-E`) so it never shows up in
/// the process table.
#[derive(Debug, Clone)]
pub struct IpmitoolConnector {
    binary: PathBuf,
    interface: String,
}

impl IpmitoolConnector {
    pub fn new(binary: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            interface: interface.into(),
        }
    }

    pub fn from_config(config: &FenceConfig) -> Self {
        Self::new(config.ipmitool_path.clone(), config.ipmi_interface.clone())
    }

    async fn run(
        &self,
        endpoint: &BmcEndpoint,
        action: &'static str,
        args: &[&str],
    ) -> Result<String, FenceError> {
        let output = Command::new(&self.binary)
            .arg("-I")
            .arg(&self.interface)
            .arg("-H")
            .arg(&endpoint.address)
            .arg("-p")
            .arg(endpoint.port.to_string())
            .arg("-U")
            .arg(&endpoint.username)
            .arg("-E")
            .args(args)
            .env("IPMI_PASSWORD", &endpoint.password)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| FenceError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(FenceError::Command {
                address: endpoint.address.clone(),
                action,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[async_trait]
impl BmcConnector for IpmitoolConnector {
    async fn open(&self, endpoint: &BmcEndpoint) -> Result<Box<dyn BmcSession>, FenceError> {
        // ipmitool is stateless; a status query proves address and credentials work.
        let status = self
            .run(endpoint, "chassis power status", &["chassis", "power", "status"])
            .await
            .map_err(|err| FenceError::Connect {
                address: endpoint.address.clone(),
                reason: err.to_string(),
            })?;
        debug!(bmc = %endpoint, status = %status, "BMC session opened");
        Ok(Box::new(IpmitoolSession {
            connector: self.clone(),
            endpoint: endpoint.clone(),
        }))
    }
}

struct IpmitoolSession {
    connector: IpmitoolConnector,
    endpoint: BmcEndpoint,
}

#[async_trait]
impl BmcSession for IpmitoolSession {
    async fn power_off(&mut self) -> Result<(), FenceError> {
        self.connector
            .run(&self.endpoint, "chassis power off", &["chassis", "power", "off"])
            .await
            .map(|_| ())
    }

    async fn close(self: Box<Self>) -> Result<(), FenceError> {
        Ok(())
    }
}

/// Fences a host through one IPMI management controller.
#[derive(Debug, Clone)]
pub struct IpmiFencer {
    endpoint: BmcEndpoint,
    connector: Arc<dyn BmcConnector>,
}

impl IpmiFencer {
    pub fn new(endpoint: BmcEndpoint, connector: Arc<dyn BmcConnector>) -> Self {
        Self {
            endpoint,
            connector,
        }
    }

    pub fn endpoint(&self) -> &BmcEndpoint {
        &self.endpoint
    }

    /// Open a session, power the chassis off and close the session.
    ///
    /// A close failure after a successful power-off is logged but does not fail
    /// the fence.
    pub async fn fence(&self) -> Result<(), FenceError> {
        let mut session = match self.connector.open(&self.endpoint).await {
            Ok(session) => session,
            Err(err) => {
                warn!(bmc = %self.endpoint, error = %err, "IPMI fencer failed to connect BMC");
                return Err(err);
            }
        };
        let result = session.power_off().await;
        if let Err(err) = &result {
            warn!(bmc = %self.endpoint, error = %err, "IPMI fencer failed to power down");
        }
        if let Err(err) = session.close().await {
            warn!(bmc = %self.endpoint, error = %err, "IPMI fencer failed to close session");
        }
        if result.is_ok() {
            info!(bmc = %self.endpoint, "chassis powered down");
        }
        result
    }
}
