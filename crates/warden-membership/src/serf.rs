//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::path::PathBuf;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use warden_common::config::MonitorConfig;

use crate::{HealthStatus, MemberStatus, MembershipError, MembershipSource};

#[derive(Debug, Deserialize)]
struct SerfMembers {
    #[serde(default)]
    members: Vec<SerfMember>,
}

#[derive(Debug, Deserialize)]
struct SerfMember {
    name: String,
    status: String,
}

/// Decode the output of `serf members -format=json`.
///
/// `alive` members are reported active and `failed` members failed; members
/// that are leaving, left or otherwise in transition are skipped.
pub fn parse_members(output: &[u8]) -> Result<Vec<MemberStatus>, MembershipError> {
    let decoded: SerfMembers = serde_json::from_slice(output)?;
    Ok(decoded
        .members
        .into_iter()
        .filter_map(|member| {
            let status = match member.status.as_str() {
                "alive" => HealthStatus::Active,
                "failed" => HealthStatus::Failed,
                _ => return None,
            };
            Some(MemberStatus {
                hostname: member.name,
                status,
            })
        })
        .collect())
}

/// Membership feed backed by a Serf agent's RPC endpoint.
#[derive(Debug, Clone)]
pub struct SerfSource {
    binary: PathBuf,
    rpc_addr: String,
}

impl SerfSource {
    pub fn new(binary: impl Into<PathBuf>, rpc_addr: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            rpc_addr: rpc_addr.into(),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.serf_binary.clone(), config.address.clone())
    }

    async fn query(&self) -> Result<Vec<MemberStatus>, MembershipError> {
        let binary = self.binary.display().to_string();
        let output = Command::new(&self.binary)
            .arg("members")
            .arg(format!("-rpc-addr={}", self.rpc_addr))
            .arg("-format=json")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| MembershipError::Spawn {
                binary: binary.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(MembershipError::CommandFailed {
                binary,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        parse_members(&output.stdout)
    }
}

impl MembershipSource for SerfSource {
    fn start(&self) -> Result<mpsc::Receiver<Vec<MemberStatus>>, MembershipError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| MembershipError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(1);
        let source = self.clone();
        handle.spawn(async move {
            match source.query().await {
                Ok(members) => {
                    debug!(rpc_addr = %source.rpc_addr, members = members.len(), "serf snapshot received");
                    let _ = tx.send(members).await;
                }
                Err(err) => {
                    warn!(rpc_addr = %source.rpc_addr, error = %err, "serf membership query failed");
                }
            }
        });
        Ok(rx)
    }
}
