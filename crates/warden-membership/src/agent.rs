//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Keeps the local serf agent of each health-signal network running, so every
//! host reports into the membership feeds the monitor reads.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_common::config::{AgentConfig, MonitorConfig};

use crate::MembershipError;

const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs `serf agent` for one tag and restarts it whenever it exits.
#[derive(Debug, Clone)]
pub struct SerfAgentKeeper {
    tag: String,
    binary: PathBuf,
    rpc_addr: SocketAddr,
    restart_delay: Duration,
}

impl SerfAgentKeeper {
    pub fn new(
        tag: impl Into<String>,
        binary: impl Into<PathBuf>,
        rpc_addr: SocketAddr,
        restart_delay: Duration,
    ) -> Self {
        Self {
            tag: tag.into(),
            binary: binary.into(),
            rpc_addr,
            restart_delay,
        }
    }

    pub fn from_config(
        tag: &str,
        monitor: &MonitorConfig,
        agent: &AgentConfig,
    ) -> Result<Self, MembershipError> {
        let rpc_addr = monitor
            .address
            .parse()
            .map_err(|_| MembershipError::Address(monitor.address.clone()))?;
        Ok(Self::new(
            tag,
            monitor.serf_binary.clone(),
            rpc_addr,
            agent.restart_delay,
        ))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The agent gossips on the RPC address's interface and discovers peers of
    /// the same tag over mDNS.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("agent")
            .arg(format!("-bind={}", self.rpc_addr.ip()))
            .arg(format!("-discover=serf.{}", self.tag))
            .arg(format!("-rpc-addr={}", self.rpc_addr))
            .arg("-tag")
            .arg(format!("network={}", self.tag))
            .kill_on_drop(true);
        command
    }

    async fn rpc_answers(&self) -> bool {
        matches!(
            timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(self.rpc_addr)).await,
            Ok(Ok(_))
        )
    }

    /// Supervise the agent until `cancel` fires. Returns how many times an
    /// agent process was launched.
    pub async fn run(self, cancel: CancellationToken) -> usize {
        let mut launches = 0;
        loop {
            if self.rpc_answers().await {
                debug!(tag = %self.tag, rpc_addr = %self.rpc_addr, "serf agent already listening");
                if self.pause(&cancel).await {
                    break;
                }
                continue;
            }

            let mut child = match self.command().spawn() {
                Ok(child) => child,
                Err(err) => {
                    warn!(tag = %self.tag, binary = %self.binary.display(), error = %err, "unable to start serf agent");
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };
            launches += 1;
            info!(tag = %self.tag, rpc_addr = %self.rpc_addr, pid = ?child.id(), "serf agent started");

            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(tag = %self.tag, error = %err, "unable to stop serf agent");
                    }
                    break;
                }
                status = child.wait() => match status {
                    Ok(status) => warn!(tag = %self.tag, %status, "serf agent exited"),
                    Err(err) => warn!(tag = %self.tag, error = %err, "lost track of serf agent"),
                },
            }
            if self.pause(&cancel).await {
                break;
            }
        }
        info!(tag = %self.tag, launches, "serf agent keeper stopped");
        launches
    }

    /// Wait out the restart delay; true when cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = sleep(self.restart_delay) => false,
        }
    }
}
