//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the controller runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

const KERNEL_HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

fn resolve_leader_name(configured: Option<&str>, hostname: Option<&str>) -> Result<String> {
    fn usable(name: &str) -> Option<&str> {
        Some(name.trim()).filter(|name| !name.is_empty())
    }
    configured
        .and_then(usable)
        .or_else(|| hostname.and_then(usable))
        .map(str::to_owned)
        .ok_or_else(|| {
            anyhow!(
                "unable to determine controller identity: set identity.leader_name or make {KERNEL_HOSTNAME_PATH} readable"
            )
        })
}

fn default_election_name() -> String {
    "warden-leader".to_owned()
}

fn default_lease_term() -> Duration {
    Duration::from_secs(30)
}

fn default_drain_interval() -> Duration {
    Duration::from_secs(6)
}

fn default_settle_period() -> Duration {
    Duration::from_secs(60)
}

fn default_failure_threshold() -> u32 {
    6
}

fn default_bind_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_restart_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_serf_binary() -> PathBuf {
    PathBuf::from("serf")
}

fn default_ipmitool_path() -> PathBuf {
    PathBuf::from("ipmitool")
}

fn default_ipmi_interface() -> String {
    "lanplus".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9878))
}

fn default_database_url() -> String {
    "sqlite:///var/lib/warden/warden.db?mode=rwc".to_owned()
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_agent_restart_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_disable_reason() -> String {
    "disabled by warden monitor".to_owned()
}

/// Primary configuration object for the Warden daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub monitors: IndexMap<String, MonitorConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub fence: FenceConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "WARDEN_CONFIG";

    /// Load configuration from disk, respecting the `WARDEN_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Identity this process campaigns with: the configured name, else the
    /// kernel hostname. Fails rather than letting two controllers share a name.
    pub fn leader_name(&self) -> Result<String> {
        let hostname = fs::read_to_string(KERNEL_HOSTNAME_PATH).ok();
        resolve_leader_name(self.identity.leader_name.as_deref(), hostname.as_deref())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.monitors.is_empty() {
            return Err(anyhow!("configuration must declare at least one monitor"));
        }
        for (tag, monitor) in &self.monitors {
            monitor.validate(tag)?;
        }
        self.election.validate()?;
        self.database.validate()?;
        self.policy.validate()?;
        self.remediation.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// Overrides the host name used as the election identity.
    #[serde(default)]
    pub leader_name: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default = "default_election_name")]
    pub name: String,
    #[serde(default = "default_lease_term")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub term: Duration,
    /// Defaults to a fifth of the term when unset.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub refresh_interval: Option<Duration>,
}

impl ElectionConfig {
    pub fn effective_refresh_interval(&self) -> Duration {
        self.refresh_interval.unwrap_or(self.term / 5)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("election name must not be empty"));
        }
        if self.term.is_zero() {
            return Err(anyhow!("election term must be greater than zero"));
        }
        if self.effective_refresh_interval() >= self.term {
            return Err(anyhow!(
                "election refresh interval ({:?}) must be shorter than the term ({:?})",
                self.effective_refresh_interval(),
                self.term
            ));
        }
        Ok(())
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            name: default_election_name(),
            term: default_lease_term(),
            refresh_interval: None,
        }
    }
}

/// Shared SQL database holding hosts, counters, fencers and the election lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://` or `postgres://` connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_database_max_connections")]
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .url
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or_default();
        if !matches!(scheme, "sqlite" | "postgres" | "postgresql") {
            return Err(anyhow!(
                "database url '{}' must use the sqlite or postgres scheme",
                self.url
            ));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("database max_connections must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_database_max_connections(),
        }
    }
}

/// Settings for `wardend agent`, which keeps one serf agent alive per monitor tag.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Wait before restarting an agent that exited.
    #[serde(default = "default_agent_restart_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub restart_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            restart_delay: default_agent_restart_delay(),
        }
    }
}

/// Kind of external membership feed backing a monitor tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    #[default]
    Serf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default, rename = "type")]
    pub kind: MonitorKind,
    /// RPC address of the membership agent, `ip:port`.
    pub address: String,
    #[serde(default = "default_serf_binary")]
    pub serf_binary: PathBuf,
}

impl MonitorConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            kind: MonitorKind::Serf,
            address: address.into(),
            serf_binary: default_serf_binary(),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.address
            .parse::<SocketAddr>()
            .with_context(|| format!("monitor address '{}' is not ip:port", self.address))
    }

    pub fn validate(&self, tag: &str) -> Result<()> {
        if tag.trim().is_empty() {
            return Err(anyhow!("monitor tags must not be empty"));
        }
        self.socket_addr()
            .with_context(|| format!("monitor '{}' is misconfigured", tag))?;
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Time collectors are given to answer before their events are drained.
    #[serde(default = "default_drain_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub drain_interval: Duration,
    /// Minimum time a host spends in a status before leaving it.
    #[serde(default = "default_settle_period")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub settle_period: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub fence_on_management_only: bool,
    #[serde(default = "default_bind_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub bind_check_interval: Duration,
    #[serde(default = "default_restart_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub restart_backoff: Duration,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("policy failure_threshold must be at least 1"));
        }
        if self.drain_interval.is_zero() {
            return Err(anyhow!("policy drain_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            drain_interval: default_drain_interval(),
            settle_period: default_settle_period(),
            failure_threshold: default_failure_threshold(),
            fence_on_management_only: false,
            bind_check_interval: default_bind_check_interval(),
            restart_backoff: default_restart_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceConfig {
    /// Log eligible hosts instead of powering them off.
    #[serde(default)]
    pub disable_fence_ops: bool,
    /// Mark and evacuate a host even when every fencer failed.
    #[serde(default)]
    pub evacuate_on_fence_failure: bool,
    #[serde(default = "default_ipmitool_path")]
    pub ipmitool_path: PathBuf,
    #[serde(default = "default_ipmi_interface")]
    pub ipmi_interface: String,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            disable_fence_ops: false,
            evacuate_on_fence_failure: false,
            ipmitool_path: default_ipmitool_path(),
            ipmi_interface: default_ipmi_interface(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemediationBackend {
    #[default]
    Openstack,
    Converge,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemediationConfig {
    #[serde(default)]
    pub backend: RemediationBackend,
    #[serde(default)]
    pub openstack: OpenstackConfig,
    #[serde(default)]
    pub converge: ConvergeConfig,
}

impl RemediationConfig {
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            RemediationBackend::Openstack => {
                Url::parse(&self.openstack.auth_url).with_context(|| {
                    format!("invalid openstack auth_url '{}'", self.openstack.auth_url)
                })?;
            }
            RemediationBackend::Converge => {
                Url::parse(&self.converge.url)
                    .with_context(|| format!("invalid converge url '{}'", self.converge.url))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenstackConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub domain_name: String,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default = "default_disable_reason")]
    pub disable_reason: String,
}

impl Default for OpenstackConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://localhost:5000/v3".to_owned(),
            username: "admin".to_owned(),
            password: String::new(),
            project_name: "admin".to_owned(),
            domain_name: "default".to_owned(),
            region_name: Some("RegionOne".to_owned()),
            disable_reason: default_disable_reason(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergeConfig {
    pub url: String,
    pub username: String,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1".to_owned(),
            username: "admin".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [monitors.network]
        address = "10.0.0.5:7373"

        [monitors.storage]
        type = "serf"
        address = "10.1.0.5:7373"
    "#;

    #[test]
    fn minimal_config_uses_documented_defaults() {
        let config: AppConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.monitors.len(), 2);
        assert_eq!(config.election.term, Duration::from_secs(30));
        assert_eq!(
            config.election.effective_refresh_interval(),
            Duration::from_secs(6)
        );
        assert_eq!(config.policy.failure_threshold, 6);
        assert_eq!(config.policy.settle_period, Duration::from_secs(60));
        assert!(!config.policy.fence_on_management_only);
        assert_eq!(config.remediation.backend, RemediationBackend::Openstack);
        let keys: Vec<_> = config.monitors.keys().cloned().collect();
        assert_eq!(keys, vec!["network".to_owned(), "storage".to_owned()]);
    }

    #[test]
    fn durations_are_read_as_seconds() {
        let content = format!(
            "{}\n[election]\nterm = 10\nrefresh_interval = 2\n[policy]\ndrain_interval = 1\n",
            MINIMAL
        );
        let config: AppConfig = content.parse().unwrap();
        assert_eq!(config.election.term, Duration::from_secs(10));
        assert_eq!(
            config.election.effective_refresh_interval(),
            Duration::from_secs(2)
        );
        assert_eq!(config.policy.drain_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_config_without_monitors() {
        let err = "[policy]\nfailure_threshold = 3\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("at least one monitor"));
    }

    #[test]
    fn rejects_monitor_address_without_port() {
        let err = "[monitors.network]\naddress = \"10.0.0.5\"\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{:#}", err).contains("not ip:port"));
    }

    #[test]
    fn rejects_refresh_longer_than_term() {
        let content = format!("{}\n[election]\nterm = 5\nrefresh_interval = 5\n", MINIMAL);
        assert!(content.parse::<AppConfig>().is_err());
    }

    #[test]
    fn rejects_hostname_monitor_address() {
        let err = "[monitors.network]\naddress = \"localhost:7373\"\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{:#}", err).contains("'localhost:7373' is not ip:port"));
    }

    #[test]
    fn rejects_unknown_database_scheme() {
        let content = format!("{}\n[database]\nurl = \"mysql://db/warden\"\n", MINIMAL);
        let err = content.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("sqlite or postgres"));
    }

    #[test]
    fn database_defaults_to_local_sqlite() {
        let config: AppConfig = MINIMAL.parse().unwrap();
        assert!(config.database.url.starts_with("sqlite://"));
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.agent.restart_delay, Duration::from_secs(1));
    }

    #[test]
    fn explicit_leader_name_wins() {
        let mut config: AppConfig = MINIMAL.parse().unwrap();
        config.identity.leader_name = Some("controller-a".into());
        assert_eq!(config.leader_name().unwrap(), "controller-a");
    }

    #[test]
    fn leader_name_falls_back_to_kernel_hostname() {
        assert_eq!(
            resolve_leader_name(None, Some("ctl-02\n")).unwrap(),
            "ctl-02"
        );
        assert_eq!(
            resolve_leader_name(Some("  "), Some("ctl-02")).unwrap(),
            "ctl-02"
        );
    }

    #[test]
    fn missing_identity_is_an_error_not_a_shared_default() {
        let err = resolve_leader_name(None, None).unwrap_err();
        assert!(err.to_string().contains("identity.leader_name"));
        assert!(resolve_leader_name(Some(""), Some(" \n")).is_err());
    }
}
