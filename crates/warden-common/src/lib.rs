//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the controller runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Shared primitives for the Warden workspace.
//! This crate exposes configuration loading, logging setup, time helpers and
//! the local address checks used by the supervisor.

pub mod config;
pub mod logging;
pub mod net;
pub mod time;

pub use config::{
    AppConfig, ElectionConfig, FenceConfig, LoggingConfig, MetricsConfig, MonitorConfig,
    MonitorKind, PolicyConfig, RemediationBackend, RemediationConfig,
};
pub use logging::{init_tracing, LogFormat};
