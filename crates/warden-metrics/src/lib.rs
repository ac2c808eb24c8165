//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Metrics collection and export utilities."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub async fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let addr = listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> Response {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address, useful when listening on port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the monitor loop, the policy engine and the fencing path.
#[derive(Clone, Debug)]
pub struct MonitorMetrics {
    registry: SharedRegistry,
    leader: IntGauge,
    epochs: IntCounter,
    cycles: IntCounter,
    events: IntCounterVec,
    transitions: IntCounterVec,
    fence_attempts: IntCounterVec,
    evacuations: IntCounterVec,
    build_info: IntGaugeVec,
}

impl MonitorMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let leader = IntGauge::with_opts(Opts::new(
            "warden_leader",
            "Indicator (0/1) whether this process holds the leader lease",
        ))?;
        registry.register(Box::new(leader.clone()))?;

        let epochs = IntCounter::with_opts(Opts::new(
            "warden_epochs_total",
            "Leadership epochs started by this process",
        ))?;
        registry.register(Box::new(epochs.clone()))?;

        let cycles = IntCounter::with_opts(Opts::new(
            "warden_policy_cycles_total",
            "Policy cycles completed",
        ))?;
        registry.register(Box::new(cycles.clone()))?;

        let events = IntCounterVec::new(
            Opts::new(
                "warden_events_total",
                "Membership events processed by tag and reported status",
            ),
            &["tag", "status"],
        )?;
        registry.register(Box::new(events.clone()))?;

        let transitions = IntCounterVec::new(
            Opts::new(
                "warden_host_transitions_total",
                "Host status transitions by target status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let fence_attempts = IntCounterVec::new(
            Opts::new(
                "warden_fence_attempts_total",
                "Fence attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(fence_attempts.clone()))?;

        let evacuations = IntCounterVec::new(
            Opts::new(
                "warden_evacuations_total",
                "Host evacuations by backend and outcome",
            ),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(evacuations.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("warden_build_info", "Build metadata for the running binary"),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            leader,
            epochs,
            cycles,
            events,
            transitions,
            fence_attempts,
            evacuations,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.set(i64::from(leader));
    }

    pub fn is_leader(&self) -> bool {
        self.leader.get() == 1
    }

    pub fn inc_epoch(&self) {
        self.epochs.inc();
    }

    pub fn epochs(&self) -> u64 {
        self.epochs.get()
    }

    pub fn inc_cycle(&self) {
        self.cycles.inc();
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }

    pub fn record_event(&self, tag: &str, status: &str) {
        self.events.with_label_values(&[tag, status]).inc();
    }

    pub fn record_transition(&self, status: &str) {
        self.transitions.with_label_values(&[status]).inc();
    }

    pub fn transitions(&self, status: &str) -> u64 {
        self.transitions.with_label_values(&[status]).get()
    }

    pub fn record_fence_attempt(&self, outcome: &str) {
        self.fence_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn fence_attempts(&self, outcome: &str) -> u64 {
        self.fence_attempts.with_label_values(&[outcome]).get()
    }

    pub fn record_evacuation(&self, backend: &str, outcome: &str) {
        self.evacuations.with_label_values(&[backend, outcome]).inc();
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_registered_once() {
        let registry = new_registry();
        let metrics = MonitorMetrics::new(registry.clone()).unwrap();
        metrics.set_leader(true);
        metrics.record_fence_attempt("failed");
        metrics.record_fence_attempt("failed");
        assert!(metrics.is_leader());
        assert_eq!(metrics.fence_attempts("failed"), 2);
        assert!(MonitorMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registered_families() {
        let metrics = MonitorMetrics::new(new_registry()).unwrap();
        metrics.inc_epoch();
        metrics.record_event("storage", "failed");
        let server = spawn_http_server(metrics.registry(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let body = reqwest::get(format!("http://{}/metrics", server.addr()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("warden_epochs_total 1"));
        assert!(body.contains("warden_events_total{status=\"failed\",tag=\"storage\"} 1"));

        server.shutdown().await.unwrap();
    }
}
