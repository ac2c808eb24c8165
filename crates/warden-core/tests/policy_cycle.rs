//! ---
//! warden_section: "07-resilience-fault-tolerance"
//! warden_subsection: "tests"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Policy engine cycles against the in-memory store and scripted backends."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use warden_common::config::{FenceConfig, PolicyConfig};
use warden_core::{DecisionMatrix, DispatchOutcome, FenceDispatcher, PolicyEngine, PolicySettings};
use warden_fence::{
    BmcConnector, BmcEndpoint, BmcSession, BmcStep, FenceError, FenceOutcome, ScriptedBmc,
};
use warden_membership::{HealthStatus, MembershipEvent};
use warden_metrics::{new_registry, MonitorMetrics};
use warden_persistence::{
    disable_host, HostStatus, MemoryStore, NewFencer, SharedStore, Store,
};
use warden_remediation::{
    ComputeApi, ComputeService, RecordingCompute, RemediationError, RemediationWorker, Server,
};

struct Harness {
    store: SharedStore,
    bmc: ScriptedBmc,
    compute: Arc<RecordingCompute>,
    metrics: MonitorMetrics,
    engine: PolicyEngine,
}

fn harness(fence: FenceConfig, policy: PolicyConfig, compute: RecordingCompute) -> Harness {
    let compute = Arc::new(compute);
    harness_with(fence, policy, compute.clone(), compute)
}

fn harness_with(
    fence: FenceConfig,
    policy: PolicyConfig,
    api: Arc<dyn ComputeApi>,
    compute: Arc<RecordingCompute>,
) -> Harness {
    let bmc = ScriptedBmc::new();
    let connector = Arc::new(bmc.clone());
    build(fence, policy, api, compute, bmc, connector)
}

fn build(
    fence: FenceConfig,
    policy: PolicyConfig,
    api: Arc<dyn ComputeApi>,
    compute: Arc<RecordingCompute>,
    bmc: ScriptedBmc,
    connector: Arc<dyn BmcConnector>,
) -> Harness {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let metrics = MonitorMetrics::new(new_registry()).unwrap();
    let dispatcher = Arc::new(FenceDispatcher::new(
        store.clone(),
        connector,
        RemediationWorker::openstack(api, "fenced by warden"),
        fence,
        metrics.clone(),
    ));
    let engine = PolicyEngine::new(
        store.clone(),
        PolicySettings::from_config(&policy),
        DecisionMatrix::from_config(&policy),
        dispatcher,
        metrics.clone(),
    );
    Harness {
        store,
        bmc,
        compute,
        metrics,
        engine,
    }
}

fn compute_for(host: &str, servers: &[&str]) -> RecordingCompute {
    servers.iter().fold(
        RecordingCompute::new().with_service(ComputeService::new("nova-compute", host)),
        |compute, id| compute.with_server(host, Server::new(*id)),
    )
}

fn event(host: &str, tag: &str, status: HealthStatus) -> MembershipEvent {
    MembershipEvent::new(host, tag, status)
}

fn storage_and_network_down(host: &str) -> Vec<MembershipEvent> {
    vec![
        event(host, "storage", HealthStatus::Failed),
        event(host, "network", HealthStatus::Failed),
        event(host, "management", HealthStatus::Active),
    ]
}

async fn add_fencer(harness: &Harness, host: &str, address: &str) {
    let host = harness.store.host_by_name(host).await.unwrap().unwrap();
    harness
        .store
        .insert_fencer(NewFencer::ipmi(host.id, address, "admin", "secret"))
        .await
        .unwrap();
}

async fn counters(store: &dyn Store, host: &str) -> Vec<(String, u32)> {
    let host = store.host_by_name(host).await.unwrap().unwrap();
    store
        .host_states(host.id)
        .await
        .unwrap()
        .into_iter()
        .map(|state| (state.tag, state.failed_times))
        .collect()
}

async fn status(store: &dyn Store, host: &str) -> HostStatus {
    store.host_by_name(host).await.unwrap().unwrap().status
}

/// Drive `host` to `Failed` with storage and network down; returns the time of the last cycle.
async fn fail_host(harness: &Harness, host: &str, start: DateTime<Utc>) -> DateTime<Utc> {
    let mut now = start;
    for cycle in 0..7 {
        now = start + ChronoDuration::seconds(cycle * 10);
        harness
            .engine
            .handle_events(storage_and_network_down(host), now)
            .await
            .unwrap();
    }
    now
}

#[tokio::test]
async fn failing_host_is_fenced_and_evacuated() {
    let harness = harness(
        FenceConfig::default(),
        PolicyConfig::default(),
        compute_for("h1", &["vm-1", "vm-2"]),
    );
    let start = Utc::now();
    let mut path = Vec::new();
    let mut last = None;
    for cycle in 0..7 {
        let now = start + ChronoDuration::seconds(cycle * 10);
        let report = harness
            .engine
            .handle_events(storage_and_network_down("h1"), now)
            .await
            .unwrap();
        if cycle == 0 {
            add_fencer(&harness, "h1", "10.0.0.1").await;
        }
        path.push(status(harness.store.as_ref(), "h1").await);
        last = Some(report);
    }

    assert_eq!(
        counters(harness.store.as_ref(), "h1").await,
        vec![
            ("storage".to_owned(), 7),
            ("network".to_owned(), 7),
            ("management".to_owned(), 0),
        ]
    );
    assert!(path[..6].iter().all(|status| *status == HostStatus::Checking));
    assert_eq!(path[6], HostStatus::Fenced);

    let host = harness.store.host_by_name("h1").await.unwrap().unwrap();
    assert!(host.disabled);
    assert_eq!(harness.bmc.powered_off(), vec!["10.0.0.1".to_owned()]);
    assert_eq!(harness.compute.evacuated(), vec!["vm-1".to_owned(), "vm-2".to_owned()]);

    let report = last.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    match &report.outcomes[0] {
        (name, DispatchOutcome::Fenced { fence, evacuation }) => {
            assert_eq!(name, "h1");
            assert!(matches!(fence, FenceOutcome::Fenced { index: 0, .. }));
            assert_eq!(evacuation.servers_evacuated, 2);
            assert!(evacuation.is_clean());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.metrics.transitions("checking"), 1);
    assert_eq!(harness.metrics.transitions("failed"), 1);
    assert_eq!(harness.metrics.transitions("fenced"), 1);
    assert_eq!(harness.metrics.fence_attempts("fenced"), 1);
    assert_eq!(harness.metrics.cycles(), 7);
}

#[tokio::test]
async fn counters_track_a_floored_model() {
    let fence = FenceConfig {
        disable_fence_ops: true,
        ..FenceConfig::default()
    };
    let harness = harness(fence, PolicyConfig::default(), RecordingCompute::new());
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let tags = ["management", "storage", "network"];
    let mut model = [0u32; 3];
    let start = Utc::now();
    for cycle in 0..200 {
        let mut events = Vec::new();
        for (index, tag) in tags.iter().enumerate() {
            if rng.gen_bool(0.2) {
                continue;
            }
            let failed = rng.gen_bool(0.45);
            model[index] = if failed {
                model[index] + 1
            } else {
                model[index].saturating_sub(1)
            };
            let status = if failed {
                HealthStatus::Failed
            } else {
                HealthStatus::Active
            };
            events.push(event("h1", tag, status));
        }
        let now = start + ChronoDuration::seconds(cycle * 6);
        harness.engine.handle_events(events, now).await.unwrap();
    }

    let observed = counters(harness.store.as_ref(), "h1").await;
    for (index, tag) in tags.iter().enumerate() {
        let value = observed
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, value)| *value)
            .unwrap_or(0);
        assert_eq!(value, model[index], "counter for {tag}");
    }
    assert!(harness.bmc.calls().is_empty());
}

#[tokio::test]
async fn last_report_for_a_tag_wins_within_a_cycle() {
    let harness = harness(FenceConfig::default(), PolicyConfig::default(), RecordingCompute::new());
    let events = vec![
        event("h1", "network", HealthStatus::Failed),
        event("h1", "network", HealthStatus::Active),
    ];
    let report = harness.engine.handle_events(events, Utc::now()).await.unwrap();
    assert_eq!(report.hosts, 1);
    assert_eq!(
        counters(harness.store.as_ref(), "h1").await,
        vec![("network".to_owned(), 0)]
    );
    assert_eq!(status(harness.store.as_ref(), "h1").await, HostStatus::Initial);
}

#[tokio::test]
async fn healthy_settled_host_is_left_alone() {
    let harness = harness(FenceConfig::default(), PolicyConfig::default(), RecordingCompute::new());
    let start = Utc::now();
    let healthy = || {
        vec![
            event("h1", "management", HealthStatus::Active),
            event("h1", "storage", HealthStatus::Active),
        ]
    };
    harness.engine.handle_events(healthy(), start).await.unwrap();
    harness
        .engine
        .handle_events(healthy(), start + ChronoDuration::seconds(60))
        .await
        .unwrap();
    let settled = harness.store.host_by_name("h1").await.unwrap().unwrap();
    assert_eq!(settled.status, HostStatus::Active);

    for offset in [70, 80, 600] {
        harness
            .engine
            .handle_events(healthy(), start + ChronoDuration::seconds(offset))
            .await
            .unwrap();
    }
    let after = harness.store.host_by_name("h1").await.unwrap().unwrap();
    assert_eq!(after, settled);
    assert_eq!(harness.metrics.transitions("active"), 1);
}

#[tokio::test]
async fn disabled_fence_ops_leave_host_failed() {
    let fence = FenceConfig {
        disable_fence_ops: true,
        ..FenceConfig::default()
    };
    let harness = harness(fence, PolicyConfig::default(), compute_for("h1", &["vm-1"]));
    let now = fail_host(&harness, "h1", Utc::now()).await;

    let report = harness
        .engine
        .handle_events(storage_and_network_down("h1"), now + ChronoDuration::seconds(10))
        .await
        .unwrap();
    assert_eq!(report.outcomes, vec![("h1".to_owned(), DispatchOutcome::Suppressed)]);
    let host = harness.store.host_by_name("h1").await.unwrap().unwrap();
    assert_eq!(host.status, HostStatus::Failed);
    assert!(!host.disabled);
    assert!(harness.bmc.calls().is_empty());
    assert!(harness.compute.calls().is_empty());
    assert_eq!(harness.metrics.fence_attempts("suppressed"), 2);
}

#[tokio::test]
async fn failed_fencing_reverts_and_retries() {
    let harness = harness(FenceConfig::default(), PolicyConfig::default(), compute_for("h1", &["vm-1"]));
    let start = Utc::now();
    harness
        .engine
        .handle_events(storage_and_network_down("h1"), start)
        .await
        .unwrap();
    for address in ["10.0.0.1", "10.0.0.2"] {
        add_fencer(&harness, "h1", address).await;
        harness.bmc.fail(address, BmcStep::PowerOff);
    }
    let now = fail_host(&harness, "h1", start + ChronoDuration::seconds(10)).await;

    assert_eq!(status(harness.store.as_ref(), "h1").await, HostStatus::Failed);
    assert!(harness.compute.calls().is_empty());
    let attempts = harness.metrics.fence_attempts("failed");
    assert!(attempts >= 1);

    let report = harness
        .engine
        .handle_events(storage_and_network_down("h1"), now + ChronoDuration::seconds(10))
        .await
        .unwrap();
    assert_eq!(
        report.outcomes,
        vec![(
            "h1".to_owned(),
            DispatchOutcome::Reverted(FenceOutcome::Failed { attempts: 2 })
        )]
    );
    assert_eq!(harness.metrics.fence_attempts("failed"), attempts + 1);
    assert!(!harness.store.host_by_name("h1").await.unwrap().unwrap().disabled);
}

#[tokio::test]
async fn evacuation_can_follow_failed_fencing() {
    let fence = FenceConfig {
        evacuate_on_fence_failure: true,
        ..FenceConfig::default()
    };
    let harness = harness(fence, PolicyConfig::default(), compute_for("h1", &["vm-1"]));
    fail_host(&harness, "h1", Utc::now()).await;

    let host = harness.store.host_by_name("h1").await.unwrap().unwrap();
    assert_eq!(host.status, HostStatus::Fenced);
    assert!(host.disabled);
    assert_eq!(harness.metrics.fence_attempts("no_fencers"), 1);
    assert_eq!(harness.compute.evacuated(), vec!["vm-1".to_owned()]);
}

/// Management fails throughout; network fails twice, enough to reach `Failed` but
/// never reaching the threshold.
async fn run_management_outage(harness: &Harness, start: DateTime<Utc>) -> Vec<(String, DispatchOutcome)> {
    let mut outcomes = Vec::new();
    for cycle in 0..7 {
        let mut events = vec![event("h1", "management", HealthStatus::Failed)];
        if cycle < 2 {
            events.push(event("h1", "network", HealthStatus::Failed));
        }
        let report = harness
            .engine
            .handle_events(events, start + ChronoDuration::seconds(cycle * 10))
            .await
            .unwrap();
        if cycle == 0 {
            add_fencer(harness, "h1", "10.0.0.1").await;
        }
        outcomes.extend(report.outcomes);
    }
    outcomes
}

#[tokio::test]
async fn management_only_failure_respects_configuration() {
    let start = Utc::now();

    let standard = harness(FenceConfig::default(), PolicyConfig::default(), RecordingCompute::new());
    let outcomes = run_management_outage(&standard, start).await;
    assert!(outcomes.is_empty());
    assert_eq!(status(standard.store.as_ref(), "h1").await, HostStatus::Failed);
    assert!(standard.bmc.powered_off().is_empty());

    let policy = PolicyConfig {
        fence_on_management_only: true,
        ..PolicyConfig::default()
    };
    let variant = harness(FenceConfig::default(), policy, RecordingCompute::new());
    assert_eq!(variant.engine.matrix(), DecisionMatrix::FENCE_ON_MANAGEMENT_ONLY);
    let outcomes = run_management_outage(&variant, start).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(status(variant.store.as_ref(), "h1").await, HostStatus::Fenced);
    assert_eq!(variant.bmc.powered_off(), vec!["10.0.0.1".to_owned()]);
}

#[tokio::test]
async fn disabled_host_is_frozen() {
    let harness = harness(FenceConfig::default(), PolicyConfig::default(), RecordingCompute::new());
    let start = Utc::now();
    harness
        .engine
        .handle_events(vec![event("h1", "network", HealthStatus::Failed)], start)
        .await
        .unwrap();
    disable_host(harness.store.as_ref(), "h1").await.unwrap();
    let frozen = harness.store.host_by_name("h1").await.unwrap().unwrap();

    for cycle in 1..20 {
        harness
            .engine
            .handle_events(
                storage_and_network_down("h1"),
                start + ChronoDuration::seconds(cycle * 10),
            )
            .await
            .unwrap();
    }
    assert_eq!(harness.store.host_by_name("h1").await.unwrap().unwrap(), frozen);
    assert_eq!(
        counters(harness.store.as_ref(), "h1").await,
        vec![
            ("network".to_owned(), 1),
            ("storage".to_owned(), 0),
            ("management".to_owned(), 0),
        ]
    );
    assert!(harness.bmc.calls().is_empty());
}

#[tokio::test]
async fn hosts_fail_independently_in_one_cycle() {
    let compute = RecordingCompute::new()
        .with_service(ComputeService::new("nova-compute", "h1"))
        .with_service(ComputeService::new("nova-compute", "h2"))
        .with_server("h1", Server::new("vm-a"))
        .with_server("h2", Server::new("vm-b"));
    let harness = harness(FenceConfig::default(), PolicyConfig::default(), compute);
    let start = Utc::now();
    for cycle in 0..7 {
        let mut events = storage_and_network_down("h1");
        events.extend(storage_and_network_down("h2"));
        events.push(event("h3", "network", HealthStatus::Active));
        let report = harness
            .engine
            .handle_events(events, start + ChronoDuration::seconds(cycle * 10))
            .await
            .unwrap();
        assert_eq!(report.hosts, 3);
        if cycle == 0 {
            add_fencer(&harness, "h1", "10.0.0.1").await;
            add_fencer(&harness, "h2", "10.0.0.2").await;
        }
        if cycle == 6 {
            assert_eq!(report.outcomes.len(), 2);
        }
    }
    let mut evacuated = harness.compute.evacuated();
    evacuated.sort();
    assert_eq!(evacuated, vec!["vm-a".to_owned(), "vm-b".to_owned()]);
    let mut powered_off = harness.bmc.powered_off();
    powered_off.sort();
    assert_eq!(powered_off, vec!["10.0.0.1".to_owned(), "10.0.0.2".to_owned()]);
    assert_eq!(status(harness.store.as_ref(), "h3").await, HostStatus::Active);
}

/// Compute API that panics while listing servers of one host.
#[derive(Debug)]
struct PanickingCompute {
    inner: Arc<RecordingCompute>,
    poisoned: &'static str,
}

#[async_trait]
impl ComputeApi for PanickingCompute {
    async fn list_services(&self) -> Result<Vec<ComputeService>, RemediationError> {
        self.inner.list_services().await
    }

    async fn force_down_service(&self, service: &ComputeService) -> Result<(), RemediationError> {
        self.inner.force_down_service(service).await
    }

    async fn disable_service(
        &self,
        service: &ComputeService,
        reason: &str,
    ) -> Result<(), RemediationError> {
        self.inner.disable_service(service, reason).await
    }

    async fn list_servers(&self, host: &str) -> Result<Vec<Server>, RemediationError> {
        if host == self.poisoned {
            panic!("compute client bug for {host}");
        }
        self.inner.list_servers(host).await
    }

    async fn evacuate(&self, server_id: &str) -> Result<(), RemediationError> {
        self.inner.evacuate(server_id).await
    }
}

#[tokio::test]
async fn panicking_dispatch_does_not_stop_the_cycle() {
    let recording = Arc::new(
        RecordingCompute::new()
            .with_server("h1", Server::new("vm-a"))
            .with_server("h2", Server::new("vm-b")),
    );
    let api = Arc::new(PanickingCompute {
        inner: recording.clone(),
        poisoned: "h1",
    });
    let harness = harness_with(FenceConfig::default(), PolicyConfig::default(), api, recording);
    let start = Utc::now();
    let mut last = None;
    for cycle in 0..7 {
        let mut events = storage_and_network_down("h1");
        events.extend(storage_and_network_down("h2"));
        last = Some(
            harness
                .engine
                .handle_events(events, start + ChronoDuration::seconds(cycle * 10))
                .await
                .unwrap(),
        );
        if cycle == 0 {
            add_fencer(&harness, "h1", "10.0.0.1").await;
            add_fencer(&harness, "h2", "10.0.0.2").await;
        }
    }
    let report = last.unwrap();
    assert_eq!(report.panicked, 1);
    // The host was persisted as fenced before the evacuation blew up.
    assert_eq!(status(harness.store.as_ref(), "h1").await, HostStatus::Fenced);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].0, "h2");
    assert_eq!(harness.compute.evacuated(), vec!["vm-b".to_owned()]);
}

/// BMC connector that panics on `open` until disarmed.
#[derive(Debug)]
struct PanickingBmc {
    inner: ScriptedBmc,
    armed: AtomicBool,
}

#[async_trait]
impl BmcConnector for PanickingBmc {
    async fn open(&self, endpoint: &BmcEndpoint) -> Result<Box<dyn BmcSession>, FenceError> {
        if self.armed.load(Ordering::SeqCst) {
            panic!("ipmi driver bug for {endpoint}");
        }
        self.inner.open(endpoint).await
    }
}

#[tokio::test]
async fn panicking_fencer_leaves_host_failed_for_retry() {
    let compute = Arc::new(compute_for("h1", &["vm-1"]));
    let bmc = ScriptedBmc::new();
    let connector = Arc::new(PanickingBmc {
        inner: bmc.clone(),
        armed: AtomicBool::new(true),
    });
    let harness = build(
        FenceConfig::default(),
        PolicyConfig::default(),
        compute.clone(),
        compute,
        bmc,
        connector.clone(),
    );
    let start = Utc::now();
    harness
        .engine
        .handle_events(storage_and_network_down("h1"), start)
        .await
        .unwrap();
    add_fencer(&harness, "h1", "10.0.0.1").await;
    let mut report = None;
    for cycle in 1..7 {
        report = Some(
            harness
                .engine
                .handle_events(
                    storage_and_network_down("h1"),
                    start + ChronoDuration::seconds(cycle * 10),
                )
                .await
                .unwrap(),
        );
    }
    assert_eq!(report.unwrap().panicked, 1);
    let host = harness.store.host_by_name("h1").await.unwrap().unwrap();
    assert_eq!(host.status, HostStatus::Failed);
    assert!(!host.disabled);
    assert!(harness.compute.calls().is_empty());

    connector.armed.store(false, Ordering::SeqCst);
    let report = harness
        .engine
        .handle_events(storage_and_network_down("h1"), start + ChronoDuration::seconds(70))
        .await
        .unwrap();
    assert_eq!(report.panicked, 0);
    assert!(matches!(
        report.outcomes.as_slice(),
        [(name, DispatchOutcome::Fenced { .. })] if name == "h1"
    ));
    assert_eq!(status(harness.store.as_ref(), "h1").await, HostStatus::Fenced);
    assert_eq!(harness.bmc.powered_off(), vec!["10.0.0.1".to_owned()]);
}
