//! Integration tests driving the scaler, provisioner, reconciler, and GC
//! together against `MemoryStore` and the in-memory adapter fakes — the
//! testable-property scenarios enumerated for the control plane.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use fleet_core::adapters::{
    ControllerAdapter, FakeControllerAdapter, FakeNodeAgentClient, NodeAgentClient, NodeState,
};
use fleet_core::gc::{Gc, GcConfig};
use fleet_core::host::HostRegistry;
use fleet_core::placement::{AcceptAllRouter, Placement};
use fleet_core::provisioner::{Provisioner, ProvisionerConfig};
use fleet_core::reconciler::{Reconciler, ReconcilerConfig};
use fleet_core::scaler::{Scaler, ScalerConfig};
use fleet_storage::{Capacity, LeaseState, MemoryStore, NewHost, Platform, Store};
use uuid::Uuid;

fn platform() -> Platform {
    Platform {
        os_family: "linux".to_owned(),
        os_flavor: "debian".to_owned(),
        cpu_arch: "x86_64".to_owned(),
        accelerator: "kvm".to_owned(),
        supported_accelerators: vec!["kvm".to_owned()],
    }
}

struct Fixture {
    store: Arc<dyn Store>,
    controller: Arc<FakeControllerAdapter>,
    node_agent: Arc<FakeNodeAgentClient>,
    scaler: Scaler,
    reconciler: Reconciler,
    gc: Gc,
}

async fn fixture(global_max_vms: i64, cpu_free: i32, ram_free_mb: i64) -> (Fixture, fleet_storage::Host) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let host = store
        .create_host(NewHost {
            host_id: "h1".to_owned(),
            bootstrap_token_hash: "x".to_owned(),
            node_agent_url: "http://h1:9000".to_owned(),
            platform: platform(),
            capacity: Capacity {
                cpu_total: cpu_free,
                cpu_free,
                ram_total_mb: ram_free_mb,
                ram_free_mb,
                io_pressure: 0.0,
            },
        })
        .await
        .unwrap();
    store
        .heartbeat_host(&host.host_id, host.capacity, Utc::now())
        .await
        .unwrap();

    let registry = Arc::new(HostRegistry::new(Arc::clone(&store), false, Duration::seconds(15)));
    let placement = Arc::new(Placement::new(AcceptAllRouter));
    let controller = Arc::new(FakeControllerAdapter::new());
    let node_agent = Arc::new(FakeNodeAgentClient::new());
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&store),
        Arc::clone(&controller) as Arc<dyn ControllerAdapter>,
        Arc::clone(&node_agent) as Arc<dyn fleet_core::adapters::NodeAgentClient>,
        ProvisionerConfig {
            base_image_by_label: HashMap::new(),
            disk_gb: 20,
            controller_url: "https://ci.example.com".to_owned(),
        },
    ));

    let scaler = Scaler::new(
        Arc::clone(&store),
        Arc::clone(&controller) as Arc<dyn ControllerAdapter>,
        Arc::clone(&registry),
        placement,
        provisioner,
        ScalerConfig {
            labels: vec!["linux-x64".to_owned()],
            demand_by_label: HashMap::new(),
            global_max_vms,
            label_max_inflight: 10,
            label_burst: 10,
            connect_deadline: Duration::seconds(240),
            vm_ttl: Duration::seconds(3600),
            cooldown: Duration::seconds(30),
        },
    );

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&controller) as Arc<dyn ControllerAdapter>,
        Arc::clone(&node_agent) as Arc<dyn fleet_core::adapters::NodeAgentClient>,
        ReconcilerConfig::default(),
    );

    let gc = Gc::new(
        Arc::clone(&store),
        Arc::clone(&controller) as Arc<dyn ControllerAdapter>,
        Arc::clone(&node_agent) as Arc<dyn fleet_core::adapters::NodeAgentClient>,
        GcConfig::default(),
    );

    (
        Fixture {
            store,
            controller,
            node_agent,
            scaler,
            reconciler,
            gc,
        },
        host,
    )
}

#[tokio::test]
async fn s1_happy_path_through_running_and_teardown() {
    let (fx, host) = fixture(10, 4, 4096).await;
    fx.controller.set_queued("linux-x64", 1);

    fx.scaler.tick().await;
    let leases = fx.store.list_nonterminal_leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    let lease = leases[0].clone();
    assert_eq!(lease.state, LeaseState::Booting);
    assert_eq!(lease.host_id.as_deref(), Some(host.host_id.as_str()));
    assert!(fx
        .node_agent
        .list_vms(&host.node_agent_url)
        .await
        .unwrap()
        .iter()
        .any(|v| v.vm_id == lease.vm_id));

    // Controller reports the node online: reconciler moves BOOTING -> CONNECTING.
    fx.controller.set_node_state(&lease.controller_node_name, NodeState { online: true, busy: false });
    fx.reconciler.tick().await.unwrap();
    let lease = fx.store.get_lease(lease.lease_id).await.unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Connecting);

    // Controller reports the node busy: reconciler moves CONNECTING -> RUNNING.
    fx.controller.set_node_state(&lease.controller_node_name, NodeState { online: true, busy: true });
    fx.reconciler.tick().await.unwrap();
    let lease = fx.store.get_lease(lease.lease_id).await.unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Running);

    // Controller reports the node offline and gone: reconciler marks terminating
    // after the disconnect grace, then GC drains it to terminated.
    fx.controller.set_node_state(&lease.controller_node_name, NodeState { online: false, busy: false });
    fx.store
        .transition_lease(
            lease.lease_id,
            LeaseState::Running,
            LeaseState::Running,
            fleet_storage::LeaseTransitionFields {
                last_heartbeat: Some(Utc::now() - Duration::seconds(120)),
                ..Default::default()
            },
            fleet_storage::NewEvent::new("lease.heartbeat", serde_json::json!({})),
        )
        .await
        .unwrap();
    fx.reconciler.tick().await.unwrap();
    let lease = fx.store.get_lease(lease.lease_id).await.unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Terminating);

    fx.gc.tick().await.unwrap();
    let lease = fx.store.get_lease(lease.lease_id).await.unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Terminated);
    assert!(!fx
        .node_agent
        .list_vms(&host.node_agent_url)
        .await
        .unwrap()
        .iter()
        .any(|v| v.vm_id == lease.vm_id));
}

#[tokio::test]
async fn s2_connect_deadline_terminates_never_connected() {
    let (fx, _host) = fixture(10, 4, 4096).await;
    fx.controller.set_queued("linux-x64", 1);
    fx.scaler.tick().await;
    let lease = fx.store.list_nonterminal_leases().await.unwrap().remove(0);

    // Force the deadline into the past without waiting for real time.
    fx.store
        .transition_lease(
            lease.lease_id,
            LeaseState::Booting,
            LeaseState::Booting,
            fleet_storage::LeaseTransitionFields::default(),
            fleet_storage::NewEvent::new("lease.heartbeat", serde_json::json!({})),
        )
        .await
        .unwrap();

    let gc = Gc::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.controller) as Arc<dyn ControllerAdapter>,
        Arc::clone(&fx.node_agent) as Arc<dyn fleet_core::adapters::NodeAgentClient>,
        GcConfig::default(),
    );

    // Drive past the deadline by constructing a fresh lease with a
    // deadline already in the past, since ScalerConfig's deadline is fixed
    // relative to "now" above and this test cannot fast-forward the clock.
    let backdated = fx
        .store
        .create_lease(
            fleet_storage::NewLease {
                lease_id: Uuid::new_v4(),
                vm_id: Uuid::new_v4(),
                label: "linux-x64".to_owned(),
                controller_node_name: "ephemeral-backdated".to_owned(),
                cpu_demand: 2,
                ram_demand_mb: 2048,
                connect_deadline: Utc::now() - Duration::seconds(1),
                ttl_deadline: Utc::now() + Duration::seconds(3600),
            },
            fleet_storage::NewEvent::new("lease.requested", serde_json::json!({})),
        )
        .await
        .unwrap();
    fx.store
        .transition_lease(
            backdated.lease_id,
            LeaseState::Requested,
            LeaseState::Booting,
            fleet_storage::LeaseTransitionFields::default(),
            fleet_storage::NewEvent::new("lease.booting", serde_json::json!({})),
        )
        .await
        .unwrap();

    gc.tick().await.unwrap();
    let refreshed = fx.store.get_lease(backdated.lease_id).await.unwrap().unwrap();
    assert_eq!(refreshed.state, LeaseState::Terminating);

    gc.tick().await.unwrap();
    let refreshed = fx.store.get_lease(backdated.lease_id).await.unwrap().unwrap();
    assert_eq!(refreshed.state, LeaseState::Terminated);
    assert_eq!(refreshed.last_error.as_deref(), Some("never_connected"));
}

#[tokio::test]
async fn s3_orphan_vm_is_deleted_by_reconciler() {
    let (fx, host) = fixture(10, 4, 4096).await;
    let orphan = Uuid::new_v4();
    fx.node_agent.seed_vm(&host.node_agent_url, orphan, "RUNNING");

    let counts = fx.reconciler.tick().await.unwrap();
    assert_eq!(counts.orphan_vms_cleaned, 1);
    assert!(fx
        .node_agent
        .list_vms(&host.node_agent_url)
        .await
        .unwrap()
        .is_empty());

    let events = fx.store.list_events(Default::default()).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "orphan_vm_cleanup"));
}

#[tokio::test]
async fn s4_stale_controller_node_is_deleted_by_reconciler() {
    let (fx, _host) = fixture(10, 4, 4096).await;
    fx.controller.seed_node("ephemeral-abc", "linux-x64", NodeState::default());

    let counts = fx.reconciler.tick().await.unwrap();
    assert_eq!(counts.stale_controller_nodes_deleted, 1);
    assert!(fx
        .controller
        .list_nodes_with_prefix("ephemeral-")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn s5_node_agent_launch_failure_reaches_failed_with_no_vm_created() {
    let (fx, host) = fixture(10, 4, 4096).await;
    fx.node_agent.fail_next_create(&host.node_agent_url, 503);
    fx.controller.set_queued("linux-x64", 1);

    fx.scaler.tick().await;
    let leases = fx.store.list_leases(Default::default()).await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].state, LeaseState::Failed);
    assert!(fx.node_agent.list_vms(&host.node_agent_url).await.unwrap().is_empty());

    let events = fx.store.list_events(Default::default()).await.unwrap();
    let failed = events.iter().find(|e| e.event_type == "scale.launch_failed").unwrap();
    assert_eq!(failed.payload["error_type"], "http_503");

    // The controller node created before the node-agent call failed is
    // cleaned up as part of the same failure path.
    assert!(fx
        .controller
        .list_nodes_with_prefix("ephemeral-")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn s6_global_cap_limits_launches_across_ticks() {
    let (fx, _host) = fixture(2, 64, 131072).await;
    fx.controller.set_queued("linux-x64", 5);

    fx.scaler.tick().await;
    let leases = fx.store.list_nonterminal_leases().await.unwrap();
    assert_eq!(leases.len(), 2);

    fx.scaler.tick().await;
    let leases = fx.store.list_nonterminal_leases().await.unwrap();
    assert_eq!(leases.len(), 2, "global cap must not be exceeded across ticks");
}

#[tokio::test]
async fn s7_disabled_host_blocks_new_launches_but_leaves_existing_lease() {
    let (fx, host) = fixture(10, 4, 4096).await;
    fx.controller.set_queued("linux-x64", 1);
    fx.scaler.tick().await;
    let existing = fx.store.list_nonterminal_leases().await.unwrap().remove(0);

    fx.store.set_host_enabled(&host.host_id, false).await.unwrap();
    fx.controller.set_queued("linux-x64", 1);
    fx.scaler.tick().await;

    let leases = fx.store.list_nonterminal_leases().await.unwrap();
    assert_eq!(leases.len(), 1, "no new lease launched against a disabled host");
    assert_eq!(leases[0].lease_id, existing.lease_id, "existing lease is undisturbed");
}
