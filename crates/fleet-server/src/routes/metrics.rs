//! Prometheus metrics endpoint: `/metrics`
//!
//! No authentication required — designed for Prometheus scraping. Gauges
//! are computed live from the store's current rows; the counters are
//! derived from the event log, since nothing in this control plane keeps a
//! running tally in memory that would be lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use fleet_storage::{EventFilter, LeaseState};
use uuid::Uuid;

use crate::state::AppState;

/// Build the `/metrics` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(prometheus_metrics))
}

const QUEUE_TO_CONNECT_BUCKETS: [f64; 5] = [30.0, 60.0, 120.0, 240.0, 600.0];

/// `GET /metrics` — Prometheus text format.
async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut lines = Vec::with_capacity(64);

    let hosts = state.store.list_hosts().await.unwrap_or_default();
    let now = Utc::now();
    let host_stale_total = hosts
        .iter()
        .filter(|h| !state.host_registry.is_schedulable(h, now, 0, 0) && h.enabled)
        .count();

    gauge(
        &mut lines,
        "fleet_host_stale_total",
        "Enabled hosts whose last heartbeat is too old to be schedulable.",
        host_stale_total as f64,
    );

    let leases = state.store.list_nonterminal_leases().await.unwrap_or_default();

    lines.push("# HELP fleet_leases_by_state Non-terminal leases grouped by state.".to_owned());
    lines.push("# TYPE fleet_leases_by_state gauge".to_owned());
    for state_variant in [
        LeaseState::Requested,
        LeaseState::Provisioning,
        LeaseState::Booting,
        LeaseState::Connecting,
        LeaseState::Running,
        LeaseState::Terminating,
    ] {
        let count = leases.iter().filter(|l| l.state == state_variant).count();
        lines.push(format!(
            "fleet_leases_by_state{{state=\"{}\"}} {count}",
            state_variant.as_str()
        ));
    }

    let events = state
        .store
        .list_events(EventFilter {
            limit: Some(50_000),
            ..Default::default()
        })
        .await
        .unwrap_or_default();

    let mut orphan_vm_cleanup_total = 0u64;
    let mut retry_exhausted_total = 0u64;
    let mut leases_never_connected_total = 0u64;
    let mut requested_at: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    let mut running_at: HashMap<Uuid, DateTime<Utc>> = HashMap::new();

    for event in &events {
        match event.event_type.as_str() {
            "orphan_vm_cleanup" => orphan_vm_cleanup_total += 1,
            "retry_exhausted_total" => retry_exhausted_total += 1,
            "lease.terminating" => {
                if event.payload.get("reason").and_then(|r| r.as_str())
                    == Some(fleet_core::lease::reason::NEVER_CONNECTED)
                {
                    leases_never_connected_total += 1;
                }
            }
            "lease.requested" => {
                if let Some(id) = event.lease_id {
                    requested_at.entry(id).or_insert(event.timestamp);
                }
            }
            "lease.running" => {
                if let Some(id) = event.lease_id {
                    running_at.entry(id).or_insert(event.timestamp);
                }
            }
            _ => {}
        }
    }

    counter(
        &mut lines,
        "fleet_orphan_vm_cleanup_total",
        "Orphan VMs deleted by the reconciler.",
        orphan_vm_cleanup_total,
    );
    counter(
        &mut lines,
        "fleet_retry_exhausted_total",
        "Terminating leases that exhausted their node-agent delete retry budget.",
        retry_exhausted_total,
    );
    counter(
        &mut lines,
        "fleet_leases_never_connected_total",
        "Leases that blew their connect deadline without reaching RUNNING.",
        leases_never_connected_total,
    );

    let mut bucket_counts = [0u64; QUEUE_TO_CONNECT_BUCKETS.len() + 1];
    let mut sum = 0.0;
    let mut sample_count = 0u64;
    for (id, requested) in &requested_at {
        if let Some(running) = running_at.get(id) {
            let seconds = (*running - *requested).num_milliseconds() as f64 / 1000.0;
            sum += seconds;
            sample_count += 1;
            let bucket_index = QUEUE_TO_CONNECT_BUCKETS
                .iter()
                .position(|b| seconds <= *b)
                .unwrap_or(QUEUE_TO_CONNECT_BUCKETS.len());
            for slot in bucket_counts.iter_mut().skip(bucket_index) {
                *slot += 1;
            }
        }
    }

    lines.push("# HELP fleet_queue_to_connect_seconds Time from lease.requested to lease.running.".to_owned());
    lines.push("# TYPE fleet_queue_to_connect_seconds histogram".to_owned());
    for (bucket, count) in QUEUE_TO_CONNECT_BUCKETS.iter().zip(bucket_counts.iter()) {
        lines.push(format!(
            "fleet_queue_to_connect_seconds_bucket{{le=\"{bucket}\"}} {count}"
        ));
    }
    lines.push(format!(
        "fleet_queue_to_connect_seconds_bucket{{le=\"+Inf\"}} {}",
        bucket_counts[QUEUE_TO_CONNECT_BUCKETS.len()]
    ));
    lines.push(format!("fleet_queue_to_connect_seconds_sum {sum}"));
    lines.push(format!("fleet_queue_to_connect_seconds_count {sample_count}"));

    lines.push("# HELP fleet_info Fleet control plane build information.".to_owned());
    lines.push("# TYPE fleet_info gauge".to_owned());
    lines.push(format!("fleet_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION")));

    let body = lines.join("\n") + "\n";

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn gauge(lines: &mut Vec<String>, name: &str, help: &str, value: f64) {
    lines.push(format!("# HELP {name} {help}"));
    lines.push(format!("# TYPE {name} gauge"));
    lines.push(format!("{name} {value}"));
}

fn counter(lines: &mut Vec<String>, name: &str, help: &str, value: u64) {
    lines.push(format!("# HELP {name} {help}"));
    lines.push(format!("# TYPE {name} counter"));
    lines.push(format!("{name} {value}"));
}
