//! Read-only operator dashboard: `/ui`
//!
//! A single HTML page with a JSON snapshot embedded at render time. There
//! is no client-side polling or websocket — reloading the page takes a
//! fresh snapshot, same as `curl`ing the JSON endpoints directly.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use fleet_storage::{Capacity, EventFilter};
use serde::Serialize;

use crate::state::AppState;

/// Build the `/ui` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(dashboard))
}

/// A host view with credential hashes stripped — this page has no
/// authentication, so nothing that ever compares against a stored hash
/// belongs in it.
#[derive(Serialize)]
struct HostSummary {
    host_id: String,
    enabled: bool,
    capacity: Capacity,
    last_seen: Option<DateTime<Utc>>,
}

impl From<fleet_storage::Host> for HostSummary {
    fn from(h: fleet_storage::Host) -> Self {
        Self {
            host_id: h.host_id,
            enabled: h.enabled,
            capacity: h.capacity,
            last_seen: h.last_seen,
        }
    }
}

#[derive(Serialize)]
struct Snapshot {
    generated_at: DateTime<Utc>,
    hosts: Vec<HostSummary>,
    leases: Vec<fleet_storage::Lease>,
    recent_events: Vec<fleet_storage::Event>,
    inflight_by_label: Vec<(String, i64)>,
}

/// `GET /ui` — renders an HTML page with the current fleet state embedded
/// as JSON, for a human to read or a browser devtools console to poke at.
async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    let hosts = state.store.list_hosts().await.unwrap_or_default();
    let leases = state.store.list_nonterminal_leases().await.unwrap_or_default();
    let recent_events = state
        .store
        .list_events(EventFilter {
            limit: Some(200),
            ..Default::default()
        })
        .await
        .unwrap_or_default();

    let mut labels: Vec<String> = leases
        .iter()
        .map(|l| l.label.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    labels.sort();

    let mut inflight_by_label = Vec::with_capacity(labels.len());
    for label in labels {
        let count = state
            .store
            .count_inflight(&label)
            .await
            .unwrap_or(0);
        inflight_by_label.push((label, count));
    }

    let snapshot = Snapshot {
        generated_at: Utc::now(),
        hosts: hosts.into_iter().map(HostSummary::from).collect(),
        leases,
        recent_events,
        inflight_by_label,
    };

    let json = serde_json::to_string_pretty(&snapshot)
        .unwrap_or_else(|_| "{}".to_owned());

    Html(render_page(&json))
}

fn render_page(snapshot_json: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>fleet control plane</title>
<style>
body {{ font-family: monospace; background: #0b0d10; color: #d8dee9; margin: 2rem; }}
h1 {{ font-size: 1.1rem; color: #88c0d0; }}
pre {{ background: #161a1e; padding: 1rem; border-radius: 4px; overflow-x: auto; }}
</style>
</head>
<body>
<h1>fleet control plane — snapshot</h1>
<p>Reload this page for a fresh snapshot. No client-side polling.</p>
<pre id="snapshot">{snapshot_json}</pre>
</body>
</html>
"#
    )
}
