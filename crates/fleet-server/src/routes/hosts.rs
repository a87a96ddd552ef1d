//! Host routes: `/v1/hosts/*`
//!
//! Two audiences share this path prefix: node agents calling `register` and
//! `heartbeat` with a bootstrap or session token (via [`crate::middleware`]),
//! and operators calling `enable`/`disable` with no node-agent credential at
//! all.

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fleet_storage::{Capacity, Platform};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::HostToken;
use crate::state::AppState;

/// Build the `/v1/hosts` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{host_id}/register", post(register))
        .route("/{host_id}/heartbeat", post(heartbeat))
        .route("/{host_id}/enable", post(enable))
        .route("/{host_id}/disable", post(disable))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub platform: Platform,
    pub capacity: Capacity,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub session_token: String,
    pub session_expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub capacity: Capacity,
    /// Consumed by the reconciler via the node-agent client's own
    /// `list_vms` call, not persisted from this body — included so node
    /// agents can report it without the server silently ignoring an
    /// undeclared field.
    #[serde(default)]
    pub active_vm_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct HostResponse {
    pub host_id: String,
    pub enabled: bool,
    pub capacity: Capacity,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<fleet_storage::Host> for HostResponse {
    fn from(h: fleet_storage::Host) -> Self {
        Self {
            host_id: h.host_id,
            enabled: h.enabled,
            capacity: h.capacity,
            last_seen: h.last_seen,
        }
    }
}

/// `POST /v1/hosts/{host_id}/register` — exchange a bootstrap token for a
/// session token.
async fn register(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Extension(token): Extension<HostToken>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let (session_token, session_expires_at) = state
        .host_registry
        .register(&host_id, &token.0, body.platform, body.capacity.clamped())
        .await?;

    Ok(Json(RegisterResponse {
        session_token,
        session_expires_at,
    }))
}

/// `POST /v1/hosts/{host_id}/heartbeat` — refresh capacity and liveness.
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
    Extension(token): Extension<HostToken>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<HostResponse>, AppError> {
    let host = state
        .host_registry
        .heartbeat(&host_id, &token.0, body.capacity.clamped())
        .await?;
    state.placement.observe_heartbeat(&host_id);

    Ok(Json(host.into()))
}

/// `POST /v1/hosts/{host_id}/enable` — operator re-admits a host to placement.
async fn enable(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HostResponse>, AppError> {
    let host = state.host_registry.set_enabled(&host_id, true).await?;
    Ok(Json(host.into()))
}

/// `POST /v1/hosts/{host_id}/disable` — operator excludes a host from
/// placement. Existing leases on the host are left untouched.
async fn disable(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<String>,
) -> Result<Json<HostResponse>, AppError> {
    let host = state.host_registry.set_enabled(&host_id, false).await?;
    Ok(Json(host.into()))
}
