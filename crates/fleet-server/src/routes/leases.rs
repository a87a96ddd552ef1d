//! Lease routes: `/v1/leases/*`
//!
//! Read-only listing plus the one operator-initiated mutation this control
//! plane exposes: force a lease into `TERMINATING`. Every other transition
//! is owned by the background loops.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fleet_storage::{LeaseFilter, LeaseState, LeaseTransitionFields, NewEvent, TransitionOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/v1/leases` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_leases))
        .route("/{lease_id}/terminate", post(terminate_lease))
}

#[derive(Debug, Deserialize)]
pub struct LeaseQuery {
    pub label: Option<String>,
    pub state: Option<String>,
    pub host_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub lease_id: Uuid,
    pub vm_id: Uuid,
    pub label: String,
    pub controller_node_name: String,
    pub state: &'static str,
    pub host_id: Option<String>,
    pub cpu_demand: i32,
    pub ram_demand_mb: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connect_deadline: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<fleet_storage::Lease> for LeaseResponse {
    fn from(l: fleet_storage::Lease) -> Self {
        Self {
            lease_id: l.lease_id,
            vm_id: l.vm_id,
            label: l.label,
            controller_node_name: l.controller_node_name,
            state: l.state.as_str(),
            host_id: l.host_id,
            cpu_demand: l.cpu_demand,
            ram_demand_mb: l.ram_demand_mb,
            created_at: l.created_at,
            updated_at: l.updated_at,
            connect_deadline: l.connect_deadline,
            ttl_deadline: l.ttl_deadline,
            last_heartbeat: l.last_heartbeat,
            last_error: l.last_error,
        }
    }
}

/// `GET /v1/leases?label=&state=&host_id=`
async fn list_leases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaseQuery>,
) -> Result<Json<Vec<LeaseResponse>>, AppError> {
    let filter_state = query
        .state
        .as_deref()
        .map(LeaseState::parse)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let leases = state
        .store
        .list_leases(LeaseFilter {
            label: query.label,
            state: filter_state,
            host_id: query.host_id,
        })
        .await?;

    Ok(Json(leases.into_iter().map(LeaseResponse::from).collect()))
}

/// `POST /v1/leases/{lease_id}/terminate` — force a non-terminal lease into
/// `TERMINATING`; the garbage collector drives it the rest of the way.
async fn terminate_lease(
    State(state): State<Arc<AppState>>,
    Path(lease_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let lease = state
        .store
        .get_lease(lease_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("lease '{lease_id}' not found")))?;

    if !fleet_core::lease::can_transition(lease.state, LeaseState::Terminating) {
        return Err(AppError::Conflict(format!(
            "lease '{lease_id}' is already {}",
            lease.state
        )));
    }

    debug_assert!(fleet_core::lease::can_transition(lease.state, LeaseState::Terminating));
    let outcome = state
        .store
        .transition_lease(
            lease_id,
            lease.state,
            LeaseState::Terminating,
            LeaseTransitionFields::default(),
            NewEvent::new(
                "lease.terminating",
                serde_json::json!({"reason": fleet_core::lease::reason::OPERATOR_TERMINATE}),
            ),
        )
        .await?;

    match outcome {
        TransitionOutcome::Applied(_) => Ok(StatusCode::ACCEPTED),
        TransitionOutcome::Conflict { actual } => Err(AppError::Conflict(format!(
            "lease '{lease_id}' changed state to {actual} before termination was applied"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lease(state: LeaseState) -> fleet_storage::Lease {
        let now = Utc::now();
        fleet_storage::Lease {
            lease_id: Uuid::new_v4(),
            vm_id: Uuid::new_v4(),
            label: "linux-x64".to_owned(),
            controller_node_name: "fleet-abc123".to_owned(),
            state,
            host_id: Some("build-1".to_owned()),
            cpu_demand: 2,
            ram_demand_mb: 2048,
            created_at: now,
            updated_at: now,
            connect_deadline: now,
            ttl_deadline: now,
            last_heartbeat: None,
            last_error: None,
        }
    }

    #[test]
    fn lease_response_carries_state_as_static_str() {
        let lease = sample_lease(LeaseState::Running);
        let resp: LeaseResponse = lease.into();
        assert_eq!(resp.state, "RUNNING");
    }
}
