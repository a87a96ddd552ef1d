//! Shared application state for the fleet control plane server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`: each field is an already-wired-up component,
//! not raw configuration, so handlers never reach past `state` for a
//! dependency.

use std::sync::Arc;

use fleet_core::adapters::{ControllerAdapter, NodeAgentClient};
use fleet_core::host::HostRegistry;
use fleet_core::placement::Placer;
use fleet_storage::Store;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The persistence layer for hosts, leases, and events.
    pub store: Arc<dyn Store>,
    /// Job-controller adapter, shared with the background loops.
    pub controller: Arc<dyn ControllerAdapter>,
    /// Node-agent client, shared with the background loops.
    pub node_agent: Arc<dyn NodeAgentClient>,
    /// Host bootstrap/session token and schedulability logic.
    pub host_registry: Arc<HostRegistry>,
    /// Host selection for new leases.
    pub placement: Arc<dyn Placer>,
    /// Whether unauthenticated node registration is allowed for unknown
    /// host ids — surfaced here too since the register handler needs it
    /// directly, not just `HostRegistry`.
    pub allow_unknown_host_registration: bool,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
