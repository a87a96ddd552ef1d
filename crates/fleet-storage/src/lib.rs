//! Persistence layer for the fleet control plane.
//!
//! Defines the [`Store`] trait — the single source of truth for hosts,
//! leases, and events — and two implementations: [`PostgresStore`] (feature
//! `postgres-backend`, the production default) and [`MemoryStore`] (always
//! available, used by tests and local/dev runs).
//!
//! Every lease state transition and its triggering event are written
//! together, atomically, through [`Store::transition_lease`]. There is no
//! other way to change a lease's state — this is what makes restart
//! recovery and cross-loop coordination safe.

mod error;
mod memory;
mod model;
#[cfg(feature = "postgres-backend")]
mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::{
    Capacity, Event, EventFilter, Host, Lease, LeaseFilter, LeaseState, LeaseTransitionFields,
    NewEvent, NewHost, NewLease, Platform, TransitionOutcome,
};
#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A pluggable, transactional store for the control plane's three relations.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`)
/// and must serialize conflicting writes: two callers racing to CAS the same
/// lease must see exactly one `Applied` and one `Conflict`.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Create a host row. Used only by operator provisioning — the HTTP API
    /// never creates hosts except when `ALLOW_UNKNOWN_HOST_REGISTRATION` is
    /// set.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] if `host_id` already exists.
    async fn create_host(&self, new: NewHost) -> Result<Host, StoreError>;

    /// Look up a host by id.
    async fn get_host(&self, host_id: &str) -> Result<Option<Host>, StoreError>;

    /// List every host. Order is not guaranteed across backends.
    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;

    /// Swap a host's bootstrap credential for a session credential and
    /// record its declared platform/capacity. Called once per successful
    /// `Register` call.
    ///
    /// # Errors
    /// [`StoreError::HostNotFound`] if the host row does not exist.
    async fn register_host(
        &self,
        host_id: &str,
        session_token_hash: String,
        session_expires_at: DateTime<Utc>,
        platform: Platform,
        capacity: Capacity,
    ) -> Result<Host, StoreError>;

    /// Absorb a heartbeat: update capacity and `last_seen`.
    ///
    /// # Errors
    /// [`StoreError::HostNotFound`] if the host row does not exist.
    async fn heartbeat_host(
        &self,
        host_id: &str,
        capacity: Capacity,
        last_seen: DateTime<Utc>,
    ) -> Result<Host, StoreError>;

    /// Operator enable/disable. Does not touch existing leases.
    ///
    /// # Errors
    /// [`StoreError::HostNotFound`] if the host row does not exist.
    async fn set_host_enabled(&self, host_id: &str, enabled: bool) -> Result<Host, StoreError>;

    /// Create a lease in `REQUESTED` state and its `lease.requested` event,
    /// atomically.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] if `vm_id` or `controller_node_name` is
    /// already in use by a non-terminal lease.
    async fn create_lease(&self, new: NewLease, event: NewEvent) -> Result<Lease, StoreError>;

    /// Look up a lease by id.
    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<Lease>, StoreError>;

    /// List leases matching an optional label/state/host filter, for the
    /// operator API.
    async fn list_leases(&self, filter: LeaseFilter) -> Result<Vec<Lease>, StoreError>;

    /// All leases not yet `TERMINATED` or `FAILED` — the restart-recovery
    /// work list and the reconciler/GC's input set.
    async fn list_nonterminal_leases(&self) -> Result<Vec<Lease>, StoreError>;

    /// Count leases for `label` in an inflight state
    /// (`PROVISIONING`/`BOOTING`/`CONNECTING`), for `LABEL_MAX_INFLIGHT`.
    async fn count_inflight(&self, label: &str) -> Result<i64, StoreError>;

    /// Count all non-terminal leases, for `GLOBAL_MAX_VMS`.
    async fn count_nonterminal(&self) -> Result<i64, StoreError>;

    /// Compare-and-swap a lease's state. Applies `fields` and writes `event`
    /// in the same transaction if and only if the lease's current state
    /// equals `expected`; otherwise nothing changes and no event is written.
    ///
    /// Passing `expected == new_state` is how callers refresh
    /// `last_heartbeat` (or `last_error`) without changing state — a
    /// self-loop, not a backward transition.
    ///
    /// # Errors
    /// [`StoreError::LeaseNotFound`] if the lease does not exist at all.
    async fn transition_lease(
        &self,
        lease_id: Uuid,
        expected: LeaseState,
        new_state: LeaseState,
        fields: LeaseTransitionFields,
        event: NewEvent,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Append a standalone event not tied to a lease transition (e.g.
    /// `auth.fail`, `orphan_vm_cleanup`, `stale_controller_node_deleted`).
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError>;

    /// List events, most recent first, for the operator API / UI snapshot.
    async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError>;

    /// Cheap liveness check for `/healthz`.
    async fn healthcheck(&self) -> Result<(), StoreError>;
}
