//! Domain model shared by every `Store` implementation.
//!
//! These types mirror the data model exactly: three relations (hosts,
//! leases, events) plus the platform tuple embedded in a host record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node agent's platform description, used for label→host matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os_family: String,
    pub os_flavor: String,
    pub cpu_arch: String,
    /// Currently selected accelerator, if any (e.g. `"none"`, `"kvm"`).
    pub accelerator: String,
    /// Accelerators this host is capable of offering.
    pub supported_accelerators: Vec<String>,
}

impl Platform {
    /// A host is only schedulable if its selected accelerator is one it
    /// actually supports — a declared-capacity consistency check, not a
    /// scheduling preference.
    #[must_use]
    pub fn accelerator_is_consistent(&self) -> bool {
        self.supported_accelerators
            .iter()
            .any(|a| a == &self.accelerator)
    }
}

/// Declared or measured host capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_total: i32,
    pub cpu_free: i32,
    pub ram_total_mb: i64,
    pub ram_free_mb: i64,
    /// Fraction in `[0, 1]`; callers should clamp before constructing.
    pub io_pressure: f64,
}

impl Capacity {
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.io_pressure = self.io_pressure.clamp(0.0, 1.0);
        self.cpu_free = self.cpu_free.clamp(0, self.cpu_total);
        self.ram_free_mb = self.ram_free_mb.clamp(0, self.ram_total_mb);
        self
    }
}

/// A registered host, identified by an operator-chosen string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub host_id: String,
    pub enabled: bool,
    pub bootstrap_token_hash: String,
    pub session_token_hash: Option<String>,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub capacity: Capacity,
    pub last_seen: Option<DateTime<Utc>>,
    pub node_agent_url: String,
    pub platform: Platform,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a host record (operator provisioning).
#[derive(Debug, Clone)]
pub struct NewHost {
    pub host_id: String,
    pub bootstrap_token_hash: String,
    pub node_agent_url: String,
    pub platform: Platform,
    pub capacity: Capacity,
}

/// The lease lifecycle state. Transitions are defined in `fleet-core::lease`;
/// this type only knows how to name and parse itself.
///
/// `CONNECTED` is intentionally absent — folded into `Connecting`, which
/// covers the window from handshake start through the VM reporting itself
/// ready.
///
/// Serializes to the same uppercase strings as [`LeaseState::as_str`], so a
/// `Lease` embedded wholesale in a JSON response (as the dashboard snapshot
/// does) renders `state` identically to routes that call `as_str()`
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    Requested,
    Provisioning,
    Booting,
    Connecting,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl LeaseState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Provisioning => "PROVISIONING",
            Self::Booting => "BOOTING",
            Self::Connecting => "CONNECTING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        }
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// States counted toward `LABEL_MAX_INFLIGHT` and scaler "inflight".
    #[must_use]
    pub const fn is_inflight(self) -> bool {
        matches!(self, Self::Provisioning | Self::Booting | Self::Connecting)
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "REQUESTED" => Ok(Self::Requested),
            "PROVISIONING" => Ok(Self::Provisioning),
            "BOOTING" => Ok(Self::Booting),
            "CONNECTING" => Ok(Self::Connecting),
            "RUNNING" => Ok(Self::Running),
            "TERMINATING" => Ok(Self::Terminating),
            "TERMINATED" => Ok(Self::Terminated),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown lease state '{other}'")),
        }
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The central entity: one queued job, one VM, one controller node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub vm_id: Uuid,
    pub label: String,
    pub controller_node_name: String,
    pub state: LeaseState,
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

impl Lease {
    #[must_use]
    pub fn is_expired_by_ttl(&self, now: DateTime<Utc>) -> bool {
        now > self.ttl_deadline
    }

    #[must_use]
    pub fn is_past_connect_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.connect_deadline
    }
}

/// Parameters for creating a lease (always starts in `REQUESTED`).
#[derive(Debug, Clone)]
pub struct NewLease {
    pub lease_id: Uuid,
    pub vm_id: Uuid,
    pub label: String,
    pub controller_node_name: String,
    pub cpu_demand: i32,
    pub ram_demand_mb: i64,
    pub connect_deadline: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
}

/// Filter for listing leases via the operator API.
#[derive(Debug, Clone, Default)]
pub struct LeaseFilter {
    pub label: Option<String>,
    pub state: Option<LeaseState>,
    pub host_id: Option<String>,
}

/// Fields that may change alongside a state transition. `None` leaves the
/// existing value untouched.
#[derive(Debug, Clone, Default)]
pub struct LeaseTransitionFields {
    pub host_id: Option<String>,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// An append-only event log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub lease_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Parameters for appending an event (the id and timestamp are assigned by
/// the store).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub lease_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            lease_id: None,
            event_type: event_type.into(),
            payload,
        }
    }

    #[must_use]
    pub fn for_lease(mut self, lease_id: Uuid) -> Self {
        self.lease_id = Some(lease_id);
        self
    }
}

/// Filter for listing events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub lease_id: Option<Uuid>,
    pub since_id: Option<i64>,
    pub limit: Option<i64>,
}

/// Outcome of a compare-and-swap lease transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The lease was in the expected state and is now updated.
    Applied(Lease),
    /// The lease was not in the expected state; no change was made and no
    /// event was written.
    Conflict { actual: LeaseState },
}
