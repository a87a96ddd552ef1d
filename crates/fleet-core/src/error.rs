//! Error types for `fleet-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. These are domain errors; HTTP status mapping happens in
//! `fleet-server`.

use fleet_storage::StoreError;

/// Errors from host registry operations.
#[derive(Debug, thiserror::Error)]
pub enum HostRegistryError {
    /// No host exists with that id (and `ALLOW_UNKNOWN_HOST_REGISTRATION` is off).
    #[error("host '{host_id}' not found")]
    UnknownHost { host_id: String },

    /// Bootstrap token did not match the stored hash.
    #[error("bootstrap token rejected for host '{host_id}'")]
    BadBootstrapToken { host_id: String },

    /// Session token absent, unknown, or expired — caller must re-register.
    #[error("session token rejected for host '{host_id}': {reason}")]
    BadSessionToken { host_id: String, reason: String },

    /// A declared capacity value was out of range (e.g. free > total).
    #[error("invalid capacity for host '{host_id}': {reason}")]
    InvalidCapacity { host_id: String, reason: String },

    /// The underlying store returned an error.
    #[error("host registry storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Reasons placement can reject a lease request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// No enabled, schedulable host exists at all.
    #[error("no hosts enabled")]
    NoHostsEnabled,

    /// Hosts exist for the label but none has enough free capacity.
    #[error("insufficient capacity")]
    InsufficientCapacity,

    /// No host declares support for the requested label.
    #[error("label not served by any host")]
    LabelNotServed,
}

/// Errors from the provisioning sequence.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The lease was not in the expected state when the provisioner tried to
    /// claim it — another loop raced us, or it was already handled.
    #[error("lease '{lease_id}' was not in the expected state for provisioning")]
    StaleLease { lease_id: uuid::Uuid },

    /// The controller adapter failed to allocate a node.
    #[error("controller node allocation failed: {reason}")]
    ControllerAllocation { reason: String },

    /// The node agent rejected or failed the VM creation call.
    #[error("node agent launch failed ({error_type}): {reason}")]
    NodeAgentLaunch { error_type: String, reason: String },

    /// The underlying store returned an error.
    #[error("provisioner storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Errors surfaced by the external adapter traits.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The call could not reach the remote system at all (network/timeout).
    #[error("adapter call to '{target}' timed out or was unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    /// The remote system responded with a non-2xx HTTP status.
    #[error("adapter call to '{target}' failed with status {status}: {reason}")]
    Http {
        target: String,
        status: u16,
        reason: String,
    },

    /// The remote system returned a response this client could not parse.
    #[error("adapter call to '{target}' returned an unparseable response: {reason}")]
    BadResponse { target: String, reason: String },
}

impl AdapterError {
    /// A short machine-readable tag for event payloads (`error_type`), e.g.
    /// `"http_503"` or `"timeout"`.
    #[must_use]
    pub fn error_type(&self) -> String {
        match self {
            Self::Unreachable { .. } => "timeout".to_owned(),
            Self::Http { status, .. } => format!("http_{status}"),
            Self::BadResponse { .. } => "bad_response".to_owned(),
        }
    }

    /// Human-readable detail for the event payload's `error_detail` field.
    #[must_use]
    pub fn error_detail(&self) -> String {
        self.to_string()
    }

    /// Whether this failure is worth retrying (transient) as opposed to
    /// permanent (DELETE on an already-gone VM is treated as success by the
    /// caller before this even matters).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            Self::BadResponse { .. } => false,
        }
    }
}
