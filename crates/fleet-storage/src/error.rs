//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to open or migrate the storage backend.
    #[error("failed to open store at '{target}': {reason}")]
    Open { target: String, reason: String },

    /// A read operation failed.
    #[error("read failed: {reason}")]
    Read { reason: String },

    /// A write operation failed.
    #[error("write failed: {reason}")]
    Write { reason: String },

    /// A transaction could not be started, committed, or rolled back.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A row held a value the store could not deserialize (e.g. an unknown
    /// lease state string). This indicates on-disk corruption or a schema
    /// mismatch, not a transient fault.
    #[error("corrupt row in '{table}': {reason}")]
    Corrupt { table: String, reason: String },

    /// The referenced host does not exist.
    #[error("host '{host_id}' not found")]
    HostNotFound { host_id: String },

    /// The referenced lease does not exist.
    #[error("lease '{lease_id}' not found")]
    LeaseNotFound { lease_id: uuid::Uuid },

    /// A uniqueness constraint was violated (duplicate `vm_id` or
    /// `controller_node_name` among non-terminal leases, or a host_id that
    /// already exists).
    #[error("uniqueness violation: {reason}")]
    Conflict { reason: String },
}
