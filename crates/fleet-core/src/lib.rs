//! Core library for the fleet control plane.
//!
//! Contains the lease state machine, host registry, placement engine,
//! provisioner, and the three control loops (scaler, reconciler, garbage
//! collector) that drive leases through their lifecycle. This crate depends
//! on `fleet-storage` for the persistence trait and knows nothing about a
//! specific job-controller or node-agent wire format beyond the adapter
//! traits it defines.

pub mod adapters;
pub mod error;
pub mod gc;
pub mod host;
pub mod lease;
pub mod placement;
pub mod provisioner;
pub mod reconciler;
pub mod scaler;
