//! HTTP route modules.

pub mod hosts;
pub mod leases;
pub mod metrics;
pub mod ui;
