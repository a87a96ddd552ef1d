//! Fleet control plane HTTP server.
//!
//! Wires together `fleet-core` and `fleet-storage` into a running Axum
//! server: the operator API, the node-agent inbound routes, and the
//! background scaler/reconciler/gc loops that drive lease state forward
//! without any HTTP request in the loop.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;
