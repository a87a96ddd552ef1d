//! Server configuration for the fleet control plane.
//!
//! Loads configuration from environment variables with sensible defaults,
//! following the env var names and defaults fixed by the control plane's
//! external interface. A malformed value falls back to the default rather
//! than failing startup — only a handful of settings (the storage URL) are
//! load-bearing enough to be worth a hard failure, and that happens later
//! when the backend actually tries to connect.

use std::net::SocketAddr;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend selection.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g. `info`, `debug`, `warn`).
    pub log_level: String,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
    /// Whether to skip spawning the scaler/reconciler/gc background loops —
    /// useful for running the HTTP API alone against a store another
    /// process is already driving (e.g. in tests).
    pub disable_background_loops: bool,
    /// Whether `POST /v1/hosts/{id}/register` may create a host row for an
    /// id it has never seen, rather than requiring operator provisioning
    /// first.
    pub allow_unknown_host_registration: bool,
    pub loop_interval: Duration,
    pub gc_interval: Duration,
    pub scaling: ScalingConfig,
}

/// The subset of scaler/provisioner tuning that is genuinely
/// environment-configured, as opposed to the per-label demand map and
/// label→host routing, which are wired up in `main` from whatever static
/// configuration the deployment supplies.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub labels: Vec<String>,
    pub global_max_vms: i64,
    pub label_max_inflight: i64,
    pub label_burst: i64,
    pub connect_deadline_sec: i64,
    pub disconnected_grace_sec: i64,
    pub vm_ttl_sec: i64,
    pub controller_url: String,
    pub disk_gb: i32,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development and tests only, data lost on restart).
    Memory,
    /// `PostgreSQL` persistent storage.
    Postgres { url: String },
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on, binds to `0.0.0.0` (default: none)
    /// - `FLEET_BIND_ADDR` — full bind address, overrides `PORT` (default: `127.0.0.1:8080`)
    /// - `FLEET_STORAGE` — `memory` or `postgres` (default: `memory`)
    /// - `DATABASE_URL` — connection string when `FLEET_STORAGE=postgres`
    /// - `FLEET_LOG_LEVEL` — log filter (default: `info`)
    /// - `FLEET_DISABLE_MLOCK` — skip `mlockall` for dev environments (default: `false`)
    /// - `DISABLE_BACKGROUND_LOOPS` — run the HTTP API without the control loops (default: `false`)
    /// - `ALLOW_UNKNOWN_HOST_REGISTRATION` — auto-create hosts on first registration (default: `false`)
    /// - `LOOP_INTERVAL_SEC` — scaler/reconciler tick period (default: `5`)
    /// - `GC_INTERVAL_SEC` — garbage collector tick period (default: `5`)
    /// - `FLEET_LABELS` — comma-separated capability labels the scaler polls (default: empty)
    /// - `GLOBAL_MAX_VMS` — fleet-wide inflight+running cap (default: `100`)
    /// - `LABEL_MAX_INFLIGHT` — per-label inflight cap (default: `5`)
    /// - `LABEL_BURST` — per-label per-tick launch cap (default: `3`)
    /// - `CONNECT_DEADLINE_SEC` — seconds a lease has to reach `RUNNING` (default: `240`)
    /// - `DISCONNECTED_GRACE_SEC` — grace period before an unresponsive running node is reclaimed (default: `60`)
    /// - `VM_TTL_SEC` — hard lease lifetime (default: `3600`)
    /// - `FLEET_CONTROLLER_URL` — callback URL handed to booted VMs (default: `http://localhost:8080`)
    /// - `FLEET_DISK_GB` — disk size requested per VM (default: `20`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("FLEET_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8080);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        let storage_backend = match std::env::var("FLEET_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => {
                let url = std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/fleet".to_owned());
                StorageBackendType::Postgres { url }
            }
            _ => StorageBackendType::Memory,
        };

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let disable_mlock = env_bool("FLEET_DISABLE_MLOCK", false);
        let disable_background_loops = env_bool("DISABLE_BACKGROUND_LOOPS", false);
        let allow_unknown_host_registration = env_bool("ALLOW_UNKNOWN_HOST_REGISTRATION", false);

        let loop_interval = Duration::from_secs(env_u64("LOOP_INTERVAL_SEC", 5));
        let gc_interval = Duration::from_secs(env_u64("GC_INTERVAL_SEC", 5));

        let labels = std::env::var("FLEET_LABELS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let scaling = ScalingConfig {
            labels,
            global_max_vms: env_i64("GLOBAL_MAX_VMS", 100),
            label_max_inflight: env_i64("LABEL_MAX_INFLIGHT", 5),
            label_burst: env_i64("LABEL_BURST", 3),
            connect_deadline_sec: env_i64("CONNECT_DEADLINE_SEC", 240),
            disconnected_grace_sec: env_i64("DISCONNECTED_GRACE_SEC", 60),
            vm_ttl_sec: env_i64("VM_TTL_SEC", 3600),
            controller_url: std::env::var("FLEET_CONTROLLER_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_owned()),
            disk_gb: i32::try_from(env_i64("FLEET_DISK_GB", 20)).unwrap_or(20),
        };

        Self {
            bind_addr,
            storage_backend,
            log_level,
            disable_mlock,
            disable_background_loops,
            allow_unknown_host_registration,
            loop_interval,
            gc_interval,
            scaling,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
