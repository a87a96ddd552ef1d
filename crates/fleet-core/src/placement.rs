//! Placement: picks a host for a new lease under capacity, admission, and
//! label constraints.
//!
//! Maintains a short-lived in-memory reservation counter per host so a burst
//! of placements within one scaler tick doesn't all land on the same host
//! before any heartbeat confirms arrival. The counter decays the moment a
//! heartbeat is observed through [`Placement::observe_heartbeat`] — it is
//! advisory only, never authoritative, per the concurrency model.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fleet_storage::Host;

use crate::error::PlacementError;
use crate::host::HostRegistry;

/// How a label selects the hosts eligible to run it. The distilled spec
/// allows either the platform tuple or an explicit label→hosts map; this
/// implementation uses an explicit map, since the platform tuple alone
/// (os/arch/accelerator) cannot express arbitrary capability labels like
/// `gpu-build` versus `linux-x64`.
pub trait LabelRouter: Send + Sync + 'static {
    /// Whether `host` is eligible to serve `label` at all (independent of
    /// current capacity).
    fn serves(&self, host: &Host, label: &str) -> bool;
}

/// A label router that accepts every host for every label — suitable when
/// the fleet has a single homogeneous pool.
pub struct AcceptAllRouter;

impl LabelRouter for AcceptAllRouter {
    fn serves(&self, _host: &Host, _label: &str) -> bool {
        true
    }
}

/// A label router keyed by an explicit `label -> [host_id]` map, falling
/// back to rejecting labels with no entry.
pub struct MapRouter {
    routes: HashMap<String, Vec<String>>,
}

impl MapRouter {
    #[must_use]
    pub fn new(routes: HashMap<String, Vec<String>>) -> Self {
        Self { routes }
    }
}

impl LabelRouter for MapRouter {
    fn serves(&self, host: &Host, label: &str) -> bool {
        self.routes
            .get(label)
            .is_some_and(|hosts| hosts.iter().any(|h| h == &host.host_id))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Reservation {
    cpu: i32,
    ram_mb: i64,
}

/// Object-safe facade over [`Placement`] so the scaler/reconciler can hold a
/// `Arc<dyn Placer>` instead of being generic over the router type.
pub trait Placer: Send + Sync + 'static {
    fn pick(
        &self,
        hosts: &[Host],
        registry: &HostRegistry,
        label: &str,
        now: DateTime<Utc>,
        cpu_demand: i32,
        ram_demand_mb: i64,
    ) -> Result<String, PlacementError>;

    fn observe_heartbeat(&self, host_id: &str);
}

impl<R: LabelRouter> Placer for Placement<R> {
    fn pick(
        &self,
        hosts: &[Host],
        registry: &HostRegistry,
        label: &str,
        now: DateTime<Utc>,
        cpu_demand: i32,
        ram_demand_mb: i64,
    ) -> Result<String, PlacementError> {
        Placement::pick(self, hosts, registry, label, now, cpu_demand, ram_demand_mb)
    }

    fn observe_heartbeat(&self, host_id: &str) {
        Placement::observe_heartbeat(self, host_id);
    }
}

/// Placement engine: schedulable-host filtering, scoring, and the advisory
/// reservation counter.
pub struct Placement<R: LabelRouter> {
    router: R,
    reservations: Mutex<HashMap<String, Reservation>>,
}

impl<R: LabelRouter> Placement<R> {
    #[must_use]
    pub fn new(router: R) -> Self {
        Self {
            router,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Select a host for `label` demanding `cpu_demand`/`ram_demand_mb`,
    /// from the given candidate host list (already loaded by the caller via
    /// `Store::list_hosts`).
    ///
    /// Scoring prioritises lower `io_pressure`, then most free RAM, then
    /// most free CPU; ties break deterministically by `host_id`.
    ///
    /// # Errors
    /// - [`PlacementError::NoHostsEnabled`] if no enabled host exists at
    ///   all.
    /// - [`PlacementError::LabelNotServed`] if no host declares support for
    ///   `label`.
    /// - [`PlacementError::InsufficientCapacity`] if hosts serve the label
    ///   but none has enough free capacity after reservations.
    pub fn pick(
        &self,
        hosts: &[Host],
        registry: &HostRegistry,
        label: &str,
        now: DateTime<Utc>,
        cpu_demand: i32,
        ram_demand_mb: i64,
    ) -> Result<String, PlacementError> {
        if !hosts.iter().any(|h| h.enabled) {
            return Err(PlacementError::NoHostsEnabled);
        }

        let serving: Vec<&Host> = hosts.iter().filter(|h| self.router.serves(h, label)).collect();
        if serving.is_empty() {
            return Err(PlacementError::LabelNotServed);
        }

        let reservations = self.reservations.lock().unwrap();
        let mut candidates: Vec<&Host> = serving
            .into_iter()
            .filter(|h| registry.is_schedulable(h, now, cpu_demand, ram_demand_mb))
            .filter(|h| {
                let r = reservations.get(&h.host_id).copied().unwrap_or_default();
                h.capacity.cpu_free - r.cpu >= cpu_demand.max(1)
                    && h.capacity.ram_free_mb - r.ram_mb >= ram_demand_mb
            })
            .collect();
        drop(reservations);

        if candidates.is_empty() {
            return Err(PlacementError::InsufficientCapacity);
        }

        candidates.sort_by(|a, b| {
            a.capacity
                .io_pressure
                .partial_cmp(&b.capacity.io_pressure)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.capacity.ram_free_mb.cmp(&a.capacity.ram_free_mb))
                .then_with(|| b.capacity.cpu_free.cmp(&a.capacity.cpu_free))
                .then_with(|| a.host_id.cmp(&b.host_id))
        });

        let chosen = candidates[0];
        self.reserve(&chosen.host_id, cpu_demand, ram_demand_mb);
        Ok(chosen.host_id.clone())
    }

    fn reserve(&self, host_id: &str, cpu: i32, ram_mb: i64) {
        let mut reservations = self.reservations.lock().unwrap();
        let entry = reservations.entry(host_id.to_owned()).or_default();
        entry.cpu += cpu;
        entry.ram_mb += ram_mb;
    }

    /// Clear the advisory reservation for `host_id` once a heartbeat
    /// confirms the host's real free capacity reflects the placements made
    /// against it.
    pub fn observe_heartbeat(&self, host_id: &str) {
        self.reservations.lock().unwrap().remove(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_storage::{Capacity, Platform};

    fn host(id: &str, cpu_free: i32, ram_free_mb: i64, io_pressure: f64) -> Host {
        Host {
            host_id: id.to_owned(),
            enabled: true,
            bootstrap_token_hash: String::new(),
            session_token_hash: None,
            session_expires_at: None,
            capacity: Capacity {
                cpu_total: cpu_free,
                cpu_free,
                ram_total_mb: ram_free_mb,
                ram_free_mb,
                io_pressure,
            },
            last_seen: Some(Utc::now()),
            node_agent_url: format!("http://{id}"),
            platform: Platform {
                os_family: "linux".to_owned(),
                os_flavor: "debian".to_owned(),
                cpu_arch: "x86_64".to_owned(),
                accelerator: "kvm".to_owned(),
                supported_accelerators: vec!["kvm".to_owned()],
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn registry() -> HostRegistry {
        HostRegistry::new(
            std::sync::Arc::new(fleet_storage::MemoryStore::new()),
            false,
            chrono::Duration::seconds(15),
        )
    }

    #[test]
    fn picks_lowest_io_pressure_first() {
        let placement = Placement::new(AcceptAllRouter);
        let reg = registry();
        let hosts = vec![host("b", 4, 4096, 0.5), host("a", 4, 4096, 0.1)];
        let picked = placement
            .pick(&hosts, &reg, "any", Utc::now(), 1, 1024)
            .unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn ties_broken_by_host_id() {
        let placement = Placement::new(AcceptAllRouter);
        let reg = registry();
        let hosts = vec![host("z", 4, 4096, 0.1), host("a", 4, 4096, 0.1)];
        let picked = placement
            .pick(&hosts, &reg, "any", Utc::now(), 1, 1024)
            .unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn no_hosts_enabled_is_reported_distinctly() {
        let placement = Placement::new(AcceptAllRouter);
        let reg = registry();
        let mut h = host("a", 4, 4096, 0.1);
        h.enabled = false;
        let err = placement
            .pick(&[h], &reg, "any", Utc::now(), 1, 1024)
            .unwrap_err();
        assert_eq!(err, PlacementError::NoHostsEnabled);
    }

    #[test]
    fn label_not_served_is_reported_distinctly() {
        let placement = Placement::new(MapRouter::new(HashMap::new()));
        let reg = registry();
        let err = placement
            .pick(&[host("a", 4, 4096, 0.1)], &reg, "gpu", Utc::now(), 1, 1024)
            .unwrap_err();
        assert_eq!(err, PlacementError::LabelNotServed);
    }

    #[test]
    fn reservation_prevents_double_booking_before_heartbeat() {
        let placement = Placement::new(AcceptAllRouter);
        let reg = registry();
        let hosts = vec![host("a", 2, 2048, 0.0)];
        // First pick reserves all of a's capacity.
        placement.pick(&hosts, &reg, "any", Utc::now(), 2, 2048).unwrap();
        let err = placement
            .pick(&hosts, &reg, "any", Utc::now(), 2, 2048)
            .unwrap_err();
        assert_eq!(err, PlacementError::InsufficientCapacity);

        placement.observe_heartbeat("a");
        placement
            .pick(&hosts, &reg, "any", Utc::now(), 2, 2048)
            .unwrap();
    }
}
