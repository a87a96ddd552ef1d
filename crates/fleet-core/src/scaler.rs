//! Scaler: computes per-label deficit and launches leases subject to caps
//! and cooldowns.
//!
//! Cooldown state is an advisory in-memory map (lost on restart, which is
//! harmless per the concurrency model) — only the store's lease counts are
//! authoritative for the admission caps themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use fleet_storage::{NewEvent, NewLease, Store};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::ControllerAdapter;
use crate::host::HostRegistry;
use crate::placement::Placer;
use crate::provisioner::{generate_node_name, Provisioner};

/// Per-label demand, in case labels request differently sized VMs.
#[derive(Debug, Clone, Copy)]
pub struct Demand {
    pub cpu: i32,
    pub ram_mb: i64,
}

impl Default for Demand {
    fn default() -> Self {
        Self { cpu: 2, ram_mb: 2048 }
    }
}

/// Static scaler configuration, populated from the deployment's environment.
pub struct ScalerConfig {
    /// Capability labels the scaler polls each tick. The job-controller
    /// adapter has no "list active labels" operation, so the operator
    /// configures the set of labels in play.
    pub labels: Vec<String>,
    pub demand_by_label: HashMap<String, Demand>,
    pub global_max_vms: i64,
    pub label_max_inflight: i64,
    pub label_burst: i64,
    pub connect_deadline: Duration,
    pub vm_ttl: Duration,
    pub cooldown: Duration,
}

impl ScalerConfig {
    fn demand_for(&self, label: &str) -> Demand {
        self.demand_by_label.get(label).copied().unwrap_or_default()
    }
}

/// Drives one scaler tick across every configured label.
pub struct Scaler {
    store: Arc<dyn Store>,
    controller: Arc<dyn ControllerAdapter>,
    registry: Arc<HostRegistry>,
    placement: Arc<dyn Placer>,
    provisioner: Arc<Provisioner>,
    config: ScalerConfig,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Scaler {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        controller: Arc<dyn ControllerAdapter>,
        registry: Arc<HostRegistry>,
        placement: Arc<dyn Placer>,
        provisioner: Arc<Provisioner>,
        config: ScalerConfig,
    ) -> Self {
        Self {
            store,
            controller,
            registry,
            placement,
            provisioner,
            config,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// One full scaler tick: visit every configured label.
    pub async fn tick(&self) {
        for label in self.config.labels.clone() {
            if let Err(e) = self.tick_label(&label).await {
                warn!(label, error = %e, "scaler tick failed for label");
            }
        }
    }

    async fn tick_label(&self, label: &str) -> Result<(), fleet_storage::StoreError> {
        if self.cooldown_active(label) {
            debug!(label, "scaler cooldown active, skipping");
            return Ok(());
        }

        let queued = match self.controller.queued(label).await {
            Ok(n) => n,
            Err(e) => {
                warn!(label, error = %e, "failed to read queue depth, skipping tick");
                return Ok(());
            }
        };

        let inflight = self.store.count_inflight(label).await?;
        let raw_deficit = queued - inflight;
        if raw_deficit <= 0 {
            return Ok(());
        }

        let total_active = self.store.count_nonterminal().await?;
        let hosts = self.store.list_hosts().await?;
        let demand = self.config.demand_for(label);
        let now = Utc::now();
        // How many more VMs of this demand size the currently schedulable
        // hosts could collectively absorb — not just how many hosts qualify,
        // since one host can host several VMs.
        let schedulable_capacity: i64 = hosts
            .iter()
            .filter(|h| self.registry.is_schedulable(h, now, demand.cpu, demand.ram_mb))
            .map(|h| {
                let by_cpu = i64::from(h.capacity.cpu_free / demand.cpu.max(1));
                let by_ram = h.capacity.ram_free_mb / demand.ram_mb.max(1);
                by_cpu.min(by_ram)
            })
            .sum();

        let launchable = raw_deficit
            .min(self.config.label_burst)
            .min(self.config.label_max_inflight - inflight)
            .min(self.config.global_max_vms - total_active)
            .min(schedulable_capacity);

        if launchable <= 0 {
            return Ok(());
        }

        let mut launched = 0;
        for _ in 0..launchable {
            let host_id = match self.placement.pick(
                &hosts,
                &self.registry,
                label,
                now,
                demand.cpu,
                demand.ram_mb,
            ) {
                Ok(h) => h,
                Err(_) => break,
            };
            let Some(host) = hosts.iter().find(|h| h.host_id == host_id) else {
                break;
            };

            let lease = match self.make_lease(label, demand).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(label, error = %e, "failed to create lease, stopping tick");
                    break;
                }
            };

            if let Err(e) = self
                .provisioner
                .provision(&lease, &host_id, &host.node_agent_url)
                .await
            {
                warn!(lease_id = %lease.lease_id, error = %e, "provision call failed, will retry next tick");
                break;
            }
            launched += 1;
        }

        if launched > 0 {
            info!(label, launched, "scaler launched leases");
            self.set_cooldown(label);
        }

        Ok(())
    }

    async fn make_lease(
        &self,
        label: &str,
        demand: Demand,
    ) -> Result<fleet_storage::Lease, fleet_storage::StoreError> {
        let now = Utc::now();
        self.store
            .create_lease(
                NewLease {
                    lease_id: Uuid::new_v4(),
                    vm_id: Uuid::new_v4(),
                    label: label.to_owned(),
                    controller_node_name: generate_node_name(label),
                    cpu_demand: demand.cpu,
                    ram_demand_mb: demand.ram_mb,
                    connect_deadline: now + self.config.connect_deadline,
                    ttl_deadline: now + self.config.vm_ttl,
                },
                NewEvent::new("lease.requested", serde_json::json!({"label": label})),
            )
            .await
    }

    fn cooldown_active(&self, label: &str) -> bool {
        self.cooldowns
            .lock()
            .unwrap()
            .get(label)
            .is_some_and(|until| Utc::now() < *until)
    }

    fn set_cooldown(&self, label: &str) {
        self.cooldowns
            .lock()
            .unwrap()
            .insert(label.to_owned(), Utc::now() + self.config.cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeControllerAdapter, FakeNodeAgentClient};
    use crate::placement::{AcceptAllRouter, Placement};
    use crate::provisioner::ProvisionerConfig;
    use fleet_storage::{Capacity, MemoryStore, NewHost, Platform};

    fn platform() -> Platform {
        Platform {
            os_family: "linux".to_owned(),
            os_flavor: "debian".to_owned(),
            cpu_arch: "x86_64".to_owned(),
            accelerator: "kvm".to_owned(),
            supported_accelerators: vec!["kvm".to_owned()],
        }
    }

    async fn setup(global_max: i64, label_max_inflight: i64, burst: i64) -> (Scaler, Arc<dyn Store>, Arc<FakeControllerAdapter>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let host = store
            .create_host(NewHost {
                host_id: "h1".to_owned(),
                bootstrap_token_hash: "x".to_owned(),
                node_agent_url: "http://h1:9000".to_owned(),
                platform: platform(),
                capacity: Capacity {
                    cpu_total: 64,
                    cpu_free: 64,
                    ram_total_mb: 131072,
                    ram_free_mb: 131072,
                    io_pressure: 0.0,
                },
            })
            .await
            .unwrap();
        store
            .heartbeat_host(&host.host_id, host.capacity, Utc::now())
            .await
            .unwrap();

        let registry = Arc::new(HostRegistry::new(Arc::clone(&store), false, Duration::seconds(15)));
        let placement: Arc<dyn Placer> = Arc::new(Placement::new(AcceptAllRouter));
        let controller = Arc::new(FakeControllerAdapter::new());
        let node_agent = Arc::new(FakeNodeAgentClient::new());
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&controller) as Arc<dyn ControllerAdapter>,
            node_agent,
            ProvisionerConfig {
                base_image_by_label: HashMap::new(),
                disk_gb: 20,
                controller_url: "https://ci.example.com".to_owned(),
            },
        ));

        let scaler = Scaler::new(
            Arc::clone(&store),
            Arc::clone(&controller) as Arc<dyn ControllerAdapter>,
            registry,
            placement,
            provisioner,
            ScalerConfig {
                labels: vec!["linux-x64".to_owned()],
                demand_by_label: HashMap::new(),
                global_max_vms: global_max,
                label_max_inflight,
                label_burst: burst,
                connect_deadline: Duration::seconds(240),
                vm_ttl: Duration::seconds(3600),
                cooldown: Duration::seconds(30),
            },
        );
        (scaler, store, controller)
    }

    #[tokio::test]
    async fn happy_path_launches_one_lease() {
        let (scaler, store, controller) = setup(10, 5, 3).await;
        controller.set_queued("linux-x64", 1);
        scaler.tick().await;

        let leases = store.list_nonterminal_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].state, fleet_storage::LeaseState::Booting);
    }

    #[tokio::test]
    async fn global_cap_limits_launches() {
        let (scaler, store, controller) = setup(2, 10, 10).await;
        controller.set_queued("linux-x64", 5);
        scaler.tick().await;

        let leases = store.list_nonterminal_leases().await.unwrap();
        assert_eq!(leases.len(), 2);

        // A second tick with the cooldown active launches nothing more.
        scaler.tick().await;
        let leases = store.list_nonterminal_leases().await.unwrap();
        assert_eq!(leases.len(), 2);
    }

    #[tokio::test]
    async fn no_queue_means_no_launch() {
        let (scaler, store, _controller) = setup(10, 5, 3).await;
        scaler.tick().await;
        assert!(store.list_nonterminal_leases().await.unwrap().is_empty());
    }
}
