//! Reconciler: a periodic three-way diff between controller-side nodes,
//! node-agent VM inventories, and the lease store, correcting drift.
//!
//! The only component authorised to reclassify `PROVISIONING`/`BOOTING` as
//! `FAILED` from externally observed absence, and to terminate orphan
//! node-agent VMs. Treats node-agent unreachability as **no information**,
//! never as absence — an unreachable host contributes nothing to the diff
//! rather than being assumed empty.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use fleet_storage::{Lease, LeaseState, LeaseTransitionFields, NewEvent, Store};
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{ControllerAdapter, NodeAgentClient};
use crate::lease::reason;
use crate::provisioner::NODE_NAME_PREFIX;

/// Reconciler tuning. `boot_grace` defaults to the same value as
/// `CONNECT_DEADLINE_SEC` unless overridden, since both bound "how long is
/// too long to still be booting."
pub struct ReconcilerConfig {
    pub node_name_prefix: String,
    pub boot_grace: Duration,
    pub disconnected_grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            node_name_prefix: NODE_NAME_PREFIX.to_owned(),
            boot_grace: Duration::seconds(240),
            disconnected_grace: Duration::seconds(60),
        }
    }
}

/// Counters bumped by one reconciler tick, surfaced as the `/metrics`
/// counters of the same names.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileCounts {
    pub stale_controller_nodes_deleted: u32,
    pub orphan_vms_cleaned: u32,
    pub boot_timeouts: u32,
    pub unexpected_disconnects: u32,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    controller: Arc<dyn ControllerAdapter>,
    node_agent: Arc<dyn NodeAgentClient>,
    config: ReconcilerConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        controller: Arc<dyn ControllerAdapter>,
        node_agent: Arc<dyn NodeAgentClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            controller,
            node_agent,
            config,
        }
    }

    /// Run one full three-way diff. Errors reading the store are
    /// propagated; failures talking to external systems are logged and
    /// degrade that rule's coverage for this tick rather than aborting it.
    ///
    /// # Errors
    /// Propagates [`fleet_storage::StoreError`] if the store itself is
    /// unreachable (a transient condition that ends the tick early).
    pub async fn tick(&self) -> Result<ReconcileCounts, fleet_storage::StoreError> {
        let mut counts = ReconcileCounts::default();
        let leases = self.store.list_nonterminal_leases().await?;
        let hosts = self.store.list_hosts().await?;

        let lease_node_names: HashSet<&str> =
            leases.iter().map(|l| l.controller_node_name.as_str()).collect();
        let lease_vm_ids: HashSet<Uuid> = leases.iter().map(|l| l.vm_id).collect();

        // --- c in C with no matching lease: stale controller node.
        let controller_reachable = match self
            .controller
            .list_nodes_with_prefix(&self.config.node_name_prefix)
            .await
        {
            Ok(nodes) => {
                for name in &nodes {
                    if !lease_node_names.contains(name.as_str()) {
                        match self.controller.delete_node(name).await {
                            Ok(()) => {
                                counts.stale_controller_nodes_deleted += 1;
                                self.store
                                    .append_event(NewEvent::new(
                                        "reconcile.stale_controller_node_deleted",
                                        serde_json::json!({"node_name": name}),
                                    ))
                                    .await?;
                                info!(node_name = %name, "deleted stale controller node");
                            }
                            Err(e) => warn!(node_name = %name, error = %e, "failed to delete stale controller node"),
                        }
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "controller adapter unreachable, skipping controller-side diff");
                false
            }
        };

        // --- a in A on host h with no matching lease: orphan VM. Also
        // builds the per-host inventory used by the BOOTING-timeout rule.
        let mut reachable_host_inventory: std::collections::HashMap<String, HashSet<Uuid>> =
            std::collections::HashMap::new();

        for host in &hosts {
            match self.node_agent.list_vms(&host.node_agent_url).await {
                Ok(vms) => {
                    let mut inventory = HashSet::new();
                    for vm in vms {
                        inventory.insert(vm.vm_id);
                        if !lease_vm_ids.contains(&vm.vm_id) {
                            match self
                                .node_agent
                                .delete_vm(&host.node_agent_url, vm.vm_id, "orphan")
                                .await
                            {
                                Ok(()) => {
                                    counts.orphan_vms_cleaned += 1;
                                    self.store
                                        .append_event(NewEvent::new(
                                            "orphan_vm_cleanup",
                                            serde_json::json!({
                                                "host_id": host.host_id,
                                                "vm_id": vm.vm_id,
                                            }),
                                        ))
                                        .await?;
                                    info!(host_id = %host.host_id, vm_id = %vm.vm_id, "cleaned up orphan vm");
                                }
                                Err(e) => warn!(
                                    host_id = %host.host_id, vm_id = %vm.vm_id, error = %e,
                                    "failed to delete orphan vm"
                                ),
                            }
                        }
                    }
                    reachable_host_inventory.insert(host.host_id.clone(), inventory);
                }
                Err(e) => {
                    // No information from this host this tick — it
                    // contributes nothing to either rule below.
                    warn!(host_id = %host.host_id, error = %e, "node agent unreachable, skipping diff for this host");
                }
            }
        }

        let now = Utc::now();
        for lease in &leases {
            self.reconcile_lease(lease, &reachable_host_inventory, controller_reachable, now, &mut counts)
                .await?;
        }

        Ok(counts)
    }

    async fn reconcile_lease(
        &self,
        lease: &Lease,
        reachable_host_inventory: &std::collections::HashMap<String, HashSet<Uuid>>,
        controller_reachable: bool,
        now: chrono::DateTime<Utc>,
        counts: &mut ReconcileCounts,
    ) -> Result<(), fleet_storage::StoreError> {
        match lease.state {
            LeaseState::Booting => {
                if controller_reachable
                    && self
                        .controller
                        .node_state(&lease.controller_node_name)
                        .await
                        .map(|s| s.online)
                        .unwrap_or(false)
                {
                    debug_assert!(crate::lease::can_transition(LeaseState::Booting, LeaseState::Connecting));
                    let outcome = self
                        .store
                        .transition_lease(
                            lease.lease_id,
                            LeaseState::Booting,
                            LeaseState::Connecting,
                            LeaseTransitionFields {
                                last_heartbeat: Some(now),
                                ..Default::default()
                            },
                            NewEvent::new(
                                "lease.connecting",
                                serde_json::json!({"reason": reason::REPORTED_ONLINE}),
                            ),
                        )
                        .await?;
                    if matches!(outcome, fleet_storage::TransitionOutcome::Applied(_)) {
                        info!(lease_id = %lease.lease_id, "lease connecting: controller reports node online");
                    }
                    return Ok(());
                }

                let Some(host_id) = &lease.host_id else {
                    return Ok(());
                };
                let Some(inventory) = reachable_host_inventory.get(host_id) else {
                    return Ok(()); // host unreachable this tick — no information.
                };
                if !inventory.contains(&lease.vm_id) && now > lease.updated_at + self.config.boot_grace {
                    debug_assert!(crate::lease::can_transition(LeaseState::Booting, LeaseState::Failed));
                    let outcome = self
                        .store
                        .transition_lease(
                            lease.lease_id,
                            LeaseState::Booting,
                            LeaseState::Failed,
                            LeaseTransitionFields {
                                last_error: Some("boot timed out: vm never appeared in node-agent inventory".to_owned()),
                                ..Default::default()
                            },
                            NewEvent::new(
                                "lease.failed",
                                serde_json::json!({"reason": reason::BOOT_TIMEOUT}),
                            ),
                        )
                        .await?;
                    if matches!(outcome, fleet_storage::TransitionOutcome::Applied(_)) {
                        counts.boot_timeouts += 1;
                        warn!(lease_id = %lease.lease_id, "lease failed: boot timeout");
                    }
                }
            }
            LeaseState::Connecting => {
                if !controller_reachable {
                    return Ok(());
                }
                let busy = self
                    .controller
                    .node_state(&lease.controller_node_name)
                    .await
                    .map(|s| s.busy)
                    .unwrap_or(false);
                if busy {
                    debug_assert!(crate::lease::can_transition(LeaseState::Connecting, LeaseState::Running));
                    let outcome = self
                        .store
                        .transition_lease(
                            lease.lease_id,
                            LeaseState::Connecting,
                            LeaseState::Running,
                            LeaseTransitionFields {
                                last_heartbeat: Some(now),
                                ..Default::default()
                            },
                            NewEvent::new(
                                "lease.running",
                                serde_json::json!({"reason": reason::JOB_ASSIGNED}),
                            ),
                        )
                        .await?;
                    if matches!(outcome, fleet_storage::TransitionOutcome::Applied(_)) {
                        info!(lease_id = %lease.lease_id, "lease running: job assigned");
                    }
                }
            }
            LeaseState::Running => {
                if !controller_reachable {
                    return Ok(());
                }
                let Some(last_heartbeat) = lease.last_heartbeat else {
                    return Ok(());
                };
                let node_gone = self
                    .controller
                    .node_state(&lease.controller_node_name)
                    .await
                    .map(|s| !s.online)
                    .unwrap_or(false);
                if node_gone && now > last_heartbeat + self.config.disconnected_grace {
                    debug_assert!(crate::lease::can_transition(LeaseState::Running, LeaseState::Terminating));
                    let outcome = self
                        .store
                        .transition_lease(
                            lease.lease_id,
                            LeaseState::Running,
                            LeaseState::Terminating,
                            LeaseTransitionFields::default(),
                            NewEvent::new(
                                "lease.terminating",
                                serde_json::json!({"reason": reason::UNEXPECTED_DISCONNECT}),
                            ),
                        )
                        .await?;
                    if matches!(outcome, fleet_storage::TransitionOutcome::Applied(_)) {
                        counts.unexpected_disconnects += 1;
                        warn!(lease_id = %lease.lease_id, "lease terminating: unexpected disconnect");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
