//! Provisioner: drives one lease from `REQUESTED` to `BOOTING` (or
//! `FAILED`).
//!
//! Re-entrant by construction: every step is a CAS against the store, so a
//! crash between steps leaves the lease in a well-defined intermediate
//! state (`PROVISIONING` with no node-agent VM yet, or `PROVISIONING` with a
//! controller node but no VM) that the reconciler knows how to resolve on
//! the next tick.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use fleet_storage::{Lease, LeaseState, LeaseTransitionFields, NewEvent, Store};
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{ControllerAdapter, NodeAgentClient, VmSpec};
use crate::error::ProvisionError;
use crate::lease::reason;

/// Static provisioning parameters that don't vary per lease.
pub struct ProvisionerConfig {
    /// Base image id per label; labels with no entry use the label string
    /// itself as the image id.
    pub base_image_by_label: HashMap<String, String>,
    pub disk_gb: i32,
    /// URL the booted VM should call back into (the job controller).
    pub controller_url: String,
}

impl ProvisionerConfig {
    fn base_image_for(&self, label: &str) -> String {
        self.base_image_by_label
            .get(label)
            .cloned()
            .unwrap_or_else(|| label.to_owned())
    }
}

/// Drives the provisioning sequence for a single lease.
pub struct Provisioner {
    store: Arc<dyn Store>,
    controller: Arc<dyn ControllerAdapter>,
    node_agent: Arc<dyn NodeAgentClient>,
    config: ProvisionerConfig,
}

impl Provisioner {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        controller: Arc<dyn ControllerAdapter>,
        node_agent: Arc<dyn NodeAgentClient>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            store,
            controller,
            node_agent,
            config,
        }
    }

    /// Run the full sequence for `lease`, which must currently be
    /// `REQUESTED`, placing it on `host_id`.
    ///
    /// Returns `Ok(())` whether the lease ends up `BOOTING` or `FAILED` —
    /// both are successful completions of provisioning's job. Only a stale
    /// CAS (another loop already touched the lease) or a store I/O failure
    /// is an `Err`, and per the error-handling table those are swallowed by
    /// the caller (scaler) and retried next tick, never surfaced upward.
    ///
    /// # Errors
    /// [`ProvisionError::StaleLease`] if the lease was not `REQUESTED`.
    /// [`ProvisionError::Storage`] if the store is unreachable.
    pub async fn provision(
        &self,
        lease: &Lease,
        host_id: &str,
        node_agent_url: &str,
    ) -> Result<(), ProvisionError> {
        debug_assert!(crate::lease::can_transition(LeaseState::Requested, LeaseState::Provisioning));
        let outcome = self
            .store
            .transition_lease(
                lease.lease_id,
                LeaseState::Requested,
                LeaseState::Provisioning,
                LeaseTransitionFields {
                    host_id: Some(host_id.to_owned()),
                    ..Default::default()
                },
                NewEvent::new(
                    "lease.provisioning",
                    serde_json::json!({"reason": reason::PLACED, "host_id": host_id}),
                ),
            )
            .await?;

        if !matches!(outcome, fleet_storage::TransitionOutcome::Applied(_)) {
            return Err(ProvisionError::StaleLease {
                lease_id: lease.lease_id,
            });
        }

        let node_name = lease.controller_node_name.clone();
        let secret = match self
            .controller
            .create_node(&node_name, &lease.label, 1, true)
            .await
        {
            Ok(secret) => secret,
            Err(e) => {
                warn!(lease_id = %lease.lease_id, error = %e, "controller node allocation failed");
                self.fail(lease, "controller_error", &e.to_string()).await?;
                return Ok(());
            }
        };

        let spec = VmSpec {
            vm_id: lease.vm_id,
            label: lease.label.clone(),
            base_image_id: self.config.base_image_for(&lease.label),
            vcpu: lease.cpu_demand,
            ram_mb: lease.ram_demand_mb,
            disk_gb: self.config.disk_gb,
            ttl_deadline: lease.ttl_deadline,
            connect_deadline: lease.connect_deadline,
            controller_url: self.config.controller_url.clone(),
            controller_node_name: node_name.clone(),
            inbound_secret: secret,
            cloud_init_user_data_b64: base64::engine::general_purpose::STANDARD.encode(b""),
        };

        match self.node_agent.create_vm(node_agent_url, &spec).await {
            Ok(()) => {
                debug_assert!(crate::lease::can_transition(LeaseState::Provisioning, LeaseState::Booting));
                self.store
                    .transition_lease(
                        lease.lease_id,
                        LeaseState::Provisioning,
                        LeaseState::Booting,
                        LeaseTransitionFields::default(),
                        NewEvent::new(
                            "lease.booting",
                            serde_json::json!({
                                "reason": reason::LAUNCH_OK,
                                "host_id": host_id,
                                "node_agent_url": node_agent_url,
                            }),
                        ),
                    )
                    .await?;
                info!(lease_id = %lease.lease_id, host_id, "lease booting");
                Ok(())
            }
            Err(e) => {
                warn!(lease_id = %lease.lease_id, error = %e, "node agent launch failed");
                // Best-effort cleanup of the controller node we just
                // created; idempotent, so a failure here is not fatal.
                if let Err(cleanup_err) = self.controller.delete_node(&node_name).await {
                    warn!(
                        lease_id = %lease.lease_id,
                        error = %cleanup_err,
                        "failed to clean up controller node after launch failure"
                    );
                }
                self.fail(lease, &e.error_type(), &e.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn fail(&self, lease: &Lease, error_type: &str, error_detail: &str) -> Result<(), ProvisionError> {
        debug_assert!(crate::lease::can_transition(LeaseState::Provisioning, LeaseState::Failed));
        self.store
            .transition_lease(
                lease.lease_id,
                LeaseState::Provisioning,
                LeaseState::Failed,
                LeaseTransitionFields {
                    last_error: Some(error_detail.to_owned()),
                    ..Default::default()
                },
                NewEvent::new(
                    "scale.launch_failed",
                    serde_json::json!({
                        "reason": reason::LAUNCH_FAILED,
                        "error_type": error_type,
                        "error_detail": error_detail,
                    }),
                ),
            )
            .await?;
        Ok(())
    }
}

/// Generate a fresh, globally-unique controller node name for a label,
/// prefixed so the reconciler can identify our own nodes by name when it
/// lists everything the controller currently has queued or running.
#[must_use]
pub fn generate_node_name(label: &str) -> String {
    format!("ephemeral-{label}-{}", Uuid::new_v4())
}

pub const NODE_NAME_PREFIX: &str = "ephemeral-";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeControllerAdapter, FakeNodeAgentClient};
    use chrono::{Duration, Utc};
    use fleet_storage::{MemoryStore, NewLease};

    fn config() -> ProvisionerConfig {
        ProvisionerConfig {
            base_image_by_label: HashMap::new(),
            disk_gb: 20,
            controller_url: "https://ci.example.com".to_owned(),
        }
    }

    async fn make_lease(store: &Arc<dyn Store>, label: &str) -> Lease {
        let now = Utc::now();
        store
            .create_lease(
                NewLease {
                    lease_id: Uuid::new_v4(),
                    vm_id: Uuid::new_v4(),
                    label: label.to_owned(),
                    controller_node_name: generate_node_name(label),
                    cpu_demand: 2,
                    ram_demand_mb: 2048,
                    connect_deadline: now + Duration::seconds(240),
                    ttl_deadline: now + Duration::seconds(3600),
                },
                NewEvent::new("lease.requested", serde_json::json!({})),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_provision_reaches_booting() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let controller = Arc::new(FakeControllerAdapter::new());
        let node_agent = Arc::new(FakeNodeAgentClient::new());
        let provisioner = Provisioner::new(
            Arc::clone(&store),
            controller,
            node_agent,
            config(),
        );

        let lease = make_lease(&store, "linux-x64").await;
        provisioner.provision(&lease, "h1", "http://h1:9000").await.unwrap();

        let updated = store.get_lease(lease.lease_id).await.unwrap().unwrap();
        assert_eq!(updated.state, LeaseState::Booting);
        assert_eq!(updated.host_id.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn node_agent_failure_reaches_failed_and_cleans_up_node() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let controller: Arc<dyn ControllerAdapter> = Arc::new(FakeControllerAdapter::new());
        let node_agent = Arc::new(FakeNodeAgentClient::new());
        node_agent.fail_next_create("http://h1:9000", 503);
        let provisioner = Provisioner::new(
            Arc::clone(&store),
            Arc::clone(&controller),
            node_agent,
            config(),
        );

        let lease = make_lease(&store, "linux-x64").await;
        provisioner.provision(&lease, "h1", "http://h1:9000").await.unwrap();

        let updated = store.get_lease(lease.lease_id).await.unwrap().unwrap();
        assert_eq!(updated.state, LeaseState::Failed);
        assert!(updated.last_error.unwrap().contains("503"));

        let events = store.list_events(Default::default()).await.unwrap();
        let launch_failed = events
            .iter()
            .find(|e| e.event_type == "scale.launch_failed")
            .unwrap();
        assert_eq!(launch_failed.payload["error_type"], "http_503");
    }

    #[tokio::test]
    async fn stale_lease_is_reported_not_silently_applied() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let controller = Arc::new(FakeControllerAdapter::new());
        let node_agent = Arc::new(FakeNodeAgentClient::new());
        let provisioner = Provisioner::new(Arc::clone(&store), controller, node_agent, config());

        let lease = make_lease(&store, "linux-x64").await;
        // Race: another caller already moved it to PROVISIONING.
        store
            .transition_lease(
                lease.lease_id,
                LeaseState::Requested,
                LeaseState::Provisioning,
                LeaseTransitionFields {
                    host_id: Some("other".to_owned()),
                    ..Default::default()
                },
                NewEvent::new("lease.provisioning", serde_json::json!({})),
            )
            .await
            .unwrap();

        let err = provisioner
            .provision(&lease, "h1", "http://h1:9000")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::StaleLease { .. }));
    }
}
