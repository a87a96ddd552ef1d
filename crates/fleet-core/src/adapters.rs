//! External system contracts: the job-controller adapter and the node-agent
//! client.
//!
//! Both are traits so the control loops can be driven against in-memory
//! fakes in tests and a real HTTP implementation in production, the same
//! `Arc<dyn Trait>` injection the storage backend uses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AdapterError;

/// The state of the controller-side node, as reported by the job controller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub online: bool,
    pub busy: bool,
}

/// The payload sent to a node agent to create a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub vm_id: Uuid,
    pub label: String,
    pub base_image_id: String,
    pub vcpu: i32,
    pub ram_mb: i64,
    pub disk_gb: i32,
    pub ttl_deadline: chrono::DateTime<chrono::Utc>,
    pub connect_deadline: chrono::DateTime<chrono::Utc>,
    pub controller_url: String,
    pub controller_node_name: String,
    pub inbound_secret: String,
    pub cloud_init_user_data_b64: String,
}

/// A node agent's report of one VM it knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatus {
    pub vm_id: Uuid,
    pub state: String,
}

/// Declared node-agent capacity, as returned by `GET /v1/capacity`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeAgentCapacity {
    pub cpu_free: i32,
    pub ram_free_mb: i64,
    pub io_pressure: f64,
}

/// Abstraction over the external job controller's REST API.
///
/// Out of scope per the control plane's purpose: real controller
/// integration. This trait is the full contract; `FakeControllerAdapter` is
/// the only implementation shipped, for tests and local/dev runs.
#[async_trait::async_trait]
pub trait ControllerAdapter: Send + Sync + 'static {
    /// Number of queued jobs carrying `label`.
    async fn queued(&self, label: &str) -> Result<i64, AdapterError>;

    /// Create a controller-side node, returning its inbound secret.
    async fn create_node(
        &self,
        name: &str,
        label: &str,
        executors: i32,
        exclusive: bool,
    ) -> Result<String, AdapterError>;

    /// Delete a controller-side node. Idempotent: deleting an already-gone
    /// node is success.
    async fn delete_node(&self, name: &str) -> Result<(), AdapterError>;

    /// Online/busy state of a controller-side node.
    async fn node_state(&self, name: &str) -> Result<NodeState, AdapterError>;

    /// All controller-side node names starting with `prefix` — the
    /// reconciler's view of set **C**.
    async fn list_nodes_with_prefix(&self, prefix: &str) -> Result<Vec<String>, AdapterError>;
}

/// Abstraction over a per-host node agent's HTTP API.
#[async_trait::async_trait]
pub trait NodeAgentClient: Send + Sync + 'static {
    /// `PUT /v1/vms/{vm_id}` — create a VM. Idempotent on `vm_id`.
    async fn create_vm(&self, node_agent_url: &str, spec: &VmSpec) -> Result<(), AdapterError>;

    /// `GET /v1/vms/{vm_id}`.
    async fn get_vm(
        &self,
        node_agent_url: &str,
        vm_id: Uuid,
    ) -> Result<Option<VmStatus>, AdapterError>;

    /// `DELETE /v1/vms/{vm_id}?reason=`. Idempotent: deleting an
    /// already-gone VM is success.
    async fn delete_vm(
        &self,
        node_agent_url: &str,
        vm_id: Uuid,
        reason: &str,
    ) -> Result<(), AdapterError>;

    /// `GET /v1/vms` — this host's full live inventory.
    async fn list_vms(&self, node_agent_url: &str) -> Result<Vec<VmStatus>, AdapterError>;

    /// `GET /v1/capacity`.
    async fn capacity(&self, node_agent_url: &str) -> Result<NodeAgentCapacity, AdapterError>;

    /// `GET /healthz`.
    async fn healthcheck(&self, node_agent_url: &str) -> Result<bool, AdapterError>;
}

/// In-memory fake node the fake controller adapter keeps per call.
#[derive(Debug, Clone, Default)]
struct FakeNode {
    label: String,
    state: NodeState,
}

/// An in-memory fake of [`ControllerAdapter`] for tests and local/dev runs.
///
/// Queue depth and node states are pre-seeded or mutated directly by tests;
/// this adapter never talks to a real controller.
#[derive(Default)]
pub struct FakeControllerAdapter {
    queued: Mutex<HashMap<String, i64>>,
    nodes: Mutex<HashMap<String, FakeNode>>,
}

impl FakeControllerAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite the queue depth for `label`.
    pub fn set_queued(&self, label: &str, count: i64) {
        self.queued.lock().unwrap().insert(label.to_owned(), count);
    }

    /// Seed a node with an explicit name/label without going through
    /// `create_node` — used to simulate stale or externally-created nodes.
    pub fn seed_node(&self, name: &str, label: &str, state: NodeState) {
        self.nodes.lock().unwrap().insert(
            name.to_owned(),
            FakeNode {
                label: label.to_owned(),
                state,
            },
        );
    }

    /// Mutate an existing node's reported state (e.g. mark it online+busy).
    pub fn set_node_state(&self, name: &str, state: NodeState) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(name) {
            node.state = state;
        }
    }
}

#[async_trait::async_trait]
impl ControllerAdapter for FakeControllerAdapter {
    async fn queued(&self, label: &str) -> Result<i64, AdapterError> {
        Ok(*self.queued.lock().unwrap().get(label).unwrap_or(&0))
    }

    async fn create_node(
        &self,
        name: &str,
        label: &str,
        _executors: i32,
        _exclusive: bool,
    ) -> Result<String, AdapterError> {
        self.nodes.lock().unwrap().insert(
            name.to_owned(),
            FakeNode {
                label: label.to_owned(),
                state: NodeState::default(),
            },
        );
        Ok(format!("fake-secret-{}", Uuid::new_v4()))
    }

    async fn delete_node(&self, name: &str) -> Result<(), AdapterError> {
        self.nodes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn node_state(&self, name: &str) -> Result<NodeState, AdapterError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .get(name)
            .map(|n| n.state)
            .unwrap_or_default())
    }

    async fn list_nodes_with_prefix(&self, prefix: &str) -> Result<Vec<String>, AdapterError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// In-memory fake of [`NodeAgentClient`], keyed by `node_agent_url`.
#[derive(Default)]
pub struct FakeNodeAgentClient {
    hosts: Mutex<HashMap<String, HashMap<Uuid, VmStatus>>>,
    /// URLs that should fail the next `create_vm` call with this status.
    fail_create: Mutex<HashMap<String, u16>>,
}

impl FakeNodeAgentClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a VM as already present on a host, as if created out of band —
    /// used to simulate orphans the reconciler must clean up.
    pub fn seed_vm(&self, node_agent_url: &str, vm_id: Uuid, state: &str) {
        self.hosts
            .lock()
            .unwrap()
            .entry(node_agent_url.to_owned())
            .or_default()
            .insert(
                vm_id,
                VmStatus {
                    vm_id,
                    state: state.to_owned(),
                },
            );
    }

    /// Make the next `create_vm` call to `node_agent_url` fail with `status`.
    pub fn fail_next_create(&self, node_agent_url: &str, status: u16) {
        self.fail_create
            .lock()
            .unwrap()
            .insert(node_agent_url.to_owned(), status);
    }
}

#[async_trait::async_trait]
impl NodeAgentClient for FakeNodeAgentClient {
    async fn create_vm(&self, node_agent_url: &str, spec: &VmSpec) -> Result<(), AdapterError> {
        if let Some(status) = self.fail_create.lock().unwrap().remove(node_agent_url) {
            return Err(AdapterError::Http {
                target: node_agent_url.to_owned(),
                status,
                reason: "fake induced failure".to_owned(),
            });
        }
        self.hosts
            .lock()
            .unwrap()
            .entry(node_agent_url.to_owned())
            .or_default()
            .insert(
                spec.vm_id,
                VmStatus {
                    vm_id: spec.vm_id,
                    state: "BOOTING".to_owned(),
                },
            );
        Ok(())
    }

    async fn get_vm(
        &self,
        node_agent_url: &str,
        vm_id: Uuid,
    ) -> Result<Option<VmStatus>, AdapterError> {
        Ok(self
            .hosts
            .lock()
            .unwrap()
            .get(node_agent_url)
            .and_then(|vms| vms.get(&vm_id))
            .cloned())
    }

    async fn delete_vm(
        &self,
        node_agent_url: &str,
        vm_id: Uuid,
        _reason: &str,
    ) -> Result<(), AdapterError> {
        if let Some(vms) = self.hosts.lock().unwrap().get_mut(node_agent_url) {
            vms.remove(&vm_id);
        }
        Ok(())
    }

    async fn list_vms(&self, node_agent_url: &str) -> Result<Vec<VmStatus>, AdapterError> {
        Ok(self
            .hosts
            .lock()
            .unwrap()
            .get(node_agent_url)
            .map(|vms| vms.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn capacity(&self, _node_agent_url: &str) -> Result<NodeAgentCapacity, AdapterError> {
        Ok(NodeAgentCapacity {
            cpu_free: 8,
            ram_free_mb: 16384,
            io_pressure: 0.0,
        })
    }

    async fn healthcheck(&self, _node_agent_url: &str) -> Result<bool, AdapterError> {
        Ok(true)
    }
}

/// A real [`NodeAgentClient`] over HTTP, feature-gated behind
/// `http-node-agent` (on by default).
#[cfg(feature = "http-node-agent")]
pub struct HttpNodeAgentClient {
    client: reqwest::Client,
}

#[cfg(feature = "http-node-agent")]
impl HttpNodeAgentClient {
    /// Build a client with the given per-request timeout (default: 10s per
    /// the concurrency/resource model).
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn classify(err: &reqwest::Error, target: &str) -> AdapterError {
        if err.is_timeout() || err.is_connect() {
            return AdapterError::Unreachable {
                target: target.to_owned(),
                reason: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return AdapterError::Http {
                target: target.to_owned(),
                status: status.as_u16(),
                reason: err.to_string(),
            };
        }
        AdapterError::BadResponse {
            target: target.to_owned(),
            reason: err.to_string(),
        }
    }
}

#[cfg(feature = "http-node-agent")]
#[async_trait::async_trait]
impl NodeAgentClient for HttpNodeAgentClient {
    async fn create_vm(&self, node_agent_url: &str, spec: &VmSpec) -> Result<(), AdapterError> {
        let url = format!("{node_agent_url}/v1/vms/{}", spec.vm_id);
        let resp = self
            .client
            .put(&url)
            .json(spec)
            .send()
            .await
            .map_err(|e| Self::classify(&e, &url))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(AdapterError::Http {
            target: url,
            status,
            reason: body,
        })
    }

    async fn get_vm(
        &self,
        node_agent_url: &str,
        vm_id: Uuid,
    ) -> Result<Option<VmStatus>, AdapterError> {
        let url = format!("{node_agent_url}/v1/vms/{vm_id}");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::classify(&e, &url))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                target: url,
                status,
                reason: body,
            });
        }
        resp.json()
            .await
            .map(Some)
            .map_err(|e| AdapterError::BadResponse {
                target: url,
                reason: e.to_string(),
            })
    }

    async fn delete_vm(
        &self,
        node_agent_url: &str,
        vm_id: Uuid,
        reason: &str,
    ) -> Result<(), AdapterError> {
        let url = format!("{node_agent_url}/v1/vms/{vm_id}?reason={reason}");
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::classify(&e, &url))?;

        // A 404 on DELETE means the VM is already gone — idempotent success.
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        warn!(%url, status, "node agent rejected delete_vm");
        Err(AdapterError::Http {
            target: url,
            status,
            reason: body,
        })
    }

    async fn list_vms(&self, node_agent_url: &str) -> Result<Vec<VmStatus>, AdapterError> {
        let url = format!("{node_agent_url}/v1/vms");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::classify(&e, &url))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                target: url,
                status,
                reason: body,
            });
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::BadResponse {
                target: url,
                reason: e.to_string(),
            })
    }

    async fn capacity(&self, node_agent_url: &str) -> Result<NodeAgentCapacity, AdapterError> {
        let url = format!("{node_agent_url}/v1/capacity");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::classify(&e, &url))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                target: url,
                status,
                reason: body,
            });
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::BadResponse {
                target: url,
                reason: e.to_string(),
            })
    }

    async fn healthcheck(&self, node_agent_url: &str) -> Result<bool, AdapterError> {
        let url = format!("{node_agent_url}/healthz");
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                debug!(%url, error = %e, "node agent healthcheck failed");
                Ok(false)
            }
        }
    }
}
