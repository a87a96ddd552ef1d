//! In-memory store for testing and local/dev runs.
//!
//! Everything lives behind a single `tokio::sync::Mutex`, which is how this
//! backend emulates the transactional atomicity the Postgres backend gets
//! from real transactions: the whole check-then-write sequence for a CAS
//! happens while the lock is held, so two racing callers never both observe
//! the pre-transition state.
//!
//! Not persistent — all data is lost when the process exits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    Capacity, Event, EventFilter, Host, Lease, LeaseFilter, LeaseState, LeaseTransitionFields,
    NewEvent, NewHost, NewLease, Platform, TransitionOutcome,
};
use crate::Store;

#[derive(Default)]
struct Inner {
    hosts: HashMap<String, Host>,
    leases: HashMap<Uuid, Lease>,
    events: Vec<Event>,
    next_event_id: i64,
}

impl Inner {
    fn vm_id_in_use(&self, vm_id: Uuid, exclude: Option<Uuid>) -> bool {
        self.leases.values().any(|l| {
            l.vm_id == vm_id && !l.state.is_terminal() && Some(l.lease_id) != exclude
        })
    }

    fn node_name_in_use(&self, name: &str, exclude: Option<Uuid>) -> bool {
        self.leases.values().any(|l| {
            l.controller_node_name == name && !l.state.is_terminal() && Some(l.lease_id) != exclude
        })
    }

    fn push_event(&mut self, event: NewEvent) -> Event {
        self.next_event_id += 1;
        let e = Event {
            id: self.next_event_id,
            timestamp: Utc::now(),
            lease_id: event.lease_id,
            event_type: event.event_type,
            payload: event.payload,
        };
        self.events.push(e.clone());
        e
    }
}

/// An in-memory [`Store`] backed by a mutex-guarded set of hash maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn create_host(&self, new: NewHost) -> Result<Host, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.hosts.contains_key(&new.host_id) {
            return Err(StoreError::Conflict {
                reason: format!("host '{}' already exists", new.host_id),
            });
        }
        let now = Utc::now();
        let host = Host {
            host_id: new.host_id.clone(),
            enabled: true,
            bootstrap_token_hash: new.bootstrap_token_hash,
            session_token_hash: None,
            session_expires_at: None,
            capacity: new.capacity.clamped(),
            last_seen: None,
            node_agent_url: new.node_agent_url,
            platform: new.platform,
            created_at: now,
            updated_at: now,
        };
        inner.hosts.insert(new.host_id, host.clone());
        Ok(host)
    }

    async fn get_host(&self, host_id: &str) -> Result<Option<Host>, StoreError> {
        Ok(self.inner.lock().await.hosts.get(host_id).cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        Ok(self.inner.lock().await.hosts.values().cloned().collect())
    }

    async fn register_host(
        &self,
        host_id: &str,
        session_token_hash: String,
        session_expires_at: DateTime<Utc>,
        platform: Platform,
        capacity: Capacity,
    ) -> Result<Host, StoreError> {
        let mut inner = self.inner.lock().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::HostNotFound {
                host_id: host_id.to_owned(),
            })?;
        host.session_token_hash = Some(session_token_hash);
        host.session_expires_at = Some(session_expires_at);
        host.platform = platform;
        host.capacity = capacity.clamped();
        host.updated_at = Utc::now();
        Ok(host.clone())
    }

    async fn heartbeat_host(
        &self,
        host_id: &str,
        capacity: Capacity,
        last_seen: DateTime<Utc>,
    ) -> Result<Host, StoreError> {
        let mut inner = self.inner.lock().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::HostNotFound {
                host_id: host_id.to_owned(),
            })?;
        host.capacity = capacity.clamped();
        host.last_seen = Some(last_seen);
        host.updated_at = Utc::now();
        Ok(host.clone())
    }

    async fn set_host_enabled(&self, host_id: &str, enabled: bool) -> Result<Host, StoreError> {
        let mut inner = self.inner.lock().await;
        let host = inner
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| StoreError::HostNotFound {
                host_id: host_id.to_owned(),
            })?;
        host.enabled = enabled;
        host.updated_at = Utc::now();
        Ok(host.clone())
    }

    async fn create_lease(&self, new: NewLease, event: NewEvent) -> Result<Lease, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.vm_id_in_use(new.vm_id, None) {
            return Err(StoreError::Conflict {
                reason: format!("vm_id '{}' already in use", new.vm_id),
            });
        }
        if inner.node_name_in_use(&new.controller_node_name, None) {
            return Err(StoreError::Conflict {
                reason: format!(
                    "controller_node_name '{}' already in use",
                    new.controller_node_name
                ),
            });
        }
        let now = Utc::now();
        let lease = Lease {
            lease_id: new.lease_id,
            vm_id: new.vm_id,
            label: new.label,
            controller_node_name: new.controller_node_name,
            state: LeaseState::Requested,
            host_id: None,
            cpu_demand: new.cpu_demand,
            ram_demand_mb: new.ram_demand_mb,
            created_at: now,
            updated_at: now,
            connect_deadline: new.connect_deadline,
            ttl_deadline: new.ttl_deadline,
            last_heartbeat: None,
            last_error: None,
        };
        inner.leases.insert(lease.lease_id, lease.clone());
        inner.push_event(event.for_lease(lease.lease_id));
        Ok(lease)
    }

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.inner.lock().await.leases.get(&lease_id).cloned())
    }

    async fn list_leases(&self, filter: LeaseFilter) -> Result<Vec<Lease>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leases
            .values()
            .filter(|l| filter.label.as_deref().is_none_or(|v| v == l.label))
            .filter(|l| filter.state.is_none_or(|s| s == l.state))
            .filter(|l| {
                filter
                    .host_id
                    .as_deref()
                    .is_none_or(|v| l.host_id.as_deref() == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn list_nonterminal_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leases
            .values()
            .filter(|l| !l.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn count_inflight(&self, label: &str) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .leases
            .values()
            .filter(|l| l.label == label && l.state.is_inflight())
            .count() as i64)
    }

    async fn count_nonterminal(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.leases.values().filter(|l| !l.state.is_terminal()).count() as i64)
    }

    async fn transition_lease(
        &self,
        lease_id: Uuid,
        expected: LeaseState,
        new_state: LeaseState,
        fields: LeaseTransitionFields,
        event: NewEvent,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        // Uniqueness checks must run before we mutate, using a snapshot of
        // the lease being transitioned (vm_id/controller_node_name never
        // change after creation, so this only matters on re-entry into a
        // non-terminal state, which never happens here, but keeping the
        // check symmetric with `create_lease` costs nothing).
        let current_state = match inner.leases.get(&lease_id) {
            Some(l) => l.state,
            None => {
                return Err(StoreError::LeaseNotFound { lease_id });
            }
        };

        if current_state != expected || current_state.is_terminal() {
            return Ok(TransitionOutcome::Conflict {
                actual: current_state,
            });
        }

        let lease = inner
            .leases
            .get_mut(&lease_id)
            .ok_or(StoreError::LeaseNotFound { lease_id })?;

        lease.state = new_state;
        lease.updated_at = Utc::now();
        if let Some(host_id) = fields.host_id {
            lease.host_id = Some(host_id);
        }
        if let Some(err) = fields.last_error {
            lease.last_error = Some(err);
        }
        if let Some(hb) = fields.last_heartbeat {
            lease.last_heartbeat = Some(hb);
        }
        let updated = lease.clone();

        inner.push_event(event.for_lease(lease_id));

        Ok(TransitionOutcome::Applied(updated))
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.push_event(event))
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| filter.lease_id.is_none_or(|id| Some(id) == e.lease_id))
            .filter(|e| filter.since_id.is_none_or(|since| e.id > since))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            events.truncate(limit.max(0) as usize);
        }
        Ok(events)
    }

    async fn healthcheck(&self) -> Result<(), StoreError> {
        let _ = self.inner.lock().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capacity, NewHost, NewLease, Platform};

    fn test_capacity() -> Capacity {
        Capacity {
            cpu_total: 8,
            cpu_free: 8,
            ram_total_mb: 16384,
            ram_free_mb: 16384,
            io_pressure: 0.0,
        }
    }

    fn test_platform() -> Platform {
        Platform {
            os_family: "linux".to_owned(),
            os_flavor: "debian".to_owned(),
            cpu_arch: "x86_64".to_owned(),
            accelerator: "kvm".to_owned(),
            supported_accelerators: vec!["kvm".to_owned(), "none".to_owned()],
        }
    }

    #[tokio::test]
    async fn create_and_fetch_host() {
        let store = MemoryStore::new();
        let host = store
            .create_host(NewHost {
                host_id: "h1".to_owned(),
                bootstrap_token_hash: "hash".to_owned(),
                node_agent_url: "http://h1:9000".to_owned(),
                platform: test_platform(),
                capacity: test_capacity(),
            })
            .await
            .unwrap();
        assert_eq!(host.host_id, "h1");
        assert!(host.enabled);

        let fetched = store.get_host("h1").await.unwrap().unwrap();
        assert_eq!(fetched.host_id, "h1");
    }

    #[tokio::test]
    async fn duplicate_host_id_conflicts() {
        let store = MemoryStore::new();
        let new_host = || NewHost {
            host_id: "h1".to_owned(),
            bootstrap_token_hash: "hash".to_owned(),
            node_agent_url: "http://h1:9000".to_owned(),
            platform: test_platform(),
            capacity: test_capacity(),
        };
        store.create_host(new_host()).await.unwrap();
        let err = store.create_host(new_host()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    fn new_lease(label: &str) -> NewLease {
        let now = Utc::now();
        NewLease {
            lease_id: Uuid::new_v4(),
            vm_id: Uuid::new_v4(),
            label: label.to_owned(),
            controller_node_name: format!("ephemeral-{}", Uuid::new_v4()),
            cpu_demand: 2,
            ram_demand_mb: 2048,
            connect_deadline: now + chrono::Duration::seconds(240),
            ttl_deadline: now + chrono::Duration::seconds(3600),
        }
    }

    #[tokio::test]
    async fn create_lease_starts_requested_and_emits_event() {
        let store = MemoryStore::new();
        let lease = store
            .create_lease(
                new_lease("linux-x64"),
                NewEvent::new("lease.requested", serde_json::json!({})),
            )
            .await
            .unwrap();
        assert_eq!(lease.state, LeaseState::Requested);
        assert!(lease.host_id.is_none());

        let events = store.list_events(EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "lease.requested");
        assert_eq!(events[0].lease_id, Some(lease.lease_id));
    }

    #[tokio::test]
    async fn duplicate_vm_id_conflicts() {
        let store = MemoryStore::new();
        let vm_id = Uuid::new_v4();
        let mut a = new_lease("linux-x64");
        a.vm_id = vm_id;
        let mut b = new_lease("linux-x64");
        b.vm_id = vm_id;

        store
            .create_lease(a, NewEvent::new("lease.requested", serde_json::json!({})))
            .await
            .unwrap();
        let err = store
            .create_lease(b, NewEvent::new("lease.requested", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn cas_transition_applies_once_and_conflicts_on_retry() {
        let store = MemoryStore::new();
        let lease = store
            .create_lease(
                new_lease("linux-x64"),
                NewEvent::new("lease.requested", serde_json::json!({})),
            )
            .await
            .unwrap();

        let outcome = store
            .transition_lease(
                lease.lease_id,
                LeaseState::Requested,
                LeaseState::Provisioning,
                LeaseTransitionFields {
                    host_id: Some("h1".to_owned()),
                    ..Default::default()
                },
                NewEvent::new("lease.provisioning", serde_json::json!({"host_id": "h1"})),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Applied(_)));

        // A second attempt from the same stale expectation must conflict,
        // not silently re-apply.
        let outcome = store
            .transition_lease(
                lease.lease_id,
                LeaseState::Requested,
                LeaseState::Provisioning,
                LeaseTransitionFields::default(),
                NewEvent::new("lease.provisioning", serde_json::json!({})),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Conflict { .. }));

        let events = store.list_events(EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2, "conflicting CAS must not write an event");
    }

    #[tokio::test]
    async fn terminal_state_blocks_further_transitions() {
        let store = MemoryStore::new();
        let lease = store
            .create_lease(
                new_lease("linux-x64"),
                NewEvent::new("lease.requested", serde_json::json!({})),
            )
            .await
            .unwrap();

        store
            .transition_lease(
                lease.lease_id,
                LeaseState::Requested,
                LeaseState::Failed,
                LeaseTransitionFields {
                    last_error: Some("boom".to_owned()),
                    ..Default::default()
                },
                NewEvent::new("scale.launch_failed", serde_json::json!({})),
            )
            .await
            .unwrap();

        let outcome = store
            .transition_lease(
                lease.lease_id,
                LeaseState::Failed,
                LeaseState::Terminating,
                LeaseTransitionFields::default(),
                NewEvent::new("lease.terminating", serde_json::json!({})),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Conflict { .. }));
    }
}
