//! Host registry: bootstrap/session token handling, heartbeat absorption,
//! and the schedulability predicate placement relies on.
//!
//! A plaintext token is generated with `uuid::Uuid::new_v4()`, hashed with
//! SHA-256 before it ever reaches storage, and compared by hash — the
//! plaintext is shown to the caller exactly once, at issuance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleet_storage::{Capacity, Host, NewHost, Platform, Store};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::HostRegistryError;

/// How long an issued session token remains valid.
pub const SESSION_TTL: Duration = Duration::hours(1);

/// A host counts as stale (and is excluded from placement) once
/// `last_seen` is older than this multiple of the heartbeat interval.
pub const STALENESS_MULTIPLE: i64 = 2;

/// Hash a plaintext token with SHA-256, hex-encoded. One-way.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Business logic layered over [`Store`] for host lifecycle operations.
pub struct HostRegistry {
    store: Arc<dyn Store>,
    allow_unknown_host_registration: bool,
    heartbeat_interval: Duration,
}

impl HostRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        allow_unknown_host_registration: bool,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            allow_unknown_host_registration,
            heartbeat_interval,
        }
    }

    /// Operator provisioning: create a host row with a fresh bootstrap
    /// token, returned once in plaintext.
    ///
    /// # Errors
    /// Propagates [`HostRegistryError::Storage`] on conflict or I/O failure.
    pub async fn provision(
        &self,
        host_id: String,
        node_agent_url: String,
        platform: Platform,
        capacity: Capacity,
    ) -> Result<(Host, String), HostRegistryError> {
        let bootstrap_token = uuid::Uuid::new_v4().to_string();
        let host = self
            .store
            .create_host(NewHost {
                host_id,
                bootstrap_token_hash: hash_token(&bootstrap_token),
                node_agent_url,
                platform,
                capacity,
            })
            .await?;
        Ok((host, bootstrap_token))
    }

    /// `Register(host_id, bootstrap_token, platform, capacity) -> (session_token, expiry)`.
    ///
    /// Authenticates by hashing the presented bootstrap token and comparing
    /// hashes: a bootstrap token is matched against exactly one stored row
    /// rather than looked up in a hash-keyed table, so the comparison
    /// happens against the loaded row's hash.
    ///
    /// # Errors
    /// - [`HostRegistryError::UnknownHost`] if the host does not exist and
    ///   auto-creation is disabled.
    /// - [`HostRegistryError::BadBootstrapToken`] if the token does not
    ///   match.
    pub async fn register(
        &self,
        host_id: &str,
        bootstrap_token: &str,
        platform: Platform,
        capacity: Capacity,
    ) -> Result<(String, DateTime<Utc>), HostRegistryError> {
        let host = match self.store.get_host(host_id).await? {
            Some(h) => h,
            None if self.allow_unknown_host_registration => {
                info!(host_id, "auto-creating host on first registration");
                self.store
                    .create_host(NewHost {
                        host_id: host_id.to_owned(),
                        bootstrap_token_hash: hash_token(bootstrap_token),
                        node_agent_url: String::new(),
                        platform: platform.clone(),
                        capacity,
                    })
                    .await?
            }
            None => {
                return Err(HostRegistryError::UnknownHost {
                    host_id: host_id.to_owned(),
                });
            }
        };

        if host.bootstrap_token_hash != hash_token(bootstrap_token) {
            return Err(HostRegistryError::BadBootstrapToken {
                host_id: host_id.to_owned(),
            });
        }

        let session_token = uuid::Uuid::new_v4().to_string();
        let session_expires_at = Utc::now() + SESSION_TTL;

        self.store
            .register_host(
                host_id,
                hash_token(&session_token),
                session_expires_at,
                platform,
                capacity,
            )
            .await?;

        info!(host_id, "host registered");
        Ok((session_token, session_expires_at))
    }

    /// `Heartbeat(host_id, session_token, capacity, active_vm_ids) -> ack`.
    ///
    /// `active_vm_ids` is consumed by the reconciler (via `NodeAgentClient`)
    /// rather than stored here; the registry only validates auth and
    /// refreshes capacity/`last_seen`.
    ///
    /// # Errors
    /// - [`HostRegistryError::UnknownHost`] if the host does not exist.
    /// - [`HostRegistryError::BadSessionToken`] if the session token is
    ///   absent, mismatched, or expired.
    pub async fn heartbeat(
        &self,
        host_id: &str,
        session_token: &str,
        capacity: Capacity,
    ) -> Result<Host, HostRegistryError> {
        let host = self
            .store
            .get_host(host_id)
            .await?
            .ok_or_else(|| HostRegistryError::UnknownHost {
                host_id: host_id.to_owned(),
            })?;

        let Some(ref expected_hash) = host.session_token_hash else {
            return Err(HostRegistryError::BadSessionToken {
                host_id: host_id.to_owned(),
                reason: "no session established — register first".to_owned(),
            });
        };

        if *expected_hash != hash_token(session_token) {
            return Err(HostRegistryError::BadSessionToken {
                host_id: host_id.to_owned(),
                reason: "token mismatch".to_owned(),
            });
        }

        let now = Utc::now();
        if host.session_expires_at.is_none_or(|exp| now > exp) {
            return Err(HostRegistryError::BadSessionToken {
                host_id: host_id.to_owned(),
                reason: "session expired".to_owned(),
            });
        }

        Ok(self.store.heartbeat_host(host_id, capacity, now).await?)
    }

    /// Operator enable/disable. Does not touch existing leases.
    ///
    /// # Errors
    /// Propagates [`HostRegistryError::Storage`] if the host does not exist.
    pub async fn set_enabled(&self, host_id: &str, enabled: bool) -> Result<Host, HostRegistryError> {
        Ok(self.store.set_host_enabled(host_id, enabled).await?)
    }

    /// Whether `host` may currently receive a lease demanding `cpu_demand`
    /// vCPUs and `ram_demand_mb` RAM.
    #[must_use]
    pub fn is_schedulable(&self, host: &Host, now: DateTime<Utc>, cpu_demand: i32, ram_demand_mb: i64) -> bool {
        if !host.enabled {
            return false;
        }
        let Some(last_seen) = host.last_seen else {
            return false;
        };
        let staleness_threshold = self.heartbeat_interval * STALENESS_MULTIPLE as i32;
        if now - last_seen > staleness_threshold {
            return false;
        }
        if !host.platform.accelerator_is_consistent() {
            return false;
        }
        host.capacity.cpu_free >= cpu_demand.max(1) && host.capacity.ram_free_mb >= ram_demand_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_storage::MemoryStore;

    fn platform() -> Platform {
        Platform {
            os_family: "linux".to_owned(),
            os_flavor: "debian".to_owned(),
            cpu_arch: "x86_64".to_owned(),
            accelerator: "kvm".to_owned(),
            supported_accelerators: vec!["kvm".to_owned()],
        }
    }

    fn capacity() -> Capacity {
        Capacity {
            cpu_total: 4,
            cpu_free: 4,
            ram_total_mb: 8192,
            ram_free_mb: 8192,
            io_pressure: 0.0,
        }
    }

    fn registry() -> HostRegistry {
        HostRegistry::new(Arc::new(MemoryStore::new()), false, Duration::seconds(15))
    }

    #[tokio::test]
    async fn register_with_wrong_bootstrap_token_fails() {
        let reg = registry();
        let (_, token) = reg
            .provision("h1".to_owned(), "http://h1".to_owned(), platform(), capacity())
            .await
            .unwrap();
        let _ = token;
        let err = reg
            .register("h1", "not-the-token", platform(), capacity())
            .await
            .unwrap_err();
        assert!(matches!(err, HostRegistryError::BadBootstrapToken { .. }));
    }

    #[tokio::test]
    async fn register_then_heartbeat_succeeds() {
        let reg = registry();
        let (_, bootstrap) = reg
            .provision("h1".to_owned(), "http://h1".to_owned(), platform(), capacity())
            .await
            .unwrap();
        let (session, _) = reg
            .register("h1", &bootstrap, platform(), capacity())
            .await
            .unwrap();
        let host = reg.heartbeat("h1", &session, capacity()).await.unwrap();
        assert!(host.last_seen.is_some());
    }

    #[tokio::test]
    async fn heartbeat_with_stale_session_rejected() {
        let reg = registry();
        let err = reg.heartbeat("h1", "whatever", capacity()).await.unwrap_err();
        assert!(matches!(err, HostRegistryError::UnknownHost { .. }));
    }

    #[tokio::test]
    async fn unknown_host_registration_blocked_by_default() {
        let reg = registry();
        let err = reg
            .register("ghost", "token", platform(), capacity())
            .await
            .unwrap_err();
        assert!(matches!(err, HostRegistryError::UnknownHost { .. }));
    }

    #[test]
    fn schedulability_requires_fresh_heartbeat() {
        let reg = registry();
        let mut host = Host {
            host_id: "h1".to_owned(),
            enabled: true,
            bootstrap_token_hash: String::new(),
            session_token_hash: None,
            session_expires_at: None,
            capacity: capacity(),
            last_seen: Some(Utc::now() - Duration::minutes(5)),
            node_agent_url: "http://h1".to_owned(),
            platform: platform(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!reg.is_schedulable(&host, Utc::now(), 1, 1024));
        host.last_seen = Some(Utc::now());
        assert!(reg.is_schedulable(&host, Utc::now(), 1, 1024));
    }
}
