//! PostgreSQL storage backend.
//!
//! Stores hosts, leases, and events in three relations with foreign keys
//! and the indexes the scaler/reconciler/GC loops scan by. Every lease
//! transition and its event are written inside one `sqlx` transaction, which
//! is what makes [`Store::transition_lease`] an actual compare-and-swap
//! rather than a read-then-write race.
//!
//! Feature-gated behind `postgres-backend`, the default feature.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    Capacity, Event, EventFilter, Host, Lease, LeaseFilter, LeaseState, LeaseTransitionFields,
    NewEvent, NewHost, NewLease, Platform, TransitionOutcome,
};
use crate::Store;

/// A storage backend backed by PostgreSQL.
///
/// Thread-safe via `PgPool`. All operations are fully async.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect to PostgreSQL and run the initial migration.
    ///
    /// Creates the `hosts`, `leases`, and `events` tables and their indexes
    /// if they do not exist yet.
    ///
    /// # Errors
    /// [`StoreError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Open {
                target: database_url.to_owned(),
                reason: e.to_string(),
            })?;

        Self::migrate(&pool, database_url).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &PgPool, database_url: &str) -> Result<(), StoreError> {
        let open_err = |reason: String| StoreError::Open {
            target: database_url.to_owned(),
            reason,
        };

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS hosts (
                host_id              TEXT PRIMARY KEY,
                enabled              BOOLEAN NOT NULL DEFAULT TRUE,
                bootstrap_token_hash TEXT NOT NULL,
                session_token_hash   TEXT,
                session_expires_at   TIMESTAMPTZ,
                cpu_total            INTEGER NOT NULL,
                cpu_free             INTEGER NOT NULL,
                ram_total_mb         BIGINT NOT NULL,
                ram_free_mb          BIGINT NOT NULL,
                io_pressure          DOUBLE PRECISION NOT NULL DEFAULT 0,
                last_seen            TIMESTAMPTZ,
                node_agent_url       TEXT NOT NULL,
                platform             JSONB NOT NULL,
                created_at           TIMESTAMPTZ NOT NULL,
                updated_at           TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("hosts migration failed: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS leases (
                lease_id              UUID PRIMARY KEY,
                vm_id                 UUID NOT NULL,
                label                 TEXT NOT NULL,
                controller_node_name  TEXT NOT NULL,
                state                 TEXT NOT NULL,
                host_id               TEXT REFERENCES hosts(host_id),
                cpu_demand            INTEGER NOT NULL,
                ram_demand_mb         BIGINT NOT NULL,
                created_at            TIMESTAMPTZ NOT NULL,
                updated_at            TIMESTAMPTZ NOT NULL,
                connect_deadline      TIMESTAMPTZ NOT NULL,
                ttl_deadline          TIMESTAMPTZ NOT NULL,
                last_heartbeat        TIMESTAMPTZ,
                last_error            TEXT
            )",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("leases migration failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_leases_label_state ON leases (label, state)",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("leases index failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_leases_host_state ON leases (host_id, state)",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("leases index failed: {e}")))?;

        // Partial unique indexes enforce uniqueness of vm_id /
        // controller_node_name among non-terminal leases at the database
        // level, not just in application code.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_leases_vm_id_active ON leases (vm_id) \
             WHERE state NOT IN ('TERMINATED', 'FAILED')",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("leases vm_id index failed: {e}")))?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_leases_node_name_active \
             ON leases (controller_node_name) WHERE state NOT IN ('TERMINATED', 'FAILED')",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("leases node name index failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_hosts_last_seen ON hosts (last_seen)",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("hosts index failed: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id         BIGSERIAL PRIMARY KEY,
                timestamp  TIMESTAMPTZ NOT NULL,
                lease_id   UUID REFERENCES leases(lease_id),
                event_type TEXT NOT NULL,
                payload    JSONB NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(|e| open_err(format!("events migration failed: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_lease_id ON events (lease_id)")
            .execute(pool)
            .await
            .map_err(|e| open_err(format!("events index failed: {e}")))?;

        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_host(row: &sqlx::postgres::PgRow) -> Result<Host, StoreError> {
    let platform_json: serde_json::Value = row.try_get("platform").map_err(|e| StoreError::Corrupt {
        table: "hosts".to_owned(),
        reason: e.to_string(),
    })?;
    let platform: Platform =
        serde_json::from_value(platform_json).map_err(|e| StoreError::Corrupt {
            table: "hosts".to_owned(),
            reason: format!("bad platform json: {e}"),
        })?;

    Ok(Host {
        host_id: row.try_get("host_id").map_err(db_read_err("hosts"))?,
        enabled: row.try_get("enabled").map_err(db_read_err("hosts"))?,
        bootstrap_token_hash: row
            .try_get("bootstrap_token_hash")
            .map_err(db_read_err("hosts"))?,
        session_token_hash: row
            .try_get("session_token_hash")
            .map_err(db_read_err("hosts"))?,
        session_expires_at: row
            .try_get("session_expires_at")
            .map_err(db_read_err("hosts"))?,
        capacity: Capacity {
            cpu_total: row.try_get("cpu_total").map_err(db_read_err("hosts"))?,
            cpu_free: row.try_get("cpu_free").map_err(db_read_err("hosts"))?,
            ram_total_mb: row.try_get("ram_total_mb").map_err(db_read_err("hosts"))?,
            ram_free_mb: row.try_get("ram_free_mb").map_err(db_read_err("hosts"))?,
            io_pressure: row.try_get("io_pressure").map_err(db_read_err("hosts"))?,
        },
        last_seen: row.try_get("last_seen").map_err(db_read_err("hosts"))?,
        node_agent_url: row
            .try_get("node_agent_url")
            .map_err(db_read_err("hosts"))?,
        platform,
        created_at: row.try_get("created_at").map_err(db_read_err("hosts"))?,
        updated_at: row.try_get("updated_at").map_err(db_read_err("hosts"))?,
    })
}

fn row_to_lease(row: &sqlx::postgres::PgRow) -> Result<Lease, StoreError> {
    let state_str: String = row.try_get("state").map_err(db_read_err("leases"))?;
    let state = LeaseState::parse(&state_str).map_err(|reason| StoreError::Corrupt {
        table: "leases".to_owned(),
        reason,
    })?;

    Ok(Lease {
        lease_id: row.try_get("lease_id").map_err(db_read_err("leases"))?,
        vm_id: row.try_get("vm_id").map_err(db_read_err("leases"))?,
        label: row.try_get("label").map_err(db_read_err("leases"))?,
        controller_node_name: row
            .try_get("controller_node_name")
            .map_err(db_read_err("leases"))?,
        state,
        host_id: row.try_get("host_id").map_err(db_read_err("leases"))?,
        cpu_demand: row.try_get("cpu_demand").map_err(db_read_err("leases"))?,
        ram_demand_mb: row.try_get("ram_demand_mb").map_err(db_read_err("leases"))?,
        created_at: row.try_get("created_at").map_err(db_read_err("leases"))?,
        updated_at: row.try_get("updated_at").map_err(db_read_err("leases"))?,
        connect_deadline: row
            .try_get("connect_deadline")
            .map_err(db_read_err("leases"))?,
        ttl_deadline: row.try_get("ttl_deadline").map_err(db_read_err("leases"))?,
        last_heartbeat: row
            .try_get("last_heartbeat")
            .map_err(db_read_err("leases"))?,
        last_error: row.try_get("last_error").map_err(db_read_err("leases"))?,
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: row.try_get("id").map_err(db_read_err("events"))?,
        timestamp: row.try_get("timestamp").map_err(db_read_err("events"))?,
        lease_id: row.try_get("lease_id").map_err(db_read_err("events"))?,
        event_type: row.try_get("event_type").map_err(db_read_err("events"))?,
        payload: row.try_get("payload").map_err(db_read_err("events"))?,
    })
}

fn db_read_err(table: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| StoreError::Corrupt {
        table: table.to_owned(),
        reason: e.to_string(),
    }
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewEvent,
) -> Result<Event, StoreError> {
    let row = sqlx::query(
        "INSERT INTO events (timestamp, lease_id, event_type, payload) \
         VALUES ($1, $2, $3, $4) RETURNING id, timestamp, lease_id, event_type, payload",
    )
    .bind(Utc::now())
    .bind(event.lease_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::Write {
        reason: e.to_string(),
    })?;
    row_to_event(&row)
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn create_host(&self, new: NewHost) -> Result<Host, StoreError> {
        let now = Utc::now();
        let capacity = new.capacity.clamped();
        let platform_json = serde_json::to_value(&new.platform).map_err(|e| StoreError::Write {
            reason: e.to_string(),
        })?;

        let row = sqlx::query(
            "INSERT INTO hosts (
                host_id, enabled, bootstrap_token_hash, session_token_hash,
                session_expires_at, cpu_total, cpu_free, ram_total_mb, ram_free_mb,
                io_pressure, last_seen, node_agent_url, platform, created_at, updated_at
            ) VALUES ($1, TRUE, $2, NULL, NULL, $3, $4, $5, $6, $7, NULL, $8, $9, $10, $10) \
             RETURNING *",
        )
        .bind(&new.host_id)
        .bind(&new.bootstrap_token_hash)
        .bind(capacity.cpu_total)
        .bind(capacity.cpu_free)
        .bind(capacity.ram_total_mb)
        .bind(capacity.ram_free_mb)
        .bind(capacity.io_pressure)
        .bind(&new.node_agent_url)
        .bind(&platform_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict {
                    reason: format!("host '{}' already exists", new.host_id),
                }
            } else {
                StoreError::Write {
                    reason: e.to_string(),
                }
            }
        })?;

        row_to_host(&row)
    }

    async fn get_host(&self, host_id: &str) -> Result<Option<Host>, StoreError> {
        let row = sqlx::query("SELECT * FROM hosts WHERE host_id = $1")
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                reason: e.to_string(),
            })?;
        row.as_ref().map(row_to_host).transpose()
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let rows = sqlx::query("SELECT * FROM hosts ORDER BY host_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                reason: e.to_string(),
            })?;
        rows.iter().map(row_to_host).collect()
    }

    async fn register_host(
        &self,
        host_id: &str,
        session_token_hash: String,
        session_expires_at: DateTime<Utc>,
        platform: Platform,
        capacity: Capacity,
    ) -> Result<Host, StoreError> {
        let capacity = capacity.clamped();
        let platform_json = serde_json::to_value(&platform).map_err(|e| StoreError::Write {
            reason: e.to_string(),
        })?;

        let row = sqlx::query(
            "UPDATE hosts SET
                session_token_hash = $2, session_expires_at = $3, platform = $4,
                cpu_total = $5, cpu_free = $6, ram_total_mb = $7, ram_free_mb = $8,
                io_pressure = $9, updated_at = $10
             WHERE host_id = $1 RETURNING *",
        )
        .bind(host_id)
        .bind(&session_token_hash)
        .bind(session_expires_at)
        .bind(&platform_json)
        .bind(capacity.cpu_total)
        .bind(capacity.cpu_free)
        .bind(capacity.ram_total_mb)
        .bind(capacity.ram_free_mb)
        .bind(capacity.io_pressure)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Write {
            reason: e.to_string(),
        })?
        .ok_or_else(|| StoreError::HostNotFound {
            host_id: host_id.to_owned(),
        })?;

        row_to_host(&row)
    }

    async fn heartbeat_host(
        &self,
        host_id: &str,
        capacity: Capacity,
        last_seen: DateTime<Utc>,
    ) -> Result<Host, StoreError> {
        let capacity = capacity.clamped();
        let row = sqlx::query(
            "UPDATE hosts SET
                cpu_total = $2, cpu_free = $3, ram_total_mb = $4, ram_free_mb = $5,
                io_pressure = $6, last_seen = $7, updated_at = $7
             WHERE host_id = $1 RETURNING *",
        )
        .bind(host_id)
        .bind(capacity.cpu_total)
        .bind(capacity.cpu_free)
        .bind(capacity.ram_total_mb)
        .bind(capacity.ram_free_mb)
        .bind(capacity.io_pressure)
        .bind(last_seen)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Write {
            reason: e.to_string(),
        })?
        .ok_or_else(|| StoreError::HostNotFound {
            host_id: host_id.to_owned(),
        })?;

        row_to_host(&row)
    }

    async fn set_host_enabled(&self, host_id: &str, enabled: bool) -> Result<Host, StoreError> {
        let row = sqlx::query(
            "UPDATE hosts SET enabled = $2, updated_at = $3 WHERE host_id = $1 RETURNING *",
        )
        .bind(host_id)
        .bind(enabled)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Write {
            reason: e.to_string(),
        })?
        .ok_or_else(|| StoreError::HostNotFound {
            host_id: host_id.to_owned(),
        })?;

        row_to_host(&row)
    }

    async fn create_lease(&self, new: NewLease, event: NewEvent) -> Result<Lease, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;

        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO leases (
                lease_id, vm_id, label, controller_node_name, state, host_id,
                cpu_demand, ram_demand_mb, created_at, updated_at,
                connect_deadline, ttl_deadline, last_heartbeat, last_error
            ) VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $8, $8, $9, $10, NULL, NULL) \
             RETURNING *",
        )
        .bind(new.lease_id)
        .bind(new.vm_id)
        .bind(&new.label)
        .bind(&new.controller_node_name)
        .bind(LeaseState::Requested.as_str())
        .bind(new.cpu_demand)
        .bind(new.ram_demand_mb)
        .bind(now)
        .bind(new.connect_deadline)
        .bind(new.ttl_deadline)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict {
                    reason: format!(
                        "vm_id '{}' or controller_node_name '{}' already in use",
                        new.vm_id, new.controller_node_name
                    ),
                }
            } else {
                StoreError::Write {
                    reason: e.to_string(),
                }
            }
        })?;

        let lease = row_to_lease(&row)?;
        insert_event(&mut tx, &event.for_lease(lease.lease_id)).await?;

        tx.commit().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;

        Ok(lease)
    }

    async fn get_lease(&self, lease_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query("SELECT * FROM leases WHERE lease_id = $1")
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                reason: e.to_string(),
            })?;
        row.as_ref().map(row_to_lease).transpose()
    }

    async fn list_leases(&self, filter: LeaseFilter) -> Result<Vec<Lease>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM leases \
             WHERE ($1::TEXT IS NULL OR label = $1) \
               AND ($2::TEXT IS NULL OR state = $2) \
               AND ($3::TEXT IS NULL OR host_id = $3) \
             ORDER BY created_at DESC",
        )
        .bind(&filter.label)
        .bind(filter.state.map(LeaseState::as_str))
        .bind(&filter.host_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Read {
            reason: e.to_string(),
        })?;
        rows.iter().map(row_to_lease).collect()
    }

    async fn list_nonterminal_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM leases WHERE state NOT IN ('TERMINATED', 'FAILED') \
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Read {
            reason: e.to_string(),
        })?;
        rows.iter().map(row_to_lease).collect()
    }

    async fn count_inflight(&self, label: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM leases \
             WHERE label = $1 AND state IN ('PROVISIONING', 'BOOTING', 'CONNECTING')",
        )
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Read {
            reason: e.to_string(),
        })?;
        row.try_get("n").map_err(db_read_err("leases"))
    }

    async fn count_nonterminal(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM leases WHERE state NOT IN ('TERMINATED', 'FAILED')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Read {
            reason: e.to_string(),
        })?;
        row.try_get("n").map_err(db_read_err("leases"))
    }

    async fn transition_lease(
        &self,
        lease_id: Uuid,
        expected: LeaseState,
        new_state: LeaseState,
        fields: LeaseTransitionFields,
        event: NewEvent,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;

        // SELECT ... FOR UPDATE pins the row for the life of the
        // transaction, so the compare and the swap are atomic even under
        // concurrent callers targeting the same lease.
        let current = sqlx::query("SELECT state FROM leases WHERE lease_id = $1 FOR UPDATE")
            .bind(lease_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Read {
                reason: e.to_string(),
            })?;

        let Some(current) = current else {
            return Err(StoreError::LeaseNotFound { lease_id });
        };

        let current_state_str: String = current.try_get("state").map_err(db_read_err("leases"))?;
        let current_state =
            LeaseState::parse(&current_state_str).map_err(|reason| StoreError::Corrupt {
                table: "leases".to_owned(),
                reason,
            })?;

        if current_state != expected || current_state.is_terminal() {
            // No write, no event — rolling back is implicit on drop, but
            // commit an empty transaction to release the row lock promptly.
            tx.commit().await.map_err(|e| StoreError::Transaction {
                reason: e.to_string(),
            })?;
            return Ok(TransitionOutcome::Conflict {
                actual: current_state,
            });
        }

        let row = sqlx::query(
            "UPDATE leases SET
                state = $2,
                host_id = COALESCE($3, host_id),
                last_error = COALESCE($4, last_error),
                last_heartbeat = COALESCE($5, last_heartbeat),
                updated_at = $6
             WHERE lease_id = $1 RETURNING *",
        )
        .bind(lease_id)
        .bind(new_state.as_str())
        .bind(&fields.host_id)
        .bind(&fields.last_error)
        .bind(fields.last_heartbeat)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Write {
            reason: e.to_string(),
        })?;

        let lease = row_to_lease(&row)?;
        insert_event(&mut tx, &event.for_lease(lease_id)).await?;

        tx.commit().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;

        Ok(TransitionOutcome::Applied(lease))
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;
        let inserted = insert_event(&mut tx, &event).await?;
        tx.commit().await.map_err(|e| StoreError::Transaction {
            reason: e.to_string(),
        })?;
        Ok(inserted)
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events \
             WHERE ($1::UUID IS NULL OR lease_id = $1) \
               AND ($2::BIGINT IS NULL OR id > $2) \
             ORDER BY id DESC \
             LIMIT $3",
        )
        .bind(filter.lease_id)
        .bind(filter.since_id)
        .bind(filter.limit.unwrap_or(500))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Read {
            reason: e.to_string(),
        })?;
        rows.iter().map(row_to_event).collect()
    }

    async fn healthcheck(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Read {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err.as_database_error().and_then(sqlx::error::DatabaseError::code), Some(code) if code == "23505")
}
