//! Postgres-backed ledger.
//!
//! Fingerprint locks are session-level advisory locks. Each held lock pins
//! a connection from a dedicated lock pool until `unlock`, so running
//! incidents never starve ledger writes of connections. The lock pool size
//! bounds how many incidents can run at once.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Postgres, Row};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    advisory_key, EventKind, IncidentEvent, IncidentLedger, IncidentRecord, IncidentUpsert,
    LedgerError,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Connections for incident and event queries.
const QUERY_POOL_SIZE: u32 = 16;

/// Connections that hold fingerprint locks; one per running incident.
const LOCK_POOL_SIZE: u32 = 32;

pub struct PgLedger {
    pool: PgPool,
    lock_pool: PgPool,
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgLedger {
    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let connect = |size: u32, acquire_timeout: Duration| async move {
            PgPoolOptions::new()
                .max_connections(size)
                .acquire_timeout(acquire_timeout)
                .connect(database_url)
                .await
                .map_err(|e| {
                    warn!("Failed to connect to incident database: {}", e);
                    LedgerError::from(e)
                })
        };
        let pool = connect(QUERY_POOL_SIZE, Duration::from_secs(10)).await?;
        let lock_pool = connect(LOCK_POOL_SIZE, Duration::from_secs(5)).await?;
        let ledger = Self::new(pool, lock_pool);
        ledger.migrate().await?;
        info!("Incident ledger connected");
        Ok(ledger)
    }

    #[must_use]
    pub fn new(pool: PgPool, lock_pool: PgPool) -> Self {
        Self {
            pool,
            lock_pool,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn incident_from_row(row: &PgRow) -> Result<IncidentRecord, sqlx::Error> {
    Ok(IncidentRecord {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        alertname: row.try_get("alertname")?,
        namespace: row.try_get("namespace")?,
        pod: row.try_get("pod")?,
        severity: row.try_get("severity")?,
        agent_mode: row.try_get("agent_mode")?,
        summary: row.try_get("summary")?,
        runbook_id: row.try_get("runbook_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<IncidentEvent, LedgerError> {
    let kind: String = row.try_get("event_type")?;
    Ok(IncidentEvent {
        id: row.try_get("id")?,
        incident_id: row.try_get("incident_id")?,
        ts: row.try_get("ts")?,
        kind: kind.parse()?,
        payload: row.try_get("payload")?,
    })
}

#[async_trait]
impl IncidentLedger for PgLedger {
    async fn upsert_incident(&self, upsert: &IncidentUpsert) -> Result<IncidentRecord, LedgerError> {
        let row = sqlx::query(
            r#"
            insert into incidents (fingerprint, alertname, namespace, pod, severity, agent_mode, summary)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (fingerprint) do update set
              updated_at = now(),
              alertname = coalesce(excluded.alertname, incidents.alertname),
              namespace = coalesce(excluded.namespace, incidents.namespace),
              pod = coalesce(excluded.pod, incidents.pod),
              severity = coalesce(excluded.severity, incidents.severity),
              agent_mode = coalesce(excluded.agent_mode, incidents.agent_mode),
              summary = coalesce(excluded.summary, incidents.summary)
            returning *
            "#,
        )
        .bind(&upsert.fingerprint)
        .bind(&upsert.alertname)
        .bind(&upsert.namespace)
        .bind(&upsert.pod)
        .bind(&upsert.severity)
        .bind(&upsert.agent_mode)
        .bind(upsert.effective_summary())
        .fetch_one(&self.pool)
        .await?;
        Ok(incident_from_row(&row)?)
    }

    async fn set_runbook(&self, incident_id: i64, runbook_id: &str) -> Result<(), LedgerError> {
        let done = sqlx::query("update incidents set runbook_id = $1, updated_at = now() where id = $2")
            .bind(runbook_id)
            .bind(incident_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(LedgerError::IncidentNotFound(incident_id));
        }
        Ok(())
    }

    async fn append_event(
        &self,
        incident_id: i64,
        kind: EventKind,
        payload: Value,
    ) -> Result<IncidentEvent, LedgerError> {
        let row = sqlx::query(
            r#"
            insert into incident_events (incident_id, event_type, payload)
            values ($1, $2, $3)
            returning *
            "#,
        )
        .bind(incident_id)
        .bind(kind.as_str())
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                LedgerError::IncidentNotFound(incident_id)
            }
            other => LedgerError::from(other),
        })?;
        event_from_row(&row)
    }

    async fn try_lock(&self, fingerprint: &str) -> Result<bool, LedgerError> {
        if self.held.lock().await.contains_key(fingerprint) {
            return Ok(false);
        }
        // The map mutex is never held across a database round trip.
        let mut conn = self.lock_pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("select pg_try_advisory_lock($1)")
            .bind(advisory_key(fingerprint))
            .fetch_one(&mut *conn)
            .await?;
        if locked {
            self.held.lock().await.insert(fingerprint.to_string(), conn);
        }
        Ok(locked)
    }

    async fn unlock(&self, fingerprint: &str) -> Result<(), LedgerError> {
        let Some(mut conn) = self.held.lock().await.remove(fingerprint) else {
            return Ok(());
        };
        let released = sqlx::query_scalar::<_, bool>("select pg_advisory_unlock($1)")
            .bind(advisory_key(fingerprint))
            .fetch_one(&mut *conn)
            .await;
        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(fingerprint, "Advisory lock was not held by its session");
                Ok(())
            }
            Err(e) => {
                // Closing the session drops every advisory lock it holds.
                error!(fingerprint, error = %e, "Advisory unlock failed, closing lock session");
                if let Err(close) = conn.detach().close().await {
                    warn!(fingerprint, error = %close, "Failed to close lock session cleanly");
                }
                Err(e.into())
            }
        }
    }

    async fn list_incidents(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<IncidentRecord>, LedgerError> {
        let rows = sqlx::query("select * from incidents order by updated_at desc limit $1 offset $2")
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(incident_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_incident(&self, incident_id: i64) -> Result<Option<IncidentRecord>, LedgerError> {
        let row = sqlx::query("select * from incidents where id = $1")
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(incident_from_row).transpose()?)
    }

    async fn list_events(
        &self,
        incident_id: i64,
        limit: usize,
    ) -> Result<Vec<IncidentEvent>, LedgerError> {
        let rows = sqlx::query(
            "select * from incident_events where incident_id = $1 order by ts desc, id desc limit $2",
        )
        .bind(incident_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn latest_event(
        &self,
        incident_id: i64,
        kind: EventKind,
    ) -> Result<Option<IncidentEvent>, LedgerError> {
        let row = sqlx::query(
            r#"
            select * from incident_events
            where incident_id = $1 and event_type = $2
            order by ts desc, id desc
            limit 1
            "#,
        )
        .bind(incident_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }
}
