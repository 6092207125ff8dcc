//! Incident ledger.
//!
//! Incidents are keyed by fingerprint; each carries an append-only event log.
//! The ledger also owns the per-fingerprint trylock that keeps at most one
//! workflow running per incident line.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryLedger;
#[cfg(feature = "postgres")]
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("incident {0} not found")]
    IncidentNotFound(i64),

    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("ledger backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Kinds of incident events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WebhookReceived,
    Suppressed,
    Step,
    Final,
    CoordinatorError,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookReceived => "webhook_received",
            Self::Suppressed => "suppressed",
            Self::Step => "step",
            Self::Final => "final",
            Self::CoordinatorError => "coordinator_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook_received" => Ok(Self::WebhookReceived),
            "suppressed" => Ok(Self::Suppressed),
            "step" => Ok(Self::Step),
            "final" => Ok(Self::Final),
            "coordinator_error" => Ok(Self::CoordinatorError),
            other => Err(LedgerError::UnknownEventKind(other.to_string())),
        }
    }
}

/// Identity fields written on every delivery. `None` never clears a
/// previously stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncidentUpsert {
    pub fingerprint: String,
    pub alertname: Option<String>,
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub severity: Option<String>,
    pub agent_mode: Option<String>,
    pub summary: Option<String>,
}

impl IncidentUpsert {
    /// Summary to store: the supplied one, else `Alert: X | Namespace: Y | Pod: Z`
    /// built from whichever identity fields are present.
    #[must_use]
    pub fn effective_summary(&self) -> Option<String> {
        if let Some(s) = self.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(s.to_string());
        }
        let parts: Vec<String> = [
            ("Alert", &self.alertname),
            ("Namespace", &self.namespace),
            ("Pod", &self.pod),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| format!("{label}: {v}")))
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" | "))
        }
    }
}

/// A stored incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: i64,
    pub fingerprint: String,
    pub alertname: Option<String>,
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub severity: Option<String>,
    pub agent_mode: Option<String>,
    pub summary: Option<String>,
    pub runbook_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One event in an incident's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub id: i64,
    pub incident_id: i64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Value,
}

/// Durable incident store with fingerprint locks.
#[async_trait]
pub trait IncidentLedger: Send + Sync {
    /// Insert or update the incident for `upsert.fingerprint`.
    async fn upsert_incident(&self, upsert: &IncidentUpsert) -> Result<IncidentRecord, LedgerError>;

    async fn set_runbook(&self, incident_id: i64, runbook_id: &str) -> Result<(), LedgerError>;

    async fn append_event(
        &self,
        incident_id: i64,
        kind: EventKind,
        payload: Value,
    ) -> Result<IncidentEvent, LedgerError>;

    /// Non-blocking. `false` means another holder has the fingerprint.
    async fn try_lock(&self, fingerprint: &str) -> Result<bool, LedgerError>;

    async fn unlock(&self, fingerprint: &str) -> Result<(), LedgerError>;

    /// Newest update first.
    async fn list_incidents(&self, limit: usize, offset: usize)
        -> Result<Vec<IncidentRecord>, LedgerError>;

    async fn get_incident(&self, incident_id: i64) -> Result<Option<IncidentRecord>, LedgerError>;

    /// Newest first.
    async fn list_events(&self, incident_id: i64, limit: usize)
        -> Result<Vec<IncidentEvent>, LedgerError>;

    async fn latest_event(
        &self,
        incident_id: i64,
        kind: EventKind,
    ) -> Result<Option<IncidentEvent>, LedgerError>;
}

/// Advisory lock key: first 8 bytes of SHA-256, big-endian, mod 2^63.
#[must_use]
pub fn advisory_key(fingerprint: &str) -> i64 {
    let digest = Sha256::digest(fingerprint.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) & (u64::MAX >> 1)) as i64
}
