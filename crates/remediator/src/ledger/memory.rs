//! Process-local ledger used when no database is configured.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{EventKind, IncidentEvent, IncidentLedger, IncidentRecord, IncidentUpsert, LedgerError};

#[derive(Debug, Default)]
struct Inner {
    incidents: Vec<IncidentRecord>,
    by_fingerprint: HashMap<String, usize>,
    events: Vec<IncidentEvent>,
    locks: HashSet<String>,
    last_ts: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing timestamps keep the log ordered by write.
    fn next_ts(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_ts {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_ts = Some(ts);
        ts
    }

    fn incident_mut(&mut self, incident_id: i64) -> Result<&mut IncidentRecord, LedgerError> {
        self.incidents
            .iter_mut()
            .find(|i| i.id == incident_id)
            .ok_or(LedgerError::IncidentNotFound(incident_id))
    }
}

/// In-memory [`IncidentLedger`]. Locks are only exclusive within this process.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every event of every incident in write order.
    #[must_use]
    pub fn all_events(&self) -> Vec<IncidentEvent> {
        self.lock().events.clone()
    }
}

fn coalesce(target: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        target.clone_from(value);
    }
}

#[async_trait]
impl IncidentLedger for MemoryLedger {
    async fn upsert_incident(&self, upsert: &IncidentUpsert) -> Result<IncidentRecord, LedgerError> {
        let mut inner = self.lock();
        let now = inner.next_ts();
        let summary = upsert.effective_summary();

        if let Some(&idx) = inner.by_fingerprint.get(&upsert.fingerprint) {
            let record = &mut inner.incidents[idx];
            coalesce(&mut record.alertname, &upsert.alertname);
            coalesce(&mut record.namespace, &upsert.namespace);
            coalesce(&mut record.pod, &upsert.pod);
            coalesce(&mut record.severity, &upsert.severity);
            coalesce(&mut record.agent_mode, &upsert.agent_mode);
            coalesce(&mut record.summary, &summary);
            record.updated_at = now;
            return Ok(record.clone());
        }

        let record = IncidentRecord {
            id: inner.incidents.len() as i64 + 1,
            fingerprint: upsert.fingerprint.clone(),
            alertname: upsert.alertname.clone(),
            namespace: upsert.namespace.clone(),
            pod: upsert.pod.clone(),
            severity: upsert.severity.clone(),
            agent_mode: upsert.agent_mode.clone(),
            summary,
            runbook_id: None,
            created_at: now,
            updated_at: now,
        };
        let idx = inner.incidents.len();
        inner.by_fingerprint.insert(record.fingerprint.clone(), idx);
        inner.incidents.push(record.clone());
        Ok(record)
    }

    async fn set_runbook(&self, incident_id: i64, runbook_id: &str) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let now = inner.next_ts();
        let record = inner.incident_mut(incident_id)?;
        record.runbook_id = Some(runbook_id.to_string());
        record.updated_at = now;
        Ok(())
    }

    async fn append_event(
        &self,
        incident_id: i64,
        kind: EventKind,
        payload: Value,
    ) -> Result<IncidentEvent, LedgerError> {
        let mut inner = self.lock();
        inner.incident_mut(incident_id)?;
        let event = IncidentEvent {
            id: inner.events.len() as i64 + 1,
            incident_id,
            ts: inner.next_ts(),
            kind,
            payload,
        };
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn try_lock(&self, fingerprint: &str) -> Result<bool, LedgerError> {
        Ok(self.lock().locks.insert(fingerprint.to_string()))
    }

    async fn unlock(&self, fingerprint: &str) -> Result<(), LedgerError> {
        self.lock().locks.remove(fingerprint);
        Ok(())
    }

    async fn list_incidents(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<IncidentRecord>, LedgerError> {
        let mut incidents = self.lock().incidents.clone();
        incidents.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(incidents.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_incident(&self, incident_id: i64) -> Result<Option<IncidentRecord>, LedgerError> {
        Ok(self
            .lock()
            .incidents
            .iter()
            .find(|i| i.id == incident_id)
            .cloned())
    }

    async fn list_events(
        &self,
        incident_id: i64,
        limit: usize,
    ) -> Result<Vec<IncidentEvent>, LedgerError> {
        Ok(self
            .lock()
            .events
            .iter()
            .rev()
            .filter(|e| e.incident_id == incident_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_event(
        &self,
        incident_id: i64,
        kind: EventKind,
    ) -> Result<Option<IncidentEvent>, LedgerError> {
        Ok(self
            .lock()
            .events
            .iter()
            .rev()
            .find(|e| e.incident_id == incident_id && e.kind == kind)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(fp: &str, pod: Option<&str>) -> IncidentUpsert {
        IncidentUpsert {
            fingerprint: fp.to_string(),
            alertname: Some("KubePodOOMKilled".to_string()),
            pod: pod.map(str::to_string),
            ..IncidentUpsert::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_coalesces() {
        let ledger = MemoryLedger::new();
        let first = ledger.upsert_incident(&upsert("fp1", Some("p1"))).await.unwrap();
        let second = ledger.upsert_incident(&upsert("fp1", None)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.pod.as_deref(), Some("p1"));
        assert!(second.updated_at > first.updated_at);
        assert_eq!(ledger.list_incidents(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_newest_first() {
        let ledger = MemoryLedger::new();
        let inc = ledger.upsert_incident(&upsert("fp1", None)).await.unwrap();
        for i in 0..3 {
            ledger
                .append_event(inc.id, EventKind::Step, json!({"i": i}))
                .await
                .unwrap();
        }
        ledger
            .append_event(inc.id, EventKind::Final, json!({}))
            .await
            .unwrap();

        let events = ledger.list_events(inc.id, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Final);
        assert!(events[0].ts > events[1].ts);

        let latest_step = ledger.latest_event(inc.id, EventKind::Step).await.unwrap().unwrap();
        assert_eq!(latest_step.payload, json!({"i": 2}));
    }

    #[tokio::test]
    async fn test_append_to_missing_incident() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.append_event(42, EventKind::Step, json!({})).await,
            Err(LedgerError::IncidentNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_trylock() {
        let ledger = MemoryLedger::new();
        assert!(ledger.try_lock("fp1").await.unwrap());
        assert!(!ledger.try_lock("fp1").await.unwrap());
        assert!(ledger.try_lock("fp2").await.unwrap());
        ledger.unlock("fp1").await.unwrap();
        assert!(ledger.try_lock("fp1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_incidents_order_and_paging() {
        let ledger = MemoryLedger::new();
        let a = ledger.upsert_incident(&upsert("a", None)).await.unwrap();
        ledger.upsert_incident(&upsert("b", None)).await.unwrap();
        ledger.set_runbook(a.id, "RB_OOM").await.unwrap();

        let listed = ledger.list_incidents(10, 0).await.unwrap();
        assert_eq!(listed[0].fingerprint, "a");
        assert_eq!(listed[0].runbook_id.as_deref(), Some("RB_OOM"));
        let page = ledger.list_incidents(1, 1).await.unwrap();
        assert_eq!(page[0].fingerprint, "b");
    }
}
