//! Per-alert lifecycle: ledger writes, fingerprint dedup, workflow run.

use remediator_config::ToolsConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alerts::{classify, AlertContext, AlertmanagerAlert, AlertmanagerPayload, Labels, RunbookId};
use crate::ledger::{EventKind, IncidentLedger, IncidentRecord, IncidentUpsert, LedgerError};
use crate::workflow::{RunOutcome, WorkflowExecutor};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("incident ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The workflow ran (whatever its outcome)
    Handled,
    /// Another run holds the fingerprint
    Suppressed,
}

/// Per-alert entry of the webhook response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertOutcome {
    pub fingerprint: String,
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runbook_id: Option<String>,
    #[serde(skip)]
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub received: usize,
    pub results: Vec<AlertOutcome>,
}

pub struct IncidentCoordinator {
    ledger: Arc<dyn IncidentLedger>,
    executor: Arc<WorkflowExecutor>,
    cluster_name: String,
    tools: Arc<ToolsConfig>,
}

impl IncidentCoordinator {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn IncidentLedger>,
        executor: Arc<WorkflowExecutor>,
        cluster_name: impl Into<String>,
        tools: ToolsConfig,
    ) -> Self {
        Self {
            ledger,
            executor,
            cluster_name: cluster_name.into(),
            tools: Arc::new(tools),
        }
    }

    /// Process every alert of a batch in delivery order.
    pub async fn handle_batch(
        &self,
        payload: &AlertmanagerPayload,
    ) -> Result<WebhookResponse, CoordinatorError> {
        info!(
            receiver = %payload.receiver,
            status = %payload.status,
            alerts = payload.alerts.len(),
            "Webhook received"
        );
        let mut results = Vec::with_capacity(payload.alerts.len());
        for alert in &payload.alerts {
            results.push(self.handle(payload, alert).await?);
        }
        Ok(WebhookResponse {
            received: payload.alerts.len(),
            results,
        })
    }

    /// Process one alert.
    ///
    /// Errors only escape before the fingerprint lock is taken. Once it is
    /// held, the run continues in a detached task that records failures
    /// best-effort and always releases the lock.
    pub async fn handle(
        &self,
        payload: &AlertmanagerPayload,
        alert: &AlertmanagerAlert,
    ) -> Result<AlertOutcome, CoordinatorError> {
        let labels = payload.effective_labels(alert);
        let fingerprint = payload.fingerprint_for(alert, &labels);

        let incident = self
            .ledger
            .upsert_incident(&IncidentUpsert {
                fingerprint: fingerprint.clone(),
                alertname: labels.get("alertname").cloned(),
                namespace: labels.get("namespace").cloned(),
                pod: labels.get("pod").cloned(),
                severity: labels.get("severity").cloned(),
                agent_mode: Some(self.executor.settings().mode.to_string()),
                summary: alert.summary().map(str::to_string),
            })
            .await?;

        self.ledger
            .append_event(
                incident.id,
                EventKind::WebhookReceived,
                json!({
                    "cluster": self.cluster_name,
                    "alert_status": alert.status,
                    "webhook_status": payload.status,
                    "labels": labels,
                    "annotations": alert.annotations,
                    "startsAt": alert.starts_at,
                    "endsAt": alert.ends_at,
                    "fingerprint": fingerprint,
                }),
            )
            .await?;

        if !self.ledger.try_lock(&fingerprint).await? {
            info!(fingerprint = %fingerprint, incident_id = incident.id, "Suppressed: fingerprint lock busy");
            self.ledger
                .append_event(
                    incident.id,
                    EventKind::Suppressed,
                    json!({ "reason": "dedupe_lock_busy", "fingerprint": fingerprint }),
                )
                .await?;
            return Ok(AlertOutcome {
                fingerprint,
                status: AlertStatus::Suppressed,
                runbook_id: None,
                outcome: None,
            });
        }

        let runbook_id = classify(&labels);
        let run = LockedRun {
            ledger: Arc::clone(&self.ledger),
            executor: Arc::clone(&self.executor),
            tools: Arc::clone(&self.tools),
            incident,
            fingerprint: fingerprint.clone(),
        };
        // Detached: the run and its unlock finish even if this request is dropped.
        let outcome = match tokio::spawn(run.execute(runbook_id, labels)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(fingerprint = %fingerprint, error = %e, "Locked run aborted");
                None
            }
        };

        Ok(AlertOutcome {
            fingerprint,
            status: AlertStatus::Handled,
            runbook_id: Some(runbook_id.to_string()),
            outcome,
        })
    }
}

/// Work done while a fingerprint lock is held. Owns everything it needs so
/// it can outlive the request that started it.
#[derive(Clone)]
struct LockedRun {
    ledger: Arc<dyn IncidentLedger>,
    executor: Arc<WorkflowExecutor>,
    tools: Arc<ToolsConfig>,
    incident: IncidentRecord,
    fingerprint: String,
}

impl LockedRun {
    /// Run the workflow in its own task, then release the lock on every path.
    async fn execute(self, runbook_id: RunbookId, labels: Labels) -> Option<RunOutcome> {
        let workflow = tokio::spawn(self.clone().run_workflow(runbook_id, labels)).await;

        if let Err(e) = self.ledger.unlock(&self.fingerprint).await {
            error!(fingerprint = %self.fingerprint, error = %e, "Failed to release fingerprint lock");
        }

        match workflow {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                let reason = if e.is_panic() {
                    "workflow_panicked"
                } else {
                    "workflow_cancelled"
                };
                error!(fingerprint = %self.fingerprint, runbook_id = %runbook_id, reason, "Workflow task failed");
                self.record_error(reason).await;
                None
            }
        }
    }

    async fn run_workflow(self, runbook_id: RunbookId, labels: Labels) -> RunOutcome {
        let context = AlertContext::from_labels(labels, &self.tools);
        let outcome = self.executor.run(runbook_id.as_str(), &context).await;
        if let Err(e) = self.persist(&outcome).await {
            warn!(incident_id = self.incident.id, error = %e, "Failed to persist workflow outcome");
            self.record_error(&e.to_string()).await;
        }
        outcome
    }

    async fn persist(&self, outcome: &RunOutcome) -> Result<(), LedgerError> {
        let incident_id = self.incident.id;
        self.ledger
            .set_runbook(incident_id, &outcome.runbook_id)
            .await?;
        for (index, step) in outcome.steps.iter().enumerate() {
            self.ledger
                .append_event(
                    incident_id,
                    EventKind::Step,
                    json!({ "index": index, "runbook_id": outcome.runbook_id, "step": step }),
                )
                .await?;
        }
        self.ledger
            .append_event(
                incident_id,
                EventKind::Final,
                json!({ "runbook_id": outcome.runbook_id, "state": outcome }),
            )
            .await?;
        Ok(())
    }

    /// Best-effort failure record; a ledger error here is only logged.
    async fn record_error(&self, message: &str) {
        let payload = json!({ "error": message, "fingerprint": self.fingerprint });
        if let Err(e) = self
            .ledger
            .append_event(self.incident.id, EventKind::CoordinatorError, payload)
            .await
        {
            error!(incident_id = self.incident.id, error = %e, "Failed to record coordinator error");
        }
    }
}
