//! Runbook remediation controller.
//!
//! Receives Alertmanager notifications, classifies each alert into a runbook,
//! and drives that runbook to a terminal outcome by alternating between a
//! decision oracle and a closed catalog of cluster remediation tools. Every
//! transition lands in the incident ledger; at most one workflow runs per
//! alert fingerprint at a time.

pub mod alerts;
pub mod coordinator;
pub mod ledger;
pub mod oracle;
pub mod runbook;
pub mod server;
pub mod tools;
pub mod workflow;

pub use alerts::{classify, AlertContext, AlertmanagerAlert, AlertmanagerPayload, RunbookId};
pub use coordinator::{AlertOutcome, AlertStatus, IncidentCoordinator, WebhookResponse};
pub use ledger::{IncidentLedger, MemoryLedger};
pub use oracle::{Decision, DecisionOracle, DecisionRequest};
pub use runbook::{RunbookDefinition, RunbookStore};
pub use tools::{ClusterApi, ToolKind, ToolRegistry, ToolResult};
pub use workflow::{RunOutcome, WorkflowExecutor};
