//! Per-run state and the outcome it collapses into.

use remediator_config::ExecutionMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

/// One entry of the step trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub action_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// The validated decision that led to this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    fn new(action_id: &str, status: StepStatus) -> Self {
        Self {
            action_id: action_id.to_string(),
            status,
            tool: None,
            decision: None,
            evidence: None,
            error: None,
        }
    }

    #[must_use]
    pub fn skipped(action_id: &str, reason: impl Into<String>) -> Self {
        let mut record = Self::new(action_id, StepStatus::Skipped);
        record.evidence = Some(json!({ "reason": reason.into() }));
        record
    }

    #[must_use]
    pub fn failed(action_id: &str, error: impl Into<String>) -> Self {
        let mut record = Self::new(action_id, StepStatus::Failed);
        record.error = Some(error.into());
        record
    }

    /// Record of an executed tool call; status follows `result.ok`.
    #[must_use]
    pub fn executed(action_id: &str, tool: &str, decision: Value, result: &ToolResult) -> Self {
        let status = if result.ok {
            StepStatus::Ok
        } else {
            StepStatus::Failed
        };
        let mut record = Self::new(action_id, status);
        record.tool = Some(tool.to_string());
        record.decision = Some(decision);
        record.error.clone_from(&result.error);
        record.evidence = Some(result.to_value());
        record
    }

    #[must_use]
    pub fn with_decision(mut self, decision: Value) -> Self {
        self.decision = Some(decision);
        self
    }
}

/// Mutable state owned by one executor run.
#[derive(Debug, Default)]
pub struct RunState {
    /// Tool results keyed by logical name; gates read from here
    pub results: Map<String, Value>,
    pub trail: Vec<StepRecord>,
    /// Decision/tool round trips consumed
    pub round_trips: usize,
}

impl RunState {
    #[must_use]
    pub fn seeded(runbook_params: Value) -> Self {
        let mut state = Self::default();
        state.results.insert("runbook".to_string(), runbook_params);
        state
    }

    #[must_use]
    pub fn results_value(&self) -> Value {
        Value::Object(self.results.clone())
    }

    pub fn record(&mut self, record: StepRecord) {
        self.trail.push(record);
    }
}

/// Final result of one workflow run.
///
/// At most one of `action_taken`, `action_recommended` and `action_error`
/// is set. None set means the run completed without an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub runbook_id: String,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_recommended: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_error: Option<String>,
    pub steps: Vec<StepRecord>,
}

impl RunOutcome {
    #[must_use]
    pub fn new(runbook_id: &str, mode: ExecutionMode) -> Self {
        Self {
            runbook_id: runbook_id.to_string(),
            mode,
            action_taken: None,
            action_recommended: None,
            action_error: None,
            steps: Vec::new(),
        }
    }

    /// Short label for logs: `taken`, `recommended`, `error` or `noop`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        if self.action_error.is_some() {
            "error"
        } else if self.action_taken.is_some() {
            "taken"
        } else if self.action_recommended.is_some() {
            "recommended"
        } else {
            "noop"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let skipped = StepRecord::skipped("delete_pod", "when_false:pod_events.sandbox_failure_detected");
        assert_eq!(
            serde_json::to_value(&skipped).unwrap(),
            json!({
                "action_id": "delete_pod",
                "status": "skipped",
                "evidence": {"reason": "when_false:pod_events.sandbox_failure_detected"}
            })
        );
    }

    #[test]
    fn test_executed_status_follows_result() {
        let failed = ToolResult::failed("timeout");
        let record = StepRecord::executed("get_pod_events", "get_pod_events", json!({}), &failed);
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_outcome_kind() {
        let mut outcome = RunOutcome::new("RB_OOM", ExecutionMode::RecommendOnly);
        assert_eq!(outcome.kind(), "noop");
        outcome.action_recommended = Some("patch_memory_limit:a/b/c:1Gi->2Gi".to_string());
        assert_eq!(outcome.kind(), "recommended");
    }
}
