//! Runbook workflow executor.
//!
//! Drives one classified incident to a terminal outcome. Workflow runbooks
//! walk their gated steps in order; planner runbooks loop over their
//! declared actions for a bounded number of rounds. Every decision comes
//! from the oracle (or the deterministic override), is validated against
//! the decision point, and only then reaches the tool registry.

mod policy;
mod state;

pub use policy::{contain_args, DecisionPoint, Verdict};
pub use state::{RunOutcome, RunState, StepRecord, StepStatus};

use remediator_config::{ExecutionMode, RemediatorConfig};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::alerts::{AlertContext, RunbookId};
use crate::oracle::{Decision, DecisionOracle, DecisionRequest, OracleError};
use crate::runbook::{DriveMode, RunbookDefinition, RunbookStore};
use crate::tools::{ToolKind, ToolRegistry, ToolResult};

/// Rationale recorded when the oracle is bypassed.
const SINGLE_ACTION_RATIONALE: &str = "single_runbook_action";

/// Reasons a run ends without completing.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("runbook {0} not found")]
    RunbookNotFound(String),

    #[error("runbook has no workflow steps")]
    MissingWorkflow,

    #[error("runbook action {0} has no tool")]
    UnsupportedAction(String),

    #[error("decision oracle failed: {0}")]
    OracleFailed(String),

    #[error("oracle reply broke the tool-call contract: {0}")]
    NonconformingDecision(String),

    #[error("oracle chose {tool} for step {step}")]
    InvalidTool { step: String, tool: String },

    #[error("oracle declined required step {0}")]
    NoopForRequiredStep(String),

    #[error("oracle redirected pinned argument {0}")]
    InvalidArgs(String),

    #[error("decision budget exhausted")]
    MaxStepsExceeded,

    #[error("tool failed: {0}")]
    Tool(String),
}

impl WorkflowError {
    /// Stable code stored as `action_error`.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::RunbookNotFound(_) => "runbook_not_found".to_string(),
            Self::MissingWorkflow => "missing_workflow_in_runbook".to_string(),
            Self::UnsupportedAction(id) => format!("unsupported_runbook_action:{id}"),
            Self::OracleFailed(msg) => format!("llm_failed:{msg}"),
            Self::NonconformingDecision(detail) => format!("llm_nonconforming:{detail}"),
            Self::InvalidTool { step, tool } => format!("llm_invalid_tool_for_step:{step}:{tool}"),
            Self::NoopForRequiredStep(step) => format!("llm_noop_for_required_step:{step}"),
            Self::InvalidArgs(field) => format!("llm_invalid_args:{field}"),
            Self::MaxStepsExceeded => "max_tool_steps_exceeded".to_string(),
            Self::Tool(code) => code.clone(),
        }
    }
}

/// Executor knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub mode: ExecutionMode,
    pub max_steps: usize,
    pub planner_max_rounds: usize,
    pub deterministic_override: bool,
    pub oracle_timeout: Duration,
    pub noop_allowed_actions: BTreeSet<String>,
    pub unwired_actions: BTreeMap<String, BTreeSet<String>>,
}

impl WorkflowSettings {
    #[must_use]
    pub fn from_config(config: &RemediatorConfig) -> Self {
        let wf = &config.workflow;
        Self {
            mode: config.agent_mode,
            max_steps: wf.max_steps,
            planner_max_rounds: wf.planner_max_rounds,
            deterministic_override: wf.deterministic_override,
            oracle_timeout: Duration::from_secs(config.oracle.timeout_secs),
            noop_allowed_actions: wf.noop_allowed_actions.iter().cloned().collect(),
            unwired_actions: wf
                .unwired_actions
                .iter()
                .map(|(rb, ids)| (rb.clone(), ids.iter().cloned().collect()))
                .collect(),
        }
    }

    fn is_unwired(&self, runbook_id: &str, action_id: &str) -> bool {
        self.unwired_actions
            .get(runbook_id)
            .is_some_and(|ids| ids.contains(action_id))
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&RemediatorConfig::default())
    }
}

/// Result of one decision point.
enum Progress {
    /// Move on; carries the non-terminal tool that ran, if any
    Continue(Option<ToolKind>),
    Done(Completion),
}

/// How a run finished when no error occurred.
enum Completion {
    /// A terminal tool succeeded
    Action(ToolResult),
    /// Nothing left to do
    NoAction(String),
}

/// Everything fixed for the duration of one run.
struct Run<'a> {
    runbook: &'a RunbookDefinition,
    context: &'a AlertContext,
    alert_json: Value,
    state: RunState,
}

pub struct WorkflowExecutor {
    runbooks: Arc<RunbookStore>,
    oracle: Arc<dyn DecisionOracle>,
    tools: Arc<ToolRegistry>,
    settings: WorkflowSettings,
}

impl WorkflowExecutor {
    #[must_use]
    pub fn new(
        runbooks: Arc<RunbookStore>,
        oracle: Arc<dyn DecisionOracle>,
        tools: Arc<ToolRegistry>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            runbooks,
            oracle,
            tools,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Run the runbook to a terminal outcome. Never fails: every error is
    /// folded into `action_error` and the step trail.
    pub async fn run(&self, runbook_id: &str, context: &AlertContext) -> RunOutcome {
        let mut outcome = RunOutcome::new(runbook_id, self.settings.mode);

        if runbook_id == RunbookId::Unknown.as_str() {
            outcome
                .steps
                .push(StepRecord::skipped(ToolKind::NOOP, "no_runbook_for_alert"));
            info!(runbook_id, "Alert did not match a runbook");
            return outcome;
        }

        let Some(runbook) = self.runbooks.get(runbook_id) else {
            let err = WorkflowError::RunbookNotFound(runbook_id.to_string());
            warn!(runbook_id, "Runbook not found");
            outcome
                .steps
                .push(StepRecord::failed("load_runbook", err.code()));
            outcome.action_error = Some(err.code());
            return outcome;
        };

        let mut run = Run {
            runbook: &runbook,
            context,
            alert_json: context.to_json(),
            state: RunState::seeded(runbook.seed_params()),
        };

        info!(
            runbook_id,
            mode = %self.settings.mode,
            drive = ?runbook.mode,
            namespace = %context.namespace,
            pod = %context.pod,
            node = %context.node,
            "Workflow started"
        );

        let result = match runbook.mode {
            DriveMode::Workflow => self.run_steps(&mut run).await,
            DriveMode::Planner => self.run_planner(&mut run).await,
        };

        match result {
            Ok(Completion::Action(tool_result)) => {
                let description = tool_result.action.clone().or_else(|| {
                    tool_result
                        .evidence
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                if self.settings.mode.is_apply() && !tool_result.noop {
                    outcome.action_taken = description;
                } else {
                    outcome.action_recommended = description;
                }
            }
            Ok(Completion::NoAction(reason)) => {
                run.state.record(StepRecord {
                    status: StepStatus::Ok,
                    evidence: Some(json!({ "reason": reason })),
                    ..StepRecord::skipped(ToolKind::NOOP, "")
                });
            }
            Err(err) => outcome.action_error = Some(err.code()),
        }
        outcome.steps = run.state.trail;

        info!(
            runbook_id,
            outcome = outcome.kind(),
            action_taken = outcome.action_taken.as_deref().unwrap_or(""),
            action_recommended = outcome.action_recommended.as_deref().unwrap_or(""),
            action_error = outcome.action_error.as_deref().unwrap_or(""),
            steps = outcome.steps.len(),
            "Workflow finished"
        );
        outcome
    }

    /// Ordered, gated steps.
    async fn run_steps(&self, run: &mut Run<'_>) -> Result<Completion, WorkflowError> {
        let runbook = run.runbook;
        if runbook.steps.is_empty() {
            run.state
                .record(StepRecord::failed("load_workflow", WorkflowError::MissingWorkflow.code()));
            return Err(WorkflowError::MissingWorkflow);
        }

        for step in &runbook.steps {
            let action_id = step.action_id.as_str();

            if let Some(path) = step.gate.first_unmet(&run.state.results_value()) {
                debug!(action_id, path, "Gate not met, skipping step");
                run.state
                    .record(StepRecord::skipped(action_id, format!("when_false:{path}")));
                continue;
            }

            let Some(expected) = ToolKind::for_action(action_id) else {
                if self.settings.is_unwired(&runbook.id, action_id) {
                    run.state.record(StepRecord::skipped(
                        action_id,
                        "unsupported_action_not_wired_yet",
                    ));
                    continue;
                }
                let err = WorkflowError::UnsupportedAction(action_id.to_string());
                run.state.record(StepRecord::failed(action_id, err.code()));
                return Err(err);
            };

            let point = DecisionPoint::Step {
                action_id: action_id.to_string(),
                expected,
                noop_allowed: step.optional || self.settings.noop_allowed_actions.contains(action_id),
            };
            if let Progress::Done(done) = self.decide_and_execute(run, &point, action_id).await? {
                return Ok(done);
            }
        }

        Ok(Completion::NoAction(
            "workflow_completed_without_action".to_string(),
        ))
    }

    /// Bounded loop over the runbook's declared actions.
    async fn run_planner(&self, run: &mut Run<'_>) -> Result<Completion, WorkflowError> {
        let runbook = run.runbook;
        let mut candidates = Vec::new();
        for action_id in runbook.planner_actions() {
            match ToolKind::for_action(action_id) {
                Some(kind) if !candidates.contains(&kind) => candidates.push(kind),
                Some(_) => {}
                None if self.settings.is_unwired(&runbook.id, action_id) => {
                    debug!(action_id, "Planner ignores unwired action");
                }
                None => {
                    let err = WorkflowError::UnsupportedAction(action_id.to_string());
                    run.state.record(StepRecord::failed(action_id, err.code()));
                    return Err(err);
                }
            }
        }

        let mut spent: Vec<ToolKind> = Vec::new();
        for _ in 0..self.settings.planner_max_rounds {
            // a check that already ran has nothing new to say
            let reachable: Vec<ToolKind> = candidates
                .iter()
                .copied()
                .filter(|k| !spent.contains(k))
                .collect();
            if reachable.is_empty() {
                return Ok(Completion::NoAction("planner_actions_exhausted".to_string()));
            }

            let point = DecisionPoint::Planner {
                candidates: reachable,
            };
            match self.decide_and_execute(run, &point, "planner").await? {
                Progress::Done(done) => return Ok(done),
                Progress::Continue(Some(kind)) => spent.push(kind),
                Progress::Continue(None) => {}
            }
        }

        run.state
            .record(StepRecord::failed("planner", WorkflowError::MaxStepsExceeded.code()));
        Err(WorkflowError::MaxStepsExceeded)
    }

    /// Decide, validate and execute one decision point.
    async fn decide_and_execute(
        &self,
        run: &mut Run<'_>,
        point: &DecisionPoint,
        label: &str,
    ) -> Result<Progress, WorkflowError> {
        if run.state.round_trips >= self.settings.max_steps {
            run.state
                .record(StepRecord::failed(label, WorkflowError::MaxStepsExceeded.code()));
            return Err(WorkflowError::MaxStepsExceeded);
        }
        run.state.round_trips += 1;

        let decision = match self.decide(run, point).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(runbook_id = %run.runbook.id, step = label, error = %err, "Decision failed");
                let err = match err {
                    OracleError::Nonconforming(detail) => WorkflowError::NonconformingDecision(detail),
                    other => WorkflowError::OracleFailed(other.to_string()),
                };
                run.state.record(StepRecord::failed(label, err.code()));
                return Err(err);
            }
        };
        let decision_json = serde_json::to_value(&decision).unwrap_or(Value::Null);

        let validated = point.validate(&decision).and_then(|verdict| match verdict {
            Verdict::Call(kind) => contain_args(
                kind,
                &decision.args,
                run.context,
                run.runbook.fallback_image(),
            )
            .map(|args| Some((kind, args))),
            Verdict::Noop => Ok(None),
        });
        let (kind, args) = match validated {
            Ok(Some(call)) => call,
            Ok(None) => {
                info!(runbook_id = %run.runbook.id, step = label, reason = %decision.reason, "Oracle declined step");
                let reason = format!("oracle_noop:{}", decision.reason);
                run.state
                    .record(StepRecord::skipped(label, reason).with_decision(decision_json));
                return Ok(match point {
                    DecisionPoint::Step { .. } => Progress::Continue(None),
                    DecisionPoint::Planner { .. } => {
                        Progress::Done(Completion::NoAction("planner_noop".to_string()))
                    }
                });
            }
            Err(err) => {
                warn!(
                    runbook_id = %run.runbook.id,
                    step = label,
                    tool = %decision.tool,
                    error = %err.code(),
                    "Rejected decision"
                );
                run.state
                    .record(StepRecord::failed(label, err.code()).with_decision(decision_json));
                return Err(err);
            }
        };

        let result = self.tools.execute(kind, &args, self.settings.mode).await;
        let spec = kind.spec();
        run.state
            .results
            .insert(spec.result_key.to_string(), result.to_value());
        run.state
            .record(StepRecord::executed(label, spec.name, decision_json, &result));

        if !result.ok {
            let code = result.error.clone().unwrap_or_else(|| "tool_failed".to_string());
            return Err(WorkflowError::Tool(code));
        }
        if spec.terminal {
            return Ok(Progress::Done(Completion::Action(result)));
        }
        Ok(Progress::Continue(Some(kind)))
    }

    /// Ask the oracle, unless the decision point leaves no real choice.
    async fn decide(&self, run: &Run<'_>, point: &DecisionPoint) -> Result<Decision, OracleError> {
        if self.settings.deterministic_override {
            if let (DecisionPoint::Planner { .. }, Some(only)) = (point, point.single_candidate()) {
                debug!(tool = only.name(), "Deterministic override");
                return Ok(Decision::new(only.name(), SINGLE_ACTION_RATIONALE));
            }
        }

        let request = DecisionRequest {
            runbook_id: run.runbook.id.clone(),
            step_action_id: match point {
                DecisionPoint::Step { action_id, .. } => Some(action_id.clone()),
                DecisionPoint::Planner { .. } => None,
            },
            allowed_tools: point.allowed_tools(),
            runbook_text: run.runbook.text.clone(),
            alert_context: run.alert_json.clone(),
            tool_results: run.state.results_value(),
        };
        let timeout = self.settings.oracle_timeout;
        match tokio::time::timeout(timeout, self.oracle.decide(&request)).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Labels;
    use crate::oracle::MockDecisionOracle;
    use crate::runbook::{ActionDefinition, Gate, Step};
    use crate::tools::{ClusterApi, ClusterError, ToolSettings};
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
    use k8s_openapi::api::core::v1::{Event, Node, Pod};
    use remediator_config::ToolsConfig;
    use serde_json::Map;

    /// Cluster with no objects; only event listing and node reads answer.
    struct EmptyCluster;

    #[async_trait]
    impl ClusterApi for EmptyCluster {
        async fn get_pod(&self, _: &str, name: &str) -> Result<Pod, ClusterError> {
            Err(ClusterError::NotFound { kind: "pod", name: name.to_string() })
        }
        async fn get_replica_set(&self, _: &str, name: &str) -> Result<ReplicaSet, ClusterError> {
            Err(ClusterError::NotFound { kind: "replicaset", name: name.to_string() })
        }
        async fn get_deployment(&self, _: &str, name: &str) -> Result<Deployment, ClusterError> {
            Err(ClusterError::NotFound { kind: "deployment", name: name.to_string() })
        }
        async fn patch_deployment(&self, _: &str, _: &str, _: &Value) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn list_pod_events(&self, _: &str, _: &str) -> Result<Vec<Event>, ClusterError> {
            Ok(Vec::new())
        }
        async fn delete_pod(&self, _: &str, _: &str) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
            Ok(serde_json::from_value(json!({"metadata": {"name": name}})).unwrap())
        }
        async fn patch_node(&self, _: &str, _: &Value) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn list_pods_on_node(&self, _: &str) -> Result<Vec<Pod>, ClusterError> {
            Ok(Vec::new())
        }
        async fn evict_pod(&self, _: &str, _: &str, _: u32) -> Result<(), ClusterError> {
            Ok(())
        }
    }

    fn runbook(id: &str, mode: DriveMode, steps: Vec<Step>, actions: &[&str]) -> RunbookDefinition {
        RunbookDefinition {
            id: id.to_string(),
            title: String::new(),
            description: String::new(),
            mode,
            steps,
            actions: actions
                .iter()
                .map(|a| ActionDefinition {
                    action_id: (*a).to_string(),
                    description: String::new(),
                    command: String::new(),
                    conditions: Value::Null,
                    params: Map::new(),
                })
                .collect(),
            text: "procedure".to_string(),
        }
    }

    fn executor(rb: RunbookDefinition, oracle: MockDecisionOracle, mode: ExecutionMode) -> WorkflowExecutor {
        let tools = ToolRegistry::new(
            Arc::new(EmptyCluster),
            ToolSettings::from_config(&ToolsConfig::default()).unwrap(),
        );
        let settings = WorkflowSettings {
            mode,
            ..WorkflowSettings::default()
        };
        WorkflowExecutor::new(
            Arc::new(RunbookStore::from_definitions([rb])),
            Arc::new(oracle),
            Arc::new(tools),
            settings,
        )
    }

    fn context() -> AlertContext {
        let labels: Labels = [("namespace", "ns1"), ("pod", "p1"), ("node", "n1")]
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AlertContext::from_labels(labels, &ToolsConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_runbook_is_noop() {
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("get_pod_events")], &[]),
            MockDecisionOracle::new(),
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_UNKNOWN", &context()).await;
        assert_eq!(outcome.kind(), "noop");
        let outcome = exec.run("RB_MISSING", &context()).await;
        assert_eq!(outcome.action_error.as_deref(), Some("runbook_not_found"));
    }

    #[tokio::test]
    async fn test_gate_missing_path_skips_without_oracle() {
        let steps = vec![Step::new("delete_pod").gated(Gate::all(["pod_events.sandbox_failure_detected"]))];
        let mut oracle = MockDecisionOracle::new();
        oracle.expect_decide().never();
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, steps, &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(outcome.kind(), "noop");
        assert_eq!(outcome.steps[0].status, StepStatus::Skipped);
        assert_eq!(
            outcome.steps[0].evidence,
            Some(json!({"reason": "when_false:pod_events.sandbox_failure_detected"}))
        );
        assert_eq!(
            outcome.steps.last().unwrap().evidence,
            Some(json!({"reason": "workflow_completed_without_action"}))
        );
    }

    #[tokio::test]
    async fn test_noop_for_required_step_aborts() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .times(1)
            .returning(|_| Ok(Decision::new("noop", "not sure")));
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("delete_pod")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(
            outcome.action_error.as_deref(),
            Some("llm_noop_for_required_step:delete_pod")
        );
        assert!(outcome.action_taken.is_none());
    }

    #[tokio::test]
    async fn test_optional_step_noop_continues() {
        let mut oracle = MockDecisionOracle::new();
        oracle.expect_decide().returning(|req| {
            Ok(match req.step_action_id.as_deref() {
                Some("get_pod_events") => Decision::new("noop", "enough context"),
                _ => Decision::new("delete_pod", "recreate"),
            })
        });
        let steps = vec![Step::new("get_pod_events").optional(), Step::new("delete_pod")];
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, steps, &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(outcome.action_taken.as_deref(), Some("delete_pod:ns1/p1"));
        assert_eq!(outcome.steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_wrong_tool_aborts() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .returning(|_| Ok(Decision::new("drain_node", "")));
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("get_pod_events")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(
            outcome.action_error.as_deref(),
            Some("llm_invalid_tool_for_step:get_pod_events:drain_node")
        );
    }

    #[tokio::test]
    async fn test_oracle_error_aborts() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .returning(|_| Err(OracleError::NoToolCall));
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("get_pod_events")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(
            outcome.action_error.as_deref(),
            Some("llm_failed:response contained no tool call")
        );
    }

    #[tokio::test]
    async fn test_nonconforming_reply_aborts() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .returning(|_| Err(OracleError::Nonconforming("missing reason".to_string())));
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("get_pod_events")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(
            outcome.action_error.as_deref(),
            Some("llm_nonconforming:missing reason")
        );
    }

    #[tokio::test]
    async fn test_unsupported_and_unwired_actions() {
        let mut oracle = MockDecisionOracle::new();
        oracle.expect_decide().never();
        let exec = executor(
            runbook("RB_CRASHLOOP", DriveMode::Workflow, vec![Step::new("rollback_deployment")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_CRASHLOOP", &context()).await;
        assert!(outcome.action_error.is_none());
        assert_eq!(
            outcome.steps[0].evidence,
            Some(json!({"reason": "unsupported_action_not_wired_yet"}))
        );

        let mut oracle = MockDecisionOracle::new();
        oracle.expect_decide().never();
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("rollback_deployment")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(
            outcome.action_error.as_deref(),
            Some("unsupported_runbook_action:rollback_deployment")
        );
    }

    #[tokio::test]
    async fn test_tool_failure_aborts() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .returning(|_| Ok(Decision::new("increase_memory_limit", "")));
        let exec = executor(
            runbook("RB_X", DriveMode::Workflow, vec![Step::new("increase_memory_limit")], &[]),
            oracle,
            ExecutionMode::Apply,
        );
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(outcome.action_error.as_deref(), Some("not_found:pod/p1"));
        assert_eq!(outcome.steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_planner_single_action_skips_oracle() {
        let mut oracle = MockDecisionOracle::new();
        oracle.expect_decide().never();
        let exec = executor(
            runbook("RB_NODE", DriveMode::Planner, vec![], &["cordon_node"]),
            oracle,
            ExecutionMode::RecommendOnly,
        );
        let outcome = exec.run("RB_NODE", &context()).await;
        // cordon is not terminal; the candidate set empties and the run completes
        assert_eq!(outcome.kind(), "noop");
        assert_eq!(
            outcome.steps[0].decision.as_ref().unwrap()["reason"],
            SINGLE_ACTION_RATIONALE
        );
        assert_eq!(
            outcome.steps.last().unwrap().evidence,
            Some(json!({"reason": "planner_actions_exhausted"}))
        );
    }

    #[tokio::test]
    async fn test_planner_noop_ends_run() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .times(1)
            .returning(|_| Ok(Decision::new("noop", "healthy")));
        let exec = executor(
            runbook("RB_NODE", DriveMode::Planner, vec![], &["get_node_ready", "drain_node"]),
            oracle,
            ExecutionMode::RecommendOnly,
        );
        let outcome = exec.run("RB_NODE", &context()).await;
        assert_eq!(outcome.kind(), "noop");
        assert!(outcome.action_error.is_none());
    }

    #[tokio::test]
    async fn test_planner_terminal_recommendation() {
        let mut oracle = MockDecisionOracle::new();
        oracle.expect_decide().returning(|req| {
            let tool = if req.allowed_tools.iter().any(|t| t == "get_node_ready") {
                "get_node_ready"
            } else {
                "drain_node"
            };
            Ok(Decision::new(tool, ""))
        });
        let exec = executor(
            runbook("RB_NODE", DriveMode::Planner, vec![], &["get_node_ready", "drain_node"]),
            oracle,
            ExecutionMode::RecommendOnly,
        );
        let outcome = exec.run("RB_NODE", &context()).await;
        assert_eq!(outcome.action_recommended.as_deref(), Some("drain_node:n1:evict=0"));
        assert!(outcome.action_taken.is_none());
    }

    #[tokio::test]
    async fn test_step_budget() {
        let mut oracle = MockDecisionOracle::new();
        oracle
            .expect_decide()
            .returning(|_| Ok(Decision::new("get_node_ready", "")));
        let mut exec = executor(
            runbook(
                "RB_X",
                DriveMode::Workflow,
                vec![Step::new("get_node_ready"), Step::new("get_node_ready")],
                &[],
            ),
            oracle,
            ExecutionMode::Apply,
        );
        exec.settings.max_steps = 1;
        let outcome = exec.run("RB_X", &context()).await;
        assert_eq!(outcome.action_error.as_deref(), Some("max_tool_steps_exceeded"));
    }
}
