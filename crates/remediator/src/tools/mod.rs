//! Remediation tool catalog.
//!
//! A closed set of diagnostic and remediation operations. Each tool is
//! described by a static [`ToolSpec`] and dispatched by [`ToolRegistry`],
//! which validates arguments, enforces the per-call timeout and folds every
//! failure into a [`ToolResult`] with a stable error code.

mod cluster;
pub mod drain;
mod kube_cluster;
pub mod nodes;
pub mod pods;
pub mod quantity;

pub use cluster::{ClusterApi, ClusterError};
pub use kube_cluster::KubeCluster;
pub use quantity::{MemoryPolicy, MemorySizing};

use remediator_config::{ExecutionMode, ToolsConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound on the `limit` argument of event listings.
pub const MAX_EVENTS_LIMIT: u32 = 200;

/// Tool failures. Converted to [`ToolResult::failed`] at the registry boundary.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingRequiredParams(Vec<&'static str>),

    #[error("pod is not owned by a deployment")]
    PodNotOwnedByDeployment,

    #[error("container has no memory limit to scale")]
    MissingCurrentMemoryLimit,

    #[error("invalid memory quantity: {0:?}")]
    InvalidQuantity(String),

    #[error("invalid tool policy: {0}")]
    InvalidPolicy(String),

    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl ToolError {
    /// Stable error code recorded in results and outcomes.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::MissingRequiredParams(_) => "missing_required_params".to_string(),
            Self::PodNotOwnedByDeployment => "pod_not_owned_by_deployment".to_string(),
            Self::MissingCurrentMemoryLimit => "missing_current_memory_limit".to_string(),
            Self::InvalidQuantity(q) => format!("invalid_quantity:{q}"),
            Self::InvalidPolicy(msg) => format!("invalid_policy:{msg}"),
            Self::Timeout(_) => "timeout".to_string(),
            Self::Cluster(e) => e.code(),
        }
    }
}

/// The closed set of tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    GetPodEvents,
    #[serde(rename = "check_imagepullbackoff")]
    CheckImagePullBackOff,
    CheckOom,
    #[serde(rename = "fix_imagepullbackoff")]
    FixImagePullBackOff,
    IncreaseMemoryLimit,
    DeletePod,
    GetNodeReady,
    GetNodeConditions,
    UncordonNode,
    CordonNode,
    DrainNode,
}

/// Static description of one tool.
#[derive(Debug)]
pub struct ToolSpec {
    pub kind: ToolKind,
    pub name: &'static str,
    pub required: &'static [&'static str],
    /// Key the result is stored under in the run state
    pub result_key: &'static str,
    /// A successful call ends the workflow with an action
    pub terminal: bool,
    /// The tool changes cluster state in `apply` mode
    pub mutating: bool,
}

const POD_ARGS: &[&str] = &["namespace", "pod"];
const CONTAINER_ARGS: &[&str] = &["namespace", "pod", "container"];
const NODE_ARGS: &[&str] = &["node"];

static TOOL_SPECS: [ToolSpec; 11] = [
    ToolSpec {
        kind: ToolKind::GetPodEvents,
        name: "get_pod_events",
        required: POD_ARGS,
        result_key: "pod_events",
        terminal: false,
        mutating: false,
    },
    ToolSpec {
        kind: ToolKind::CheckImagePullBackOff,
        name: "check_imagepullbackoff",
        required: POD_ARGS,
        result_key: "imagepull",
        terminal: false,
        mutating: false,
    },
    ToolSpec {
        kind: ToolKind::CheckOom,
        name: "check_oom",
        required: POD_ARGS,
        result_key: "oom",
        terminal: false,
        mutating: false,
    },
    ToolSpec {
        kind: ToolKind::FixImagePullBackOff,
        name: "fix_imagepullbackoff",
        required: &["namespace", "pod", "container", "fallback_image"],
        result_key: "image_fix",
        terminal: true,
        mutating: true,
    },
    ToolSpec {
        kind: ToolKind::IncreaseMemoryLimit,
        name: "increase_memory_limit",
        required: CONTAINER_ARGS,
        result_key: "memory_limit",
        terminal: true,
        mutating: true,
    },
    ToolSpec {
        kind: ToolKind::DeletePod,
        name: "delete_pod",
        required: POD_ARGS,
        result_key: "pod_delete",
        terminal: true,
        mutating: true,
    },
    ToolSpec {
        kind: ToolKind::GetNodeReady,
        name: "get_node_ready",
        required: NODE_ARGS,
        result_key: "node_ready",
        terminal: false,
        mutating: false,
    },
    ToolSpec {
        kind: ToolKind::GetNodeConditions,
        name: "get_node_conditions",
        required: NODE_ARGS,
        result_key: "node_conditions",
        terminal: false,
        mutating: false,
    },
    ToolSpec {
        kind: ToolKind::UncordonNode,
        name: "uncordon_node",
        required: NODE_ARGS,
        result_key: "uncordon",
        terminal: true,
        mutating: true,
    },
    ToolSpec {
        kind: ToolKind::CordonNode,
        name: "cordon_node",
        required: NODE_ARGS,
        result_key: "cordon",
        terminal: false,
        mutating: true,
    },
    ToolSpec {
        kind: ToolKind::DrainNode,
        name: "drain_node",
        required: NODE_ARGS,
        result_key: "drain",
        terminal: true,
        mutating: true,
    },
];

impl ToolKind {
    /// Name of the synthetic "do nothing" decision.
    pub const NOOP: &'static str = "noop";

    #[must_use]
    pub fn all() -> impl Iterator<Item = ToolKind> {
        TOOL_SPECS.iter().map(|spec| spec.kind)
    }

    #[must_use]
    pub fn spec(self) -> &'static ToolSpec {
        // TOOL_SPECS is declared in enum order
        &TOOL_SPECS[self as usize]
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Resolve a runbook action id to the tool that implements it.
    #[must_use]
    pub fn for_action(action_id: &str) -> Option<ToolKind> {
        match action_id.trim() {
            "patch_image" => Some(Self::FixImagePullBackOff),
            other => other.parse().ok(),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TOOL_SPECS
            .iter()
            .find(|spec| spec.name == s)
            .map(|spec| spec.kind)
            .ok_or_else(|| format!("unknown tool: {s}"))
    }
}

/// Named tool arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Non-empty string argument. Numbers are rendered as strings.
    #[must_use]
    pub fn str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Integer argument, accepting numeric strings.
    #[must_use]
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn missing(&self, required: &'static [&'static str]) -> Vec<&'static str> {
        required
            .iter()
            .copied()
            .filter(|key| self.str(key).is_none())
            .collect()
    }

    fn required(&self, key: &str) -> Result<String, ToolError> {
        self.str(key)
            .ok_or_else(|| ToolError::MissingRequiredParams(vec![]))
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for ToolArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Structured result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    /// Human-readable description of the effect (performed or proposed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Mode the call actually ran in; absent for read-only tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Success without a change (e.g. limit already at the ceiling)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub noop: bool,
    /// Operation-specific evidence
    #[serde(flatten)]
    pub evidence: Map<String, Value>,
}

impl ToolResult {
    /// Successful read-only check carrying evidence (a JSON object).
    #[must_use]
    pub fn evidence(evidence: Value) -> Self {
        Self {
            ok: true,
            action: None,
            mode: None,
            error: None,
            noop: false,
            evidence: into_object(evidence),
        }
    }

    /// Successful (or proposed) action.
    #[must_use]
    pub fn action(action: String, mode: ExecutionMode) -> Self {
        Self {
            ok: true,
            action: Some(action),
            mode: Some(mode),
            error: None,
            noop: false,
            evidence: Map::new(),
        }
    }

    #[must_use]
    pub fn failed(code: impl Into<String>) -> Self {
        Self {
            ok: false,
            action: None,
            mode: None,
            error: Some(code.into()),
            noop: false,
            evidence: Map::new(),
        }
    }

    #[must_use]
    pub fn with_evidence(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }

    /// Merge the fields of a JSON object into the evidence.
    #[must_use]
    pub fn merge_evidence(mut self, value: Value) -> Self {
        self.evidence.extend(into_object(value));
        self
    }

    /// JSON form stored in the run state and step trail.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Drain behaviour knobs.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub timeout: Duration,
    pub max_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period_seconds: u32,
    pub protected_namespace: String,
}

/// Resolved tool configuration.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub call_timeout: Duration,
    pub events_limit: u32,
    pub memory: MemoryPolicy,
    pub drain: DrainSettings,
}

impl ToolSettings {
    pub fn from_config(config: &ToolsConfig) -> Result<Self, ToolError> {
        Ok(Self {
            call_timeout: Duration::from_secs(config.timeout_secs),
            events_limit: config.events_limit.clamp(1, MAX_EVENTS_LIMIT),
            memory: MemoryPolicy::from_config(&config.memory)?,
            drain: DrainSettings {
                timeout: Duration::from_secs(config.drain.timeout_secs),
                max_timeout: Duration::from_secs(config.drain.max_timeout_secs),
                poll_interval: Duration::from_secs(config.drain.poll_interval_secs),
                grace_period_seconds: config.drain.grace_period_seconds,
                protected_namespace: config.drain.protected_namespace.clone(),
            },
        })
    }
}

/// Dispatches tool calls against a cluster.
pub struct ToolRegistry {
    cluster: Arc<dyn ClusterApi>,
    settings: ToolSettings,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, settings: ToolSettings) -> Self {
        Self { cluster, settings }
    }

    pub fn from_config(
        cluster: Arc<dyn ClusterApi>,
        config: &ToolsConfig,
    ) -> Result<Self, ToolError> {
        Ok(Self::new(cluster, ToolSettings::from_config(config)?))
    }

    /// Run one tool. Never fails: errors come back as `ok=false` results.
    pub async fn execute(&self, kind: ToolKind, args: &ToolArgs, mode: ExecutionMode) -> ToolResult {
        let spec = kind.spec();
        let missing = args.missing(spec.required);
        if !missing.is_empty() {
            warn!(tool = spec.name, missing = ?missing, "Tool call missing required parameters");
            return ToolResult::failed(ToolError::MissingRequiredParams(missing).code());
        }

        let started = Instant::now();
        let budget = self.call_budget(kind);
        let outcome = match tokio::time::timeout(budget, self.dispatch(kind, args, mode)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(budget)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                info!(
                    tool = spec.name,
                    ok = result.ok,
                    mode = %mode,
                    noop = result.noop,
                    action = result.action.as_deref().unwrap_or(""),
                    latency_ms,
                    "Tool call finished"
                );
                result
            }
            Err(e) => {
                warn!(tool = spec.name, error = %e, latency_ms, "Tool call failed");
                ToolResult::failed(e.code())
            }
        }
    }

    fn call_budget(&self, kind: ToolKind) -> Duration {
        match kind {
            // drain polls for up to its own timeout; leave room for the evictions
            ToolKind::DrainNode => self.settings.drain.max_timeout + self.settings.call_timeout,
            _ => self.settings.call_timeout,
        }
    }

    async fn dispatch(
        &self,
        kind: ToolKind,
        args: &ToolArgs,
        mode: ExecutionMode,
    ) -> Result<ToolResult, ToolError> {
        let cluster = self.cluster.as_ref();
        let s = &self.settings;
        match kind {
            ToolKind::GetPodEvents => {
                let limit = args
                    .int("limit")
                    .map_or(s.events_limit, |l| l.clamp(1, i64::from(MAX_EVENTS_LIMIT)) as u32);
                pods::get_pod_events(cluster, &args.required("namespace")?, &args.required("pod")?, limit).await
            }
            ToolKind::CheckImagePullBackOff => {
                pods::check_imagepullbackoff(
                    cluster,
                    &args.required("namespace")?,
                    &args.required("pod")?,
                    args.str("container").as_deref(),
                )
                .await
            }
            ToolKind::CheckOom => {
                pods::check_oom(
                    cluster,
                    &args.required("namespace")?,
                    &args.required("pod")?,
                    args.str("container").as_deref(),
                )
                .await
            }
            ToolKind::FixImagePullBackOff => {
                pods::fix_imagepullbackoff(
                    cluster,
                    &pods::ContainerTarget::from_args(args)?,
                    &args.required("fallback_image")?,
                    mode,
                )
                .await
            }
            ToolKind::IncreaseMemoryLimit => {
                pods::increase_memory_limit(
                    cluster,
                    &pods::ContainerTarget::from_args(args)?,
                    &s.memory,
                    mode,
                )
                .await
            }
            ToolKind::DeletePod => {
                pods::delete_pod(cluster, &args.required("namespace")?, &args.required("pod")?, mode).await
            }
            ToolKind::GetNodeReady => nodes::get_node_ready(cluster, &args.required("node")?).await,
            ToolKind::GetNodeConditions => {
                nodes::get_node_conditions(cluster, &args.required("node")?).await
            }
            ToolKind::UncordonNode => {
                nodes::set_unschedulable(cluster, &args.required("node")?, false, mode).await
            }
            ToolKind::CordonNode => {
                nodes::set_unschedulable(cluster, &args.required("node")?, true, mode).await
            }
            ToolKind::DrainNode => {
                let timeout = args.int("timeout_seconds").map_or(s.drain.timeout, |t| {
                    Duration::from_secs(t.max(1) as u64).min(s.drain.max_timeout)
                });
                drain::drain_node(cluster, &args.required("node")?, &s.drain, timeout, mode).await
            }
        }
    }
}
