//! Remediator process configuration.
//!
//! Configuration is layered: built-in defaults, then an optional JSON file,
//! then environment overrides. The result is validated once at startup and
//! passed down explicitly; nothing here is global.

mod mode;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub use mode::ExecutionMode;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level configuration for the remediation controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemediatorConfig {
    /// Cluster name recorded on every alert-received event
    pub cluster_name: String,
    /// Whether remediation tools mutate the cluster or only recommend
    pub agent_mode: ExecutionMode,
    /// Directory holding `RB_*.md` runbook definitions
    pub runbooks_dir: PathBuf,
    pub server: ServerConfig,
    pub oracle: OracleConfig,
    pub workflow: WorkflowConfig,
    pub tools: ToolsConfig,
    pub ledger: LedgerConfig,
}

impl Default for RemediatorConfig {
    fn default() -> Self {
        Self {
            cluster_name: "unknown".to_string(),
            agent_mode: ExecutionMode::RecommendOnly,
            runbooks_dir: PathBuf::from("runbooks"),
            server: ServerConfig::default(),
            oracle: OracleConfig::default(),
            workflow: WorkflowConfig::default(),
            tools: ToolsConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub addr: String,
    /// Upper bound on a whole webhook request, workflows included
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 900,
        }
    }
}

/// Which decision oracle backs the workflow executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleProvider {
    /// OpenAI-compatible chat completions with required tool calls
    #[default]
    Openai,
    /// Always proposes the permitted tool with no extra arguments
    Deterministic,
}

/// Decision oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Openai,
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Workflow executor policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowConfig {
    /// Maximum decision/tool round-trips in one run
    pub max_steps: usize,
    /// Maximum oracle rounds for planner-driven runbooks
    pub planner_max_rounds: usize,
    /// Skip the oracle when exactly one non-noop action is reachable
    pub deterministic_override: bool,
    /// Action ids whose step may be declined by the oracle with `noop`
    pub noop_allowed_actions: Vec<String>,
    /// Runbook id -> action ids that are declared but intentionally not wired
    pub unwired_actions: BTreeMap<String, Vec<String>>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            planner_max_rounds: 3,
            deterministic_override: true,
            noop_allowed_actions: [
                "get_pod_events",
                "check_imagepullbackoff",
                "check_oom",
                "get_node_ready",
                "get_node_conditions",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            unwired_actions: BTreeMap::from([(
                "RB_CRASHLOOP".to_string(),
                vec![
                    "rollback_deployment".to_string(),
                    "increase_resources".to_string(),
                ],
            )]),
        }
    }
}

/// Remediation tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    /// Per-call bound for every cluster-facing tool except drain
    pub timeout_secs: u64,
    /// Default number of events returned by `get_pod_events`
    pub events_limit: u32,
    pub default_namespace: String,
    pub default_container: String,
    pub memory: MemoryPolicyConfig,
    pub drain: DrainConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            events_limit: 25,
            default_namespace: "default".to_string(),
            default_container: "app".to_string(),
            memory: MemoryPolicyConfig::default(),
            drain: DrainConfig::default(),
        }
    }
}

/// Memory limit sizing policy (quantities use Kubernetes notation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryPolicyConfig {
    pub floor: String,
    pub multiplier: f64,
    pub ceiling: String,
}

impl Default for MemoryPolicyConfig {
    fn default() -> Self {
        Self {
            floor: "256Mi".to_string(),
            multiplier: 2.0,
            ceiling: "4Gi".to_string(),
        }
    }
}

/// Node drain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainConfig {
    pub timeout_secs: u64,
    /// Ceiling for a `timeout_seconds` argument proposed by the oracle
    pub max_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub grace_period_seconds: u32,
    /// Pods in this namespace are never evicted
    pub protected_namespace: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_timeout_secs: 900,
            poll_interval_secs: 5,
            grace_period_seconds: 30,
            protected_namespace: "kube-system".to_string(),
        }
    }
}

/// Incident ledger settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerConfig {
    /// Postgres URL; when unset the in-memory ledger is used
    pub database_url: Option<String>,
}

impl RemediatorConfig {
    /// Load configuration: defaults, then the JSON file (if any), then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("CLUSTER_NAME").filter(|v| !v.is_empty()) {
            self.cluster_name = name;
        }
        if let Some(raw) = lookup("AGENT_MODE") {
            match raw.parse::<ExecutionMode>() {
                Ok(mode) => self.agent_mode = mode,
                Err(_) => debug!(value = %raw, "ignoring unrecognized AGENT_MODE"),
            }
        }
        if let Some(dir) = lookup("RUNBOOKS_DIR").filter(|v| !v.is_empty()) {
            self.runbooks_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|v| !v.is_empty()) {
            self.oracle.model = model;
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.ledger.database_url = Some(url);
        }
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow.max_steps == 0 {
            return Err(ConfigError::invalid("workflow.maxSteps", "must be at least 1"));
        }
        if self.workflow.planner_max_rounds == 0 {
            return Err(ConfigError::invalid(
                "workflow.plannerMaxRounds",
                "must be at least 1",
            ));
        }
        if !(self.tools.memory.multiplier > 1.0 && self.tools.memory.multiplier.is_finite()) {
            return Err(ConfigError::invalid(
                "tools.memory.multiplier",
                format!("must be a finite value above 1.0, got {}", self.tools.memory.multiplier),
            ));
        }
        if self.tools.timeout_secs == 0 || self.oracle.timeout_secs == 0 {
            return Err(ConfigError::invalid("timeoutSecs", "timeouts must be non-zero"));
        }
        if self.tools.drain.timeout_secs > self.tools.drain.max_timeout_secs {
            return Err(ConfigError::invalid(
                "tools.drain.timeoutSecs",
                "must not exceed tools.drain.maxTimeoutSecs",
            ));
        }
        if self.tools.drain.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "tools.drain.pollIntervalSecs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
