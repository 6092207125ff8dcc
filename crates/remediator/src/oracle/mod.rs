//! Decision oracle seam.
//!
//! The oracle proposes exactly one tool call per decision point. It is
//! untrusted: everything it returns is validated by the workflow policy
//! before anything runs.

mod deterministic;
mod openai;

pub use deterministic::DeterministicOracle;
pub use openai::OpenAIOracle;

use async_trait::async_trait;
use remediator_config::{OracleConfig, OracleProvider};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Everything the oracle sees for one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub runbook_id: String,
    /// Runbook step being decided; `None` in planner mode
    pub step_action_id: Option<String>,
    /// Tool names the oracle may choose from (may include `noop`)
    pub allowed_tools: Vec<String>,
    pub runbook_text: String,
    pub alert_context: Value,
    pub tool_results: Value,
}

/// One proposed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub reason: String,
}

impl Decision {
    #[must_use]
    pub fn new(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response contained no tool call")]
    NoToolCall,

    #[error("nonconforming tool call: {0}")]
    Nonconforming(String),

    #[error("{0} not set")]
    MissingApiKey(String),

    #[error("decision timed out after {0:?}")]
    Timeout(Duration),
}

/// A source of tool-call decisions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Provider name for logs and audit records.
    fn name(&self) -> &'static str;

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError>;
}

/// Build the configured oracle.
pub fn from_config(config: &OracleConfig) -> Result<Arc<dyn DecisionOracle>, OracleError> {
    match config.provider {
        OracleProvider::Openai => Ok(Arc::new(OpenAIOracle::from_config(config)?)),
        OracleProvider::Deterministic => Ok(Arc::new(DeterministicOracle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_defaults() {
        let d: Decision = serde_json::from_value(json!({"tool": "noop"})).unwrap();
        assert_eq!(d.tool, "noop");
        assert!(d.args.is_empty());
        assert_eq!(d.reason, "");
    }

    #[test]
    fn test_from_config_deterministic() {
        let config = OracleConfig {
            provider: OracleProvider::Deterministic,
            ..OracleConfig::default()
        };
        let oracle = from_config(&config).unwrap();
        assert_eq!(oracle.name(), "deterministic");
    }
}
