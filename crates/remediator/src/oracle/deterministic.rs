//! Offline oracle that always takes the first allowed action.

use async_trait::async_trait;

use super::{Decision, DecisionOracle, DecisionRequest, OracleError};
use crate::tools::ToolKind;

/// Picks the first allowed non-noop tool, or `noop` when there is none.
///
/// Arguments are left empty; the executor fills them from the alert context.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicOracle;

#[async_trait]
impl DecisionOracle for DeterministicOracle {
    fn name(&self) -> &'static str {
        "deterministic"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        let choice = request
            .allowed_tools
            .iter()
            .find(|t| t.as_str() != ToolKind::NOOP);
        Ok(match choice {
            Some(tool) => Decision::new(tool.clone(), "first_allowed_action"),
            None => Decision::new(ToolKind::NOOP, "no_allowed_action"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(allowed: &[&str]) -> DecisionRequest {
        DecisionRequest {
            runbook_id: "RB_OOM".to_string(),
            step_action_id: None,
            allowed_tools: allowed.iter().map(ToString::to_string).collect(),
            runbook_text: String::new(),
            alert_context: json!({}),
            tool_results: json!({}),
        }
    }

    #[tokio::test]
    async fn test_skips_noop() {
        let d = DeterministicOracle
            .decide(&request(&["noop", "check_oom", "increase_memory_limit"]))
            .await
            .unwrap();
        assert_eq!(d.tool, "check_oom");
    }

    #[tokio::test]
    async fn test_only_noop() {
        let d = DeterministicOracle.decide(&request(&["noop"])).await.unwrap();
        assert_eq!(d.tool, "noop");
    }
}
