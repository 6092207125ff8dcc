//! OpenAI chat-completions oracle using forced tool calls.

use async_trait::async_trait;
use remediator_config::OracleConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use super::{Decision, DecisionOracle, DecisionRequest, OracleError};
use crate::tools::ToolKind;

/// Default API base
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Default model
const DEFAULT_MODEL: &str = "gpt-4o";

const SYSTEM_PROMPT: &str = "You are a Kubernetes remediation agent following a runbook. \
Call exactly one of the provided tools. Only use tools that are offered. \
Fill arguments from the alert context and prior tool results. \
Put a short justification in the `reason` argument.";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct ToolDef {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionDef,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolDef>,
    tool_choice: &'static str,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

/// Decision oracle backed by the OpenAI chat-completions API.
pub struct OpenAIOracle {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAIOracle {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: Some(api_key.into()),
            base_url: OPENAI_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Build from configuration. A missing key only fails at decision time.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OracleError::Request(e.to_string()))?;
        Ok(Self {
            client,
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        })
    }

    /// Set a custom base URL (proxies, compatible gateways).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &DecisionRequest) -> ChatRequest {
        let context = json!({
            "runbook_id": request.runbook_id,
            "step_action_id": request.step_action_id,
            "allowed_tools": request.allowed_tools,
            "alert_context": request.alert_context,
            "tool_results": request.tool_results,
        });
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!(
                        "Runbook:\n{}\n\nContext:\n{}",
                        request.runbook_text,
                        serde_json::to_string_pretty(&context).unwrap_or_default()
                    ),
                },
            ],
            tools: request.allowed_tools.iter().map(|t| tool_def(t)).collect(),
            tool_choice: "required",
            temperature: 0.0,
        }
    }
}

/// Function schema for one allowed tool.
fn tool_def(name: &str) -> ToolDef {
    let mut properties = Map::new();
    properties.insert("reason".to_string(), json!({"type": "string"}));
    let mut required = vec![Value::from("reason")];
    let description = match ToolKind::for_action(name) {
        Some(kind) => {
            for arg in kind.spec().required {
                properties.insert((*arg).to_string(), json!({"type": "string"}));
                required.push(Value::from(*arg));
            }
            match kind {
                ToolKind::GetPodEvents => {
                    properties.insert("limit".to_string(), json!({"type": "integer"}));
                }
                ToolKind::DrainNode => {
                    properties.insert("timeout_seconds".to_string(), json!({"type": "integer"}));
                }
                _ => {}
            }
            format!("Run the {name} remediation tool")
        }
        None => "Take no action".to_string(),
    };
    ToolDef {
        tool_type: "function",
        function: FunctionDef {
            name: name.to_string(),
            description,
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        },
    }
}

/// Strictly extract the single tool call from a response body.
///
/// Exactly one call is accepted, and it must carry a string `reason`.
fn parse_decision(body: &str) -> Result<Decision, OracleError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| OracleError::Malformed(e.to_string()))?;
    let mut calls = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.tool_calls)
        .unwrap_or_default();
    if calls.len() > 1 {
        return Err(OracleError::Nonconforming(format!(
            "{} tool calls in one reply",
            calls.len()
        )));
    }
    let call = calls.pop().ok_or(OracleError::NoToolCall)?;

    let mut args = match serde_json::from_str::<Value>(&call.function.arguments) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(OracleError::Malformed(
                "tool arguments are not a JSON object".to_string(),
            ))
        }
        Err(e) => return Err(OracleError::Malformed(e.to_string())),
    };
    let reason = match args.remove("reason") {
        Some(Value::String(s)) => s,
        Some(_) => return Err(OracleError::Nonconforming("reason is not a string".to_string())),
        None => return Err(OracleError::Nonconforming("missing reason".to_string())),
    };
    Ok(Decision {
        tool: call.function.name,
        args,
        reason,
    })
}

#[async_trait]
impl DecisionOracle for OpenAIOracle {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, OracleError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| OracleError::MissingApiKey("OpenAI API key".to_string()))?;

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<OpenAIErrorResponse>(&body)
                .map(|r| r.error.message)
                .unwrap_or(body);
            return Err(OracleError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let decision = parse_decision(&body)?;
        debug!(
            runbook_id = %request.runbook_id,
            tool = %decision.tool,
            reason = %decision.reason,
            "OpenAI decision"
        );
        Ok(decision)
    }
}
