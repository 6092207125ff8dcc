//! Decision validation and argument containment.
//!
//! Whatever the oracle proposes passes through here before a tool runs.

use serde_json::Value;

use super::WorkflowError;
use crate::alerts::AlertContext;
use crate::oracle::Decision;
use crate::tools::{ToolArgs, ToolKind};

/// Fields the oracle may not redirect once the alert has supplied them.
const PINNED_FIELDS: [&str; 3] = ["namespace", "pod", "node"];

/// What the oracle may answer at one decision point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionPoint {
    /// A workflow step bound to exactly one tool.
    Step {
        action_id: String,
        expected: ToolKind,
        noop_allowed: bool,
    },
    /// A planner round over several candidate tools; `noop` ends the run.
    Planner { candidates: Vec<ToolKind> },
}

/// A decision that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Call(ToolKind),
    Noop,
}

impl DecisionPoint {
    /// Label used in step records and error codes.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Step { action_id, .. } => action_id,
            Self::Planner { .. } => "planner",
        }
    }

    /// Tool names offered to the oracle.
    #[must_use]
    pub fn allowed_tools(&self) -> Vec<String> {
        match self {
            Self::Step {
                expected,
                noop_allowed,
                ..
            } => {
                let mut tools = vec![expected.name().to_string()];
                if *noop_allowed {
                    tools.push(ToolKind::NOOP.to_string());
                }
                tools
            }
            Self::Planner { candidates } => candidates
                .iter()
                .map(|k| k.name().to_string())
                .chain(std::iter::once(ToolKind::NOOP.to_string()))
                .collect(),
        }
    }

    /// The only possible non-noop answer, when there is exactly one.
    #[must_use]
    pub fn single_candidate(&self) -> Option<ToolKind> {
        match self {
            Self::Step { expected, .. } => Some(*expected),
            Self::Planner { candidates } => match candidates.as_slice() {
                [only] => Some(*only),
                _ => None,
            },
        }
    }

    /// Check the proposed tool against this decision point.
    pub fn validate(&self, decision: &Decision) -> Result<Verdict, WorkflowError> {
        let tool = decision.tool.trim();
        let invalid = || WorkflowError::InvalidTool {
            step: self.label().to_string(),
            tool: tool.to_string(),
        };

        if tool == ToolKind::NOOP {
            return match self {
                Self::Step {
                    action_id,
                    noop_allowed: false,
                    ..
                } => Err(WorkflowError::NoopForRequiredStep(action_id.clone())),
                _ => Ok(Verdict::Noop),
            };
        }

        let kind: ToolKind = tool.parse().map_err(|_| invalid())?;
        let allowed = match self {
            Self::Step { expected, .. } => kind == *expected,
            Self::Planner { candidates } => candidates.contains(&kind),
        };
        if allowed {
            Ok(Verdict::Call(kind))
        } else {
            Err(invalid())
        }
    }
}

/// Build the tool arguments for a validated call.
///
/// Alert context supplies the defaults; oracle arguments are layered on top.
/// `mode` is dropped, pinned targets must match the alert, and a runbook
/// fallback image always wins.
pub fn contain_args(
    kind: ToolKind,
    proposed: &serde_json::Map<String, Value>,
    context: &AlertContext,
    fallback_image: Option<&str>,
) -> Result<ToolArgs, WorkflowError> {
    let mut args = ToolArgs::new();
    for (key, value) in [
        ("namespace", &context.namespace),
        ("pod", &context.pod),
        ("container", &context.container),
        ("node", &context.node),
    ] {
        if !value.is_empty() {
            args.set(key, value.as_str());
        }
    }

    for (key, value) in proposed {
        if key == "mode" || is_blank(value) {
            continue;
        }
        if PINNED_FIELDS.contains(&key.as_str()) {
            if let Some(pinned) = context.pinned(key) {
                if value.as_str().map(str::trim) != Some(pinned) {
                    return Err(WorkflowError::InvalidArgs(key.clone()));
                }
                continue;
            }
        }
        args.set(key, value.clone());
    }

    if kind == ToolKind::FixImagePullBackOff {
        if let Some(image) = fallback_image {
            args.set("fallback_image", image);
        }
    }
    Ok(args)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
