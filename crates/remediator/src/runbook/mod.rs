//! Runbook definitions.
//!
//! Runbooks are markdown files with YAML frontmatter. They are parsed once at
//! startup into immutable [`RunbookDefinition`] values held by a
//! [`RunbookStore`]; any parse failure is fatal.

mod gate;
mod parser;
mod store;

pub use gate::{lookup, Gate};
pub use parser::parse_runbook;
pub use store::RunbookStore;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunbookError {
    #[error("failed to read runbooks from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: missing YAML frontmatter")]
    MissingFrontmatter { path: PathBuf },

    #[error("{path}: invalid frontmatter: {source}")]
    Frontmatter {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// How the executor drives a runbook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    /// Ordered, gated steps
    #[default]
    Workflow,
    /// Bounded loop over the declared actions
    Planner,
}

/// One workflow step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub action_id: String,
    pub gate: Gate,
    /// The oracle may decline this step with `noop`
    pub optional: bool,
    pub metadata: Map<String, Value>,
}

impl Step {
    #[must_use]
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            gate: Gate::always(),
            optional: false,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A `### Action N:` block from the remediation section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionDefinition {
    pub action_id: String,
    pub description: String,
    pub command: String,
    pub conditions: Value,
    /// Free-form parameters such as `fallback_image`
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunbookDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub mode: DriveMode,
    pub steps: Vec<Step>,
    pub actions: Vec<ActionDefinition>,
    /// Markdown body handed to the oracle
    pub text: String,
}

impl RunbookDefinition {
    #[must_use]
    pub fn action(&self, action_id: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.action_id == action_id)
    }

    /// Fallback image declared on the `patch_image` action, if any.
    #[must_use]
    pub fn fallback_image(&self) -> Option<&str> {
        self.action("patch_image")
            .and_then(|a| a.params.get("fallback_image"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Action ids the planner may choose from, in declaration order.
    #[must_use]
    pub fn planner_actions(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        let declared = self
            .actions
            .iter()
            .map(|a| a.action_id.as_str())
            .chain(self.steps.iter().map(|s| s.action_id.as_str()));
        for id in declared {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Parameters of every action, seeded into run state under `runbook`.
    #[must_use]
    pub fn seed_params(&self) -> Value {
        let mut seed = Map::new();
        for action in &self.actions {
            for (key, value) in &action.params {
                seed.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(image) = self.fallback_image() {
            seed.insert("fallback_image".to_string(), json!(image));
        }
        seed.insert("ok".to_string(), json!(true));
        seed.insert("runbook_id".to_string(), json!(self.id));
        Value::Object(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str, params: Value) -> ActionDefinition {
        ActionDefinition {
            action_id: id.to_string(),
            description: String::new(),
            command: String::new(),
            conditions: Value::Null,
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    fn definition(actions: Vec<ActionDefinition>, steps: Vec<Step>) -> RunbookDefinition {
        RunbookDefinition {
            id: "RB_TEST".to_string(),
            title: String::new(),
            description: String::new(),
            mode: DriveMode::Workflow,
            steps,
            actions,
            text: String::new(),
        }
    }

    #[test]
    fn test_seed_params() {
        let rb = definition(
            vec![
                action("get_pod_events", json!({"limit": 25})),
                action("patch_image", json!({"fallback_image": " nginx:1.27 "})),
            ],
            vec![],
        );
        assert_eq!(rb.fallback_image(), Some("nginx:1.27"));
        assert_eq!(
            rb.seed_params(),
            json!({"ok": true, "runbook_id": "RB_TEST", "limit": 25, "fallback_image": "nginx:1.27"})
        );
    }

    #[test]
    fn test_planner_actions_dedup() {
        let rb = definition(
            vec![action("increase_memory_limit", json!({}))],
            vec![Step::new("check_oom"), Step::new("increase_memory_limit")],
        );
        assert_eq!(rb.planner_actions(), vec!["increase_memory_limit", "check_oom"]);
    }
}
