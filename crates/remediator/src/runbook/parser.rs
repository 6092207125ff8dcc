//! Markdown runbook parsing.

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::LazyLock;

use super::{ActionDefinition, DriveMode, Gate, RunbookDefinition, RunbookError, Step};

static FRONTMATTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\A---\r?\n(.*?)\r?\n---\r?\n(.*)\z").unwrap());

static ACTIONS_SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)## Remediation Actions[ \t]*\r?\n(.*?)(?:\n## |\z)").unwrap()
});

static ACTION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"### Action \d+:").unwrap());

static ACTION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"- \*\*action_id\*\*:\s*`?(\w+)`?").unwrap());

static KEY_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \*\*(\w+)\*\*:\s*`?(.+?)`?$").unwrap());

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WhenExpr {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawStep {
    action_id: String,
    #[serde(default)]
    when: Option<WhenExpr>,
    #[serde(default)]
    when_all: Vec<String>,
    #[serde(default)]
    optional: bool,
    #[serde(flatten)]
    metadata: Map<String, Value>,
}

impl RawStep {
    fn into_step(self) -> Step {
        let mut paths = match self.when {
            Some(WhenExpr::One(p)) => vec![p],
            Some(WhenExpr::Many(ps)) => ps,
            None => Vec::new(),
        };
        paths.extend(self.when_all);
        Step {
            action_id: self.action_id.trim().to_string(),
            gate: Gate::all(paths),
            optional: self.optional,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Frontmatter {
    id: Option<String>,
    title: String,
    description: String,
    mode: Option<DriveMode>,
    workflow: Vec<RawStep>,
}

/// Parse one runbook file. `fallback_id` (the file stem) is used when the
/// frontmatter carries no `id`.
pub fn parse_runbook(
    path: &Path,
    fallback_id: &str,
    content: &str,
) -> Result<RunbookDefinition, RunbookError> {
    let invalid = |reason: String| RunbookError::Invalid {
        path: path.to_path_buf(),
        reason,
    };

    let caps = FRONTMATTER_RE
        .captures(content)
        .ok_or_else(|| RunbookError::MissingFrontmatter {
            path: path.to_path_buf(),
        })?;
    let front: Frontmatter = if caps[1].trim().is_empty() {
        Frontmatter::default()
    } else {
        serde_yaml::from_str(&caps[1]).map_err(|source| RunbookError::Frontmatter {
            path: path.to_path_buf(),
            source,
        })?
    };
    let text = caps[2].to_string();

    let id = front
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());
    if id != fallback_id {
        return Err(invalid(format!(
            "frontmatter id {id} does not match file name {fallback_id}"
        )));
    }

    let steps: Vec<Step> = front.workflow.into_iter().map(RawStep::into_step).collect();
    if let Some(pos) = steps.iter().position(|s| s.action_id.is_empty()) {
        return Err(invalid(format!("workflow step {} has an empty action_id", pos + 1)));
    }

    let actions = parse_actions(&text);
    let mode = front.mode.unwrap_or(if steps.is_empty() && !actions.is_empty() {
        DriveMode::Planner
    } else {
        DriveMode::Workflow
    });

    match mode {
        DriveMode::Workflow if steps.is_empty() => {
            return Err(invalid("missing_workflow_in_runbook".to_string()));
        }
        DriveMode::Planner if steps.is_empty() && actions.is_empty() => {
            return Err(invalid("planner runbook declares no actions".to_string()));
        }
        _ => {}
    }

    Ok(RunbookDefinition {
        id,
        title: front.title,
        description: front.description,
        mode,
        steps,
        actions,
        text,
    })
}

/// Parse the `## Remediation Actions` section into action blocks.
fn parse_actions(text: &str) -> Vec<ActionDefinition> {
    let Some(section) = ACTIONS_SECTION_RE.captures(text) else {
        return Vec::new();
    };
    ACTION_HEADER_RE
        .split(&section[1])
        .skip(1)
        .filter_map(parse_action_block)
        .collect()
}

fn parse_action_block(block: &str) -> Option<ActionDefinition> {
    let action_id = ACTION_ID_RE.captures(block)?[1].to_string();

    let mut data = Map::new();
    for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = KEY_VALUE_RE.captures(line) {
            let raw = caps[2].trim().trim_end_matches('`').trim();
            data.insert(caps[1].to_string(), parse_value(raw));
        }
    }

    let text_field = |data: &mut Map<String, Value>, key: &str| match data.remove(key) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let description = text_field(&mut data, "description");
    let command = text_field(&mut data, "command");
    let conditions = data.remove("conditions").unwrap_or(Value::Null);
    data.remove("action_id");

    Some(ActionDefinition {
        action_id,
        description,
        command,
        conditions,
        params: data,
    })
}

/// Inline `{...}` / `[...]` values are YAML; everything else is a string.
fn parse_value(raw: &str) -> Value {
    if raw.starts_with('{') || raw.starts_with('[') {
        if let Ok(value) = serde_yaml::from_str::<Value>(raw) {
            return value;
        }
    }
    Value::String(raw.to_string())
}
