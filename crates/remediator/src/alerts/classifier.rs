//! Alert → runbook classification.
//!
//! Priority:
//! - an explicit `runbook_id` label naming a known runbook
//! - ordered substring patterns over the lowercased alert name
//! - the `RB_UNKNOWN` sentinel

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Labels;

/// Runbook families the controller knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunbookId {
    #[serde(rename = "RB_IMAGEPULL")]
    ImagePull,
    #[serde(rename = "RB_OOM")]
    Oom,
    #[serde(rename = "RB_CONTAINERCREATING")]
    ContainerCreating,
    #[serde(rename = "RB_CRASHLOOP")]
    CrashLoop,
    #[serde(rename = "RB_NODE_UNSCHEDULABLE")]
    NodeUnschedulable,
    #[serde(rename = "RB_NODE_NOTREADY")]
    NodeNotReady,
    #[serde(rename = "RB_UNKNOWN")]
    Unknown,
}

impl RunbookId {
    /// Every runbook that has a definition (everything but `Unknown`).
    pub const KNOWN: [RunbookId; 6] = [
        Self::ImagePull,
        Self::Oom,
        Self::ContainerCreating,
        Self::CrashLoop,
        Self::NodeUnschedulable,
        Self::NodeNotReady,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImagePull => "RB_IMAGEPULL",
            Self::Oom => "RB_OOM",
            Self::ContainerCreating => "RB_CONTAINERCREATING",
            Self::CrashLoop => "RB_CRASHLOOP",
            Self::NodeUnschedulable => "RB_NODE_UNSCHEDULABLE",
            Self::NodeNotReady => "RB_NODE_NOTREADY",
            Self::Unknown => "RB_UNKNOWN",
        }
    }
}

impl fmt::Display for RunbookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunbookId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::KNOWN
            .into_iter()
            .chain(std::iter::once(Self::Unknown))
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown runbook id: {s}"))
    }
}

/// Ordered alert-name patterns. First match wins.
const ALERTNAME_PATTERNS: &[(&[&str], RunbookId)] = &[
    (&["imagepullbackoff"], RunbookId::ImagePull),
    (&["oomkilled"], RunbookId::Oom),
    (&["containercreating"], RunbookId::ContainerCreating),
    (&["crashloop"], RunbookId::CrashLoop),
    (&["nodeunschedulable", "unschedulable"], RunbookId::NodeUnschedulable),
    (&["nodenotready", "notready"], RunbookId::NodeNotReady),
];

/// Map alert labels to a runbook. Total and deterministic.
#[must_use]
pub fn classify(labels: &Labels) -> RunbookId {
    if let Some(explicit) = labels.get("runbook_id") {
        if let Ok(id) = explicit.parse::<RunbookId>() {
            if id != RunbookId::Unknown {
                return id;
            }
        }
    }

    let alertname = labels
        .get("alertname")
        .map(|name| name.to_lowercase())
        .unwrap_or_default();

    ALERTNAME_PATTERNS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| alertname.contains(n)))
        .map_or(RunbookId::Unknown, |(_, id)| *id)
}
