use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a remediation tool is allowed to act on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Perform the mutating API call
    #[serde(alias = "auto")]
    Apply,
    /// Compute and describe the change without mutating anything
    #[default]
    #[serde(alias = "recommend")]
    RecommendOnly,
}

impl ExecutionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::RecommendOnly => "recommend-only",
        }
    }

    #[must_use]
    pub fn is_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply" | "auto" => Ok(Self::Apply),
            "recommend-only" | "recommend" => Ok(Self::RecommendOnly),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}
