//! Step gates: dotted-path boolean lookups over collected tool results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Preconditions for a step. Every path must resolve to JSON `true`.
///
/// An empty gate always passes. A path that does not resolve fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gate {
    paths: Vec<String>,
}

impl Gate {
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn all<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(Into::into)
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    #[must_use]
    pub fn is_always(&self) -> bool {
        self.paths.is_empty()
    }

    /// First path that does not hold, or `None` when the gate passes.
    #[must_use]
    pub fn first_unmet<'a>(&'a self, results: &Value) -> Option<&'a str> {
        self.paths
            .iter()
            .find(|p| lookup(results, p) != Some(&Value::Bool(true)))
            .map(String::as_str)
    }
}

/// Resolve `a.b.c` against nested objects. Empty segments are ignored.
#[must_use]
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .try_fold(root, |cur, part| cur.as_object()?.get(part))
}
