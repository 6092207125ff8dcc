//! Immutable collection of parsed runbooks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{parse_runbook, RunbookDefinition, RunbookError};
use crate::alerts::RunbookId;

/// Runbooks keyed by id. Reload means restart.
#[derive(Debug, Default, Clone)]
pub struct RunbookStore {
    runbooks: BTreeMap<String, Arc<RunbookDefinition>>,
}

impl RunbookStore {
    /// Parse every `*.md` file in `dir`. The first bad file aborts the load.
    pub fn load_dir(dir: &Path) -> Result<Self, RunbookError> {
        let io_err = |source| RunbookError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut store = Self::default();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path).map_err(|source| RunbookError::Io {
                path: path.clone(),
                source,
            })?;
            store.insert(parse_runbook(&path, stem, &content)?);
        }

        let missing = store.missing_known();
        if !missing.is_empty() {
            warn!(missing = ?missing, "Some classifier runbooks have no definition");
        }
        info!(dir = %dir.display(), count = store.len(), "Loaded runbooks");
        Ok(store)
    }

    #[must_use]
    pub fn from_definitions(definitions: impl IntoIterator<Item = RunbookDefinition>) -> Self {
        let mut store = Self::default();
        for rb in definitions {
            store.insert(rb);
        }
        store
    }

    fn insert(&mut self, runbook: RunbookDefinition) {
        self.runbooks.insert(runbook.id.clone(), Arc::new(runbook));
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<RunbookDefinition>> {
        self.runbooks.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.runbooks.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runbooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runbooks.is_empty()
    }

    /// Classifier targets with no loaded definition.
    #[must_use]
    pub fn missing_known(&self) -> Vec<RunbookId> {
        RunbookId::KNOWN
            .into_iter()
            .filter(|id| !self.runbooks.contains_key(id.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("RB_OOM.md"),
            "---\nmode: planner\n---\n## Remediation Actions\n\n### Action 1: Raise\n- **action_id**: increase_memory_limit\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = RunbookStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.ids().collect::<Vec<_>>(), vec!["RB_OOM"]);
        assert!(store.get("RB_OOM").is_some());
        assert!(store.get("RB_IMAGEPULL").is_none());
        assert_eq!(store.missing_known().len(), RunbookId::KNOWN.len() - 1);
    }

    #[test]
    fn test_load_dir_fails_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("RB_BAD.md"), "no frontmatter").unwrap();
        assert!(matches!(
            RunbookStore::load_dir(dir.path()),
            Err(RunbookError::MissingFrontmatter { .. })
        ));
    }

    #[test]
    fn test_shipped_runbooks_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("runbooks");
        let store = RunbookStore::load_dir(&dir).unwrap();
        assert!(store.missing_known().is_empty());
    }
}
