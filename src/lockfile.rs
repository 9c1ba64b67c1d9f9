use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::declaration::StackDeclaration;
use crate::synth::{GraphDiff, ResourceGraph, synthesize};

/// Pins the synthesized template so later changes show up as a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackLock {
    pub stack: String,
    pub declaration_version: u32,
    pub generated_at: DateTime<Utc>,
    pub template_digest: String,
    /// Resource fingerprints keyed by logical id.
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub exports: Vec<String>,
}

impl StackLock {
    pub fn from_graph(stack: &StackDeclaration, graph: &ResourceGraph) -> Self {
        Self {
            stack: stack.name.clone(),
            declaration_version: stack.version,
            generated_at: Utc::now(),
            template_digest: graph.digest(),
            resources: graph.fingerprints(),
            exports: stack.outputs.iter().map(|o| o.export.clone()).collect(),
        }
    }
}

pub fn generate_lock(stack: &StackDeclaration, path: &Path) -> Result<StackLock> {
    let graph = synthesize(stack)
        .with_context(|| format!("Failed to synthesize stack '{}'", stack.name))?;
    let lock = StackLock::from_graph(stack, &graph);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(lock)
}

pub fn load_lock(path: &Path) -> Result<StackLock> {
    let file =
        File::open(path).with_context(|| format!("Failed to open lockfile: {}", path.display()))?;
    serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse lockfile: {}", path.display()))
}

/// Result of comparing a lock against a freshly synthesized graph.
#[derive(Debug, Clone, Serialize)]
pub struct LockCheck {
    pub digest_matches: bool,
    pub diff: GraphDiff,
}

impl LockCheck {
    pub fn is_current(&self) -> bool {
        self.digest_matches && self.diff.is_empty()
    }
}

pub fn check_lock(lock: &StackLock, graph: &ResourceGraph) -> LockCheck {
    LockCheck {
        digest_matches: lock.template_digest == graph.digest(),
        diff: GraphDiff::between(&lock.resources, &graph.fingerprints()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets;
    use tempfile::tempdir;

    #[test]
    fn fresh_lock_matches_its_graph() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locks/stack.lock.yaml");
        let stack = presets::preset("devsecops-eks").unwrap();

        let written = generate_lock(&stack, &path).unwrap();
        let loaded = load_lock(&path).unwrap();
        assert_eq!(loaded.template_digest, written.template_digest);
        assert_eq!(loaded.exports.len(), 7);

        let check = check_lock(&loaded, &synthesize(&stack).unwrap());
        assert!(check.is_current(), "{check:?}");
    }

    #[test]
    fn detects_changed_resources() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("stack.lock.yaml");
        let mut stack = presets::preset("minimal").unwrap();
        let lock = generate_lock(&stack, &path).unwrap();

        stack.node_pools[0].max_size = 5;
        let check = check_lock(&lock, &synthesize(&stack).unwrap());
        assert!(!check.digest_matches);
        assert_eq!(check.diff.changed, vec!["DefaultNodegroup".to_string()]);
        assert!(check.diff.added.is_empty() && check.diff.removed.is_empty());
    }
}
