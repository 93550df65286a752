use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use pvm_lite_core::{DefinitionId, ProcessEngine};

fn is_definition_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Deploy every `*.yaml` / `*.yml` file in `dir`, in file-name order.
/// Unchanged definitions keep their current version.
pub fn deploy_definitions(engine: &ProcessEngine, dir: &Path) -> Result<Vec<DefinitionId>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_definition_file(path))
        .collect();
    files.sort();

    let mut deployed = Vec::with_capacity(files.len());
    for path in files {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Reading {}", path.display()))?;
        let deployment = engine
            .deploy_yaml(&content)
            .with_context(|| format!("Deploying {}", path.display()))?;
        tracing::info!(
            file = %path.display(),
            definition = %deployment.definition.id,
            unchanged = deployment.unchanged,
            warnings = deployment.warnings.len(),
            "Loaded definition"
        );
        deployed.push(deployment.definition.id.clone());
    }
    Ok(deployed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvm_lite_core::MemoryStore;
    use std::sync::Arc;

    const WAIT: &str = r#"
key: approval
activities:
  - id: start
    kind: Automatic
  - id: approve
    kind: WaitState
transitions:
  - from: start
    to: approve
"#;

    fn engine() -> ProcessEngine {
        ProcessEngine::builder(Arc::new(MemoryStore::new())).build()
    }

    #[test]
    fn test_deploys_yaml_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("approval.yaml"), WAIT).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a definition").unwrap();

        let engine = engine();
        let deployed = deploy_definitions(&engine, dir.path()).unwrap();
        assert_eq!(deployed, vec![DefinitionId::new("approval", 1)]);

        // Redeploying the same directory changes nothing.
        let again = deploy_definitions(&engine, dir.path()).unwrap();
        assert_eq!(again, vec![DefinitionId::new("approval", 1)]);
    }

    #[test]
    fn test_invalid_definition_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yml"), "key: broken\nactivities: 3\n").unwrap();

        let err = deploy_definitions(&engine(), dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("broken.yml"));
    }

    #[test]
    fn test_shipped_definitions_deploy() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("definitions");
        let deployed = deploy_definitions(&engine(), &dir).unwrap();
        assert!(!deployed.is_empty());
    }
}
