use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::authoring::validate::ValidationIssue;
use crate::error::{EngineError, GraphError, StoreError};
use crate::graph::{Activity, ProcessGraph};
use crate::types::Timestamp;

/// `(key, version)` identity of a deployed definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionId {
    pub key: String,
    pub version: u32,
}

impl DefinitionId {
    pub fn new(key: impl Into<String>, version: u32) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.version)
    }
}

/// A published, versioned graph. Never mutated after deployment.
#[derive(Debug)]
pub struct ProcessDefinition {
    pub id: DefinitionId,
    /// SHA-256 of the canonical JSON encoding of the graph.
    pub digest: [u8; 32],
    pub deployed_at: Timestamp,
    graph: ProcessGraph,
}

impl ProcessDefinition {
    pub fn graph(&self) -> &ProcessGraph {
        &self.graph
    }

    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.graph.activity(id)
    }
}

/// Result of a deploy call.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub definition: Arc<ProcessDefinition>,
    /// Non-fatal validation findings.
    pub warnings: Vec<ValidationIssue>,
    /// True when `deploy_if_changed` found an identical latest version.
    pub unchanged: bool,
}

/// How a command refers to a definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionRef {
    Latest(String),
    Exact(DefinitionId),
}

impl From<&str> for DefinitionRef {
    fn from(key: &str) -> Self {
        DefinitionRef::Latest(key.to_string())
    }
}

impl From<DefinitionId> for DefinitionRef {
    fn from(id: DefinitionId) -> Self {
        DefinitionRef::Exact(id)
    }
}

// ── DefinitionRepository ──

/// In-process registry of deployed definitions.
///
/// Every version of a key stays resolvable so running instances keep their
/// graph; new instances default to the latest version.
#[derive(Default)]
pub struct DefinitionRepository {
    inner: RwLock<HashMap<String, Vec<Arc<ProcessDefinition>>>>,
}

impl DefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy `graph` as `latest + 1`. Validation is the caller's job.
    pub fn deploy(
        &self,
        graph: ProcessGraph,
        warnings: Vec<ValidationIssue>,
        now: Timestamp,
    ) -> Result<Deployment, EngineError> {
        self.deploy_inner(graph, warnings, now, false)
    }

    /// Like `deploy`, but returns the latest version unchanged when its digest
    /// matches.
    pub fn deploy_if_changed(
        &self,
        graph: ProcessGraph,
        warnings: Vec<ValidationIssue>,
        now: Timestamp,
    ) -> Result<Deployment, EngineError> {
        self.deploy_inner(graph, warnings, now, true)
    }

    fn deploy_inner(
        &self,
        graph: ProcessGraph,
        warnings: Vec<ValidationIssue>,
        now: Timestamp,
        skip_duplicate: bool,
    ) -> Result<Deployment, EngineError> {
        let digest = digest_graph(&graph)?;
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Backend(anyhow!("Lock: {}", e)))?;
        let versions = inner.entry(graph.key().to_string()).or_default();

        if skip_duplicate {
            if let Some(latest) = versions.last() {
                if latest.digest == digest {
                    return Ok(Deployment {
                        definition: latest.clone(),
                        warnings,
                        unchanged: true,
                    });
                }
            }
        }

        let version = versions.last().map(|d| d.id.version + 1).unwrap_or(1);
        let definition = Arc::new(ProcessDefinition {
            id: DefinitionId::new(graph.key(), version),
            digest,
            deployed_at: now,
            graph,
        });
        versions.push(definition.clone());

        tracing::info!(
            definition = %definition.id,
            warnings = warnings.len(),
            "Deployed process definition"
        );

        Ok(Deployment {
            definition,
            warnings,
            unchanged: false,
        })
    }

    pub fn get(&self, id: &DefinitionId) -> Option<Arc<ProcessDefinition>> {
        let inner = self.inner.read().ok()?;
        inner
            .get(&id.key)?
            .iter()
            .find(|d| d.id.version == id.version)
            .cloned()
    }

    pub fn latest(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        let inner = self.inner.read().ok()?;
        inner.get(key)?.last().cloned()
    }

    pub fn resolve(&self, reference: &DefinitionRef) -> Result<Arc<ProcessDefinition>, EngineError> {
        match reference {
            DefinitionRef::Latest(key) => self
                .latest(key)
                .ok_or_else(|| EngineError::DefinitionNotFound(key.clone())),
            DefinitionRef::Exact(id) => self
                .get(id)
                .ok_or_else(|| EngineError::definition_not_found(id)),
        }
    }

    /// All versions of `key`, oldest first.
    pub fn versions(&self, key: &str) -> Vec<DefinitionId> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .get(key)
                    .map(|v| v.iter().map(|d| d.id.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

fn digest_graph(graph: &ProcessGraph) -> Result<[u8; 32], GraphError> {
    let encoded = serde_json::to_vec(graph).map_err(|e| GraphError::Encoding(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Behavior, ProcessGraphBuilder};

    fn graph(wait: &str) -> ProcessGraph {
        ProcessGraphBuilder::new("order")
            .node("start", Behavior::Automatic)
            .node(wait, Behavior::WaitState)
            .transition("start", wait)
            .build()
            .unwrap()
    }

    #[test]
    fn test_versions_strictly_increment() {
        let repo = DefinitionRepository::new();
        let v1 = repo.deploy(graph("approve"), vec![], 0).unwrap();
        let v2 = repo.deploy(graph("approve"), vec![], 1).unwrap();
        assert_eq!(v1.definition.id.version, 1);
        assert_eq!(v2.definition.id.version, 2);
        // Previous version stays resolvable.
        assert!(repo.get(&DefinitionId::new("order", 1)).is_some());
        assert_eq!(repo.latest("order").unwrap().id.version, 2);
        assert_eq!(repo.versions("order").len(), 2);
    }

    #[test]
    fn test_deploy_if_changed_filters_duplicates() {
        let repo = DefinitionRepository::new();
        repo.deploy_if_changed(graph("approve"), vec![], 0).unwrap();
        let same = repo.deploy_if_changed(graph("approve"), vec![], 1).unwrap();
        assert!(same.unchanged);
        assert_eq!(same.definition.id.version, 1);

        let changed = repo.deploy_if_changed(graph("review"), vec![], 2).unwrap();
        assert!(!changed.unchanged);
        assert_eq!(changed.definition.id.version, 2);
    }

    #[test]
    fn test_resolve_missing_definition() {
        let repo = DefinitionRepository::new();
        let err = repo.resolve(&DefinitionRef::from("nope")).unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));
    }
}
