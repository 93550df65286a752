use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

use crate::behavior::BehaviorRegistry;
use crate::graph::{Behavior, ProcessGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Rejects the deployment.
    Error,
    /// Reported to the deployer, deployment proceeds.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub rule: String,
    pub message: String,
}

impl ValidationIssue {
    fn error(rule: &str, message: String) -> Self {
        Self {
            severity: Severity::Error,
            rule: rule.to_string(),
            message,
        }
    }

    fn warning(rule: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            rule: rule.to_string(),
            message,
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Deployment-time checks on a built graph. Returns every issue found.
///
/// `registry`: when given, `Custom` behaviors must name a registered
/// implementation.
pub fn validate_graph(
    graph: &ProcessGraph,
    registry: Option<&BehaviorRegistry>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let mut g: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for activity in graph.activities() {
        index.insert(activity.id.as_str(), g.add_node(activity.id.as_str()));
    }
    for activity in graph.activities() {
        for t in &activity.outgoing {
            if let (Some(&a), Some(&b)) = (
                index.get(activity.id.as_str()),
                index.get(t.destination.as_str()),
            ) {
                g.add_edge(a, b, ());
            }
        }
    }

    // V1: every activity reachable from the initial activity
    if let Some(&start) = index.get(graph.initial().id.as_str()) {
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&g, start);
        while let Some(nx) = dfs.next(&g) {
            reachable.insert(nx);
        }
        for activity in graph.activities() {
            if !reachable.contains(&index[activity.id.as_str()]) {
                issues.push(ValidationIssue::error(
                    "V1",
                    format!("Activity '{}' is unreachable from '{}'", activity.id, graph.initial().id),
                ));
            }
        }
    }

    for activity in graph.activities() {
        match &activity.behavior {
            // V2: decision routes and default name existing transitions
            Behavior::Decision { routes, default } => {
                let named = routes
                    .iter()
                    .map(|r| r.transition.as_str())
                    .chain(default.as_deref());
                for name in named {
                    if activity.transition_by_id(name).is_none() {
                        issues.push(ValidationIssue::error(
                            "V2",
                            format!(
                                "Decision '{}': no outgoing transition named '{}'",
                                activity.id, name
                            ),
                        ));
                    }
                }
            }
            // V3: a fork needs somewhere to go
            Behavior::Fork if activity.outgoing.is_empty() => {
                issues.push(ValidationIssue::error(
                    "V3",
                    format!("Fork '{}' has no outgoing transitions", activity.id),
                ));
            }
            // V4: a join with one input never synchronizes anything
            Behavior::Join if activity.incoming < 2 => {
                issues.push(ValidationIssue::warning(
                    "V4",
                    format!(
                        "Join '{}' has {} incoming transition(s); expected at least 2",
                        activity.id, activity.incoming
                    ),
                ));
            }
            // V5: custom behaviors must be registered
            Behavior::Custom { name, .. } => {
                if let Some(registry) = registry {
                    if !registry.contains(name) {
                        issues.push(ValidationIssue::error(
                            "V5",
                            format!(
                                "Activity '{}': no behavior registered under '{}'",
                                activity.id, name
                            ),
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    // V6: fork fan-out balances join fan-in
    let fork_extra: usize = graph
        .activities()
        .iter()
        .filter(|a| matches!(a.behavior, Behavior::Fork))
        .map(|a| a.outgoing.len().saturating_sub(1))
        .sum();
    let join_extra: usize = graph
        .activities()
        .iter()
        .filter(|a| matches!(a.behavior, Behavior::Join))
        .map(|a| a.incoming.saturating_sub(1))
        .sum();
    if fork_extra != join_extra {
        issues.push(ValidationIssue::warning(
            "V6",
            format!(
                "Unbalanced fork/join: forks add {} branch(es), joins merge {}",
                fork_extra, join_extra
            ),
        ));
    }

    // V7: cycles that never pause run until the agenda limit
    for component in tarjan_scc(&g) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&nx| g.find_edge(nx, nx).is_some());
        if !cyclic {
            continue;
        }
        let never_pauses = component.iter().all(|&nx| {
            graph
                .activity(g[nx])
                .is_some_and(|a| a.behavior.is_pass_through() && !a.asynchronous)
        });
        if never_pauses {
            let mut ids: Vec<&str> = component.iter().map(|&nx| g[nx]).collect();
            ids.sort();
            issues.push(ValidationIssue::warning(
                "V7",
                format!("Cycle without a wait state: {}", ids.join(" → ")),
            ));
        }
    }

    issues
}
