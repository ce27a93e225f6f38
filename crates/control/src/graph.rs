//! Dependency graph built from managed-container labels.

use std::collections::{BTreeSet, HashMap};

use crate::engine::{ContainerView, HealthState};

/// Label that enrolls a container into controller management.
pub const MANAGED_LABEL: &str = "com.github.saltbox.saltbox_managed";
/// Label carrying the comma-separated list of dependency names.
pub const DEPENDS_ON_LABEL: &str = "com.github.saltbox.depends_on";
/// Label carrying the start delay in seconds.
pub const DELAY_LABEL: &str = "com.github.saltbox.depends_on.delay";
/// Label enabling the health gate for edges touching this container.
pub const HEALTHCHECKS_LABEL: &str = "com.github.saltbox.depends_on.healthchecks";

/// A label value the controller cannot act on. Maps to a 400-class response;
/// it never aborts the daemon.
#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error(
        "invalid value '{value}' for label {DELAY_LABEL} on container '{container}': \
         expected an integer number of seconds"
    )]
    InvalidDelay { container: String, value: String },
}

/// One container in the dependency graph. Edges are name-keyed sets; every
/// referenced name resolves to a node in the owning graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerNode {
    pub name: String,
    /// Start delay after dependencies are satisfied.
    pub delay_seconds: u64,
    /// Whether edges touching this node wait for parent health.
    pub healthcheck_gate: bool,
    /// True when this name was referenced as a dependency but no such
    /// managed container exists. Placeholders are never started or stopped.
    pub is_placeholder: bool,
    /// Names this container depends on.
    pub parents: BTreeSet<String>,
    /// Names that depend on this container.
    pub children: BTreeSet<String>,
}

impl ContainerNode {
    fn new(name: impl Into<String>, delay_seconds: u64, healthcheck_gate: bool) -> Self {
        Self {
            name: name.into(),
            delay_seconds,
            healthcheck_gate,
            is_placeholder: false,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    fn placeholder(name: impl Into<String>) -> Self {
        Self {
            is_placeholder: true,
            ..Self::new(name, 0, false)
        }
    }
}

/// The dependency graph for one start/stop request, plus the per-request
/// health caches. Rebuilt fresh on every request; caches never persist.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, ContainerNode>,
    health: HashMap<String, HealthState>,
    healthcheck_configured: HashMap<String, bool>,
}

impl DependencyGraph {
    /// Build the graph from a managed-container listing.
    ///
    /// The listing is assumed to be pre-filtered to managed containers.
    /// Unknown dependency names get placeholder nodes, logged once each.
    pub fn build(containers: &[ContainerView]) -> Result<Self, LabelError> {
        let mut graph = Self::default();

        for view in containers {
            let delay_seconds = match view.labels.get(DELAY_LABEL) {
                Some(raw) => {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|_| LabelError::InvalidDelay {
                            container: view.name.clone(),
                            value: raw.clone(),
                        })?
                }
                None => 0,
            };
            let healthcheck_gate = view
                .labels
                .get(HEALTHCHECKS_LABEL)
                .is_some_and(|v| v.trim() == "true");

            graph.nodes.insert(
                view.name.clone(),
                ContainerNode::new(view.name.as_str(), delay_seconds, healthcheck_gate),
            );
            graph.health.insert(view.name.clone(), view.health);
        }

        // Second pass: resolve dependency references into reciprocal edges,
        // synthesizing placeholders for names with no managed container.
        for view in containers {
            for dep in parse_depends_on(&view.labels) {
                graph
                    .nodes
                    .entry(dep.clone())
                    .or_insert_with(|| {
                        tracing::warn!("Created placeholder node for missing dependency: {dep}");
                        ContainerNode::placeholder(dep.as_str())
                    })
                    .children
                    .insert(view.name.clone());
                if let Some(node) = graph.nodes.get_mut(&view.name) {
                    node.parents.insert(dep);
                }
            }
        }

        Ok(graph)
    }

    pub fn node(&self, name: &str) -> Option<&ContainerNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ContainerNode> {
        self.nodes.values()
    }

    /// All node names, placeholders included.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn health(&self, name: &str) -> HealthState {
        self.health
            .get(name)
            .copied()
            .unwrap_or(HealthState::Unknown)
    }

    pub fn set_health(&mut self, name: &str, state: HealthState) {
        self.health.insert(name.to_string(), state);
    }

    /// Cached healthcheck-configuration lookup. `None` means not yet queried.
    pub fn healthcheck_configured(&self, name: &str) -> Option<bool> {
        self.healthcheck_configured.get(name).copied()
    }

    pub fn set_healthcheck_configured(&mut self, name: &str, configured: bool) {
        self.healthcheck_configured
            .insert(name.to_string(), configured);
    }
}

fn parse_depends_on(labels: &HashMap<String, String>) -> Vec<String> {
    labels
        .get(DEPENDS_ON_LABEL)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str, labels: &[(&str, &str)]) -> ContainerView {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ContainerView::new(name, labels)
    }

    #[test]
    fn builds_reciprocal_edges() {
        let containers = vec![
            view("a", &[]),
            view("b", &[(DEPENDS_ON_LABEL, "a")]),
            view("c", &[(DEPENDS_ON_LABEL, "a, b")]),
        ];
        let graph = DependencyGraph::build(&containers).expect("graph");

        assert_eq!(graph.len(), 3);
        let a = graph.node("a").expect("node a");
        assert!(a.children.contains("b") && a.children.contains("c"));
        let c = graph.node("c").expect("node c");
        assert!(c.parents.contains("a") && c.parents.contains("b"));
    }

    #[test]
    fn synthesizes_placeholder_for_missing_dependency() {
        let containers = vec![view("b", &[(DEPENDS_ON_LABEL, "ghost")])];
        let graph = DependencyGraph::build(&containers).expect("graph");

        let ghost = graph.node("ghost").expect("placeholder node");
        assert!(ghost.is_placeholder);
        assert!(ghost.children.contains("b"));
        assert!(graph.node("b").expect("node b").parents.contains("ghost"));
    }

    #[test]
    fn parses_delay_and_gate_labels() {
        let containers = vec![view(
            "a",
            &[(DELAY_LABEL, " 15 "), (HEALTHCHECKS_LABEL, "true")],
        )];
        let graph = DependencyGraph::build(&containers).expect("graph");

        let a = graph.node("a").expect("node a");
        assert_eq!(a.delay_seconds, 15);
        assert!(a.healthcheck_gate);
    }

    #[test]
    fn missing_labels_use_defaults() {
        let graph = DependencyGraph::build(&[view("a", &[])]).expect("graph");
        let a = graph.node("a").expect("node a");
        assert_eq!(a.delay_seconds, 0);
        assert!(!a.healthcheck_gate);
        assert!(a.parents.is_empty());
    }

    #[test]
    fn unparseable_delay_is_rejected() {
        let containers = vec![view("a", &[(DELAY_LABEL, "soon")])];
        let err = DependencyGraph::build(&containers).expect_err("delay must fail");
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn depends_on_list_is_trimmed_and_filtered() {
        let containers = vec![view("b", &[(DEPENDS_ON_LABEL, " a ,, ")]), view("a", &[])];
        let graph = DependencyGraph::build(&containers).expect("graph");
        let b = graph.node("b").expect("node b");
        assert_eq!(b.parents.iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn health_cache_defaults_to_unknown() {
        let mut graph = DependencyGraph::build(&[view("a", &[])]).expect("graph");
        assert_eq!(graph.health("a"), HealthState::Unknown);
        graph.set_health("a", HealthState::Healthy);
        assert_eq!(graph.health("a"), HealthState::Healthy);

        assert_eq!(graph.healthcheck_configured("a"), None);
        graph.set_healthcheck_configured("a", true);
        assert_eq!(graph.healthcheck_configured("a"), Some(true));
    }
}
