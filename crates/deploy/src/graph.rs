//! Dependency graph construction.
//!
//! Two graphs are derived from the declared node collection:
//! - the deployment graph: `A -> B` when B's address is a constructor argument of A;
//! - the configuration graph: `source -> dependency` for every configuration action, indexed
//!   from both endpoints so a change on either side selects the action again.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::GraphError,
    node::{ActionId, ConfigAction, Node, NodeId},
};

static NO_NODES: BTreeSet<NodeId> = BTreeSet::new();

/// Directed graph over node ids as an adjacency map from a node to its dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeId) {
        self.edges.entry(node).or_default();
    }

    /// Record that `node` depends on `dependency`.
    pub fn add_edge(&mut self, node: NodeId, dependency: NodeId) {
        self.add_node(dependency.clone());
        self.edges.entry(node).or_default().insert(dependency);
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.edges.contains_key(node)
    }

    /// All nodes in lexicographic order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.edges.keys()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of `node`, in lexicographic order.
    pub fn dependencies(&self, node: &NodeId) -> &BTreeSet<NodeId> {
        self.edges.get(node).unwrap_or(&NO_NODES)
    }

    /// The reverse adjacency map: every node to the nodes that directly depend on it.
    pub fn dependents(&self) -> BTreeMap<NodeId, BTreeSet<NodeId>> {
        let mut reversed: BTreeMap<NodeId, BTreeSet<NodeId>> = self
            .edges
            .keys()
            .map(|node| (node.clone(), BTreeSet::new()))
            .collect();

        for (node, dependencies) in &self.edges {
            for dependency in dependencies {
                reversed
                    .entry(dependency.clone())
                    .or_default()
                    .insert(node.clone());
            }
        }

        reversed
    }
}

impl<N, D> FromIterator<(N, D)> for DependencyGraph
where
    N: Into<NodeId>,
    D: IntoIterator,
    D::Item: Into<NodeId>,
{
    fn from_iter<I: IntoIterator<Item = (N, D)>>(iter: I) -> Self {
        let mut graph = Self::new();
        for (node, dependencies) in iter {
            let node = node.into();
            graph.add_node(node.clone());
            for dependency in dependencies {
                graph.add_edge(node.clone(), dependency.into());
            }
        }
        graph
    }
}

/// Configuration dependencies and the actions they stem from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationGraph {
    by_source: BTreeMap<NodeId, BTreeSet<NodeId>>,
    by_target: BTreeMap<NodeId, BTreeSet<NodeId>>,
    actions: BTreeMap<ActionId, ConfigAction>,
    touching: BTreeMap<NodeId, BTreeSet<ActionId>>,
    declaration: Vec<ActionId>,
}

impl ConfigurationGraph {
    fn insert(&mut self, action: ConfigAction) -> Result<(), GraphError> {
        let id = action.id();
        if self.actions.contains_key(&id) {
            return Err(GraphError::DuplicateAction { action: id });
        }

        self.by_source
            .entry(action.source.clone())
            .or_default()
            .insert(action.dependency.clone());
        self.by_target
            .entry(action.dependency.clone())
            .or_default()
            .insert(action.source.clone());

        for node in action.referenced_nodes() {
            self.touching
                .entry(node.clone())
                .or_default()
                .insert(id.clone());
        }

        self.declaration.push(id.clone());
        self.actions.insert(id, action);
        Ok(())
    }

    /// Nodes whose presence `source` is wired to.
    pub fn dependencies_of(&self, source: &NodeId) -> &BTreeSet<NodeId> {
        self.by_source.get(source).unwrap_or(&NO_NODES)
    }

    /// Nodes that are wired to `target`.
    pub fn sources_of(&self, target: &NodeId) -> &BTreeSet<NodeId> {
        self.by_target.get(target).unwrap_or(&NO_NODES)
    }

    pub fn action(&self, id: &ActionId) -> Option<&ConfigAction> {
        self.actions.get(id)
    }

    /// All actions in declaration order.
    pub fn actions(&self) -> impl Iterator<Item = &ConfigAction> {
        self.declaration.iter().filter_map(|id| self.actions.get(id))
    }

    /// Actions that reference `node` as source, dependency or argument.
    pub fn actions_touching(&self, node: &NodeId) -> impl Iterator<Item = &ConfigAction> {
        self.touching
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| self.actions.get(id))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// The deployment and configuration graphs of a node collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraphs {
    pub deployment: DependencyGraph,
    pub configuration: ConfigurationGraph,
}

impl DependencyGraphs {
    /// Derive both graphs from `nodes`.
    ///
    /// Fails on duplicate ids, on any reference to a node outside the collection, and on
    /// subsumption declarations the deploying node's constructor does not back. Cycles are
    /// reported by [`crate::order::deployment_order`].
    pub fn build<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Result<Self, GraphError> {
        let mut by_id: BTreeMap<&NodeId, &Node> = BTreeMap::new();
        for node in nodes {
            if by_id.insert(node.id(), node).is_some() {
                return Err(GraphError::DuplicateNode {
                    node: node.id().clone(),
                });
            }
        }

        let mut graphs = Self::default();

        for (id, node) in &by_id {
            graphs.deployment.add_node((*id).clone());

            for dependency in node.deployment_dependencies() {
                if !by_id.contains_key(&dependency) {
                    return Err(GraphError::DanglingDependency {
                        node: (*id).clone(),
                        missing: dependency,
                        via: "constructor".to_string(),
                    });
                }
                graphs.deployment.add_edge((*id).clone(), dependency);
            }
        }

        for (id, node) in &by_id {
            for action in node.configuration_actions() {
                if &action.source != *id {
                    return Err(GraphError::ForeignAction {
                        node: (*id).clone(),
                        action: action.id(),
                    });
                }

                if let Some(missing) = action
                    .referenced_nodes()
                    .into_iter()
                    .find(|referenced| !by_id.contains_key(referenced))
                {
                    return Err(GraphError::DanglingDependency {
                        node: (*id).clone(),
                        missing: missing.clone(),
                        via: action.id().to_string(),
                    });
                }

                if let Some(by) = &action.subsumed_by {
                    validate_subsumption(action, by, &by_id)?;
                }

                graphs.configuration.insert(action.clone())?;
            }
        }

        tracing::debug!(
            nodes = graphs.deployment.len(),
            actions = graphs.configuration.len(),
            "Built dependency graphs"
        );

        Ok(graphs)
    }
}

/// A fresh deployment of `by` only subsumes an action between `by` and the other endpoint when
/// `by`'s constructor takes that endpoint's address.
fn validate_subsumption(
    action: &ConfigAction,
    by: &NodeId,
    nodes: &BTreeMap<&NodeId, &Node>,
) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidSubsumption {
        action: action.id(),
        by: by.clone(),
        reason,
    };

    let other = if by == &action.source {
        &action.dependency
    } else if by == &action.dependency {
        &action.source
    } else {
        return Err(invalid("it is neither the source nor the dependency".to_string()));
    };

    let deploying = nodes
        .get(by)
        .filter(|node| node.is_deployable())
        .ok_or_else(|| invalid("it is not a deployable node".to_string()))?;

    // Plain parameters passed to the constructor.
    if other == by {
        return Ok(());
    }

    if !deploying.deployment_dependencies().contains(other) {
        return Err(invalid(format!("its constructor does not take {other}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::fixtures::{external, internal, wire};

    #[test]
    fn test_deployment_edges_follow_constructor_arguments() {
        let nodes = vec![
            external("token"),
            internal("lending_pool_core", &["token"], vec![]),
            internal(
                "lending_pool_peripheral",
                &["lending_pool_core", "token"],
                vec![],
            ),
        ];

        let graphs = DependencyGraphs::build(&nodes).unwrap();

        assert_eq!(
            graphs
                .deployment
                .dependencies(&"lending_pool_peripheral".into()),
            &BTreeSet::from([NodeId::from("lending_pool_core"), NodeId::from("token")])
        );
        assert!(graphs.deployment.dependencies(&"token".into()).is_empty());

        let dependents = graphs.deployment.dependents();
        assert_eq!(
            dependents[&NodeId::from("token")],
            BTreeSet::from([
                NodeId::from("lending_pool_core"),
                NodeId::from("lending_pool_peripheral")
            ])
        );
    }

    #[test]
    fn test_configuration_edges_are_indexed_both_ways() {
        let nodes = vec![
            internal(
                "lending_pool_core",
                &[],
                vec![wire(
                    "lending_pool_core",
                    "lending_pool_peripheral",
                    "setLendingPoolPeripheralAddress",
                )],
            ),
            internal("lending_pool_peripheral", &["lending_pool_core"], vec![]),
        ];

        let graphs = DependencyGraphs::build(&nodes).unwrap();

        assert_eq!(
            graphs
                .configuration
                .dependencies_of(&"lending_pool_core".into()),
            &BTreeSet::from([NodeId::from("lending_pool_peripheral")])
        );
        assert_eq!(
            graphs
                .configuration
                .sources_of(&"lending_pool_peripheral".into()),
            &BTreeSet::from([NodeId::from("lending_pool_core")])
        );
        assert_eq!(
            graphs
                .configuration
                .actions_touching(&"lending_pool_peripheral".into())
                .count(),
            1
        );
        assert_eq!(
            graphs
                .configuration
                .actions_touching(&"lending_pool_core".into())
                .count(),
            1
        );
    }

    #[test]
    fn test_dangling_constructor_dependency_is_reported() {
        let nodes = vec![internal("loans", &["loans_core"], vec![])];

        let err = DependencyGraphs::build(&nodes).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                node: "loans".into(),
                missing: "loans_core".into(),
                via: "constructor".to_string(),
            }
        );
    }

    #[test]
    fn test_dangling_configuration_dependency_is_reported() {
        let nodes = vec![internal(
            "liquidations_peripheral",
            &[],
            vec![wire(
                "liquidations_peripheral",
                "sushi_router",
                "setSushiRouterAddress",
            )],
        )];

        let err = DependencyGraphs::build(&nodes).unwrap_err();
        assert!(matches!(
            err,
            GraphError::DanglingDependency { ref missing, .. } if missing.as_str() == "sushi_router"
        ));
    }

    #[test]
    fn test_duplicate_node_is_reported() {
        let nodes = vec![internal("loans", &[], vec![]), external("loans")];
        assert_eq!(
            DependencyGraphs::build(&nodes).unwrap_err(),
            GraphError::DuplicateNode {
                node: "loans".into()
            }
        );
    }

    #[test]
    fn test_action_on_another_node_is_rejected() {
        let nodes = vec![
            internal(
                "loans",
                &[],
                vec![wire("loans_core", "loans", "setLoansPeripheral")],
            ),
            internal("loans_core", &[], vec![]),
        ];
        assert!(matches!(
            DependencyGraphs::build(&nodes).unwrap_err(),
            GraphError::ForeignAction { .. }
        ));
    }

    #[test]
    fn test_subsumption_requires_constructor_wiring() {
        let mut backed = wire(
            "loans",
            "collateral_vault_peripheral",
            "setCollateralVaultPeripheralAddress",
        );
        backed.subsumed_by = Some("loans".into());

        let nodes = vec![
            internal("collateral_vault_peripheral", &[], vec![]),
            internal("loans", &["collateral_vault_peripheral"], vec![backed.clone()]),
        ];
        assert!(DependencyGraphs::build(&nodes).is_ok());

        let nodes = vec![
            internal("collateral_vault_peripheral", &[], vec![]),
            internal("loans", &[], vec![backed]),
        ];
        assert!(matches!(
            DependencyGraphs::build(&nodes).unwrap_err(),
            GraphError::InvalidSubsumption { .. }
        ));
    }
}
