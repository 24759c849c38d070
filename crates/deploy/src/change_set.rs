//! Change-set propagation.
//!
//! Turns the explicitly changed inputs of a run into the nodes that must be redeployed and the
//! configuration actions that must be (re)issued.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::GraphError,
    graph::DependencyGraphs,
    node::{ActionId, ConfigAction, Environment, Node, NodeId},
    order,
};

/// The explicitly changed inputs of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInputs {
    /// Nodes whose bytecode or constructor arguments changed.
    pub contracts: BTreeSet<NodeId>,
    /// Node ids, configuration keys or action ids whose desired configuration changed.
    pub configs: BTreeSet<String>,
}

impl ChangeInputs {
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty() && self.configs.is_empty()
    }

    pub fn merge(&mut self, other: ChangeInputs) {
        self.contracts.extend(other.contracts);
        self.configs.extend(other.configs);
    }
}

/// Why a selected configuration action will not be issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum PruneReason {
    /// A fresh deployment of `by` already applies the action through its constructor.
    Subsumed { by: NodeId },
    /// The action is not allowed in the run's environment.
    Gated { environment: Environment },
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PruneReason::Subsumed { by } => write!(f, "subsumed by fresh deployment of {by}"),
            PruneReason::Gated { environment } => write!(f, "not allowed on {environment}"),
        }
    }
}

/// The nodes and configuration actions a run must apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Nodes to (re)deploy, in deployment order.
    pub deployments: Vec<NodeId>,
    /// Configuration actions to (re)issue, by source node, in declaration order.
    pub transactions: BTreeMap<NodeId, Vec<ConfigAction>>,
    /// Selected actions that were dropped, with the reason.
    pub pruned: Vec<(ActionId, PruneReason)>,
    /// Sources of `transactions` in deployment order.
    sources: Vec<NodeId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty() && self.transactions.is_empty()
    }

    pub fn deploys(&self, node: &NodeId) -> bool {
        self.deployments.contains(node)
    }

    /// Configuration actions in execution order: by the deployment position of their source,
    /// then in declaration order.
    pub fn ordered_transactions(&self) -> impl Iterator<Item = &ConfigAction> {
        self.sources
            .iter()
            .filter_map(|source| self.transactions.get(source))
            .flatten()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.values().map(Vec::len).sum()
    }

    pub fn pruned_reason(&self, action: &ActionId) -> Option<&PruneReason> {
        self.pruned
            .iter()
            .find(|(id, _)| id == action)
            .map(|(_, reason)| reason)
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            writeln!(f, "nothing to do")?;
        }
        for node in &self.deployments {
            writeln!(f, "deploy    {node}")?;
        }
        for action in self.ordered_transactions() {
            writeln!(f, "configure {}", action.describe())?;
        }
        for (action, reason) in &self.pruned {
            writeln!(f, "skip      {action} ({reason})")?;
        }
        Ok(())
    }
}

/// Compute the change set of `inputs`.
///
/// Every node depending on a changed contract, directly or transitively, is redeployed. External
/// nodes propagate the change to their dependents but are never deployed themselves. An action is
/// selected when any node it references is in that closure, or when its source, dependency, key
/// or id is a changed configuration. Selected actions the environment does not allow, and those
/// a fresh deployment already applies, are pruned.
///
/// `order` must be the deployment order of `graphs`.
pub fn propagate(
    graphs: &DependencyGraphs,
    order: &[NodeId],
    nodes: &BTreeMap<NodeId, Node>,
    environment: Environment,
    inputs: &ChangeInputs,
) -> Result<ChangeSet, GraphError> {
    if let Some(unknown) = inputs
        .contracts
        .iter()
        .find(|node| !graphs.deployment.contains(node))
    {
        return Err(GraphError::UnknownNode {
            node: unknown.clone(),
        });
    }

    let reached = dependents_closure(graphs, &inputs.contracts);
    let deployable: BTreeSet<&NodeId> = reached
        .iter()
        .filter(|node| nodes.get(*node).is_some_and(Node::is_deployable))
        .collect();

    let deployments: Vec<NodeId> = order::restrict(order, |node| deployable.contains(node))
        .cloned()
        .collect();

    let mut matched_configs: BTreeSet<&str> = BTreeSet::new();
    let mut transactions: BTreeMap<NodeId, Vec<ConfigAction>> = BTreeMap::new();
    let mut pruned = Vec::new();

    for action in graphs.configuration.actions() {
        let id = action.id();
        let config_hits: Vec<&str> = [
            Some(action.source.as_str()),
            Some(action.dependency.as_str()),
            action.key.as_deref(),
            Some(id.as_str()),
        ]
        .into_iter()
        .flatten()
        .filter_map(|candidate| inputs.configs.get(candidate).map(String::as_str))
        .collect();

        let touched = action
            .referenced_nodes()
            .into_iter()
            .any(|node| reached.contains(node));

        if !touched && config_hits.is_empty() {
            continue;
        }
        matched_configs.extend(config_hits);

        if !action.allowed_in(environment) {
            pruned.push((id, PruneReason::Gated { environment }));
            continue;
        }

        if let Some(by) = action.subsumed_by.as_ref().filter(|by| deployable.contains(by)) {
            pruned.push((id, PruneReason::Subsumed { by: by.clone() }));
            continue;
        }

        transactions
            .entry(action.source.clone())
            .or_default()
            .push(action.clone());
    }

    for (action, reason) in &pruned {
        tracing::debug!(action = %action, reason = %reason, "Pruned configuration action");
    }

    for config in inputs
        .configs
        .iter()
        .filter(|config| !matched_configs.contains(config.as_str()))
    {
        tracing::warn!(config = %config, "Changed configuration matches no action, ignoring");
    }

    let sources = order::restrict(order, |node| transactions.contains_key(node))
        .cloned()
        .collect();

    let change_set = ChangeSet {
        deployments,
        transactions,
        pruned,
        sources,
    };

    tracing::info!(
        deployments = change_set.deployments.len(),
        transactions = change_set.transaction_count(),
        pruned = change_set.pruned.len(),
        "Computed change set"
    );

    Ok(change_set)
}

/// All nodes reachable from `seeds` along reversed deployment edges, seeds included.
fn dependents_closure(graphs: &DependencyGraphs, seeds: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    let dependents = graphs.deployment.dependents();
    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    let mut pending: Vec<&NodeId> = seeds.iter().collect();

    while let Some(node) = pending.pop() {
        if !visited.insert(node.clone()) {
            continue;
        }
        if let Some(next) = dependents.get(node) {
            pending.extend(next.iter().filter(|dependent| !visited.contains(*dependent)));
        }
    }

    visited
}
