//! Deterministic deployment order.

use std::collections::{BTreeMap, btree_set};

use crate::{error::GraphError, graph::DependencyGraph, node::NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Linearize the deployment graph so that every dependency precedes its dependents.
///
/// A depth-first postorder over all nodes, taken as is: a node is emitted once all of its
/// dependencies have been. Roots and dependency sets are visited in lexicographic order, so the
/// same graph always yields the same order.
///
/// Returns [`GraphError::Cycle`] when the traversal reaches a node that is still on the stack.
pub fn deployment_order(graph: &DependencyGraph) -> Result<Vec<NodeId>, GraphError> {
    let mut marks: BTreeMap<&NodeId, Mark> = BTreeMap::new();
    // Nodes on the current path, each with the dependencies still to visit.
    let mut stack: Vec<(&NodeId, btree_set::Iter<'_, NodeId>)> = Vec::new();
    let mut order = Vec::with_capacity(graph.len());

    for root in graph.nodes() {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::Visiting);
        stack.push((root, graph.dependencies(root).iter()));

        while let Some((node, dependencies)) = stack.last_mut() {
            let Some(dependency) = dependencies.next() else {
                let node = *node;
                stack.pop();
                marks.insert(node, Mark::Done);
                order.push(node.clone());
                continue;
            };

            match marks.get(dependency) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => return Err(cycle(&stack, dependency)),
                None => {
                    marks.insert(dependency, Mark::Visiting);
                    stack.push((dependency, graph.dependencies(dependency).iter()));
                }
            }
        }
    }

    Ok(order)
}

fn cycle(stack: &[(&NodeId, btree_set::Iter<'_, NodeId>)], node: &NodeId) -> GraphError {
    let start = stack.iter().position(|(n, _)| *n == node).unwrap_or(0);
    let mut path: Vec<NodeId> = stack[start..].iter().map(|(n, _)| (*n).clone()).collect();
    path.push(node.clone());
    GraphError::Cycle {
        node: node.clone(),
        path,
    }
}

/// Restrict `order` to the nodes accepted by `keep`, preserving relative positions.
pub fn restrict<'a>(
    order: &'a [NodeId],
    mut keep: impl FnMut(&NodeId) -> bool + 'a,
) -> impl Iterator<Item = &'a NodeId> + 'a {
    order.iter().filter(move |node| keep(*node))
}
