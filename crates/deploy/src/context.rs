//! The per-run registry of nodes and their resolved addresses.

use std::collections::{BTreeMap, BTreeSet};

use alloy_core::primitives::Address;

use crate::{
    error::{ContextError, GraphError, ResolutionError},
    node::{
        ActionId, ArgTemplate, ConfigAction, ContractHandle, Environment, Node, NodeId, PoolId,
        Value,
    },
};

/// Environment-scoped registry mapping node ids to nodes and their resolved handles.
///
/// Built once per run from the static configuration (and the deployment record), mutated as
/// deployments and configuration transactions commit, and discarded at the end of the run.
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    environment: Environment,
    owner: Address,
    pools: Vec<PoolId>,
    nodes: BTreeMap<NodeId, Node>,
    configured: BTreeSet<ActionId>,
    deployed_this_run: BTreeSet<NodeId>,
}

impl DeploymentContext {
    /// Create a context over `nodes`. Node ids must be unique.
    pub fn new(
        environment: Environment,
        owner: Address,
        pools: Vec<PoolId>,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Result<Self, GraphError> {
        let mut by_id = BTreeMap::new();
        for node in nodes {
            let id = node.id().clone();
            if by_id.insert(id.clone(), node).is_some() {
                return Err(GraphError::DuplicateNode { node: id });
            }
        }

        Ok(Self {
            environment,
            owner,
            pools,
            nodes: by_id,
            configured: BTreeSet::new(),
            deployed_this_run: BTreeSet::new(),
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn pools(&self) -> &[PoolId] {
        &self.pools
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, Node> {
        &self.nodes
    }

    pub fn try_get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get(&self, id: &NodeId) -> Result<&Node, ResolutionError> {
        self.nodes
            .get(id)
            .ok_or_else(|| ResolutionError::UnknownNode { node: id.clone() })
    }

    /// The resolved address of `id`, if it has one.
    pub fn resolve(&self, id: &NodeId) -> Option<Address> {
        self.nodes.get(id).and_then(Node::address)
    }

    /// The resolved address of `id`, failing when it is unknown or unresolved.
    pub fn require(&self, id: &NodeId) -> Result<Address, ResolutionError> {
        self.get(id)?
            .address()
            .ok_or_else(|| ResolutionError::Unresolved { node: id.clone() })
    }

    pub fn resolve_arg(&self, arg: &ArgTemplate) -> Result<Value, ResolutionError> {
        match arg {
            ArgTemplate::Node(id) => self.require(id).map(Value::Address),
            ArgTemplate::Owner => Ok(Value::Address(self.owner)),
            ArgTemplate::Value(value) => Ok(*value),
        }
    }

    pub fn resolve_args(&self, args: &[ArgTemplate]) -> Result<Vec<Value>, ResolutionError> {
        args.iter().map(|arg| self.resolve_arg(arg)).collect()
    }

    /// Install a handle known from a previous run. Does not count as a deployment of this run.
    pub fn seed_handle(&mut self, id: &NodeId, handle: ContractHandle) -> Result<(), ContextError> {
        match self.nodes.get_mut(id) {
            Some(Node::Internal(contract)) => {
                contract.handle = Some(handle);
                Ok(())
            }
            Some(Node::External(_)) => Err(ContextError::ExternalNode { node: id.clone() }),
            None => Err(ResolutionError::UnknownNode { node: id.clone() }.into()),
        }
    }

    /// Record the handle of a node deployed in this run.
    ///
    /// A node is deployed at most once per run, so its address is stable once recorded.
    pub fn record_deployment(
        &mut self,
        id: &NodeId,
        handle: ContractHandle,
    ) -> Result<(), ContextError> {
        if self.deployed_this_run.contains(id) {
            return Err(ContextError::AlreadyDeployed { node: id.clone() });
        }

        self.seed_handle(id, handle)?;
        self.deployed_this_run.insert(id.clone());

        tracing::debug!(node = %id, address = %handle.address, "Recorded deployment");
        Ok(())
    }

    /// Record that `action` is in effect on `id`, either committed by this run or found already
    /// set on-chain.
    pub fn record_configuration(
        &mut self,
        id: &NodeId,
        action: &ConfigAction,
    ) -> Result<(), ContextError> {
        match self.get(id)? {
            Node::External(_) => return Err(ContextError::ExternalNode { node: id.clone() }),
            Node::Internal(contract) if contract.handle.is_none() => {
                return Err(ResolutionError::Unresolved { node: id.clone() }.into());
            }
            Node::Internal(_) => {}
        }

        self.configured.insert(action.id());
        Ok(())
    }

    pub fn is_configured(&self, action: &ActionId) -> bool {
        self.configured.contains(action)
    }

    pub fn configured(&self) -> &BTreeSet<ActionId> {
        &self.configured
    }

    pub fn deployed_this_run(&self, id: &NodeId) -> bool {
        self.deployed_this_run.contains(id)
    }

    /// Every resolved address, by node.
    pub fn addresses(&self) -> BTreeMap<NodeId, Address> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| node.address().map(|address| (id.clone(), address)))
            .collect()
    }
}
