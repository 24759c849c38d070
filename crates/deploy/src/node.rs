//! Data model for the contract graph.
//!
//! A [`Node`] is one contract abstraction tracked by the orchestrator. Internal nodes are
//! deployed and configured by us; external nodes are address-only references to contracts
//! someone else owns (pool tokens, AMM routers, NFT collections).

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_core::primitives::{Address, TxHash, U256};
use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

/// Stable identifier of a node in the contract graph.
///
/// Shared nodes use the contract name (`collateral_vault_core`), pool-scoped nodes append the
/// pool (`loans.weth`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize, Deref, Display, From)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the instance of `name` serving `pool`.
    pub fn scoped(name: &str, pool: &PoolId) -> Self {
        Self(format!("{name}.{pool}"))
    }

    /// Id of the external node standing for an NFT collection.
    pub fn collection(name: &str) -> Self {
        Self(format!("collection.{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a lending pool (e.g. `weth`, `usdc`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize, Deref, Display, From)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for PoolId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a configuration action: `<source>:<method>:<dependency>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize, Deref, Display, From)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The target environment of a run.
///
/// Environments gate external-integration wiring: only `local` and `production` have real
/// AMM routers and vault factories to point at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    Local,
    Dev,
    Integration,
    Production,
}

/// A statically-typed ABI value. Only single-word types are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Address(Address),
    Uint(U256),
}

/// The ABI type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ValueKind {
    #[strum(serialize = "address")]
    Address,
    #[strum(serialize = "uint256")]
    Uint,
    #[strum(serialize = "bool")]
    Bool,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Address(_) => ValueKind::Address,
            Value::Uint(_) => ValueKind::Uint,
            Value::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            Value::Address(address) => Some(*address),
            _ => None,
        }
    }
}

impl ValueKind {
    /// The value a freshly deployed contract holds for a field of this type.
    pub fn zero(&self) -> Value {
        match self {
            ValueKind::Address => Value::Address(Address::ZERO),
            ValueKind::Uint => Value::Uint(U256::ZERO),
            ValueKind::Bool => Value::Bool(false),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Address(address) => write!(f, "{address:#x}"),
            Value::Uint(value) => write!(f, "{value}"),
            Value::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// Error returned when a literal cannot be parsed as a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid literal value: {0}")]
pub struct InvalidValue(pub String);

impl FromStr for Value {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }

        if s.starts_with("0x") && s.len() == 42 {
            return s
                .parse::<Address>()
                .map(Value::Address)
                .map_err(|_| InvalidValue(s.to_string()));
        }

        U256::from_str_radix(s, 10)
            .map(Value::Uint)
            .map_err(|_| InvalidValue(s.to_string()))
    }
}

/// An argument whose value is only known once the context can resolve it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArgTemplate {
    /// The address of another node.
    Node(NodeId),
    /// The signing owner of the run.
    Owner,
    /// A literal.
    Value(Value),
}

impl ArgTemplate {
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            ArgTemplate::Node(id) => Some(id),
            _ => None,
        }
    }

    /// The ABI type this template resolves to.
    pub fn kind(&self) -> ValueKind {
        match self {
            ArgTemplate::Node(_) | ArgTemplate::Owner => ValueKind::Address,
            ArgTemplate::Value(value) => value.kind(),
        }
    }
}

impl fmt::Display for ArgTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgTemplate::Node(id) => write!(f, "@{id}"),
            ArgTemplate::Owner => write!(f, "$owner"),
            ArgTemplate::Value(value) => write!(f, "{value}"),
        }
    }
}

/// Read-only accessor used to check whether a configuration action is already in effect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Getter {
    pub method: String,
    pub args: Vec<ArgTemplate>,
    /// The value the getter returns once the action has been applied.
    pub expect: ArgTemplate,
}

/// A post-deployment transaction wiring `source` to `dependency`.
///
/// Actions are interpreted by the executor, compared for subsumption and fingerprinted in the
/// deployment record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigAction {
    /// The node the call is sent to.
    pub source: NodeId,
    /// The node whose presence triggers the call. Equal to `source` for plain parameters.
    pub dependency: NodeId,
    pub method: String,
    pub args: Vec<ArgTemplate>,
    pub getter: Option<Getter>,
    /// Environments this action may run in. `None` means all of them.
    pub environments: Option<BTreeSet<Environment>>,
    /// The node whose fresh deployment already applies this action through its constructor.
    pub subsumed_by: Option<NodeId>,
    /// Optional configuration key (e.g. `nft_borrowable_amounts`) shared by related actions.
    pub key: Option<String>,
}

impl ConfigAction {
    pub fn id(&self) -> ActionId {
        ActionId(format!("{}:{}:{}", self.source, self.method, self.dependency))
    }

    /// Whether the static environment predicate admits this action.
    pub fn allowed_in(&self, environment: Environment) -> bool {
        self.environments
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&environment))
    }

    /// Every node this action needs an address for, source and dependency included.
    pub fn referenced_nodes(&self) -> BTreeSet<&NodeId> {
        let mut nodes: BTreeSet<&NodeId> = [&self.source, &self.dependency].into_iter().collect();
        nodes.extend(self.args.iter().filter_map(ArgTemplate::node));
        if let Some(getter) = &self.getter {
            nodes.extend(getter.args.iter().filter_map(ArgTemplate::node));
            nodes.extend(getter.expect.node());
        }
        nodes
    }

    /// Human-readable call, e.g. `setLoansPeripheral(@loans.weth)`.
    pub fn describe(&self) -> String {
        let args = self
            .args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}.{}({})", self.source, self.method, args)
    }
}

/// A resolved on-chain instance of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractHandle {
    pub address: Address,
    /// The creation transaction, when this run (or a recorded one) deployed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TxHash>,
}

impl ContractHandle {
    pub fn at(address: Address) -> Self {
        Self {
            address,
            transaction: None,
        }
    }
}

/// A contract we deploy and configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalContract {
    pub id: NodeId,
    pub name: String,
    pub pool_scope: BTreeSet<PoolId>,
    /// Compiled bytecode (hex) for the deploy primitive.
    pub artifact: PathBuf,
    pub constructor: Vec<ArgTemplate>,
    pub actions: Vec<ConfigAction>,
    pub handle: Option<ContractHandle>,
}

/// A contract owned by someone else that we only reference by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalContract {
    pub id: NodeId,
    pub name: String,
    pub pool_scope: BTreeSet<PoolId>,
    /// Absent when the environment has no instance (e.g. no AMM router on `dev`).
    pub address: Option<Address>,
}

/// A node in the contract graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalContract),
    External(ExternalContract),
}

impl Node {
    pub fn id(&self) -> &NodeId {
        match self {
            Node::Internal(contract) => &contract.id,
            Node::External(contract) => &contract.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Internal(contract) => &contract.name,
            Node::External(contract) => &contract.name,
        }
    }

    pub fn pool_scope(&self) -> &BTreeSet<PoolId> {
        match self {
            Node::Internal(contract) => &contract.pool_scope,
            Node::External(contract) => &contract.pool_scope,
        }
    }

    pub fn is_deployable(&self) -> bool {
        matches!(self, Node::Internal(_))
    }

    /// The resolved address of this node, if any.
    pub fn address(&self) -> Option<Address> {
        match self {
            Node::Internal(contract) => contract.handle.map(|handle| handle.address),
            Node::External(contract) => contract.address,
        }
    }

    pub fn handle(&self) -> Option<ContractHandle> {
        match self {
            Node::Internal(contract) => contract.handle,
            Node::External(contract) => contract.address.map(ContractHandle::at),
        }
    }

    /// Nodes whose addresses are constructor arguments of this node.
    pub fn deployment_dependencies(&self) -> BTreeSet<NodeId> {
        match self {
            Node::Internal(contract) => contract
                .constructor
                .iter()
                .filter_map(ArgTemplate::node)
                .cloned()
                .collect(),
            Node::External(_) => BTreeSet::new(),
        }
    }

    pub fn configuration_actions(&self) -> &[ConfigAction] {
        match self {
            Node::Internal(contract) => &contract.actions,
            Node::External(_) => &[],
        }
    }

    pub fn artifact(&self) -> Option<&Path> {
        match self {
            Node::Internal(contract) => Some(&contract.artifact),
            Node::External(_) => None,
        }
    }
}
