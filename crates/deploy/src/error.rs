//! Error taxonomy of the orchestrator.
//!
//! Configuration errors ([`GraphError`], [`ManifestError`]) are raised before any chain
//! interaction. Resolution, context and chain errors surface during execution wrapped in an
//! [`ExecutionError`] carrying the node (and action) they occurred on.

use std::path::PathBuf;

use thiserror::Error;

use crate::node::{ActionId, NodeId};

/// Structural errors in the declared node collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A constructor argument or configuration action names a node that does not exist.
    #[error("dangling dependency: {node} references unknown node '{missing}' via {via}")]
    DanglingDependency {
        node: NodeId,
        missing: NodeId,
        via: String,
    },

    /// Two nodes share the same id.
    #[error("duplicate node id: {node}")]
    DuplicateNode { node: NodeId },

    /// Two configuration actions share the same id.
    #[error("duplicate configuration action: {action}")]
    DuplicateAction { action: ActionId },

    /// The deployment graph contains a cycle.
    #[error("cycle detected in deployment graph at '{node}': {}", format_path(.path))]
    Cycle { node: NodeId, path: Vec<NodeId> },

    /// A subsumption declaration the deploying node's constructor does not back.
    #[error("action {action} cannot be subsumed by {by}: {reason}")]
    InvalidSubsumption {
        action: ActionId,
        by: NodeId,
        reason: String,
    },

    /// An action declared on a node is sent to some other node, or to an external contract.
    #[error("action {action} declared on {node} must be sent to an internal node it belongs to")]
    ForeignAction { node: NodeId, action: ActionId },

    /// A changed-contract input names no node.
    #[error("unknown node in change inputs: {node}")]
    UnknownNode { node: NodeId },
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors turning a declarative manifest into concrete nodes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("contract '{contract}' uses unknown parameter '{parameter}'")]
    UnknownParameter { contract: String, parameter: String },

    #[error("shared contract '{contract}' cannot reference pool-scoped contract '{reference}' outside a pool")]
    AmbiguousReference { contract: String, reference: String },

    #[error("contract '{contract}' uses collection argument '{argument}' outside a per-collection action")]
    CollectionOutsideAction { contract: String, argument: String },

    #[error("invalid argument '{argument}': {reason}")]
    InvalidArgument { argument: String, reason: String },

    #[error("duplicate contract name in manifest: {name}")]
    DuplicateContract { name: String },
}

/// A value the context cannot provide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("node '{node}' has no resolved address")]
    Unresolved { node: NodeId },

    #[error("node '{node}' is not part of the deployment context")]
    UnknownNode { node: NodeId },
}

/// Invalid mutations of the deployment context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("node '{node}' was already deployed during this run")]
    AlreadyDeployed { node: NodeId },

    #[error("node '{node}' is external and cannot be deployed or configured")]
    ExternalNode { node: NodeId },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Failures reported by the chain client collaborator.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("failed to load artifact {}: {reason}", .path.display())]
    Artifact { path: PathBuf, reason: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// An execution step failed. The run halts at the first one.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to deploy {node}: {source}")]
    Deployment {
        node: NodeId,
        #[source]
        source: ChainError,
    },

    #[error("failed to configure {node} ({action}): {source}")]
    Configuration {
        node: NodeId,
        action: ActionId,
        #[source]
        source: ChainError,
    },

    #[error("failed to read current state of {node} ({action}): {source}")]
    Read {
        node: NodeId,
        action: ActionId,
        #[source]
        source: ChainError,
    },

    #[error("cannot process {node}: {source}")]
    Resolution {
        node: NodeId,
        #[source]
        source: ResolutionError,
    },

    #[error("cannot record {node}: {source}")]
    Context {
        node: NodeId,
        #[source]
        source: ContextError,
    },
}

impl ExecutionError {
    /// The node the failing step was processing.
    pub fn node(&self) -> &NodeId {
        match self {
            ExecutionError::Deployment { node, .. }
            | ExecutionError::Configuration { node, .. }
            | ExecutionError::Read { node, .. }
            | ExecutionError::Resolution { node, .. }
            | ExecutionError::Context { node, .. } => node,
        }
    }
}

/// Top-level error of an orchestration run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
