//! lendctl-deploy - Deployment and configuration orchestrator for the NFT lending protocol.
//!
//! This crate computes, from a set of changed contracts and configuration keys, the minimal
//! ordered set of deployments and configuration transactions needed to bring an environment up
//! to date, and applies it through a [`ChainClient`].

pub mod chain;
pub use chain::{ChainClient, MemoryChain, RpcChain};

mod change_set;
pub use change_set::{ChangeInputs, ChangeSet, PruneReason, propagate};

pub mod config;
pub use config::{CONFIG_FILENAME, ENV_PREFIX, StaticConfig};

mod context;
pub use context::DeploymentContext;

pub mod error;
pub use error::{
    ChainError, ContextError, Error, ExecutionError, GraphError, ManifestError, ResolutionError,
};

mod executor;

#[cfg(test)]
mod fixtures;
pub use executor::{Executor, Outcome, PlannedAction, RunReport, plan};

mod graph;
pub use graph::{ConfigurationGraph, DependencyGraph, DependencyGraphs};

pub mod node;
pub use node::{
    ActionId, ArgTemplate, ConfigAction, ContractHandle, Environment, Node, NodeId, PoolId, Value,
};

mod order;
pub use order::deployment_order;

mod orchestrator;
pub use orchestrator::Orchestrator;

pub mod protocol;

mod record;
pub use record::{
    ContractEntry, DeploymentRecord, RecordLock, action_fingerprint, contract_fingerprint,
};
