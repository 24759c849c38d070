//! The chain client collaborator.
//!
//! The orchestrator only needs three primitives: deploy a contract, send a call and perform a
//! read-only call. [`RpcChain`] talks to an Ethereum JSON-RPC endpoint, [`MemoryChain`] simulates
//! one in-process.

pub mod abi;
mod memory;
mod rpc;

use std::{future::Future, path::PathBuf};

use alloy_core::primitives::{Address, TxHash};

pub use memory::{MemoryChain, SentTransaction};
pub use rpc::RpcChain;

use crate::{
    error::ChainError,
    node::{ContractHandle, NodeId, Value, ValueKind},
};

/// A contract creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// The node being deployed, for logging and error reporting.
    pub node: NodeId,
    /// Hex-encoded creation bytecode.
    pub artifact: PathBuf,
    pub args: Vec<Value>,
    pub signer: Address,
}

/// A contract method invocation with resolved arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// The canonical signature, e.g. `setLoansPeripheral(address)`.
    pub fn signature(&self) -> String {
        let types = self
            .args
            .iter()
            .map(|arg| arg.kind().to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({})", self.method, types)
    }
}

/// The committed result of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: TxHash,
    pub block_number: Option<u64>,
}

/// Narrow interface to the target chain.
///
/// Implementations wait for confirmation before returning, so a returned handle or receipt is
/// committed. Callers never issue two transactions concurrently.
pub trait ChainClient {
    fn deploy(
        &self,
        request: DeployRequest,
    ) -> impl Future<Output = Result<ContractHandle, ChainError>> + Send;

    fn call(
        &self,
        target: Address,
        call: &Call,
        signer: Address,
    ) -> impl Future<Output = Result<TxReceipt, ChainError>> + Send;

    /// Read-only call decoding a single return word of type `returns`.
    fn read(
        &self,
        target: Address,
        call: &Call,
        returns: ValueKind,
    ) -> impl Future<Output = Result<Value, ChainError>> + Send;
}
