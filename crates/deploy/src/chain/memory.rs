//! An in-process chain.
//!
//! Used by tests and by dry runs that have no RPC endpoint. Contracts get deterministic
//! addresses, and setters can be mirrored to getters so that read-before-write checks observe
//! earlier writes.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use alloy_core::primitives::{Address, TxHash, keccak256};

use super::{Call, ChainClient, DeployRequest, TxReceipt};
use crate::{
    error::ChainError,
    node::{ArgTemplate, ConfigAction, ContractHandle, Node, NodeId, Value, ValueKind},
};

/// First address handed out to deployed contracts.
const FIRST_CONTRACT: u64 = 0xc0_0000;

/// A transaction the chain accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentTransaction {
    Deploy {
        node: NodeId,
        address: Address,
        args: Vec<Value>,
    },
    Call {
        target: Address,
        method: String,
        args: Vec<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mirror {
    /// The last argument is stored, the preceding ones key it.
    Value,
    /// Every argument is a key, `true` is stored.
    Flag,
}

#[derive(Debug, Default)]
struct State {
    nonce: u64,
    deployments: u64,
    contracts: BTreeMap<Address, NodeId>,
    storage: BTreeMap<(Address, String, Vec<Value>), Value>,
    mirrors: BTreeMap<String, (String, Mirror)>,
    reject_unchanged_writes: bool,
    failing_deploys: BTreeMap<NodeId, String>,
    failing_calls: BTreeMap<String, String>,
    log: Vec<SentTransaction>,
}

impl State {
    fn next_hash(&mut self) -> TxHash {
        self.nonce += 1;
        keccak256(self.nonce.to_be_bytes())
    }
}

/// In-memory [`ChainClient`].
#[derive(Debug, Default)]
pub struct MemoryChain {
    state: Mutex<State>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, ChainError> {
        self.state
            .lock()
            .map_err(|_| ChainError::Rpc("memory chain state poisoned".to_string()))
    }

    /// Make `setter(k.., v)` observable through `getter(k..)`, which returns `v`.
    pub fn mirror(self, setter: impl Into<String>, getter: impl Into<String>) -> Self {
        self.with_mirror(setter.into(), getter.into(), Mirror::Value)
    }

    /// Make `setter(k..)` observable through `getter(k..)`, which returns `true`.
    pub fn mirror_flag(self, setter: impl Into<String>, getter: impl Into<String>) -> Self {
        self.with_mirror(setter.into(), getter.into(), Mirror::Flag)
    }

    /// Mirror every configuration action of `nodes` to its getter. Getters expecting `true` are
    /// flags, the others return the setter's last argument.
    pub fn mirror_getters<'n>(self, nodes: impl IntoIterator<Item = &'n Node>) -> Self {
        let actions: Vec<&ConfigAction> = nodes
            .into_iter()
            .flat_map(Node::configuration_actions)
            .collect();

        actions.into_iter().fold(self, |chain, action| match &action.getter {
            Some(getter) if getter.expect == ArgTemplate::Value(Value::Bool(true)) => {
                chain.mirror_flag(action.method.clone(), getter.method.clone())
            }
            Some(getter) => chain.mirror(action.method.clone(), getter.method.clone()),
            None => chain,
        })
    }

    /// Treat `addresses` as contracts deployed earlier, so calls and reads to them succeed.
    pub fn adopt(&self, addresses: impl IntoIterator<Item = (NodeId, Address)>) {
        if let Ok(mut state) = self.state.lock() {
            state.contracts.extend(
                addresses
                    .into_iter()
                    .map(|(node, address)| (address, node)),
            );
        }
    }

    fn with_mirror(self, setter: String, getter: String, mirror: Mirror) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.mirrors.insert(setter, (getter, mirror));
        }
        self
    }

    /// Revert mirrored writes that would not change the stored value, like contracts guarding
    /// against setting the same address twice.
    pub fn reject_unchanged_writes(self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.reject_unchanged_writes = true;
        }
        self
    }

    /// Revert every deployment of `node` until [`MemoryChain::clear_failures`].
    pub fn fail_deploy(&self, node: impl Into<NodeId>, reason: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_deploys.insert(node.into(), reason.into());
        }
    }

    /// Revert every call to `method` until [`MemoryChain::clear_failures`].
    pub fn fail_call(&self, method: impl Into<String>, reason: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_calls.insert(method.into(), reason.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_deploys.clear();
            state.failing_calls.clear();
        }
    }

    /// Every accepted transaction, in submission order.
    pub fn transactions(&self) -> Vec<SentTransaction> {
        self.state
            .lock()
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().map(|state| state.log.len()).unwrap_or(0)
    }

    /// Calls sent to `method`, in submission order.
    pub fn calls_to(&self, method: &str) -> Vec<(Address, Vec<Value>)> {
        self.transactions()
            .into_iter()
            .filter_map(|tx| match tx {
                SentTransaction::Call {
                    target,
                    method: sent,
                    args,
                } if sent == method => Some((target, args)),
                _ => None,
            })
            .collect()
    }

    /// Nodes deployed, in submission order.
    pub fn deployed_nodes(&self) -> Vec<NodeId> {
        self.transactions()
            .into_iter()
            .filter_map(|tx| match tx {
                SentTransaction::Deploy { node, .. } => Some(node),
                SentTransaction::Call { .. } => None,
            })
            .collect()
    }
}

impl ChainClient for MemoryChain {
    async fn deploy(&self, request: DeployRequest) -> Result<ContractHandle, ChainError> {
        let mut state = self.state()?;

        if let Some(reason) = state.failing_deploys.get(&request.node) {
            return Err(ChainError::Reverted(reason.clone()));
        }

        let address =
            Address::left_padding_from(&(FIRST_CONTRACT + state.deployments).to_be_bytes());
        state.deployments += 1;
        let transaction = state.next_hash();

        state.contracts.insert(address, request.node.clone());
        state.log.push(SentTransaction::Deploy {
            node: request.node,
            address,
            args: request.args,
        });

        Ok(ContractHandle {
            address,
            transaction: Some(transaction),
        })
    }

    async fn call(
        &self,
        target: Address,
        call: &Call,
        _signer: Address,
    ) -> Result<TxReceipt, ChainError> {
        let mut state = self.state()?;

        if !state.contracts.contains_key(&target) {
            return Err(ChainError::Reverted(format!("no contract at {target}")));
        }
        if let Some(reason) = state.failing_calls.get(&call.method) {
            return Err(ChainError::Reverted(reason.clone()));
        }

        if let Some((getter, mirror)) = state.mirrors.get(&call.method).cloned() {
            let (keys, value) = match mirror {
                Mirror::Value => match call.args.split_last() {
                    Some((value, keys)) => (keys.to_vec(), *value),
                    None => {
                        return Err(ChainError::Reverted(format!(
                            "{} takes no value to store",
                            call.method
                        )));
                    }
                },
                Mirror::Flag => (call.args.clone(), Value::Bool(true)),
            };

            let slot = (target, getter, keys);
            if state.reject_unchanged_writes && state.storage.get(&slot) == Some(&value) {
                return Err(ChainError::Reverted("new value is the same".to_string()));
            }
            state.storage.insert(slot, value);
        }

        let transaction_hash = state.next_hash();
        state.log.push(SentTransaction::Call {
            target,
            method: call.method.clone(),
            args: call.args.clone(),
        });

        Ok(TxReceipt {
            transaction_hash,
            block_number: Some(state.nonce),
        })
    }

    async fn read(
        &self,
        target: Address,
        call: &Call,
        returns: ValueKind,
    ) -> Result<Value, ChainError> {
        let state = self.state()?;

        if !state.contracts.contains_key(&target) {
            return Err(ChainError::Reverted(format!("no contract at {target}")));
        }

        let slot = (target, call.method.clone(), call.args.clone());
        Ok(state
            .storage
            .get(&slot)
            .copied()
            .unwrap_or_else(|| returns.zero()))
    }
}
