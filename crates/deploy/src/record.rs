//! Deployment record: the addresses a run leaves behind, and the fingerprints the next run
//! compares against to find what changed.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, TxHash};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    change_set::{ChangeInputs, ChangeSet, PruneReason},
    context::DeploymentContext,
    node::{ActionId, ArgTemplate, ConfigAction, ContractHandle, Environment, Node, NodeId},
};

/// A recorded contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TxHash>,
    #[serde(default)]
    pub external: bool,
    pub fingerprint: String,
}

/// Persisted state of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub environment: Environment,
    /// RFC 3339 time of the last update.
    pub updated_at: String,
    /// Version of lendctl that wrote the record.
    pub version: String,
    #[serde(default)]
    pub contracts: BTreeMap<NodeId, ContractEntry>,
    /// Fingerprints of configuration actions known to be in effect.
    #[serde(default)]
    pub configurations: BTreeMap<ActionId, String>,
}

fn hex_digest(hasher: Sha256) -> String {
    hex::encode(hasher.finalize())
}

/// Render `arg` with its current value when the context can resolve it.
fn render(ctx: &DeploymentContext, arg: &ArgTemplate) -> String {
    ctx.resolve_arg(arg)
        .map(|value| value.to_string())
        .unwrap_or_else(|_| arg.to_string())
}

/// Fingerprint of a contract: its bytecode and its constructor arguments as currently resolved.
///
/// Dependencies' addresses are part of the fingerprint, so a node whose dependency moved is
/// detected as changed even if the run that moved it failed before redeploying the node.
pub fn contract_fingerprint(ctx: &DeploymentContext, node: &Node) -> Result<String> {
    let mut hasher = Sha256::new();
    match node {
        Node::Internal(contract) => {
            let bytecode = fs::read(&contract.artifact).context(format!(
                "Failed to read artifact of {} at {}",
                contract.id,
                contract.artifact.display()
            ))?;
            hasher.update(&bytecode);
            for arg in &contract.constructor {
                hasher.update(b"\0");
                hasher.update(render(ctx, arg).as_bytes());
            }
        }
        Node::External(contract) => {
            hasher.update(b"external\0");
            if let Some(address) = contract.address {
                hasher.update(address.as_slice());
            }
        }
    }
    Ok(hex_digest(hasher))
}

/// Fingerprint of a configuration action: target address, method and arguments as currently
/// resolved.
pub fn action_fingerprint(ctx: &DeploymentContext, action: &ConfigAction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(render(ctx, &ArgTemplate::Node(action.source.clone())).as_bytes());
    hasher.update(b"\0");
    hasher.update(action.method.as_bytes());
    for arg in &action.args {
        hasher.update(b"\0");
        hasher.update(render(ctx, arg).as_bytes());
    }
    hex_digest(hasher)
}

impl DeploymentRecord {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            updated_at: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            contracts: BTreeMap::new(),
            configurations: BTreeMap::new(),
        }
    }

    /// Load the record at `path`, or `None` when no run wrote one yet.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).context(format!(
            "Failed to read deployment record from {}",
            path.display()
        ))?;
        let record: Self = serde_json::from_str(&content).context(format!(
            "Failed to parse deployment record {}",
            path.display()
        ))?;

        Ok(Some(record))
    }

    /// Save the record as formatted JSON, creating parent directories as needed.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(format!(
                "Failed to create record directory {}",
                parent.display()
            ))?;
        }

        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize deployment record")?;
        fs::write(path, json).context(format!(
            "Failed to write deployment record to {}",
            path.display()
        ))?;

        tracing::info!(path = %path.display(), contracts = self.contracts.len(), "Deployment record saved");
        Ok(())
    }

    /// Install recorded handles of internal nodes into `ctx`.
    pub fn seed(&self, ctx: &mut DeploymentContext) -> Result<()> {
        if self.environment != ctx.environment() {
            anyhow::bail!(
                "Deployment record is for {}, not {}",
                self.environment,
                ctx.environment()
            );
        }

        for (id, entry) in &self.contracts {
            match ctx.try_get(id) {
                Some(Node::Internal(_)) => {
                    ctx.seed_handle(
                        id,
                        ContractHandle {
                            address: entry.address,
                            transaction: entry.transaction,
                        },
                    )?;
                }
                Some(Node::External(_)) => {}
                None => tracing::debug!(node = %id, "Recorded contract is no longer declared"),
            }
        }

        Ok(())
    }

    /// Change inputs implied by the difference between `ctx` and this record.
    ///
    /// Internal nodes are changed when unrecorded or when their fingerprint moved, external nodes
    /// when their address moved, and actions when unrecorded or when their fingerprint moved.
    /// Actions the environment does not allow are ignored.
    pub fn detect_changes(&self, ctx: &DeploymentContext) -> Result<ChangeInputs> {
        let mut changes = ChangeInputs::default();

        for (id, node) in ctx.nodes() {
            let entry = self.contracts.get(id);
            let changed = match node {
                Node::Internal(_) => match entry {
                    None => true,
                    Some(entry) => entry.fingerprint != contract_fingerprint(ctx, node)?,
                },
                Node::External(contract) => {
                    contract.address != entry.map(|entry| entry.address)
                        && contract.address.is_some()
                }
            };
            if changed {
                tracing::debug!(node = %id, "Contract changed since last run");
                changes.contracts.insert(id.clone());
            }

            for action in node.configuration_actions() {
                if !action.allowed_in(ctx.environment()) {
                    continue;
                }
                let id = action.id();
                if self.configurations.get(&id) != Some(&action_fingerprint(ctx, action)) {
                    changes.configs.insert(id.to_string());
                }
            }
        }

        tracing::info!(
            contracts = changes.contracts.len(),
            configs = changes.configs.len(),
            "Detected changes against deployment record"
        );

        Ok(changes)
    }

    /// Write back what `ctx` now holds.
    ///
    /// Nodes deployed this run get a fresh entry; nodes that were not redeployed keep theirs, so
    /// that a failed run is detected again next time. Actions in effect, and actions a fresh
    /// deployment of this run applied through its constructor, are fingerprinted.
    pub fn update(&mut self, ctx: &DeploymentContext, change_set: &ChangeSet) -> Result<()> {
        for (id, node) in ctx.nodes() {
            match node {
                Node::Internal(contract) if ctx.deployed_this_run(id) => {
                    if let Some(handle) = contract.handle {
                        self.contracts.insert(
                            id.clone(),
                            ContractEntry {
                                address: handle.address,
                                transaction: handle.transaction,
                                external: false,
                                fingerprint: contract_fingerprint(ctx, node)?,
                            },
                        );
                    }
                }
                Node::Internal(_) => {}
                Node::External(contract) => match contract.address {
                    Some(address) => {
                        self.contracts.insert(
                            id.clone(),
                            ContractEntry {
                                address,
                                transaction: None,
                                external: true,
                                fingerprint: contract_fingerprint(ctx, node)?,
                            },
                        );
                    }
                    None => {
                        self.contracts.remove(id);
                    }
                },
            }
        }

        let subsumed = change_set.pruned.iter().filter_map(|(action, reason)| match reason {
            PruneReason::Subsumed { by } if ctx.deployed_this_run(by) => Some(action),
            _ => None,
        });
        let in_effect: Vec<&ActionId> = ctx.configured().iter().chain(subsumed).collect();

        for node in ctx.nodes().values() {
            for action in node.configuration_actions() {
                let id = action.id();
                if in_effect.contains(&&id) {
                    self.configurations
                        .insert(id, action_fingerprint(ctx, action));
                }
            }
        }

        self.updated_at = chrono::Utc::now().to_rfc3339();
        self.version = env!("CARGO_PKG_VERSION").to_string();
        Ok(())
    }

    /// Every recorded address, by node.
    pub fn addresses(&self) -> BTreeMap<NodeId, Address> {
        self.contracts
            .iter()
            .map(|(id, entry)| (id.clone(), entry.address))
            .collect()
    }
}

/// Exclusive advisory lock on a record, held for the duration of a run.
#[derive(Debug)]
pub struct RecordLock {
    file: File,
    path: PathBuf,
}

impl RecordLock {
    /// Lock `<record>.lock`, failing immediately when another process holds it.
    pub fn acquire(record: &Path) -> Result<Self> {
        let mut name = record.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(format!(
                "Failed to create record directory {}",
                parent.display()
            ))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .context(format!("Failed to open lock file {}", path.display()))?;

        file.try_lock_exclusive().context(format!(
            "Another run holds the lock on {}",
            record.display()
        ))?;

        tracing::debug!(path = %path.display(), "Acquired record lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to release record lock");
        }
    }
}
