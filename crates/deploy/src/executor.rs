//! Applies a change set against a chain client.

use std::fmt;

use alloy_core::primitives::{Address, TxHash};
use serde::Serialize;

use crate::{
    chain::{Call, ChainClient, DeployRequest},
    change_set::ChangeSet,
    context::DeploymentContext,
    error::{ContextError, ExecutionError, ResolutionError},
    node::{ActionId, ArgTemplate, ConfigAction, Node, NodeId, Value},
};

/// One step of a run, with its arguments as declared.
///
/// The action log of a dry run is identical to the one of a real run over the same inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PlannedAction {
    Deploy {
        node: NodeId,
        args: Vec<ArgTemplate>,
    },
    Configure {
        node: NodeId,
        action: ActionId,
        method: String,
        args: Vec<ArgTemplate>,
    },
}

impl PlannedAction {
    pub fn node(&self) -> &NodeId {
        match self {
            PlannedAction::Deploy { node, .. } | PlannedAction::Configure { node, .. } => node,
        }
    }

    fn deploy(node: &Node) -> Self {
        let args = match node {
            Node::Internal(contract) => contract.constructor.clone(),
            Node::External(_) => Vec::new(),
        };
        PlannedAction::Deploy {
            node: node.id().clone(),
            args,
        }
    }

    fn configure(action: &ConfigAction) -> Self {
        PlannedAction::Configure {
            node: action.source.clone(),
            action: action.id(),
            method: action.method.clone(),
            args: action.args.clone(),
        }
    }
}

fn join(args: &[ArgTemplate]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedAction::Deploy { node, args } => write!(f, "deploy {node}({})", join(args)),
            PlannedAction::Configure {
                node, method, args, ..
            } => write!(f, "configure {node}.{method}({})", join(args)),
        }
    }
}

/// What happened to a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Deployed {
        address: Address,
        transaction: Option<TxHash>,
    },
    Submitted {
        transaction: TxHash,
    },
    /// The read-before-write check found the desired value in place.
    AlreadySet,
    /// Nothing was sent.
    DryRun,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Deployed { address, .. } => write!(f, "deployed at {address}"),
            Outcome::Submitted { transaction } => write!(f, "submitted {transaction}"),
            Outcome::AlreadySet => write!(f, "already set"),
            Outcome::DryRun => write!(f, "dry run"),
        }
    }
}

/// The action log of a run and the outcome of each action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub actions: Vec<PlannedAction>,
    pub outcomes: Vec<Outcome>,
}

impl RunReport {
    fn push(&mut self, action: PlannedAction, outcome: Outcome) {
        self.actions.push(action);
        self.outcomes.push(outcome);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlannedAction, &Outcome)> {
        self.actions.iter().zip(&self.outcomes)
    }

    /// Number of transactions sent to the chain.
    pub fn transactions_sent(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    Outcome::Deployed { .. } | Outcome::Submitted { .. }
                )
            })
            .count()
    }

    pub fn already_set(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Outcome::AlreadySet))
            .count()
    }
}

/// Render the action log of `change_set` without executing it.
pub fn plan(ctx: &DeploymentContext, change_set: &ChangeSet) -> Vec<PlannedAction> {
    change_set
        .deployments
        .iter()
        .filter_map(|id| ctx.try_get(id))
        .map(PlannedAction::deploy)
        .chain(change_set.ordered_transactions().map(PlannedAction::configure))
        .collect()
}

/// Sequential transaction executor.
///
/// Deployments run first in deployment order, then configuration actions ordered by their
/// source's deployment position. Execution halts at the first failure; the context then only
/// reflects what committed.
#[derive(Debug)]
pub struct Executor<'a, C> {
    client: &'a C,
    dry_run: bool,
}

impl<'a, C: ChainClient> Executor<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn execute(
        &self,
        ctx: &mut DeploymentContext,
        change_set: &ChangeSet,
    ) -> Result<RunReport, ExecutionError> {
        let mut report = RunReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        for id in &change_set.deployments {
            let node = ctx.get(id).map_err(|source| ExecutionError::Resolution {
                node: id.clone(),
                source,
            })?;
            let action = PlannedAction::deploy(node);
            let outcome = self.deploy(ctx, change_set, id).await?;
            report.push(action, outcome);
        }

        for action in change_set.ordered_transactions() {
            let outcome = self.configure(ctx, change_set, action).await?;
            report.push(PlannedAction::configure(action), outcome);
        }

        tracing::info!(
            dry_run = self.dry_run,
            actions = report.actions.len(),
            sent = report.transactions_sent(),
            already_set = report.already_set(),
            "Execution complete"
        );

        Ok(report)
    }

    async fn deploy(
        &self,
        ctx: &mut DeploymentContext,
        change_set: &ChangeSet,
        id: &NodeId,
    ) -> Result<Outcome, ExecutionError> {
        let context_error = |source: ContextError| ExecutionError::Context {
            node: id.clone(),
            source,
        };
        let resolution_error = |source: ResolutionError| ExecutionError::Resolution {
            node: id.clone(),
            source,
        };

        let Node::Internal(contract) = ctx
            .get(id)
            .map_err(|source| context_error(source.into()))?
        else {
            return Err(context_error(ContextError::ExternalNode { node: id.clone() }));
        };

        if self.dry_run {
            let constructor = contract.constructor.iter().filter_map(ArgTemplate::node);
            ensure_resolvable(ctx, change_set, constructor).map_err(resolution_error)?;

            tracing::info!(node = %id, artifact = %contract.artifact.display(), "[dry-run] Would deploy contract");
            if let Ok(args) = ctx.resolve_args(&contract.constructor) {
                tracing::debug!(node = %id, args = ?args, "[dry-run] Constructor arguments");
            }
            return Ok(Outcome::DryRun);
        }

        let args = ctx
            .resolve_args(&contract.constructor)
            .map_err(resolution_error)?;

        tracing::info!(node = %id, artifact = %contract.artifact.display(), "Deploying contract");
        tracing::debug!(node = %id, args = ?args, "Constructor arguments");

        let request = DeployRequest {
            node: id.clone(),
            artifact: contract.artifact.clone(),
            args,
            signer: ctx.owner(),
        };
        let handle = self
            .client
            .deploy(request)
            .await
            .map_err(|source| ExecutionError::Deployment {
                node: id.clone(),
                source,
            })?;

        ctx.record_deployment(id, handle).map_err(context_error)?;

        tracing::info!(node = %id, address = %handle.address, "Contract deployed");

        Ok(Outcome::Deployed {
            address: handle.address,
            transaction: handle.transaction,
        })
    }

    async fn configure(
        &self,
        ctx: &mut DeploymentContext,
        change_set: &ChangeSet,
        action: &ConfigAction,
    ) -> Result<Outcome, ExecutionError> {
        let node = &action.source;
        let id = action.id();
        let resolution_error = |source: ResolutionError| ExecutionError::Resolution {
            node: node.clone(),
            source,
        };

        if self.dry_run {
            // Pending nodes have no address until the real run deploys them.
            let pending = action
                .referenced_nodes()
                .into_iter()
                .any(|referenced| change_set.deploys(referenced));
            if pending {
                ensure_resolvable(ctx, change_set, action.referenced_nodes())
                    .map_err(resolution_error)?;
                tracing::info!(node = %node, call = %action.describe(), "[dry-run] Would configure");
                return Ok(Outcome::DryRun);
            }
        }

        let target = ctx.require(node).map_err(resolution_error)?;
        let args = ctx.resolve_args(&action.args).map_err(resolution_error)?;

        if self.is_already_set(ctx, action, target).await? {
            tracing::info!(node = %node, method = %action.method, "Configuration already set, skipping");
            if !self.dry_run {
                ctx.record_configuration(node, action)
                    .map_err(|source| ExecutionError::Context {
                        node: node.clone(),
                        source,
                    })?;
            }
            return Ok(Outcome::AlreadySet);
        }

        if self.dry_run {
            tracing::info!(node = %node, call = %action.describe(), args = ?args, "[dry-run] Would configure");
            return Ok(Outcome::DryRun);
        }

        tracing::info!(node = %node, call = %action.describe(), "Configuring contract");
        tracing::debug!(node = %node, method = %action.method, args = ?args, "Call arguments");

        let receipt = self
            .client
            .call(target, &Call::new(action.method.clone(), args), ctx.owner())
            .await
            .map_err(|source| ExecutionError::Configuration {
                node: node.clone(),
                action: id.clone(),
                source,
            })?;

        ctx.record_configuration(node, action)
            .map_err(|source| ExecutionError::Context {
                node: node.clone(),
                source,
            })?;

        tracing::info!(node = %node, method = %action.method, tx = %receipt.transaction_hash, "Configuration committed");

        Ok(Outcome::Submitted {
            transaction: receipt.transaction_hash,
        })
    }

    /// Read-before-write check through the action's getter. Actions without one are always sent.
    async fn is_already_set(
        &self,
        ctx: &DeploymentContext,
        action: &ConfigAction,
        target: Address,
    ) -> Result<bool, ExecutionError> {
        let Some(getter) = &action.getter else {
            return Ok(false);
        };

        let resolution_error = |source: ResolutionError| ExecutionError::Resolution {
            node: action.source.clone(),
            source,
        };
        let args: Vec<Value> = ctx.resolve_args(&getter.args).map_err(resolution_error)?;
        let expected = ctx.resolve_arg(&getter.expect).map_err(resolution_error)?;

        let current = self
            .client
            .read(
                target,
                &Call::new(getter.method.clone(), args),
                getter.expect.kind(),
            )
            .await
            .map_err(|source| ExecutionError::Read {
                node: action.source.clone(),
                action: action.id(),
                source,
            })?;

        tracing::debug!(
            node = %action.source,
            getter = %getter.method,
            current = %current,
            expected = %expected,
            "Read current configuration"
        );

        Ok(current == expected)
    }
}

/// Fails like a real run would on every node that is neither resolved nor about to be deployed.
fn ensure_resolvable<'n>(
    ctx: &DeploymentContext,
    change_set: &ChangeSet,
    nodes: impl IntoIterator<Item = &'n NodeId>,
) -> Result<(), ResolutionError> {
    for node in nodes {
        if !change_set.deploys(node) {
            ctx.require(node)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        chain::{MemoryChain, SentTransaction},
        change_set::{ChangeInputs, propagate},
        error::ChainError,
        fixtures::{external_at, internal_with_args},
        graph::DependencyGraphs,
        node::{ContractHandle, Environment, Getter},
        order::deployment_order,
    };

    fn setter(source: &str, dependency: &str, method: &str, getter: &str) -> ConfigAction {
        ConfigAction {
            source: source.into(),
            dependency: dependency.into(),
            method: method.to_string(),
            args: vec![ArgTemplate::Node(dependency.into())],
            getter: Some(Getter {
                method: getter.to_string(),
                args: vec![],
                expect: ArgTemplate::Node(dependency.into()),
            }),
            environments: None,
            subsumed_by: None,
            key: None,
        }
    }

    fn context() -> DeploymentContext {
        context_with_token(Some(Address::with_last_byte(0xee)))
    }

    fn context_with_token(token: Option<Address>) -> DeploymentContext {
        DeploymentContext::new(
            Environment::Local,
            Address::with_last_byte(0x01),
            vec![],
            vec![
                external_at("token", token),
                internal_with_args(
                    "core",
                    vec![ArgTemplate::Node("token".into()), ArgTemplate::Owner],
                    vec![setter("core", "peripheral", "setPeripheral", "peripheral")],
                ),
                internal_with_args(
                    "peripheral",
                    vec![ArgTemplate::Node("core".into())],
                    vec![ConfigAction {
                        getter: None,
                        ..setter("peripheral", "peripheral", "setMaxCapital", "maxCapital")
                    }],
                ),
            ],
        )
        .unwrap()
    }

    fn change_set(ctx: &DeploymentContext, inputs: &ChangeInputs) -> ChangeSet {
        let graphs = DependencyGraphs::build(ctx.nodes().values()).unwrap();
        let order = deployment_order(&graphs.deployment).unwrap();
        propagate(&graphs, &order, ctx.nodes(), ctx.environment(), inputs).unwrap()
    }

    fn everything() -> ChangeInputs {
        ChangeInputs {
            contracts: BTreeSet::from(["core".into(), "peripheral".into()]),
            configs: BTreeSet::new(),
        }
    }

    fn chain() -> MemoryChain {
        MemoryChain::new()
            .mirror("setPeripheral", "peripheral")
            .reject_unchanged_writes()
    }

    #[tokio::test]
    async fn test_deploys_then_configures_with_resolved_arguments() {
        let chain = chain();
        let mut ctx = context();
        let change_set = change_set(&ctx, &everything());

        let report = Executor::new(&chain)
            .execute(&mut ctx, &change_set)
            .await
            .unwrap();

        let core = ctx.resolve(&"core".into()).unwrap();
        let peripheral = ctx.resolve(&"peripheral".into()).unwrap();

        let sent = chain.transactions();
        assert_eq!(
            sent[0],
            SentTransaction::Deploy {
                node: "core".into(),
                address: core,
                args: vec![
                    Value::Address(Address::with_last_byte(0xee)),
                    Value::Address(Address::with_last_byte(0x01)),
                ],
            }
        );
        assert_eq!(
            sent[2],
            SentTransaction::Call {
                target: core,
                method: "setPeripheral".to_string(),
                args: vec![Value::Address(peripheral)],
            }
        );
        assert_eq!(report.transactions_sent(), 4);
        assert_eq!(
            report.actions.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "deploy core(@token, $owner)",
                "deploy peripheral(@core)",
                "configure core.setPeripheral(@peripheral)",
                "configure peripheral.setMaxCapital(@peripheral)",
            ]
        );
        assert!(ctx.is_configured(&ActionId::from("core:setPeripheral:peripheral".to_string())));
    }

    #[tokio::test]
    async fn test_read_before_write_skips_values_in_place() {
        let chain = chain();
        let mut ctx = context();
        let executor = Executor::new(&chain);
        let first = change_set(&ctx, &everything());
        executor.execute(&mut ctx, &first).await.unwrap();
        let sent = chain.transaction_count();

        let inputs = ChangeInputs {
            contracts: BTreeSet::new(),
            configs: BTreeSet::from(["core:setPeripheral:peripheral".to_string()]),
        };
        let second = change_set(&ctx, &inputs);
        let report = executor.execute(&mut ctx, &second).await.unwrap();

        assert_eq!(report.outcomes, vec![Outcome::AlreadySet]);
        assert_eq!(chain.transaction_count(), sent);
    }

    #[tokio::test]
    async fn test_dry_run_matches_real_action_log_without_mutation() {
        let chain = chain();
        let mut dry_ctx = context();
        let change_set = change_set(&dry_ctx, &everything());

        let dry = Executor::new(&chain)
            .dry_run(true)
            .execute(&mut dry_ctx, &change_set)
            .await
            .unwrap();

        assert_eq!(chain.transaction_count(), 0);
        assert!(dry_ctx.resolve(&"core".into()).is_none());
        assert!(dry_ctx.resolve(&"peripheral".into()).is_none());
        assert!(dry.outcomes.iter().all(|o| *o == Outcome::DryRun));

        let mut ctx = context();
        let real = Executor::new(&chain)
            .execute(&mut ctx, &change_set)
            .await
            .unwrap();
        assert_eq!(dry.actions, real.actions);
    }

    #[tokio::test]
    async fn test_failure_names_node_and_keeps_committed_state() {
        let chain = chain();
        chain.fail_deploy("peripheral", "out of gas");
        let mut ctx = context();
        let change_set = change_set(&ctx, &everything());

        let err = Executor::new(&chain)
            .execute(&mut ctx, &change_set)
            .await
            .unwrap_err();

        assert_eq!(err.node().as_str(), "peripheral");
        assert!(matches!(
            err,
            ExecutionError::Deployment {
                source: ChainError::Reverted(_),
                ..
            }
        ));
        assert!(ctx.resolve(&"core".into()).is_some());
        assert!(ctx.resolve(&"peripheral".into()).is_none());
        assert!(ctx.configured().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_dependency_is_a_resolution_error() {
        let chain = chain();
        let mut ctx = context();
        ctx.seed_handle(
            &"core".into(),
            ContractHandle::at(Address::with_last_byte(0xc0)),
        )
        .unwrap();

        // core's wiring needs peripheral, which has never been deployed.
        let inputs = ChangeInputs {
            contracts: BTreeSet::new(),
            configs: BTreeSet::from(["core".to_string()]),
        };
        let change_set = change_set(&ctx, &inputs);
        let err = Executor::new(&chain)
            .execute(&mut ctx, &change_set)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::Resolution {
                source: ResolutionError::Unresolved { .. },
                ..
            }
        ));
        assert_eq!(err.node().as_str(), "core");
    }

    #[tokio::test]
    async fn test_dry_run_fails_where_the_real_run_fails() {
        let chain = chain();
        let mut dry_ctx = context_with_token(None);
        let change_set = change_set(&dry_ctx, &everything());

        let dry = Executor::new(&chain)
            .dry_run(true)
            .execute(&mut dry_ctx, &change_set)
            .await
            .unwrap_err();

        let mut ctx = context_with_token(None);
        let real = Executor::new(&chain)
            .execute(&mut ctx, &change_set)
            .await
            .unwrap_err();

        assert!(matches!(
            dry,
            ExecutionError::Resolution {
                source: ResolutionError::Unresolved { .. },
                ..
            }
        ));
        assert_eq!(dry.node().as_str(), "core");
        assert_eq!(dry.to_string(), real.to_string());
        assert_eq!(chain.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_rejects_unresolved_wiring_of_pending_nodes() {
        let chain = MemoryChain::new();
        let mut ctx = DeploymentContext::new(
            Environment::Local,
            Address::with_last_byte(0x01),
            vec![],
            vec![
                external_at("registry", None),
                internal_with_args(
                    "vault",
                    vec![],
                    vec![setter("vault", "registry", "setRegistry", "registry")],
                ),
            ],
        )
        .unwrap();

        let inputs = ChangeInputs {
            contracts: BTreeSet::from(["vault".into()]),
            configs: BTreeSet::new(),
        };
        let change_set = change_set(&ctx, &inputs);
        assert_eq!(change_set.transaction_count(), 1);

        let err = Executor::new(&chain)
            .dry_run(true)
            .execute(&mut ctx, &change_set)
            .await
            .unwrap_err();

        assert_eq!(err.node().as_str(), "vault");
        assert!(matches!(
            err,
            ExecutionError::Resolution {
                source: ResolutionError::Unresolved { ref node },
                ..
            } if node.as_str() == "registry"
        ));
        assert_eq!(chain.transaction_count(), 0);
    }

    #[test]
    fn test_plan_renders_declared_arguments() {
        let ctx = context();
        let planned = plan(&ctx, &change_set(&ctx, &everything()));
        assert_eq!(planned.len(), 4);
        assert_eq!(planned[0].node().as_str(), "core");
        assert_eq!(
            planned[3],
            PlannedAction::Configure {
                node: "peripheral".into(),
                action: ActionId::from("peripheral:setMaxCapital:peripheral".to_string()),
                method: "setMaxCapital".to_string(),
                args: vec![ArgTemplate::Node("peripheral".into())],
            }
        );
    }
}
