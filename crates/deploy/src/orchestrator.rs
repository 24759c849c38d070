//! Ties graph building, ordering, change propagation and execution together.

use crate::{
    chain::ChainClient,
    change_set::{ChangeInputs, ChangeSet, propagate},
    context::DeploymentContext,
    error::{Error, ExecutionError, GraphError},
    executor::{Executor, RunReport},
    graph::DependencyGraphs,
    node::NodeId,
    order::deployment_order,
};

/// The validated graphs of a context and their deployment order.
///
/// Built once per run. The graphs only depend on the declared nodes, not on resolved handles,
/// so the orchestrator stays valid while the context is mutated by execution.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    graphs: DependencyGraphs,
    order: Vec<NodeId>,
}

impl Orchestrator {
    pub fn new(ctx: &DeploymentContext) -> Result<Self, GraphError> {
        let graphs = DependencyGraphs::build(ctx.nodes().values())?;
        let order = deployment_order(&graphs.deployment)?;

        tracing::info!(
            nodes = graphs.deployment.len(),
            actions = graphs.configuration.len(),
            "Built contract graph"
        );

        Ok(Self { graphs, order })
    }

    pub fn graphs(&self) -> &DependencyGraphs {
        &self.graphs
    }

    /// Every node, dependencies first.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// The change set of `inputs`.
    pub fn plan(
        &self,
        ctx: &DeploymentContext,
        inputs: &ChangeInputs,
    ) -> Result<ChangeSet, GraphError> {
        propagate(
            &self.graphs,
            &self.order,
            ctx.nodes(),
            ctx.environment(),
            inputs,
        )
    }

    /// Apply `change_set` through `client`. In a dry run nothing is sent and `ctx` is unchanged.
    pub async fn execute<C: ChainClient>(
        &self,
        ctx: &mut DeploymentContext,
        client: &C,
        change_set: &ChangeSet,
        dry_run: bool,
    ) -> Result<RunReport, ExecutionError> {
        Executor::new(client)
            .dry_run(dry_run)
            .execute(ctx, change_set)
            .await
    }

    /// Plan and execute `inputs` in one go.
    pub async fn run<C: ChainClient>(
        &self,
        ctx: &mut DeploymentContext,
        client: &C,
        inputs: &ChangeInputs,
        dry_run: bool,
    ) -> Result<(ChangeSet, RunReport), Error> {
        let change_set = self.plan(ctx, inputs)?;
        let report = self.execute(ctx, client, &change_set, dry_run).await?;
        Ok((change_set, report))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use alloy_core::primitives::Address;

    use super::*;
    use crate::{
        chain::MemoryChain,
        fixtures::{external_at, internal, wire},
        node::{Environment, Node},
    };

    fn context(nodes: Vec<Node>) -> DeploymentContext {
        DeploymentContext::new(Environment::Dev, Address::with_last_byte(1), vec![], nodes).unwrap()
    }

    #[test]
    fn test_cycles_are_rejected_before_anything_runs() {
        let ctx = context(vec![internal("a", &["b"], vec![]), internal("b", &["a"], vec![])]);
        assert!(matches!(
            Orchestrator::new(&ctx),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_deploys_and_configures() {
        let mut ctx = context(vec![
            external_at("token", Some(Address::with_last_byte(0xee))),
            internal(
                "core",
                &["token"],
                vec![wire("core", "peripheral", "setPeripheral")],
            ),
            internal("peripheral", &["core"], vec![]),
        ]);
        let orchestrator = Orchestrator::new(&ctx).unwrap();
        assert_eq!(
            orchestrator.order().last(),
            Some(&NodeId::from("peripheral"))
        );

        let chain = MemoryChain::new();
        let inputs = ChangeInputs {
            contracts: BTreeSet::from([NodeId::from("token")]),
            configs: BTreeSet::new(),
        };
        let (change_set, report) = orchestrator
            .run(&mut ctx, &chain, &inputs, false)
            .await
            .unwrap();

        assert_eq!(
            change_set.deployments,
            vec![NodeId::from("core"), NodeId::from("peripheral")]
        );
        assert_eq!(report.transactions_sent(), 3);
        assert_eq!(chain.calls_to("setPeripheral").len(), 1);
        assert!(ctx.resolve(&"peripheral".into()).is_some());
    }

    #[tokio::test]
    async fn test_unknown_changed_contract_is_a_graph_error() {
        let mut ctx = context(vec![internal("core", &[], vec![])]);
        let orchestrator = Orchestrator::new(&ctx).unwrap();
        let inputs = ChangeInputs {
            contracts: BTreeSet::from([NodeId::from("missing")]),
            configs: BTreeSet::new(),
        };

        let err = orchestrator
            .run(&mut ctx, &MemoryChain::new(), &inputs, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::UnknownNode { .. })));
    }
}
