//! lendctl deploys and configures the NFT lending protocol, redeploying and rewiring only the
//! contracts affected by a change.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS};

use cli::Cli;
use lendctl_deploy::{
    ChangeInputs, DeploymentRecord, MemoryChain, Orchestrator, Outcome, RecordLock, RpcChain,
    RunReport, StaticConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    let config = StaticConfig::load_from_file(&cli.config)?;
    let record_path = match &cli.record {
        Some(path) => path.clone(),
        None => config.record_path(cli.env)?,
    };

    // Dry runs only read the record.
    let _lock = if cli.dry_run {
        None
    } else {
        Some(RecordLock::acquire(&record_path)?)
    };

    let mut ctx = config.build_context(cli.env)?;
    let mut record = DeploymentRecord::load_from_file(&record_path)?
        .unwrap_or_else(|| DeploymentRecord::new(cli.env));
    record.seed(&mut ctx)?;

    let mut inputs = if cli.no_detect {
        ChangeInputs::default()
    } else {
        record.detect_changes(&ctx)?
    };
    inputs.merge(cli.change_inputs());

    tracing::info!(
        environment = %cli.env,
        record = %record_path.display(),
        dry_run = cli.dry_run,
        "Planning run..."
    );

    let orchestrator = Orchestrator::new(&ctx)?;
    let change_set = orchestrator.plan(&ctx, &inputs)?;
    print!("{change_set}");

    if change_set.is_empty() {
        tracing::info!("Environment is up to date");
        return Ok(());
    }

    let rpc_url = cli
        .rpc_url
        .clone()
        .or_else(|| config.environment(cli.env).ok()?.rpc_url.clone());

    let result = match rpc_url {
        Some(url) => {
            tracing::info!(rpc_url = %url, "Using JSON-RPC endpoint");
            let chain = RpcChain::new(url)?;
            orchestrator
                .execute(&mut ctx, &chain, &change_set, cli.dry_run)
                .await
        }
        None if cli.dry_run => {
            tracing::info!("No RPC endpoint configured, simulating the chain in memory");
            let chain = MemoryChain::new().mirror_getters(ctx.nodes().values());
            chain.adopt(ctx.addresses());
            orchestrator
                .execute(&mut ctx, &chain, &change_set, cli.dry_run)
                .await
        }
        None => anyhow::bail!(
            "No RPC endpoint for {}: pass --rpc-url or set environments.{}.rpc_url",
            cli.env,
            cli.env
        ),
    };

    // Whatever committed is recorded, so that a failed run resumes where it stopped.
    if !cli.dry_run {
        record.update(&ctx, &change_set)?;
        record
            .save_to_file(&record_path)
            .context("Failed to save deployment record")?;
    }

    let report = result.inspect_err(|err| {
        tracing::error!(node = %err.node(), error = %err, "Run halted");
    })?;

    println!("{}", summary(&report));

    Ok(())
}

fn summary(report: &RunReport) -> Table {
    let mut table = Table::new();
    table.apply_modifier(UTF8_ROUND_CORNERS);

    table.set_header(vec![
        Cell::new("Node"),
        Cell::new("Action"),
        Cell::new("Outcome"),
    ]);

    for (action, outcome) in report.iter() {
        let color = match outcome {
            Outcome::Deployed { .. } | Outcome::Submitted { .. } => Color::Green,
            Outcome::AlreadySet => Color::Reset,
            Outcome::DryRun => Color::Yellow,
        };
        table.add_row([
            Cell::new(action.node()),
            Cell::new(action),
            Cell::new(outcome).fg(color),
        ]);
    }

    table
}
