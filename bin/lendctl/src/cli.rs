use std::{collections::BTreeSet, path::PathBuf};

use clap::Parser;
use lendctl_deploy::{CONFIG_FILENAME, ChangeInputs, Environment, NodeId};
use tracing::level_filters::LevelFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "lendctl")]
#[command(
    author,
    version,
    about = "Deploy and configure the NFT lending protocol, touching only what changed"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "LENDCTL_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// The target environment (local, dev, integration, production).
    #[arg(short, long, env = "LENDCTL_ENV")]
    pub env: Environment,

    /// Path to the configuration file.
    #[arg(short, long, alias = "conf", env = "LENDCTL_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Log every action without sending anything or writing the deployment record.
    #[arg(long, env = "LENDCTL_DRY_RUN", default_value_t = false)]
    pub dry_run: bool,

    /// Node ids to treat as changed, e.g. `token.weth,genesis_pass`.
    #[arg(long, value_delimiter = ',', env = "LENDCTL_CHANGED")]
    pub changed: Vec<String>,

    /// Configuration keys, node ids or action ids to treat as changed, e.g.
    /// `nft_borrowable_amounts`.
    #[arg(long, value_delimiter = ',', env = "LENDCTL_CHANGED_CONFIG")]
    pub changed_config: Vec<String>,

    /// Do not compare against the deployment record; only apply `--changed` and
    /// `--changed-config`.
    #[arg(long, env = "LENDCTL_NO_DETECT")]
    pub no_detect: bool,

    /// Path to the deployment record.
    ///
    /// Defaults to the environment's `record`, else `deployments/<env>.json`.
    #[arg(long, env = "LENDCTL_RECORD")]
    pub record: Option<PathBuf>,

    /// The URL of the chain's JSON-RPC endpoint. Overrides the environment's `rpc_url`.
    ///
    /// A dry run without any endpoint simulates the chain in memory.
    #[arg(long, alias = "rpc", env = "LENDCTL_RPC_URL")]
    pub rpc_url: Option<Url>,
}

impl Cli {
    /// Change inputs given on the command line.
    pub fn change_inputs(&self) -> ChangeInputs {
        ChangeInputs {
            contracts: self
                .changed
                .iter()
                .map(|id| NodeId::new(id.trim()))
                .collect::<BTreeSet<_>>(),
            configs: self
                .changed_config
                .iter()
                .map(|config| config.trim().to_string())
                .collect(),
        }
    }
}
