//! Static configuration.
//!
//! Loaded once at the start of a run from a TOML file merged with `LENDCTL_`-prefixed environment
//! variables, and never mutated afterwards.

mod manifest;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, U256};
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

pub use manifest::{ActionSpec, ArgSpec, ContractSpec, Endpoint, Expander, GetterSpec, Scope};

use crate::{
    context::DeploymentContext,
    node::{Environment, InvalidValue, PoolId, Value},
    protocol,
};

/// The default name of the configuration file.
pub const CONFIG_FILENAME: &str = "lendctl.toml";

/// Prefix of environment variables overriding the configuration file.
pub const ENV_PREFIX: &str = "LENDCTL_";

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("contracts/build")
}

/// A named constant: fee shares, durations, caps or addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(u64),
    /// A decimal integer too large for TOML, or an address.
    Text(String),
}

impl ParamValue {
    pub fn to_value(&self) -> Result<Value, InvalidValue> {
        match self {
            ParamValue::Bool(value) => Ok(Value::Bool(*value)),
            ParamValue::Integer(value) => Ok(Value::Uint(U256::from(*value))),
            ParamValue::Text(text) => text.parse(),
        }
    }
}

/// A lending pool and the contracts it uses that someone else deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: PoolId,
    /// Addresses of pool-scoped external contracts, e.g. `token`.
    #[serde(default)]
    pub external: BTreeMap<String, Address>,
}

/// An NFT collection accepted as collateral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub address: Address,
    /// Per-pool parameters, e.g. `borrowable_amount`. Only the pools named here serve the
    /// collection.
    #[serde(default)]
    pub pools: BTreeMap<PoolId, BTreeMap<String, ParamValue>>,
}

/// Everything specific to one target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// The signing identity of privileged calls.
    pub owner: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<Url>,
    /// Deployment record path. Defaults to `deployments/<environment>.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<PathBuf>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// Addresses of shared external contracts (AMM router, vault factory, ...).
    #[serde(default)]
    pub external: BTreeMap<String, Address>,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
    /// Overrides of the global parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

/// The static configuration of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    /// The contract manifest. The built-in lending protocol when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contracts: Option<Vec<ContractSpec>>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl StaticConfig {
    /// Load the configuration from a TOML file, with environment variable overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context(format!("Failed to load configuration from {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            environments = config.environments.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse a configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Figment::from(Toml::string(content))
            .extract()
            .context("Failed to parse configuration")
    }

    pub fn environment(&self, environment: Environment) -> Result<&EnvironmentConfig> {
        self.environments
            .get(&environment.to_string())
            .with_context(|| format!("Environment '{environment}' is not configured"))
    }

    /// The contract manifest in use.
    pub fn manifest(&self) -> Result<Vec<ContractSpec>> {
        match &self.contracts {
            Some(contracts) => Ok(contracts.clone()),
            None => Ok(protocol::builtin()?.contracts),
        }
    }

    /// Parameters of `environment`: built-in defaults (with the built-in manifest only), then
    /// global parameters, then the environment's overrides.
    pub fn parameters(&self, environment: Environment) -> Result<BTreeMap<String, ParamValue>> {
        let mut parameters = match self.contracts {
            Some(_) => BTreeMap::new(),
            None => protocol::builtin()?.parameters,
        };
        parameters.extend(self.parameters.clone());
        parameters.extend(self.environment(environment)?.parameters.clone());
        Ok(parameters)
    }

    /// The record path of `environment`.
    pub fn record_path(&self, environment: Environment) -> Result<PathBuf> {
        Ok(self
            .environment(environment)?
            .record
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("deployments/{environment}.json"))))
    }

    /// Expand the manifest for `environment` into a fresh deployment context.
    pub fn build_context(&self, environment: Environment) -> Result<DeploymentContext> {
        let env = self.environment(environment)?;
        let manifest = self.manifest()?;
        let parameters = self.parameters(environment)?;

        let nodes = Expander::new(&manifest, &self.artifacts_dir, env, &parameters)?
            .expand()
            .context(format!("Failed to expand contract manifest for {environment}"))?;

        tracing::info!(
            environment = %environment,
            nodes = nodes.len(),
            pools = env.pools.len(),
            "Expanded contract manifest"
        );

        let pools = env.pools.iter().map(|pool| pool.id.clone()).collect();
        Ok(DeploymentContext::new(environment, env.owner, pools, nodes)?)
    }
}
