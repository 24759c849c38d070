//! Declarative contract manifest and its expansion into concrete nodes.
//!
//! A manifest names contracts once. Expansion instantiates shared contracts once, pool-scoped
//! contracts once per pool and every configured collection as an external node, then resolves
//! argument specs into templates.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use super::{CollectionConfig, EnvironmentConfig, ParamValue};
use crate::{
    error::ManifestError,
    node::{
        ArgTemplate, ConfigAction, Environment, ExternalContract, Getter, InternalContract, Node,
        NodeId, PoolId, Value,
    },
};

/// How many instances of a contract exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One instance serving every pool.
    #[default]
    Shared,
    /// One instance per pool.
    Pool,
}

/// An argument as written in the manifest.
///
/// - `@name`: the address of contract `name` (the same pool's instance for pool-scoped ones)
/// - `@collection`: the address of the current collection
/// - `$owner`: the signing owner
/// - `%name`: a named parameter
/// - `#name`: a per-(pool, collection) parameter
/// - anything else: a literal address, decimal integer or boolean
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArgSpec {
    Contract(String),
    Collection,
    Owner,
    Param(String),
    CollectionParam(String),
    Literal(Value),
}

impl FromStr for ArgSpec {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ManifestError::InvalidArgument {
            argument: s.to_string(),
            reason: reason.to_string(),
        };
        let name = |rest: &str| {
            if rest.is_empty() {
                Err(invalid("missing name"))
            } else {
                Ok(rest.to_string())
            }
        };

        match s.split_at_checked(1) {
            Some(("@", "collection")) => Ok(ArgSpec::Collection),
            Some(("@", rest)) => name(rest).map(ArgSpec::Contract),
            Some(("$", "owner")) => Ok(ArgSpec::Owner),
            Some(("$", _)) => Err(invalid("only $owner is supported")),
            Some(("%", rest)) => name(rest).map(ArgSpec::Param),
            Some(("#", rest)) => name(rest).map(ArgSpec::CollectionParam),
            _ => s
                .parse()
                .map(ArgSpec::Literal)
                .map_err(|_| invalid("not a reference, parameter or literal")),
        }
    }
}

impl TryFrom<String> for ArgSpec {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArgSpec> for String {
    fn from(value: ArgSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgSpec::Contract(name) => write!(f, "@{name}"),
            ArgSpec::Collection => write!(f, "@collection"),
            ArgSpec::Owner => write!(f, "$owner"),
            ArgSpec::Param(name) => write!(f, "%{name}"),
            ArgSpec::CollectionParam(name) => write!(f, "#{name}"),
            ArgSpec::Literal(value) => write!(f, "{value}"),
        }
    }
}

/// Which endpoint's fresh deployment already applies an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Source,
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetterSpec {
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    pub expect: ArgSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub method: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// `@name` or `@collection`. Defaults to the first reference in `args`, else the contract
    /// itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<ArgSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub getter: Option<GetterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<BTreeSet<Environment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsumed_by: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Instantiate once per served collection.
    #[serde(default)]
    pub per_collection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub name: String,
    #[serde(default)]
    pub scope: Scope,
    /// Deployed by someone else; only referenced by address.
    #[serde(default)]
    pub external: bool,
    /// Bytecode path, relative to the artifacts directory. Defaults to `<name>.bin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub constructor: Vec<ArgSpec>,
    #[serde(default)]
    pub configure: Vec<ActionSpec>,
}

/// Where an argument is being resolved.
#[derive(Debug, Clone, Copy)]
struct Site<'a> {
    contract: &'a str,
    pool: Option<&'a PoolId>,
    collection: Option<&'a CollectionConfig>,
}

/// Expands a manifest for one environment.
#[derive(Debug)]
pub struct Expander<'a> {
    specs: BTreeMap<&'a str, &'a ContractSpec>,
    ordered: &'a [ContractSpec],
    artifacts_dir: &'a Path,
    env: &'a EnvironmentConfig,
    parameters: &'a BTreeMap<String, ParamValue>,
}

impl<'a> Expander<'a> {
    pub fn new(
        specs: &'a [ContractSpec],
        artifacts_dir: &'a Path,
        env: &'a EnvironmentConfig,
        parameters: &'a BTreeMap<String, ParamValue>,
    ) -> Result<Self, ManifestError> {
        let mut by_name = BTreeMap::new();
        for spec in specs {
            if by_name.insert(spec.name.as_str(), spec).is_some() {
                return Err(ManifestError::DuplicateContract {
                    name: spec.name.clone(),
                });
            }
        }

        Ok(Self {
            specs: by_name,
            ordered: specs,
            artifacts_dir,
            env,
            parameters,
        })
    }

    /// Concrete nodes of the environment, collections included.
    pub fn expand(&self) -> Result<Vec<Node>, ManifestError> {
        let mut nodes = Vec::new();

        for spec in self.ordered {
            match spec.scope {
                Scope::Shared => nodes.push(self.instantiate(spec, None)?),
                Scope::Pool => {
                    for pool in &self.env.pools {
                        nodes.push(self.instantiate(spec, Some(&pool.id))?);
                    }
                }
            }
        }

        for collection in &self.env.collections {
            nodes.push(Node::External(ExternalContract {
                id: NodeId::collection(&collection.name),
                name: collection.name.clone(),
                pool_scope: collection.pools.keys().cloned().collect(),
                address: Some(collection.address),
            }));
        }

        Ok(nodes)
    }

    fn all_pools(&self) -> BTreeSet<PoolId> {
        self.env.pools.iter().map(|pool| pool.id.clone()).collect()
    }

    fn instantiate(
        &self,
        spec: &ContractSpec,
        pool: Option<&PoolId>,
    ) -> Result<Node, ManifestError> {
        let id = match pool {
            Some(pool) => NodeId::scoped(&spec.name, pool),
            None => NodeId::new(spec.name.clone()),
        };
        let pool_scope = match pool {
            Some(pool) => BTreeSet::from([pool.clone()]),
            None => self.all_pools(),
        };

        if spec.external {
            let address = match pool {
                Some(pool) => self
                    .env
                    .pools
                    .iter()
                    .find(|config| &config.id == pool)
                    .and_then(|config| config.external.get(&spec.name)),
                None => self.env.external.get(&spec.name),
            };
            return Ok(Node::External(ExternalContract {
                id,
                name: spec.name.clone(),
                pool_scope,
                address: address.copied(),
            }));
        }

        let site = Site {
            contract: &spec.name,
            pool,
            collection: None,
        };
        let constructor = spec
            .constructor
            .iter()
            .map(|arg| self.template(arg, site))
            .collect::<Result<_, _>>()?;

        let mut actions = Vec::new();
        for action in &spec.configure {
            actions.extend(self.actions(spec, &id, pool, action)?);
        }

        let artifact = spec
            .artifact
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.bin", spec.name)));

        Ok(Node::Internal(InternalContract {
            id,
            name: spec.name.clone(),
            pool_scope,
            artifact: self.artifacts_dir.join(artifact),
            constructor,
            actions,
            handle: None,
        }))
    }

    /// Whether `arg` resolves differently per pool.
    fn is_pool_dependent(&self, arg: &ArgSpec) -> bool {
        match arg {
            ArgSpec::Contract(name) => self
                .specs
                .get(name.as_str())
                .is_some_and(|spec| spec.scope == Scope::Pool),
            ArgSpec::CollectionParam(_) => true,
            _ => false,
        }
    }

    fn actions(
        &self,
        spec: &ContractSpec,
        source: &NodeId,
        source_pool: Option<&PoolId>,
        action: &ActionSpec,
    ) -> Result<Vec<ConfigAction>, ManifestError> {
        let pool_dependent = action
            .args
            .iter()
            .chain(&action.dependency)
            .chain(
                action
                    .getter
                    .iter()
                    .flat_map(|getter| getter.args.iter().chain([&getter.expect])),
            )
            .any(|arg| self.is_pool_dependent(arg));

        let pools: Vec<Option<&PoolId>> = match source_pool {
            Some(pool) => vec![Some(pool)],
            None if pool_dependent => self.env.pools.iter().map(|pool| Some(&pool.id)).collect(),
            None => vec![None],
        };

        let mut actions = Vec::new();
        for pool in pools {
            if !action.per_collection {
                let site = Site {
                    contract: &spec.name,
                    pool,
                    collection: None,
                };
                actions.push(self.action(source, action, site)?);
                continue;
            }

            for collection in self
                .env
                .collections
                .iter()
                .filter(|collection| pool.is_none_or(|pool| collection.pools.contains_key(pool)))
            {
                let site = Site {
                    contract: &spec.name,
                    pool,
                    collection: Some(collection),
                };
                actions.push(self.action(source, action, site)?);
            }
        }

        Ok(actions)
    }

    fn action(
        &self,
        source: &NodeId,
        action: &ActionSpec,
        site: Site<'_>,
    ) -> Result<ConfigAction, ManifestError> {
        let args: Vec<ArgTemplate> = action
            .args
            .iter()
            .map(|arg| self.template(arg, site))
            .collect::<Result<_, _>>()?;

        let dependency = match &action.dependency {
            Some(spec @ (ArgSpec::Contract(_) | ArgSpec::Collection)) => {
                match self.template(spec, site)? {
                    ArgTemplate::Node(id) => id,
                    _ => source.clone(),
                }
            }
            Some(other) => {
                return Err(ManifestError::InvalidArgument {
                    argument: other.to_string(),
                    reason: "a dependency must be a contract or @collection".to_string(),
                });
            }
            None => args
                .iter()
                .find_map(ArgTemplate::node)
                .cloned()
                .unwrap_or_else(|| source.clone()),
        };

        let getter = match &action.getter {
            Some(getter) => Some(Getter {
                method: getter.method.clone(),
                args: getter
                    .args
                    .iter()
                    .map(|arg| self.template(arg, site))
                    .collect::<Result<_, _>>()?,
                expect: self.template(&getter.expect, site)?,
            }),
            None => None,
        };

        let subsumed_by = action.subsumed_by.map(|endpoint| match endpoint {
            Endpoint::Source => source.clone(),
            Endpoint::Dependency => dependency.clone(),
        });

        Ok(ConfigAction {
            source: source.clone(),
            dependency,
            method: action.method.clone(),
            args,
            getter,
            environments: action.environments.clone(),
            subsumed_by,
            key: action.key.clone(),
        })
    }

    fn template(&self, arg: &ArgSpec, site: Site<'_>) -> Result<ArgTemplate, ManifestError> {
        let outside_collection = || ManifestError::CollectionOutsideAction {
            contract: site.contract.to_string(),
            argument: arg.to_string(),
        };
        let unknown_parameter = |parameter: &str| ManifestError::UnknownParameter {
            contract: site.contract.to_string(),
            parameter: parameter.to_string(),
        };
        let invalid_value = |reason: String| ManifestError::InvalidArgument {
            argument: arg.to_string(),
            reason,
        };

        match arg {
            ArgSpec::Owner => Ok(ArgTemplate::Owner),
            ArgSpec::Literal(value) => Ok(ArgTemplate::Value(*value)),
            ArgSpec::Collection => site
                .collection
                .map(|collection| ArgTemplate::Node(NodeId::collection(&collection.name)))
                .ok_or_else(outside_collection),
            ArgSpec::Contract(name) => {
                let id = match self.specs.get(name.as_str()) {
                    Some(spec) if spec.scope == Scope::Pool => match site.pool {
                        Some(pool) => NodeId::scoped(name, pool),
                        None => {
                            return Err(ManifestError::AmbiguousReference {
                                contract: site.contract.to_string(),
                                reference: name.clone(),
                            });
                        }
                    },
                    Some(_) => NodeId::new(name.clone()),
                    // Left as is so the graph builder reports it as dangling.
                    None => NodeId::new(name.clone()),
                };
                Ok(ArgTemplate::Node(id))
            }
            ArgSpec::Param(name) => self
                .parameters
                .get(name)
                .ok_or_else(|| unknown_parameter(name))?
                .to_value()
                .map(ArgTemplate::Value)
                .map_err(|err| invalid_value(err.to_string())),
            ArgSpec::CollectionParam(name) => {
                let collection = site.collection.ok_or_else(outside_collection)?;
                let pool = site.pool.ok_or_else(outside_collection)?;
                collection
                    .pools
                    .get(pool)
                    .and_then(|parameters| parameters.get(name))
                    .ok_or_else(|| {
                        unknown_parameter(&format!("{}.{pool}.{name}", collection.name))
                    })?
                    .to_value()
                    .map(ArgTemplate::Value)
                    .map_err(|err| invalid_value(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::{Address, U256};

    use super::*;
    use crate::config::PoolConfig;

    fn env() -> EnvironmentConfig {
        EnvironmentConfig {
            owner: Address::with_last_byte(0x01),
            rpc_url: None,
            record: None,
            pools: vec![
                PoolConfig {
                    id: "weth".into(),
                    external: BTreeMap::from([(
                        "token".to_string(),
                        Address::with_last_byte(0xe1),
                    )]),
                },
                PoolConfig {
                    id: "usdc".into(),
                    external: BTreeMap::from([(
                        "token".to_string(),
                        Address::with_last_byte(0xe2),
                    )]),
                },
            ],
            external: BTreeMap::new(),
            collections: vec![
                CollectionConfig {
                    name: "punks".to_string(),
                    address: Address::with_last_byte(0xc1),
                    pools: BTreeMap::from([
                        (
                            PoolId::from("weth"),
                            BTreeMap::from([(
                                "borrowable_amount".to_string(),
                                ParamValue::Integer(7),
                            )]),
                        ),
                        (
                            PoolId::from("usdc"),
                            BTreeMap::from([(
                                "borrowable_amount".to_string(),
                                ParamValue::Integer(9),
                            )]),
                        ),
                    ]),
                },
                CollectionConfig {
                    name: "apes".to_string(),
                    address: Address::with_last_byte(0xc2),
                    pools: BTreeMap::from([(
                        PoolId::from("weth"),
                        BTreeMap::from([("borrowable_amount".to_string(), ParamValue::Integer(3))]),
                    )]),
                },
            ],
            parameters: BTreeMap::new(),
        }
    }

    fn manifest(toml: &str) -> Vec<ContractSpec> {
        #[derive(Deserialize)]
        struct Manifest {
            contracts: Vec<ContractSpec>,
        }
        toml::from_str::<Manifest>(toml).unwrap().contracts
    }

    fn expand(specs: &[ContractSpec], env: &EnvironmentConfig) -> Result<Vec<Node>, ManifestError> {
        let parameters = BTreeMap::from([("fee".to_string(), ParamValue::Integer(250))]);
        Expander::new(specs, Path::new("build"), env, &parameters)?.expand()
    }

    fn find<'n>(nodes: &'n [Node], id: &str) -> &'n Node {
        nodes
            .iter()
            .find(|node| node.id().as_str() == id)
            .unwrap_or_else(|| panic!("{id} not expanded"))
    }

    #[test]
    fn test_arg_spec_parsing() {
        assert_eq!("@loans".parse::<ArgSpec>(), Ok(ArgSpec::Contract("loans".to_string())));
        assert_eq!("@collection".parse::<ArgSpec>(), Ok(ArgSpec::Collection));
        assert_eq!("$owner".parse::<ArgSpec>(), Ok(ArgSpec::Owner));
        assert_eq!("%fee".parse::<ArgSpec>(), Ok(ArgSpec::Param("fee".to_string())));
        assert_eq!(
            "#borrowable_amount".parse::<ArgSpec>(),
            Ok(ArgSpec::CollectionParam("borrowable_amount".to_string()))
        );
        assert_eq!(
            "false".parse::<ArgSpec>(),
            Ok(ArgSpec::Literal(Value::Bool(false)))
        );
        assert!("$admin".parse::<ArgSpec>().is_err());
        assert!("@".parse::<ArgSpec>().is_err());
        assert!("weth".parse::<ArgSpec>().is_err());
        assert_eq!(ArgSpec::CollectionParam("x".to_string()).to_string(), "#x");
    }

    #[test]
    fn test_pool_scoped_contracts_resolve_within_their_pool() {
        let specs = manifest(
            r#"
            [[contracts]]
            name = "token"
            scope = "pool"
            external = true

            [[contracts]]
            name = "lending_pool_core"
            scope = "pool"
            constructor = ["@token", "$owner", "%fee"]

            [[contracts]]
            name = "genesis_pass"
            "#,
        );
        let nodes = expand(&specs, &env()).unwrap();

        assert_eq!(nodes.len(), 5 + 2);
        assert_eq!(
            find(&nodes, "token.usdc").address(),
            Some(Address::with_last_byte(0xe2))
        );

        let Node::Internal(core) = find(&nodes, "lending_pool_core.weth") else {
            panic!("lending_pool_core must be internal");
        };
        assert_eq!(
            core.constructor,
            vec![
                ArgTemplate::Node("token.weth".into()),
                ArgTemplate::Owner,
                ArgTemplate::Value(Value::Uint(U256::from(250))),
            ]
        );
        assert_eq!(core.artifact, PathBuf::from("build/lending_pool_core.bin"));
        assert_eq!(core.pool_scope, BTreeSet::from([PoolId::from("weth")]));

        assert_eq!(find(&nodes, "genesis_pass").pool_scope().len(), 2);
        assert_eq!(
            find(&nodes, "collection.apes").pool_scope(),
            &BTreeSet::from([PoolId::from("weth")])
        );
    }

    #[test]
    fn test_shared_actions_on_pool_contracts_are_instantiated_per_pool() {
        let specs = manifest(
            r#"
            [[contracts]]
            name = "token"
            scope = "pool"
            external = true

            [[contracts]]
            name = "loans"
            scope = "pool"

            [[contracts]]
            name = "collateral_vault_peripheral"

            [[contracts.configure]]
            method = "addLoansPeripheralAddress"
            args = ["@token", "@loans"]
            dependency = "@loans"
            getter = { method = "loansPeripheralAddresses", args = ["@token"], expect = "@loans" }
            "#,
        );
        let nodes = expand(&specs, &env()).unwrap();

        let actions = find(&nodes, "collateral_vault_peripheral").configuration_actions();
        let ids: Vec<String> = actions.iter().map(|action| action.id().to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "collateral_vault_peripheral:addLoansPeripheralAddress:loans.weth",
                "collateral_vault_peripheral:addLoansPeripheralAddress:loans.usdc",
            ]
        );
        assert_eq!(
            actions[1].getter.as_ref().unwrap().expect,
            ArgTemplate::Node("loans.usdc".into())
        );
    }

    #[test]
    fn test_per_collection_actions_follow_served_pools() {
        let specs = manifest(
            r##"
            [[contracts]]
            name = "liquidity_controls"
            scope = "pool"

            [[contracts.configure]]
            method = "changeMaxCollectionBorrowableAmount"
            args = ["@collection", "#borrowable_amount"]
            per_collection = true
            key = "nft_borrowable_amounts"
            getter = { method = "maxCollectionBorrowableAmount", args = ["@collection"], expect = "#borrowable_amount" }
            "##,
        );
        let nodes = expand(&specs, &env()).unwrap();

        let weth = find(&nodes, "liquidity_controls.weth").configuration_actions();
        let usdc = find(&nodes, "liquidity_controls.usdc").configuration_actions();
        assert_eq!(weth.len(), 2);
        assert_eq!(usdc.len(), 1);

        let punks_usdc = &usdc[0];
        assert_eq!(punks_usdc.dependency.as_str(), "collection.punks");
        assert_eq!(punks_usdc.key.as_deref(), Some("nft_borrowable_amounts"));
        assert_eq!(
            punks_usdc.args[1],
            ArgTemplate::Value(Value::Uint(U256::from(9)))
        );
    }

    #[test]
    fn test_subsumption_endpoints_and_gating() {
        let specs = manifest(
            r#"
            [[contracts]]
            name = "sushi_router"
            external = true

            [[contracts]]
            name = "collateral_vault_peripheral"

            [[contracts]]
            name = "liquidations_peripheral"
            constructor = ["@collateral_vault_peripheral"]

            [[contracts.configure]]
            method = "changeCollateralVaultPeripheralAddress"
            args = ["@collateral_vault_peripheral"]
            subsumed_by = "source"

            [[contracts.configure]]
            method = "setSushiRouterAddress"
            args = ["@sushi_router"]
            environments = ["local", "production"]
            "#,
        );
        let nodes = expand(&specs, &env()).unwrap();
        let actions = find(&nodes, "liquidations_peripheral").configuration_actions();

        assert_eq!(actions[0].subsumed_by, Some("liquidations_peripheral".into()));
        assert!(!actions[1].allowed_in(Environment::Dev));
        assert!(actions[1].allowed_in(Environment::Production));
        assert_eq!(find(&nodes, "sushi_router").address(), None);
    }

    #[test]
    fn test_expansion_errors() {
        let ambiguous = manifest(
            r#"
            [[contracts]]
            name = "loans"
            scope = "pool"

            [[contracts]]
            name = "genesis_pass"
            constructor = ["@loans"]
            "#,
        );
        assert!(matches!(
            expand(&ambiguous, &env()),
            Err(ManifestError::AmbiguousReference { .. })
        ));

        let unknown = manifest(
            r#"
            [[contracts]]
            name = "genesis_pass"
            constructor = ["%supply"]
            "#,
        );
        assert_eq!(
            expand(&unknown, &env()).unwrap_err(),
            ManifestError::UnknownParameter {
                contract: "genesis_pass".to_string(),
                parameter: "supply".to_string(),
            }
        );

        let collection = manifest(
            r#"
            [[contracts]]
            name = "loans"
            constructor = ["@collection"]
            "#,
        );
        assert!(matches!(
            expand(&collection, &env()),
            Err(ManifestError::CollectionOutsideAction { .. })
        ));

        let duplicate = manifest(
            r#"
            [[contracts]]
            name = "loans"

            [[contracts]]
            name = "loans"
            "#,
        );
        assert!(matches!(
            expand(&duplicate, &env()),
            Err(ManifestError::DuplicateContract { .. })
        ));
    }

    #[test]
    fn test_unknown_references_are_kept_for_the_graph_builder() {
        let specs = manifest(
            r#"
            [[contracts]]
            name = "loans"
            constructor = ["@loans_core"]
            "#,
        );
        let nodes = expand(&specs, &env()).unwrap();
        assert!(
            find(&nodes, "loans")
                .deployment_dependencies()
                .contains(&NodeId::from("loans_core"))
        );
    }
}
