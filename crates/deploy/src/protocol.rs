//! The built-in lending protocol manifest.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::{ContractSpec, ParamValue};

/// Contract graph and default parameters of the lending protocol.
pub const LENDING_PROTOCOL: &str = include_str!("../protocol/lending.toml");

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolManifest {
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    pub contracts: Vec<ContractSpec>,
}

/// Parse the built-in manifest.
pub fn builtin() -> Result<ProtocolManifest> {
    toml::from_str(LENDING_PROTOCOL).context("Failed to parse built-in protocol manifest")
}
