//! Node builders shared by the unit tests.

use std::{collections::BTreeSet, path::PathBuf};

use alloy_core::primitives::Address;

use crate::node::{ArgTemplate, ConfigAction, ExternalContract, InternalContract, Node};

/// An internal contract whose constructor takes the addresses of `constructor`.
pub(crate) fn internal(id: &str, constructor: &[&str], actions: Vec<ConfigAction>) -> Node {
    let constructor = constructor
        .iter()
        .map(|dep| ArgTemplate::Node((*dep).into()))
        .collect();
    internal_with_args(id, constructor, actions)
}

pub(crate) fn internal_with_args(
    id: &str,
    constructor: Vec<ArgTemplate>,
    actions: Vec<ConfigAction>,
) -> Node {
    Node::Internal(InternalContract {
        id: id.into(),
        name: id.to_string(),
        pool_scope: BTreeSet::new(),
        artifact: PathBuf::from(format!("build/{id}.bin")),
        constructor,
        actions,
        handle: None,
    })
}

pub(crate) fn external(id: &str) -> Node {
    external_at(id, None)
}

pub(crate) fn external_at(id: &str, address: Option<Address>) -> Node {
    Node::External(ExternalContract {
        id: id.into(),
        name: id.to_string(),
        pool_scope: BTreeSet::new(),
        address,
    })
}

/// `source.method(@dependency)`, without a getter.
pub(crate) fn wire(source: &str, dependency: &str, method: &str) -> ConfigAction {
    ConfigAction {
        source: source.into(),
        dependency: dependency.into(),
        method: method.to_string(),
        args: vec![ArgTemplate::Node(dependency.into())],
        getter: None,
        environments: None,
        subsumed_by: None,
        key: None,
    }
}
