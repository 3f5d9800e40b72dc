//! Mapping cluster nodes to backend servers

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::warn;

use super::selector::LabelSelector;
use crate::error::{Error, Result};

pub const PROVIDER_ID_PREFIX: &str = "hcloud://";

/// Server ID from a node provider ID of the form `hcloud://<id>`
pub fn server_id_from_provider_id(provider_id: &str) -> Result<i64> {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .and_then(|id| id.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "provider ID {provider_id:?} is not of the form {PROVIDER_ID_PREFIX}<server-id>"
            ))
        })
}

/// Server IDs of all nodes matching `selector`
///
/// Nodes that have not been initialised by the cloud provider yet carry no
/// provider ID and are skipped.
pub fn desired_server_ids(nodes: &[Node], selector: &LabelSelector) -> Result<BTreeSet<i64>> {
    let mut ids = BTreeSet::new();
    for node in nodes {
        if !selector.matches(node.labels()) {
            continue;
        }
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .unwrap_or_default();
        if provider_id.is_empty() {
            warn!(node = %node.name_any(), "Node has no provider ID, skipping as target");
            continue;
        }
        ids.insert(server_id_from_provider_id(provider_id)?);
    }
    Ok(ids)
}
