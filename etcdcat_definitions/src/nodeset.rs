use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::node::EtcdNodeTemplateSpec;

/// A pool of EtcdNodes stamped from one immutable template.
///
/// Sets scale up and down; they never edit a live node. Rolling template
/// changes happen one level up, in the EtcdNodeDeployment, by shifting
/// replicas between sets with different template hashes.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "etcdcat.io",
    version = "v1alpha1",
    kind = "EtcdNodeSet",
    plural = "etcdnodesets",
    shortname = "ens",
    namespaced,
    status = "EtcdNodeSetStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeSetSpec {
    /// Number of nodes this set should own
    #[serde(default)]
    pub replicas: i32,

    /// Labels selecting the nodes this set owns
    ///
    /// Must be a subset of `template.labels`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Template every owned node is created from
    pub template: EtcdNodeTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeSetStatus {
    /// Number of owned nodes
    #[serde(default)]
    pub replicas: i32,

    /// Number of owned nodes reporting Ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Number of owned nodes carrying every template label
    #[serde(default)]
    pub fully_labeled_replicas: i32,

    /// Most recent generation this status reflects; never decreases
    #[serde(default)]
    pub observed_generation: i64,
}
