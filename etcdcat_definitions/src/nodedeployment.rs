use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::node::EtcdNodeTemplateSpec;

/// A versioned roll-out controller over EtcdNodeSets.
///
/// The deployment keeps one set per template revision and shifts replicas
/// between the newest set and its predecessor within the surge/unavailable
/// budgets, exactly like the workload Deployment/ReplicaSet pair it mirrors.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "etcdcat.io",
    version = "v1alpha1",
    kind = "EtcdNodeDeployment",
    plural = "etcdnodedeployments",
    shortname = "end",
    namespaced,
    status = "EtcdNodeDeploymentStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Updated","type":"integer","jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeDeploymentSpec {
    /// Total number of nodes across all owned sets once a roll completes
    #[serde(default)]
    pub replicas: i32,

    /// Labels selecting the sets (and transitively nodes) this deployment owns
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Template the current node set is created from
    pub template: EtcdNodeTemplateSpec,

    /// Roll speed tuning; defaults to 25% / 25%
    ///
    /// ```yaml
    /// rollingUpdate:
    ///   maxUnavailable: 0
    ///   maxSurge: 50%
    /// ```
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,

    /// How many drained old sets to keep around for inspection
    #[serde(default = "default_revision_history_limit")]
    pub revision_history_limit: i32,
}

fn default_revision_history_limit() -> i32 {
    10
}

/// Bounds for a rolling node replacement, percent-or-int like kubernetes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// How many nodes may be missing below the desired count during a roll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    /// How many nodes may exist above the desired count during a roll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeDeploymentStatus {
    /// Nodes currently existing across all owned sets
    #[serde(default)]
    pub replicas: i32,

    /// Nodes reporting Ready across all owned sets
    #[serde(default)]
    pub ready_replicas: i32,

    /// Ready nodes belonging to the set with the current template hash
    #[serde(default)]
    pub updated_replicas: i32,

    /// Shortfall below the desired count, clamped at zero
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Bumped whenever a set name collision forces a re-hash
    #[serde(default)]
    pub collision_count: i32,
}
