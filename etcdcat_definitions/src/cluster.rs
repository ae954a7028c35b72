use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{ClusterCondition, ClusterConditionType, EtcdClusterPhase};
use crate::refs::{LocalObjectRef, SecretKeyRef};

/// Main user-facing resource, declaring the etcd cluster that should exist.
///
/// Everything else in this API group is derived from it: the controller owns
/// the PKI secrets, the cluster Service and EndpointSlice, and exactly one
/// EtcdNodeDeployment whose template is computed from this spec.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "etcdcat.io",
    version = "v1alpha1",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "ec",
    namespaced,
    status = "EtcdClusterStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Version of etcd to run on every member
    ///
    /// Plain semver, no `v` prefix. Changing it replaces every member via a
    /// rolling update of the owned EtcdNodeDeployment.
    ///
    /// ```yaml
    /// version: 3.5.1
    /// ```
    pub version: String,

    /// Desired number of etcd members
    ///
    /// Must be at least 1. During bootstrap the controller runs a single
    /// member regardless of this value, then scales out once that member
    /// has reported Ready.
    ///
    /// ```yaml
    /// replicas: 3
    /// ```
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1))]
    pub replicas: i32,

    /// Optional login password for the VM serial console
    ///
    /// Referenced Secret key is written into each node's cloud-init user
    /// entry. Useful for debugging members that never become reachable
    /// over SSH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_password_secret_key_ref: Option<SecretKeyRef>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EtcdClusterPhase>,

    /// Number of nodes currently owned through the node deployment
    #[serde(default)]
    pub replicas: i32,

    /// Number of owned nodes reporting Ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// One-way latch, set the first time the Ready condition is observed
    /// true. While false the cluster is still bootstrapping and runs a
    /// single first node.
    #[serde(default)]
    pub ready_once: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    /// When the prober last completed a probe pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ready_probe_time: Option<DateTime<Utc>>,

    // Persisted secret material. Every reference must point at the
    // deterministically-named object the controller created; anything else
    // is treated as a foreign reference and fails the reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_private_key_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_private_key_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_certificate_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_private_key_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key_ref: Option<SecretKeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<LocalObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_slice_ref: Option<LocalObjectRef>,
}

impl EtcdCluster {
    /// Whether the cluster endpoint answered its last health check.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| ClusterCondition::is_true(&s.conditions, ClusterConditionType::Ready))
            .unwrap_or(false)
    }

    pub fn is_members_healthy(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| ClusterCondition::is_true(&s.conditions, ClusterConditionType::MembersHealthy))
            .unwrap_or(false)
    }

    /// Whether the cluster has ever reported Ready.
    ///
    /// Once true the bootstrap special case (single first node) is over for
    /// good, even if the cluster later becomes unready.
    pub fn is_ready_once(&self) -> bool {
        self.status.as_ref().map(|s| s.ready_once).unwrap_or(false) || self.is_ready()
    }

    /// Phase as a pure function of spec, status and deletion timestamp.
    pub fn desired_phase(&self) -> EtcdClusterPhase {
        if self.metadata.deletion_timestamp.is_some() {
            return EtcdClusterPhase::Deleting;
        }
        let ready_replicas = self
            .status
            .as_ref()
            .map(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready_replicas != self.spec.replicas {
            if self.is_ready_once() && !self.is_ready() {
                EtcdClusterPhase::Error
            } else {
                EtcdClusterPhase::Creating
            }
        } else if self.is_ready() {
            EtcdClusterPhase::Running
        } else {
            EtcdClusterPhase::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{ClusterConditionReason, ConditionStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn cluster(replicas: i32) -> EtcdCluster {
        let mut c = EtcdCluster::new(
            "example",
            EtcdClusterSpec {
                version: "3.5.1".into(),
                replicas,
                login_password_secret_key_ref: None,
            },
        );
        c.status = Some(EtcdClusterStatus::default());
        c
    }

    fn mark_ready(c: &mut EtcdCluster, ready: bool) {
        let status = c.status.as_mut().unwrap();
        ClusterCondition::set(
            &mut status.conditions,
            ClusterConditionType::Ready,
            if ready {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            Some(if ready {
                ClusterConditionReason::ProbeSucceeded
            } else {
                ClusterConditionReason::ProbeFailed
            }),
            None,
        );
    }

    #[test]
    fn phase_is_creating_before_first_ready() {
        let mut c = cluster(3);
        assert_eq!(c.desired_phase(), EtcdClusterPhase::Creating);
        c.status.as_mut().unwrap().ready_replicas = 1;
        assert_eq!(c.desired_phase(), EtcdClusterPhase::Creating);
    }

    #[test]
    fn phase_is_running_when_converged_and_ready() {
        let mut c = cluster(3);
        c.status.as_mut().unwrap().ready_replicas = 3;
        c.status.as_mut().unwrap().ready_once = true;
        mark_ready(&mut c, true);
        assert_eq!(c.desired_phase(), EtcdClusterPhase::Running);
    }

    #[test]
    fn phase_is_error_when_previously_ready_cluster_degrades() {
        let mut c = cluster(3);
        c.status.as_mut().unwrap().ready_replicas = 2;
        c.status.as_mut().unwrap().ready_once = true;
        mark_ready(&mut c, false);
        assert_eq!(c.desired_phase(), EtcdClusterPhase::Error);
    }

    #[test]
    fn phase_is_deleting_once_marked() {
        let mut c = cluster(1);
        c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(c.desired_phase(), EtcdClusterPhase::Deleting);
    }

    #[test]
    fn ready_once_latches_through_status_field() {
        let mut c = cluster(3);
        assert!(!c.is_ready_once());
        c.status.as_mut().unwrap().ready_once = true;
        mark_ready(&mut c, false);
        assert!(c.is_ready_once());
    }
}
