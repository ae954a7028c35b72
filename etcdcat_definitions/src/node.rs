use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{EtcdNodePhase, NodeCondition, NodeConditionType};
use crate::refs::{LocalObjectRef, SecretKeyRef};

/// One etcd member backed by one virtual machine.
///
/// EtcdNodes are created by EtcdNodeSets, never by hand. The node reconciler
/// walks each one through: peer Service, user-data Secret, virtual machine,
/// SSH-driven provisioning, and finally a health-checked Running state.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "etcdcat.io",
    version = "v1alpha1",
    kind = "EtcdNode",
    plural = "etcdnodes",
    shortname = "en",
    namespaced,
    status = "EtcdNodeStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeSpec {
    /// Version of etcd this member runs
    pub version: String,

    /// Whether this member starts a brand new etcd cluster instead of
    /// joining the existing one
    ///
    /// Set by the cluster reconciler on the sole bootstrap node, and only
    /// ever transitions true to false. The provisioning script is chosen
    /// from the flag value at the moment the VM becomes SSH-reachable.
    #[serde(default)]
    pub as_first_node: bool,

    /// CA certificate handed to etcdadm on the VM
    pub ca_certificate_ref: SecretKeyRef,
    /// CA private key handed to etcdadm on the VM
    pub ca_private_key_ref: SecretKeyRef,

    /// Client certificate used for member health checks
    pub client_certificate_ref: SecretKeyRef,
    pub client_private_key_ref: SecretKeyRef,

    /// SSH identity used to drive provisioning
    pub ssh_private_key_ref: SecretKeyRef,
    /// SSH public key granted login on the VM
    pub ssh_public_key_ref: SecretKeyRef,

    /// The cluster-wide client Service, used as the join endpoint
    pub service_ref: LocalObjectRef,

    /// PVC holding the VM boot image; the VM gets an ephemeral copy
    pub image_persistent_volume_claim_ref: LocalObjectRef,

    /// Optional serial-console password for the default user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_password_secret_key_ref: Option<SecretKeyRef>,
}

/// Labels plus an EtcdNodeSpec, stamped out by node sets.
///
/// Two templates are compared with [`semantic_eq`], not `==`, so a nil and
/// an empty label map describe the same template.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub spec: EtcdNodeSpec,
}

/// Structural template equality.
///
/// Serialization drops `None` and empty collections, so comparing the
/// serialized forms gives nil-vs-empty equivalence without a hand-written
/// recursive walk.
pub fn semantic_eq(a: &EtcdNodeTemplateSpec, b: &EtcdNodeTemplateSpec) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EtcdNodePhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeCondition>,

    /// Latch recording that this member has reported Ready at least once
    #[serde(default)]
    pub ready_once: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_service_ref: Option<LocalObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_ref: Option<LocalObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_ref: Option<LocalObjectRef>,
}

impl EtcdNode {
    pub fn is_provisioned(&self) -> bool {
        self.condition_true(NodeConditionType::Provisioned)
    }

    pub fn is_ready(&self) -> bool {
        self.condition_true(NodeConditionType::Ready)
    }

    pub fn is_member_finalized(&self) -> bool {
        self.condition_true(NodeConditionType::MemberFinalized)
    }

    pub fn is_ready_once(&self) -> bool {
        self.status.as_ref().map(|s| s.ready_once).unwrap_or(false) || self.is_ready()
    }

    fn condition_true(&self, r#type: NodeConditionType) -> bool {
        self.status
            .as_ref()
            .map(|s| NodeCondition::is_true(&s.conditions, r#type))
            .unwrap_or(false)
    }

    /// Phase as a pure function of conditions and deletion timestamp.
    pub fn desired_phase(&self) -> EtcdNodePhase {
        if self.metadata.deletion_timestamp.is_some() {
            EtcdNodePhase::Deleting
        } else if self.is_ready() {
            EtcdNodePhase::Running
        } else if self.is_ready_once() {
            EtcdNodePhase::Error
        } else if self.is_provisioned() {
            EtcdNodePhase::Provisioned
        } else {
            EtcdNodePhase::Creating
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{ConditionStatus, NodeConditionReason};

    fn template(labels: BTreeMap<String, String>) -> EtcdNodeTemplateSpec {
        EtcdNodeTemplateSpec {
            labels,
            spec: EtcdNodeSpec {
                version: "3.5.1".into(),
                as_first_node: false,
                ca_certificate_ref: SecretKeyRef::to("ca-example", "tls.crt"),
                ca_private_key_ref: SecretKeyRef::to("ca-example", "tls.key"),
                client_certificate_ref: SecretKeyRef::to("api-client-example", "tls.crt"),
                client_private_key_ref: SecretKeyRef::to("api-client-example", "tls.key"),
                ssh_private_key_ref: SecretKeyRef::to("ssh-keypair-example", "ssh-privatekey"),
                ssh_public_key_ref: SecretKeyRef::to("ssh-keypair-example", "ssh-publickey"),
                service_ref: LocalObjectRef::to("example"),
                image_persistent_volume_claim_ref: LocalObjectRef::to("image-example"),
                login_password_secret_key_ref: None,
            },
        }
    }

    #[test]
    fn nil_and_empty_labels_are_semantically_equal() {
        let a = template(BTreeMap::new());
        // an empty label map is skipped on serialization, so the round-trip
        // yields the "labels absent" form of the same template
        let json = serde_json::to_string(&a).unwrap();
        assert!(!json.contains("labels"));
        let b: EtcdNodeTemplateSpec = serde_json::from_str(&json).unwrap();
        assert!(semantic_eq(&a, &b));
    }

    #[test]
    fn differing_versions_are_not_semantically_equal() {
        let a = template(BTreeMap::new());
        let mut b = a.clone();
        b.spec.version = "3.5.2".into();
        assert!(!semantic_eq(&a, &b));
    }

    #[test]
    fn phase_walks_the_lifecycle() {
        let mut node = EtcdNode::new("example-0", template(BTreeMap::new()).spec);
        node.status = Some(EtcdNodeStatus::default());
        assert_eq!(node.desired_phase(), EtcdNodePhase::Creating);

        let status = node.status.as_mut().unwrap();
        NodeCondition::set(
            &mut status.conditions,
            NodeConditionType::Provisioned,
            ConditionStatus::True,
            Some(NodeConditionReason::ProvisionExecuted),
            None,
        );
        assert_eq!(node.desired_phase(), EtcdNodePhase::Provisioned);

        let status = node.status.as_mut().unwrap();
        NodeCondition::set(
            &mut status.conditions,
            NodeConditionType::Ready,
            ConditionStatus::True,
            Some(NodeConditionReason::HealthCheckSucceeded),
            None,
        );
        status.ready_once = true;
        assert_eq!(node.desired_phase(), EtcdNodePhase::Running);

        let status = node.status.as_mut().unwrap();
        NodeCondition::set(
            &mut status.conditions,
            NodeConditionType::Ready,
            ConditionStatus::False,
            Some(NodeConditionReason::HealthCheckFailed),
            None,
        );
        assert_eq!(node.desired_phase(), EtcdNodePhase::Error);
    }
}
