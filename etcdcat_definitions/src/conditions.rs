use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Truth value of a condition, following the kubernetes convention.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Where an EtcdCluster is in its lifecycle.
///
/// The phase is always derivable from the other status fields; it exists so
/// `kubectl get` has one column that tells the whole story.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EtcdClusterPhase {
    #[default]
    Creating,
    Running,
    Error,
    Deleting,
}

/// Where an EtcdNode is in its lifecycle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum EtcdNodePhase {
    #[default]
    Creating,
    Provisioned,
    Running,
    Error,
    Deleting,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterConditionType {
    /// The cluster endpoint answers the health check
    Ready,
    /// Every probed member answers its health check
    MembersHealthy,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterConditionReason {
    ProbeSucceeded,
    ProbeFailed,
    MemberUnreachable,
    AwaitingProbe,
}

/// One observation about an EtcdCluster made by the prober.
///
/// `lastTransitionTime` only moves when `status` flips, so consumers can
/// tell "has been down for an hour" from "went down just now".
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub r#type: ClusterConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ClusterConditionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NodeConditionType {
    /// The provisioning script ran to completion over SSH
    Provisioned,
    /// The member answers its health check
    Ready,
    /// The member was removed from the etcd cluster on tear-down
    MemberFinalized,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NodeConditionReason {
    VirtualMachineNotRunning,
    SshUnreachable,
    ProvisionFailed,
    ProvisionExecuted,
    HealthCheckSucceeded,
    HealthCheckFailed,
    LeaveExecuted,
    LeaveAbandoned,
}

/// One observation about an EtcdNode made by its reconciler.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    pub r#type: NodeConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<NodeConditionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

macro_rules! condition_impl {
    ($cond:ident, $ty:ident, $reason:ident) => {
        impl $cond {
            /// Upsert a condition, keeping `lastTransitionTime` stable while
            /// the status does not change.
            pub fn set(
                conditions: &mut Vec<$cond>,
                r#type: $ty,
                status: ConditionStatus,
                reason: Option<$reason>,
                message: Option<String>,
            ) {
                let now = Utc::now();
                if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == r#type) {
                    if existing.status != status {
                        existing.last_transition_time = Some(now);
                    }
                    existing.status = status;
                    existing.reason = reason;
                    existing.message = message;
                } else {
                    conditions.push($cond {
                        r#type,
                        status,
                        reason,
                        message,
                        last_transition_time: Some(now),
                    });
                }
            }

            pub fn is_true(conditions: &[$cond], r#type: $ty) -> bool {
                conditions
                    .iter()
                    .any(|c| c.r#type == r#type && c.status == ConditionStatus::True)
            }
        }
    };
}

condition_impl!(ClusterCondition, ClusterConditionType, ClusterConditionReason);
condition_impl!(NodeCondition, NodeConditionType, NodeConditionReason);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_is_sticky_while_status_is_stable() {
        let mut conditions = Vec::new();
        ClusterCondition::set(
            &mut conditions,
            ClusterConditionType::Ready,
            ConditionStatus::True,
            Some(ClusterConditionReason::ProbeSucceeded),
            None,
        );
        let first = conditions[0].last_transition_time;
        assert!(first.is_some());

        ClusterCondition::set(
            &mut conditions,
            ClusterConditionType::Ready,
            ConditionStatus::True,
            Some(ClusterConditionReason::ProbeSucceeded),
            None,
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);

        ClusterCondition::set(
            &mut conditions,
            ClusterConditionType::Ready,
            ConditionStatus::False,
            Some(ClusterConditionReason::ProbeFailed),
            Some("connection refused".into()),
        );
        assert_ne!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn conditions_serialize_with_kube_casing() {
        let mut conditions = Vec::new();
        NodeCondition::set(
            &mut conditions,
            NodeConditionType::Provisioned,
            ConditionStatus::True,
            Some(NodeConditionReason::ProvisionExecuted),
            None,
        );
        let json = serde_json::to_value(&conditions).unwrap();
        assert_eq!(json[0]["type"], "Provisioned");
        assert_eq!(json[0]["status"], "True");
        assert_eq!(json[0]["reason"], "ProvisionExecuted");
        assert!(json[0]["lastTransitionTime"].is_string());
    }
}
