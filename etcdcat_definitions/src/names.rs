//! Deterministic child names and the label schema.
//!
//! Every object the controller creates is named by a pure function of its
//! owner's name. A status reference whose name disagrees with the function
//! is a foreign reference and fails the reconcile, which keeps a mis-edited
//! status from ever steering the controller at somebody else's objects.

use std::collections::BTreeMap;

use regex::Regex;

/// API group, doubling as the managed-by value on emitted EndpointSlices.
pub const CONTROLLER_DOMAIN: &str = "etcdcat.io";

/// Finalizer attached to EtcdClusters and EtcdNodes.
pub const FINALIZER: &str = "etcdcat.io/finalizer";

pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_CLUSTER_NAME: &str = "etcdcat.io/cluster-name";
pub const LABEL_NODE_NAME: &str = "etcdcat.io/node-name";
pub const LABEL_TEMPLATE_HASH: &str = "etcdcat.io/node-template-hash";

pub const APP_NAME: &str = "etcd";
pub const MANAGER_NAME: &str = "etcdcat";

pub const PORT_ETCD: i32 = 2379;
pub const PORT_PEER: i32 = 2380;
pub const PORT_SSH: i32 = 22;

/// Data keys inside the TLS secrets, matching `kubernetes.io/tls`.
pub const KEY_TLS_CERT: &str = "tls.crt";
pub const KEY_TLS_KEY: &str = "tls.key";
/// Data keys inside the SSH secret, matching `kubernetes.io/ssh-auth`.
pub const KEY_SSH_PRIVATE: &str = "ssh-privatekey";
pub const KEY_SSH_PUBLIC: &str = "ssh-publickey";
/// Data key KubeVirt reads the cloud-init document from.
pub const KEY_USER_DATA: &str = "userdata";

pub fn ca_secret_name(cluster: &str) -> String {
    format!("ca-{}", cluster)
}

pub fn api_client_secret_name(cluster: &str) -> String {
    format!("api-client-{}", cluster)
}

pub fn peer_secret_name(cluster: &str) -> String {
    format!("peer-{}", cluster)
}

pub fn ssh_keypair_secret_name(cluster: &str) -> String {
    format!("ssh-keypair-{}", cluster)
}

/// The cluster Service carries the cluster's own name.
pub fn cluster_service_name(cluster: &str) -> String {
    cluster.to_string()
}

pub fn endpoint_slice_name(cluster: &str) -> String {
    cluster.to_string()
}

pub fn node_deployment_name(cluster: &str) -> String {
    cluster.to_string()
}

/// PVC holding the boot image the VMs clone. Provisioning the PVC itself is
/// an installation prerequisite, not something this controller does.
pub fn image_pvc_name(cluster: &str) -> String {
    format!("image-{}", cluster)
}

pub fn node_set_name(deployment: &str, template_hash: &str) -> String {
    format!("{}-{}", deployment, template_hash)
}

pub fn user_data_secret_name(node: &str) -> String {
    format!("userdata-{}", node)
}

/// Per-node Service; also the member name etcdadm registers.
pub fn peer_service_name(node: &str) -> String {
    node.to_string()
}

pub fn virtual_machine_name(node: &str) -> String {
    node.to_string()
}

/// Labels every owned object carries.
pub fn common_labels(cluster: &str) -> BTreeMap<String, String> {
    vec![
        (LABEL_APP_NAME, APP_NAME),
        (LABEL_MANAGED_BY, MANAGER_NAME),
        (LABEL_CLUSTER_NAME, cluster),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Whether a cluster name leaves room for every derived child name.
///
/// 46 characters keeps `ssh-keypair-<name>` and the five-character node
/// suffixes inside the 63-character DNS label limit.
pub fn valid_cluster_name(name: &str) -> bool {
    let re = Regex::new(r"^[0-9a-z][0-9a-z\-]{0,44}[0-9a-z]$").unwrap();
    re.is_match(name) || (name.len() == 1 && name.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_names_are_pure_functions_of_the_owner() {
        assert_eq!(ca_secret_name("example"), "ca-example");
        assert_eq!(api_client_secret_name("example"), "api-client-example");
        assert_eq!(peer_secret_name("example"), "peer-example");
        assert_eq!(ssh_keypair_secret_name("example"), "ssh-keypair-example");
        assert_eq!(cluster_service_name("example"), "example");
        assert_eq!(endpoint_slice_name("example"), "example");
        assert_eq!(node_deployment_name("example"), "example");
        assert_eq!(user_data_secret_name("example-abc12-xk9f2"), "userdata-example-abc12-xk9f2");
        assert_eq!(node_set_name("example", "7d9f8c6b2a"), "example-7d9f8c6b2a");
    }

    #[test]
    fn cluster_name_validation() {
        assert!(valid_cluster_name("example"));
        assert!(valid_cluster_name("etcd-prod-eu-1"));
        assert!(!valid_cluster_name("Example"));
        assert!(!valid_cluster_name("-leading-dash"));
        assert!(!valid_cluster_name("trailing-dash-"));
        assert!(!valid_cluster_name(
            "this-cluster-name-is-way-way-way-too-long-to-leave-room-for-suffixes"
        ));
    }
}
