#![allow(renamed_and_removed_lints)]

use thiserror::Error;

/// All errors the definitions crate can produce.
///
/// The controller crate wraps this into its own error enum, so everything
/// here stays close to the library that actually failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("certificate generation failed: {0}")]
    Pki(#[from] rcgen::Error),

    #[error("ssh keypair generation failed: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("template rendering failed: {0}")]
    Template(#[from] tera::Error),

    #[error("user-data serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("'{version}' is not a valid etcd version: {source}")]
    InvalidVersion {
        version: String,
        source: semver::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// References to other objects, used in specs and statuses
pub mod refs;
pub use refs::{LocalObjectRef, SecretKeyRef};

/// Phases, condition types and condition reasons as closed sum types
pub mod conditions;
pub use conditions::{
    ClusterCondition, ClusterConditionReason, ClusterConditionType, ConditionStatus,
    EtcdClusterPhase, EtcdNodePhase, NodeCondition, NodeConditionReason, NodeConditionType,
};

/// The user-facing EtcdCluster resource
pub mod cluster;
pub use cluster::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus};

/// Versioned roll-outs over node sets
pub mod nodedeployment;
pub use nodedeployment::{
    EtcdNodeDeployment, EtcdNodeDeploymentSpec, EtcdNodeDeploymentStatus, RollingUpdate,
};

/// Pools of nodes sharing one template hash
pub mod nodeset;
pub use nodeset::{EtcdNodeSet, EtcdNodeSetSpec, EtcdNodeSetStatus};

/// A single etcd member backed by one virtual machine
pub mod node;
pub use node::{EtcdNode, EtcdNodeSpec, EtcdNodeStatus, EtcdNodeTemplateSpec};

/// The subset of the KubeVirt VirtualMachineInstance API the controller emits
pub mod virtualmachine;
pub use virtualmachine::{
    VirtualMachineInstance, VirtualMachineInstanceSpec, VirtualMachineInstanceStatus,
    VirtualMachinePhase,
};

/// Deterministic child names and the label schema
pub mod names;

/// X.509 material for the cluster CA and the client/peer identities
pub mod pki;

/// OpenSSH ed25519 keypairs for node provisioning
pub mod sshkeys;

/// A renderer of `tera` templates (jinja style)
///
/// Used for the provisioning scripts and the cloud-init document that are
/// inlined into each node's user-data Secret.
pub mod userdata;
