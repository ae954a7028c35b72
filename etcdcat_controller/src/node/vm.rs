//! Creation and observation of the member's VirtualMachineInstance.
//!
//! The VM is create-only: an ephemeral copy of the image PVC, the user-data
//! Secret as a NoCloud datasource, and a TCP readiness probe on the SSH
//! port. Anything that needs changing means a new node, never an edited VM.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams};
use kube::ResourceExt;
use tracing::debug;

use etcdcat_definitions::names::{self, PORT_SSH};
use etcdcat_definitions::virtualmachine::{
    CloudInitNoCloudSource, Devices, Disk, DiskTarget, DomainSpec, EphemeralVolumeSource, Memory,
    PersistentVolumeClaimSource, TcpSocketAction, VirtualMachineInstance,
    VirtualMachineInstanceSpec, VmProbe, Volume,
};
use etcdcat_definitions::{EtcdNode, EtcdNodeStatus, LocalObjectRef};

use crate::k8s;
use crate::{Context, Error, Result};

#[tracing::instrument(skip_all)]
pub async fn reconcile_virtual_machine(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdNodeStatus,
) -> Result<()> {
    let node_name = node.name_any();
    let name = names::virtual_machine_name(&node_name);
    if let Some(r) = &status.virtual_machine_ref {
        if r.name != name {
            return Err(Error::ForeignReference {
                kind: "virtual machine",
                owner: node_name.clone(),
                expected: name,
                found: r.name.clone(),
            });
        }
    }

    let user_data = status
        .user_data_ref
        .clone()
        .ok_or_else(|| Error::waiting_for("user-data secret"))?;

    let disk = |disk_name: &str| Disk {
        name: disk_name.to_string(),
        disk: Some(DiskTarget {
            bus: Some("virtio".to_string()),
        }),
    };

    let vmi = VirtualMachineInstance {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(super::child_labels(node)),
            owner_references: Some(vec![k8s::owner_reference(node)?]),
            ..ObjectMeta::default()
        },
        spec: VirtualMachineInstanceSpec {
            hostname: Some(names::peer_service_name(&node_name)),
            domain: DomainSpec {
                devices: Devices {
                    disks: vec![disk("root"), disk("cloudinit")],
                },
                memory: Some(Memory {
                    guest: Some("512Mi".to_string()),
                }),
            },
            volumes: vec![
                Volume {
                    name: "root".to_string(),
                    ephemeral: Some(EphemeralVolumeSource {
                        persistent_volume_claim: PersistentVolumeClaimSource {
                            claim_name: node.spec.image_persistent_volume_claim_ref.name.clone(),
                        },
                    }),
                    cloud_init_no_cloud: None,
                },
                Volume {
                    name: "cloudinit".to_string(),
                    ephemeral: None,
                    cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                        secret_ref: LocalObjectRef::to(&user_data.name),
                    }),
                },
            ],
            readiness_probe: Some(VmProbe {
                tcp_socket: Some(TcpSocketAction {
                    port: IntOrString::Int(PORT_SSH),
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                failure_threshold: Some(3),
            }),
        },
        status: None,
    };

    let api: Api<VirtualMachineInstance> = Api::namespaced(ctx.client.clone(), namespace);
    k8s::create_only(&api, &vmi).await?;
    status.virtual_machine_ref = Some(LocalObjectRef::to(&name));
    Ok(())
}

/// Remove the VM during finalization; absent is already done.
pub async fn delete_virtual_machine(node: &EtcdNode, namespace: &str, ctx: &Context) -> Result<()> {
    let name = names::virtual_machine_name(&node.name_any());
    let api: Api<VirtualMachineInstance> = Api::namespaced(ctx.client.clone(), namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => debug!(vm = %name, "deleted virtual machine"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

pub async fn get_virtual_machine(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
) -> Result<Option<VirtualMachineInstance>> {
    let name = names::virtual_machine_name(&node.name_any());
    let api: Api<VirtualMachineInstance> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.get_opt(&name).await?)
}
