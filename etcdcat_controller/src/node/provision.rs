//! SSH-driven provisioning: the one place destructive etcd membership
//! commands run.
//!
//! Start-vs-join is decided solely by the `asFirstNode` flag at the moment
//! the VM becomes SSH-reachable; the scripts themselves were fixed when the
//! user-data Secret was created. Leaving happens on finalization, bounded
//! by a retry budget so a dead VM cannot wedge teardown.

use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::Api;
use kube::ResourceExt;
use tracing::{info, warn};

use etcdcat_definitions::conditions::{
    ConditionStatus, NodeCondition, NodeConditionReason, NodeConditionType,
};
use etcdcat_definitions::names::{self, PORT_SSH};
use etcdcat_definitions::userdata::{SCRIPT_DIR, SSH_USER};
use etcdcat_definitions::{EtcdNode, EtcdNodeStatus};

use crate::k8s;
use crate::{Context, Error, Result};

const SSH_RETRY: Duration = Duration::from_secs(5);
const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
// join/start may download etcdadm on first run
const SSH_EXECUTE_TIMEOUT: Duration = Duration::from_secs(120);

/// Converge-side provisioning: run start-cluster or join-cluster once the
/// VM is up, then latch the Provisioned condition.
#[tracing::instrument(skip_all)]
pub async fn provision(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdNodeStatus,
) -> Result<()> {
    if NodeCondition::is_true(&status.conditions, NodeConditionType::Provisioned) {
        return Ok(());
    }

    let vm = super::vm::get_virtual_machine(node, namespace, ctx)
        .await?
        .ok_or_else(|| Error::waiting_for("virtual machine"))?;
    if !vm.is_running() {
        NodeCondition::set(
            &mut status.conditions,
            NodeConditionType::Provisioned,
            ConditionStatus::False,
            Some(NodeConditionReason::VirtualMachineNotRunning),
            None,
        );
        return Err(Error::requeue(SSH_RETRY, "waiting for virtual machine running"));
    }

    let address = peer_address(node, namespace, ctx).await?;
    let private_key = ssh_private_key(node, namespace, ctx).await?;
    let script = if node.spec.as_first_node {
        "start-cluster.sh"
    } else {
        "join-cluster.sh"
    };
    let command = format!("sudo {}/{}", SCRIPT_DIR, script);

    match run_remote(&address, &private_key, &command).await {
        Ok(()) => {
            info!(script, "provisioned member");
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Provisioned,
                ConditionStatus::True,
                Some(NodeConditionReason::ProvisionExecuted),
                None,
            );
            Ok(())
        }
        Err(Error::Ssh(err)) => {
            // the guest's sshd may still be starting
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Provisioned,
                ConditionStatus::False,
                Some(NodeConditionReason::SshUnreachable),
                Some(err.to_string()),
            );
            Err(Error::Requeue(crate::RequeueError::wrapping(
                SSH_RETRY,
                "ssh not reachable yet",
                err,
            )))
        }
        Err(Error::RemoteCommand {
            command,
            status: exit,
            stderr,
        }) => {
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Provisioned,
                ConditionStatus::False,
                Some(NodeConditionReason::ProvisionFailed),
                Some(format!("{} exited {}: {}", command, exit, stderr)),
            );
            Err(Error::requeue(SSH_RETRY, "provisioning script failed"))
        }
        Err(err) => Err(err),
    }
}

pub enum LeaveOutcome {
    /// leave-cluster ran to completion
    Executed,
    /// the VM is gone or never ran; nothing left to leave
    VmGone,
}

/// Finalize-side: run leave-cluster if the VM is still reachable.
#[tracing::instrument(skip_all)]
pub async fn leave(node: &EtcdNode, namespace: &str, ctx: &Context) -> Result<LeaveOutcome> {
    let Some(vm) = super::vm::get_virtual_machine(node, namespace, ctx).await? else {
        return Ok(LeaveOutcome::VmGone);
    };
    if !vm.is_running() {
        return Ok(LeaveOutcome::VmGone);
    }
    let address = match peer_address(node, namespace, ctx).await {
        Ok(address) => address,
        Err(Error::Requeue(_)) => return Ok(LeaveOutcome::VmGone),
        Err(err) => return Err(err),
    };
    let private_key = ssh_private_key(node, namespace, ctx).await?;
    let command = format!("sudo {}/leave-cluster.sh", SCRIPT_DIR);
    run_remote(&address, &private_key, &command).await?;
    info!("member left the cluster");
    Ok(LeaveOutcome::Executed)
}

async fn peer_address(node: &EtcdNode, namespace: &str, ctx: &Context) -> Result<String> {
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let peer_name = names::peer_service_name(&node.name_any());
    let service = services
        .get_opt(&peer_name)
        .await?
        .ok_or_else(|| Error::waiting_for("peer service"))?;
    super::service::cluster_ip(&service).ok_or_else(|| Error::waiting_for("peer service address"))
}

async fn ssh_private_key(node: &EtcdNode, namespace: &str, ctx: &Context) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let secret = secrets
        .get_opt(&node.spec.ssh_private_key_ref.name)
        .await?
        .ok_or_else(|| Error::waiting_for("ssh keypair secret"))?;
    k8s::secret_string(&secret, &node.spec.ssh_private_key_ref.key)
}

async fn run_remote(host: &str, private_key: &str, command: &str) -> Result<()> {
    let auth = AuthMethod::with_key(private_key, None);
    let connect = Client::connect(
        (host, PORT_SSH as u16),
        SSH_USER,
        auth,
        ServerCheckMethod::NoCheck,
    );
    let client = match tokio::time::timeout(SSH_CONNECT_TIMEOUT, connect).await {
        Ok(connected) => connected?,
        Err(_) => return Err(Error::requeue(SSH_RETRY, "ssh connection timed out")),
    };
    let result = match tokio::time::timeout(SSH_EXECUTE_TIMEOUT, client.execute(command)).await {
        Ok(executed) => executed?,
        Err(_) => return Err(Error::requeue(SSH_RETRY, "remote command timed out")),
    };
    if result.exit_status != 0 {
        warn!(command, status = result.exit_status, "remote command failed");
        return Err(Error::RemoteCommand {
            command: command.to_string(),
            status: result.exit_status,
            stderr: result.stderr,
        });
    }
    Ok(())
}
