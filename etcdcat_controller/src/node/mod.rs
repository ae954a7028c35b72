//! The EtcdNode reconciler: one record, one VM, one etcd member.
//!
//! Converge order is strict: peer Service, user-data Secret (create-only),
//! VirtualMachineInstance (create-only), SSH provisioning, then the health
//! probe that drives Ready. Finalization runs leave-cluster under a retry
//! budget before the VM is removed; the owned Secret and Service fall to
//! owner-reference GC once the finalizer clears.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use etcdcat_definitions::conditions::{
    ConditionStatus, NodeCondition, NodeConditionReason, NodeConditionType,
};
use etcdcat_definitions::names::LABEL_NODE_NAME;
use etcdcat_definitions::virtualmachine::VirtualMachineInstance;
use etcdcat_definitions::{EtcdNode, EtcdNodeStatus};

use crate::k8s;
use crate::prober::client::{ProbeClient, ProbeResult};
use crate::{Context, Error, Result};

pub mod provision;
pub mod service;
pub mod userdata;
pub mod vm;

const REQUEUE_SOON: Duration = Duration::from_secs(1);
const NOT_READY_RESYNC: Duration = Duration::from_secs(5);
const READY_RESYNC: Duration = Duration::from_secs(60);

const LEAVE_ATTEMPTS_ANNOTATION: &str = "etcdcat.io/leave-attempts";

/// Labels stamped on everything a node owns; the node-name label is what
/// the peer service selects the VM by.
pub(crate) fn child_labels(node: &EtcdNode) -> BTreeMap<String, String> {
    let mut labels = node.labels().clone();
    labels.insert(LABEL_NODE_NAME.to_string(), node.name_any());
    labels
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let nodes = Api::<EtcdNode>::all(client.clone());
    Controller::new(nodes, watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .owns(
            Api::<VirtualMachineInstance>::all(client),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj, "reconciled"),
                Err(err) => warn!(error = %err, "node reconcile failed"),
            }
        })
        .await;
}

fn error_policy(node: Arc<EtcdNode>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        kind = "EtcdNode",
        namespace = %node.namespace().unwrap_or_default(),
        name = %node.name_any(),
        reason = %error,
        "reconcile failed"
    );
    Action::requeue(Duration::from_secs(15))
}

#[instrument(skip(node, ctx), fields(
    kind = "EtcdNode",
    namespace = %node.namespace().unwrap_or_default(),
    name = %node.name_any(),
))]
async fn reconcile(node: Arc<EtcdNode>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = k8s::namespace_of(node.as_ref())?;
    let name = node.name_any();
    let api: Api<EtcdNode> = Api::namespaced(ctx.client.clone(), &namespace);

    if node.meta().deletion_timestamp.is_some() {
        return finalize(&node, &namespace, &api, &ctx).await;
    }

    if !k8s::has_finalizer(node.as_ref()) {
        k8s::add_finalizer(&api, node.as_ref()).await?;
        return Ok(Action::requeue(REQUEUE_SOON));
    }

    let mut status = node.status.clone().unwrap_or_default();
    let outcome = converge(&node, &namespace, &ctx, &mut status).await;

    if NodeCondition::is_true(&status.conditions, NodeConditionType::Ready) {
        status.ready_once = true;
    }
    let mut scratch = (*node).clone();
    scratch.status = Some(status.clone());
    status.phase = Some(scratch.desired_phase());

    let patched = k8s::patch_status(&api, &name, &status).await;

    match outcome {
        Ok(()) => {
            patched?;
            let ready = NodeCondition::is_true(&status.conditions, NodeConditionType::Ready);
            Ok(Action::requeue(if ready {
                READY_RESYNC
            } else {
                NOT_READY_RESYNC
            }))
        }
        Err(Error::Requeue(rq)) => {
            if let Err(err) = patched {
                warn!(reason = %err, "status patch failed ahead of requeue");
            }
            info!(reason = %rq.message, delay = ?rq.delay, "requeueing");
            Ok(Action::requeue(rq.delay))
        }
        Err(err) => {
            if let Err(patch_err) = patched {
                warn!(reason = %patch_err, "status patch failed on erroring pass");
            }
            Err(err)
        }
    }
}

async fn converge(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdNodeStatus,
) -> Result<()> {
    service::reconcile_peer_service(node, namespace, ctx, status).await?;
    userdata::reconcile_user_data(node, namespace, ctx, status).await?;
    vm::reconcile_virtual_machine(node, namespace, ctx, status).await?;
    provision::provision(node, namespace, ctx, status).await?;
    probe_ready(node, namespace, ctx, status).await?;
    Ok(())
}

/// Drive the Ready condition off the member's own health endpoint.
///
/// Probe failures are states, not errors: the condition carries the message
/// and the short not-ready resync cadence retries it.
async fn probe_ready(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdNodeStatus,
) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let ca = read_key_bytes(&secrets, &node.spec.ca_certificate_ref).await?;
    let cert = read_key_bytes(&secrets, &node.spec.client_certificate_ref).await?;
    let key = read_key_bytes(&secrets, &node.spec.client_private_key_ref).await?;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let peer = services
        .get_opt(&etcdcat_definitions::names::peer_service_name(&node.name_any()))
        .await?
        .ok_or_else(|| Error::waiting_for("peer service"))?;
    let address = service::cluster_ip(&peer)
        .ok_or_else(|| Error::waiting_for("peer service address"))?;

    let probe = ProbeClient::new(&ca, &cert, &key, ctx.config.probe_timeout)?;
    match probe.health(&address).await {
        ProbeResult::Healthy => {
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Ready,
                ConditionStatus::True,
                Some(NodeConditionReason::HealthCheckSucceeded),
                None,
            );
        }
        ProbeResult::Unhealthy(message) => {
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Ready,
                ConditionStatus::False,
                Some(NodeConditionReason::HealthCheckFailed),
                Some(message),
            );
        }
    }
    Ok(())
}

async fn read_key_bytes(
    api: &Api<Secret>,
    reference: &etcdcat_definitions::SecretKeyRef,
) -> Result<Vec<u8>> {
    let secret = api
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::waiting_for("secret material"))?;
    k8s::secret_bytes(&secret, &reference.key)
}

fn leave_attempts(node: &EtcdNode) -> u32 {
    node.annotations()
        .get(LEAVE_ATTEMPTS_ANNOTATION)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

async fn record_leave_attempt(api: &Api<EtcdNode>, node: &EtcdNode, attempts: u32) -> Result<()> {
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { LEAVE_ATTEMPTS_ANNOTATION: attempts.to_string() }
        }
    });
    api.patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn finalize(
    node: &EtcdNode,
    namespace: &str,
    api: &Api<EtcdNode>,
    ctx: &Context,
) -> Result<Action> {
    if !k8s::has_finalizer(node) {
        return Ok(Action::await_change());
    }
    let name = node.name_any();
    let mut status = node.status.clone().unwrap_or_default();
    status.phase = Some(etcdcat_definitions::conditions::EtcdNodePhase::Deleting);

    if node.is_provisioned() && !node.is_member_finalized() {
        let attempts = leave_attempts(node);
        if attempts >= ctx.config.leave_retry_budget {
            warn!(attempts, "abandoning leave-cluster; quorum must drop the member administratively");
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::MemberFinalized,
                ConditionStatus::False,
                Some(NodeConditionReason::LeaveAbandoned),
                Some(format!("gave up after {} attempts", attempts)),
            );
        } else {
            match provision::leave(node, namespace, ctx).await {
                Ok(provision::LeaveOutcome::Executed) => {
                    NodeCondition::set(
                        &mut status.conditions,
                        NodeConditionType::MemberFinalized,
                        ConditionStatus::True,
                        Some(NodeConditionReason::LeaveExecuted),
                        None,
                    );
                }
                Ok(provision::LeaveOutcome::VmGone) => {
                    NodeCondition::set(
                        &mut status.conditions,
                        NodeConditionType::MemberFinalized,
                        ConditionStatus::False,
                        Some(NodeConditionReason::LeaveAbandoned),
                        Some("virtual machine already gone".to_string()),
                    );
                }
                Err(err) => {
                    record_leave_attempt(api, node, attempts + 1).await?;
                    if let Err(patch_err) = k8s::patch_status(api, &name, &status).await {
                        warn!(reason = %patch_err, "status patch failed during finalize");
                    }
                    info!(reason = %err, attempt = attempts + 1, delay = ?Duration::from_secs(5), "requeueing leave-cluster");
                    return Ok(Action::requeue(Duration::from_secs(5)));
                }
            }
        }
    }

    vm::delete_virtual_machine(node, namespace, ctx).await?;

    if let Err(err) = k8s::patch_status(api, &name, &status).await {
        warn!(reason = %err, "status patch failed during finalize");
    }
    k8s::remove_finalizer(api, node).await?;
    Ok(Action::requeue(REQUEUE_SOON))
}
