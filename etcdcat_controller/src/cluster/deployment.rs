//! Step 7/8: the single owned EtcdNodeDeployment, including the bootstrap
//! special case.
//!
//! While the cluster has never been Ready, the deployment runs exactly one
//! node with `asFirstNode=true`. A pre-existing deployment whose template
//! disagrees during bootstrap is scaled to zero first: the stale node must
//! be destroyed, never live-edited into a conflicting configuration. Once
//! the Ready latch flips, the deployment follows `spec.replicas` with the
//! first-node flag permanently off.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use tracing::{debug, info};

use etcdcat_definitions::names;
use etcdcat_definitions::node::{semantic_eq, EtcdNodeTemplateSpec};
use etcdcat_definitions::{
    EtcdCluster, EtcdClusterStatus, EtcdNode, EtcdNodeDeployment, EtcdNodeDeploymentSpec,
    EtcdNodeSpec, LocalObjectRef,
};

use crate::k8s;
use crate::{Context, Error, Result};

/// Reconcile the owned deployment and roll its status up into the cluster's.
#[tracing::instrument(skip_all)]
pub async fn reconcile_node_deployment(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdClusterStatus,
) -> Result<()> {
    let cluster_name = cluster.name_any();
    let name = names::node_deployment_name(&cluster_name);
    let api: Api<EtcdNodeDeployment> = Api::namespaced(ctx.client.clone(), namespace);

    let bootstrap = !bootstrap_finished(cluster, status);
    let (replicas, as_first_node) = if bootstrap {
        (1, true)
    } else {
        (cluster.spec.replicas, false)
    };
    let template = node_template(cluster, status, as_first_node)?;
    let desired = EtcdNodeDeploymentSpec {
        replicas,
        selector: names::common_labels(&cluster_name),
        template,
        rolling_update: None,
        revision_history_limit: 10,
    };

    let existing = api.get_opt(&name).await?;
    if let Some(existing) = &existing {
        let uid = cluster.uid().unwrap_or_default();
        if !k8s::is_controlled_by(existing, &uid) {
            return Err(Error::ForeignReference {
                kind: "node deployment",
                owner: cluster_name.clone(),
                expected: format!("{} owned by {}", name, uid),
                found: name.clone(),
            });
        }

        if bootstrap && !semantic_eq(&existing.spec.template, &desired.template) {
            // force the stale bootstrap node out before switching templates
            if existing.spec.replicas != 0 {
                info!(deployment = %name, "scaling stale bootstrap deployment to zero");
                let patch = serde_json::json!({"spec": {"replicas": 0}});
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Err(Error::requeue(
                    std::time::Duration::from_secs(5),
                    "waiting for stale bootstrap deployment scaled down",
                ));
            }
            let remaining = existing.status.as_ref().map(|s| s.replicas).unwrap_or(0);
            if remaining != 0 {
                return Err(Error::requeue(
                    std::time::Duration::from_secs(5),
                    "waiting for stale bootstrap nodes destroyed",
                ));
            }
        }
    }

    let applied = match existing {
        Some(existing) if specs_equal(&existing.spec, &desired) => existing,
        _ => {
            debug!(deployment = %name, replicas, as_first_node, "applying node deployment");
            let deployment = EtcdNodeDeployment {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(names::common_labels(&cluster_name)),
                    owner_references: Some(vec![k8s::owner_reference(cluster)?]),
                    ..ObjectMeta::default()
                },
                spec: desired,
                status: None,
            };
            k8s::apply(&api, &name, &deployment).await?
        }
    };

    if let Some(dep_status) = &applied.status {
        status.replicas = dep_status.replicas;
        status.ready_replicas = dep_status.ready_replicas;
    }
    Ok(())
}

/// The Ready latch, evaluated against the status copy of this pass so a
/// just-observed Ready flips bootstrap off before the deployment is written.
pub(crate) fn bootstrap_finished(cluster: &EtcdCluster, status: &EtcdClusterStatus) -> bool {
    status.ready_once || cluster.is_ready()
}

/// Flip `asFirstNode` off on any node still carrying it.
///
/// Runs once bootstrap is over and before the deployment is scaled out, so
/// no node can provision with a stale start-cluster decision. The flag only
/// ever moves true to false, and only here.
pub async fn demote_first_node(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
) -> Result<bool> {
    let mut selector = std::collections::BTreeMap::new();
    selector.insert(names::LABEL_CLUSTER_NAME.to_string(), cluster.name_any());
    let nodes: Api<EtcdNode> = Api::namespaced(ctx.client.clone(), namespace);
    let list = nodes
        .list(&kube::api::ListParams::default().labels(&k8s::selector_string(&selector)))
        .await?;
    let mut demoted = false;
    for node in list.items.iter().filter(|n| n.spec.as_first_node) {
        info!(node = %node.name_any(), "demoting first node");
        let patch = serde_json::json!({"spec": {"asFirstNode": false}});
        nodes
            .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        demoted = true;
    }
    Ok(demoted)
}

/// Template for every node of this cluster, wired to the secret material
/// recorded in status. Missing references mean earlier steps have not
/// finished; surfacing them as transient keeps the ordering visible.
fn node_template(
    cluster: &EtcdCluster,
    status: &EtcdClusterStatus,
    as_first_node: bool,
) -> Result<EtcdNodeTemplateSpec> {
    let cluster_name = cluster.name_any();
    let spec = EtcdNodeSpec {
        version: cluster.spec.version.clone(),
        as_first_node,
        ca_certificate_ref: status
            .ca_certificate_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("ca secret"))?,
        ca_private_key_ref: status
            .ca_private_key_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("ca secret"))?,
        client_certificate_ref: status
            .client_certificate_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("api client secret"))?,
        client_private_key_ref: status
            .client_private_key_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("api client secret"))?,
        ssh_private_key_ref: status
            .ssh_private_key_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("ssh keypair secret"))?,
        ssh_public_key_ref: status
            .ssh_public_key_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("ssh keypair secret"))?,
        service_ref: status
            .service_ref
            .clone()
            .ok_or_else(|| Error::waiting_for("cluster service"))?,
        image_persistent_volume_claim_ref: LocalObjectRef::to(names::image_pvc_name(
            &cluster_name,
        )),
        login_password_secret_key_ref: cluster.spec.login_password_secret_key_ref.clone(),
    };
    Ok(EtcdNodeTemplateSpec {
        labels: names::common_labels(&cluster_name),
        spec,
    })
}

/// Spec equality through serialization, so nil-vs-empty never forces a
/// spurious write.
fn specs_equal(a: &EtcdNodeDeploymentSpec, b: &EtcdNodeDeploymentSpec) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Scale the deployment to zero during cluster finalization.
///
/// Returns true once every node it owned is gone.
pub async fn drain_for_finalize(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
) -> Result<bool> {
    let name = names::node_deployment_name(&cluster.name_any());
    let api: Api<EtcdNodeDeployment> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(existing) = api.get_opt(&name).await? else {
        return Ok(true);
    };
    if existing.spec.replicas != 0 {
        info!(deployment = %name, "scaling node deployment to zero for teardown");
        let patch = serde_json::json!({"spec": {"replicas": 0}});
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(false);
    }
    let remaining = existing.status.as_ref().map(|s| s.replicas).unwrap_or(0);
    if remaining != 0 {
        return Ok(false);
    }
    api.delete(&name, &kube::api::DeleteParams::default()).await?;
    Ok(true)
}
