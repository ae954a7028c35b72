//! The EtcdCluster reconciler.
//!
//! Converge order is strict, each step blocking the next: CA, client and
//! peer identities, SSH keypair, cluster Service, EndpointSlice, and finally
//! the single owned EtcdNodeDeployment carrying the bootstrap latch.
//! Tear-down runs the same resources in reverse under the finalizer.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, DeleteParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use etcdcat_definitions::conditions::EtcdClusterPhase;
use etcdcat_definitions::names;
use etcdcat_definitions::{EtcdCluster, EtcdClusterStatus, EtcdNode, EtcdNodeDeployment};

use crate::k8s;
use crate::{Context, Error, Result};

pub mod deployment;
pub mod pki;
pub mod service;

const REQUEUE_SOON: Duration = Duration::from_secs(1);
const RESYNC: Duration = Duration::from_secs(300);

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let clusters = Api::<EtcdCluster>::all(client.clone());
    Controller::new(clusters, watcher::Config::default())
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(
            Api::<EndpointSlice>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<EtcdNodeDeployment>::all(client.clone()),
            watcher::Config::default(),
        )
        .watches(
            Api::<EtcdNode>::all(client),
            watcher::Config::default(),
            |node| {
                // nodes are owned by their set; route their events to the
                // cluster via the cluster-name label
                let namespace = node.namespace()?;
                let owner = node.labels().get(names::LABEL_CLUSTER_NAME)?.clone();
                Some(ObjectRef::<EtcdCluster>::new(&owner).within(&namespace))
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj, "reconciled"),
                Err(err) => warn!(error = %err, "cluster reconcile failed"),
            }
        })
        .await;
}

fn error_policy(cluster: Arc<EtcdCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        kind = "EtcdCluster",
        namespace = %cluster.namespace().unwrap_or_default(),
        name = %cluster.name_any(),
        reason = %error,
        "reconcile failed"
    );
    Action::requeue(Duration::from_secs(15))
}

#[instrument(skip(cluster, ctx), fields(
    kind = "EtcdCluster",
    namespace = %cluster.namespace().unwrap_or_default(),
    name = %cluster.name_any(),
))]
async fn reconcile(cluster: Arc<EtcdCluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    if !names::valid_cluster_name(&name) {
        return Err(Error::InvalidName(name));
    }
    if cluster.spec.replicas < 1 {
        return Err(Error::InvalidReplicas(cluster.spec.replicas));
    }
    let namespace = k8s::namespace_of(cluster.as_ref())?;
    let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    if cluster.meta().deletion_timestamp.is_some() {
        return finalize(&cluster, &namespace, &api, &ctx).await;
    }

    if !k8s::has_finalizer(cluster.as_ref()) {
        // let the update land before converging, so a concurrent delete
        // cannot race the first child creation
        k8s::add_finalizer(&api, cluster.as_ref()).await?;
        return Ok(Action::requeue(REQUEUE_SOON));
    }

    let mut status = cluster.status.clone().unwrap_or_default();
    let outcome = converge(&cluster, &namespace, &ctx, &mut status).await;

    if cluster.is_ready() {
        status.ready_once = true;
    }
    let mut scratch = (*cluster).clone();
    scratch.status = Some(status.clone());
    status.phase = Some(scratch.desired_phase());
    if let Err(err) = &outcome {
        if !matches!(err, Error::Requeue(_)) {
            status.phase = Some(EtcdClusterPhase::Error);
        }
    }

    let patched = k8s::patch_status(&api, &name, &converger_status_patch(&status)).await;

    match outcome {
        Ok(()) => {
            patched?;
            Ok(Action::requeue(RESYNC))
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
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdClusterStatus,
) -> Result<()> {
    pki::reconcile_secret_material(cluster, namespace, ctx, status).await?;
    service::reconcile_service(cluster, namespace, ctx, status).await?;
    service::reconcile_endpoint_slice(cluster, namespace, ctx, status).await?;
    if deployment::bootstrap_finished(cluster, status)
        && deployment::demote_first_node(cluster, namespace, ctx).await?
    {
        // re-observe the demoted node before scaling anything out
        return Err(Error::requeue(REQUEUE_SOON, "re-observing demoted first node"));
    }
    deployment::reconcile_node_deployment(cluster, namespace, ctx, status).await?;
    Ok(())
}

async fn finalize(
    cluster: &EtcdCluster,
    namespace: &str,
    api: &Api<EtcdCluster>,
    ctx: &Context,
) -> Result<Action> {
    if !k8s::has_finalizer(cluster) {
        return Ok(Action::await_change());
    }
    let name = cluster.name_any();
    let _ = k8s::patch_status(
        api,
        &name,
        &serde_json::json!({"phase": EtcdClusterPhase::Deleting}),
    )
    .await;

    if !deployment::drain_for_finalize(cluster, namespace, ctx).await? {
        info!(reason = "waiting for node deployment drained", delay = ?Duration::from_secs(5), "requeueing");
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    for secret_name in [
        names::ca_secret_name(&name),
        names::api_client_secret_name(&name),
        names::peer_secret_name(&name),
        names::ssh_keypair_secret_name(&name),
    ] {
        match secrets.delete(&secret_name, &DeleteParams::default()).await {
            Ok(_) => debug!(secret = %secret_name, "finalized secret"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }

    let mut cleared = cluster.status.clone().unwrap_or_default();
    cleared.ca_certificate_ref = None;
    cleared.ca_private_key_ref = None;
    cleared.client_certificate_ref = None;
    cleared.client_private_key_ref = None;
    cleared.peer_certificate_ref = None;
    cleared.peer_private_key_ref = None;
    cleared.ssh_private_key_ref = None;
    cleared.ssh_public_key_ref = None;
    cleared.service_ref = None;
    cleared.endpoint_slice_ref = None;
    cleared.phase = Some(EtcdClusterPhase::Deleting);
    k8s::patch_status(api, &name, &converger_status_patch(&cleared)).await?;

    k8s::remove_finalizer(api, cluster).await?;
    Ok(Action::requeue(REQUEUE_SOON))
}

/// The status fields the converger owns. Conditions and probe times belong
/// to the prober and are never written here; absent references serialize as
/// explicit nulls so finalization actually clears them.
fn converger_status_patch(status: &EtcdClusterStatus) -> serde_json::Value {
    serde_json::json!({
        "phase": status.phase,
        "replicas": status.replicas,
        "readyReplicas": status.ready_replicas,
        "readyOnce": status.ready_once,
        "caCertificateRef": status.ca_certificate_ref,
        "caPrivateKeyRef": status.ca_private_key_ref,
        "clientCertificateRef": status.client_certificate_ref,
        "clientPrivateKeyRef": status.client_private_key_ref,
        "peerCertificateRef": status.peer_certificate_ref,
        "peerPrivateKeyRef": status.peer_private_key_ref,
        "sshPrivateKeyRef": status.ssh_private_key_ref,
        "sshPublicKeyRef": status.ssh_public_key_ref,
        "serviceRef": status.service_ref,
        "endpointSliceRef": status.endpoint_slice_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etcdcat_definitions::{EtcdClusterSpec, SecretKeyRef};

    #[test]
    fn converger_patch_never_touches_prober_fields() {
        let status = EtcdClusterStatus {
            ready_replicas: 2,
            ..EtcdClusterStatus::default()
        };
        let patch = converger_status_patch(&status);
        let map = patch.as_object().unwrap();
        assert!(!map.contains_key("conditions"));
        assert!(!map.contains_key("lastReadyProbeTime"));
        assert_eq!(map["readyReplicas"], 2);
    }

    #[test]
    fn converger_patch_clears_absent_refs_with_nulls() {
        let mut status = EtcdClusterStatus::default();
        status.ca_certificate_ref = Some(SecretKeyRef::to("ca-example", "tls.crt"));
        let patch = converger_status_patch(&status);
        assert_eq!(patch["caCertificateRef"]["name"], "ca-example");
        assert!(patch["caPrivateKeyRef"].is_null());
        assert!(patch["serviceRef"].is_null());
    }

    #[test]
    fn reconcile_rejects_unusable_names() {
        let spec = EtcdClusterSpec {
            version: "3.5.1".into(),
            replicas: 1,
            login_password_secret_key_ref: None,
        };
        let cluster = EtcdCluster::new("Not-A-Dns-Label", spec);
        assert!(!names::valid_cluster_name(&cluster.name_any()));
    }
}
