//! The cluster observer.
//!
//! A second controller keyed on EtcdCluster that never mutates children: it
//! probes the cluster endpoint and each member over mutual TLS and patches
//! only the Ready/MembersHealthy conditions and the probe timestamp. The
//! converger reads those conditions but never writes them, so the two can
//! run concurrently against the same record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tracing::{debug, instrument, warn};

use etcdcat_definitions::conditions::{
    ClusterCondition, ClusterConditionReason, ClusterConditionType, ConditionStatus,
};
use etcdcat_definitions::names;
use etcdcat_definitions::{EtcdCluster, EtcdNode, SecretKeyRef};

use crate::cluster::pki::check_ref;
use crate::k8s;
use crate::node::service::cluster_ip;
use crate::{Context, Error, Result};

pub mod client;

use client::{ProbeClient, ProbeResult};

pub async fn run(ctx: Arc<Context>) {
    let clusters = Api::<EtcdCluster>::all(ctx.client.clone());
    Controller::new(clusters, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj, "probed"),
                Err(err) => warn!(error = %err, "probe pass failed"),
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
        "probe pass failed"
    );
    Action::requeue(Duration::from_secs(15))
}

#[instrument(skip(cluster, ctx), fields(
    kind = "EtcdCluster",
    namespace = %cluster.namespace().unwrap_or_default(),
    name = %cluster.name_any(),
))]
async fn reconcile(cluster: Arc<EtcdCluster>, ctx: Arc<Context>) -> Result<Action> {
    if cluster.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let namespace = k8s::namespace_of(cluster.as_ref())?;
    let name = cluster.name_any();

    let interval = if cluster.is_ready() && cluster.is_members_healthy() {
        ctx.config.probe_interval_healthy
    } else {
        ctx.config.probe_interval_degraded
    };

    let status = cluster.status.clone().unwrap_or_default();
    if let Some(last) = status.last_ready_probe_time {
        let elapsed = Utc::now()
            .signed_duration_since(last)
            .to_std()
            .unwrap_or_default();
        if elapsed < interval {
            return Ok(Action::requeue(interval - elapsed));
        }
    }

    check_ref(&cluster, "ca certificate", &status.ca_certificate_ref, &names::ca_secret_name(&name))?;
    check_ref(
        &cluster,
        "client certificate",
        &status.client_certificate_ref,
        &names::api_client_secret_name(&name),
    )?;
    check_ref(
        &cluster,
        "client private key",
        &status.client_private_key_ref,
        &names::api_client_secret_name(&name),
    )?;
    if let Some(r) = &status.service_ref {
        if r.name != names::cluster_service_name(&name) {
            return Err(Error::ForeignReference {
                kind: "cluster service",
                owner: name.clone(),
                expected: names::cluster_service_name(&name),
                found: r.name.clone(),
            });
        }
    }

    let (Some(ca_ref), Some(cert_ref), Some(key_ref), Some(service_ref)) = (
        status.ca_certificate_ref.as_ref(),
        status.client_certificate_ref.as_ref(),
        status.client_private_key_ref.as_ref(),
        status.service_ref.as_ref(),
    ) else {
        debug!("not probing: secret material not ready yet");
        return Ok(Action::requeue(ctx.config.probe_interval_degraded));
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let ca = read_key_bytes(&secrets, ca_ref).await?;
    let cert = read_key_bytes(&secrets, cert_ref).await?;
    let key = read_key_bytes(&secrets, key_ref).await?;
    let probe = ProbeClient::new(&ca, &cert, &key, ctx.config.probe_timeout)?;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut conditions = status.conditions.clone();

    let endpoint = services
        .get_opt(&service_ref.name)
        .await?
        .and_then(|s| cluster_ip(&s));
    let ready = match endpoint {
        Some(address) => {
            let result = probe.health(&address).await;
            set_ready(&mut conditions, &result);
            result.is_healthy()
        }
        None => {
            set_ready(
                &mut conditions,
                &ProbeResult::Unhealthy("cluster service has no address".to_string()),
            );
            false
        }
    };

    let members_healthy = probe_members(&cluster, &namespace, &ctx, &probe, &mut conditions).await?;

    let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({
        "conditions": conditions,
        "lastReadyProbeTime": Utc::now(),
    });
    k8s::patch_status(&api, &name, &patch).await?;

    let next = if ready && members_healthy {
        ctx.config.probe_interval_healthy
    } else {
        ctx.config.probe_interval_degraded
    };
    Ok(Action::requeue(next))
}

fn set_ready(conditions: &mut Vec<ClusterCondition>, result: &ProbeResult) {
    match result {
        ProbeResult::Healthy => ClusterCondition::set(
            conditions,
            ClusterConditionType::Ready,
            ConditionStatus::True,
            Some(ClusterConditionReason::ProbeSucceeded),
            None,
        ),
        ProbeResult::Unhealthy(message) => ClusterCondition::set(
            conditions,
            ClusterConditionType::Ready,
            ConditionStatus::False,
            Some(ClusterConditionReason::ProbeFailed),
            Some(message.clone()),
        ),
    }
}

/// Probe every member that has an addressable peer service; healthy iff all
/// probed members answer.
async fn probe_members(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
    probe: &ProbeClient,
    conditions: &mut Vec<ClusterCondition>,
) -> Result<bool> {
    let mut selector = std::collections::BTreeMap::new();
    selector.insert(names::LABEL_CLUSTER_NAME.to_string(), cluster.name_any());
    let nodes: Api<EtcdNode> = Api::namespaced(ctx.client.clone(), namespace);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let list = nodes
        .list(&ListParams::default().labels(&k8s::selector_string(&selector)))
        .await?;

    let mut unreachable = Vec::new();
    for node in &list.items {
        let Some(peer_ref) = node.status.as_ref().and_then(|s| s.peer_service_ref.clone())
        else {
            continue;
        };
        let Some(service) = services.get_opt(&peer_ref.name).await? else {
            continue;
        };
        let Some(address) = cluster_ip(&service) else {
            continue;
        };
        if !probe.health(&address).await.is_healthy() {
            unreachable.push(format!("member {} unreachable", node.name_any()));
        }
    }

    let healthy = unreachable.is_empty();
    if healthy {
        ClusterCondition::set(
            conditions,
            ClusterConditionType::MembersHealthy,
            ConditionStatus::True,
            Some(ClusterConditionReason::ProbeSucceeded),
            None,
        );
    } else {
        ClusterCondition::set(
            conditions,
            ClusterConditionType::MembersHealthy,
            ConditionStatus::False,
            Some(ClusterConditionReason::MemberUnreachable),
            Some(unreachable.join("; ")),
        );
    }
    Ok(healthy)
}

async fn read_key_bytes(api: &Api<Secret>, reference: &SecretKeyRef) -> Result<Vec<u8>> {
    let secret = api
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::waiting_for("secret material"))?;
    k8s::secret_bytes(&secret, &reference.key)
}
