//! The cluster-wide Service and the EndpointSlice that publishes the Ready
//! members behind it.

use k8s_openapi::api::core::v1::{ObjectReference, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::ResourceExt;
use tracing::debug;

use etcdcat_definitions::names::{self, LABEL_CLUSTER_NAME, PORT_ETCD};
use etcdcat_definitions::{EtcdCluster, EtcdClusterStatus, EtcdNode, LocalObjectRef};

use crate::k8s;
use crate::{Context, Error, Result};

/// Step 5: the NodePort Service every client and every `join` goes through.
#[tracing::instrument(skip_all)]
pub async fn reconcile_service(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdClusterStatus,
) -> Result<Service> {
    let cluster_name = cluster.name_any();
    let name = names::cluster_service_name(&cluster_name);
    if let Some(r) = &status.service_ref {
        if r.name != name {
            return Err(Error::ForeignReference {
                kind: "cluster service",
                owner: cluster_name.clone(),
                expected: name,
                found: r.name.clone(),
            });
        }
    }

    let mut selector = std::collections::BTreeMap::new();
    selector.insert(LABEL_CLUSTER_NAME.to_string(), cluster_name.clone());

    let service = Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(names::common_labels(&cluster_name)),
            owner_references: Some(vec![k8s::owner_reference(cluster)?]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("etcd".to_string()),
                port: PORT_ETCD,
                target_port: Some(IntOrString::Int(PORT_ETCD)),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };

    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let applied = k8s::apply(&api, &name, &service).await?;
    status.service_ref = Some(LocalObjectRef::to(&name));
    Ok(applied)
}

/// Step 6: one endpoint per Ready member, addressed by its peer service.
#[tracing::instrument(skip_all)]
pub async fn reconcile_endpoint_slice(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdClusterStatus,
) -> Result<()> {
    let cluster_name = cluster.name_any();
    let name = names::endpoint_slice_name(&cluster_name);
    if let Some(r) = &status.endpoint_slice_ref {
        if r.name != name {
            return Err(Error::ForeignReference {
                kind: "endpoint slice",
                owner: cluster_name.clone(),
                expected: name,
                found: r.name.clone(),
            });
        }
    }

    let mut selector = std::collections::BTreeMap::new();
    selector.insert(LABEL_CLUSTER_NAME.to_string(), cluster_name.clone());
    let nodes: Api<EtcdNode> = Api::namespaced(ctx.client.clone(), namespace);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);

    let mut endpoints = Vec::new();
    let owned = nodes
        .list(&kube::api::ListParams::default().labels(&k8s::selector_string(&selector)))
        .await?;
    for node in owned.items.iter().filter(|n| n.is_ready()) {
        let Some(peer_ref) = node.status.as_ref().and_then(|s| s.peer_service_ref.clone())
        else {
            debug!(node = %node.name_any(), "skipping endpoint: no peer service yet");
            continue;
        };
        let Some(peer_service) = services.get_opt(&peer_ref.name).await? else {
            debug!(node = %node.name_any(), "skipping endpoint: peer service missing");
            continue;
        };
        let Some(cluster_ip) = peer_service
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None")
        else {
            debug!(node = %node.name_any(), "skipping endpoint: peer service has no cluster ip");
            continue;
        };

        let serving = node.is_ready();
        let terminating = node.metadata.deletion_timestamp.is_some();
        endpoints.push(Endpoint {
            addresses: vec![cluster_ip],
            hostname: Some(peer_ref.name.clone()),
            conditions: Some(EndpointConditions {
                ready: Some(serving && !terminating),
                serving: Some(serving),
                terminating: Some(terminating),
            }),
            target_ref: Some(ObjectReference {
                api_version: Some("etcdcat.io/v1alpha1".to_string()),
                kind: Some("EtcdNode".to_string()),
                name: Some(node.name_any()),
                namespace: Some(namespace.to_string()),
                uid: node.uid(),
                ..ObjectReference::default()
            }),
            ..Endpoint::default()
        });
    }

    let mut labels = names::common_labels(&cluster_name);
    labels.insert(
        "kubernetes.io/service-name".to_string(),
        names::cluster_service_name(&cluster_name),
    );
    labels.insert(
        "endpointslice.kubernetes.io/managed-by".to_string(),
        names::CONTROLLER_DOMAIN.to_string(),
    );

    let slice = EndpointSlice {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![k8s::owner_reference(cluster)?]),
            ..ObjectMeta::default()
        },
        address_type: "IPv4".to_string(),
        endpoints,
        ports: Some(vec![EndpointPort {
            name: Some("etcd".to_string()),
            port: Some(PORT_ETCD),
            protocol: Some("TCP".to_string()),
            ..EndpointPort::default()
        }]),
    };

    let api: Api<EndpointSlice> = Api::namespaced(ctx.client.clone(), namespace);
    k8s::apply(&api, &name, &slice).await?;
    status.endpoint_slice_ref = Some(LocalObjectRef::to(&name));
    Ok(())
}
