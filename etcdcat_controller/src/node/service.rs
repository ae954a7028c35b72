//! The per-node peer Service: stable addressing for the member's etcd
//! client/peer ports and the SSH port provisioning goes through.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::ResourceExt;

use etcdcat_definitions::names::{self, LABEL_NODE_NAME, PORT_ETCD, PORT_PEER, PORT_SSH};
use etcdcat_definitions::{EtcdNode, EtcdNodeStatus, LocalObjectRef};

use crate::k8s;
use crate::{Context, Error, Result};

#[tracing::instrument(skip_all)]
pub async fn reconcile_peer_service(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdNodeStatus,
) -> Result<Service> {
    let node_name = node.name_any();
    let name = names::peer_service_name(&node_name);
    if let Some(r) = &status.peer_service_ref {
        if r.name != name {
            return Err(Error::ForeignReference {
                kind: "peer service",
                owner: node_name.clone(),
                expected: name,
                found: r.name.clone(),
            });
        }
    }

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_NODE_NAME.to_string(), node_name.clone());

    let port = |port_name: &str, number: i32| ServicePort {
        name: Some(port_name.to_string()),
        port: number,
        target_port: Some(IntOrString::Int(number)),
        protocol: Some("TCP".to_string()),
        ..ServicePort::default()
    };

    let service = Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(super::child_labels(node)),
            owner_references: Some(vec![k8s::owner_reference(node)?]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector),
            ports: Some(vec![
                port("etcd", PORT_ETCD),
                port("peer", PORT_PEER),
                port("ssh", PORT_SSH),
            ]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };

    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let applied = k8s::apply(&api, &name, &service).await?;
    status.peer_service_ref = Some(LocalObjectRef::to(&name));
    Ok(applied)
}

/// Cluster IP of a Service, if one has been allocated yet.
pub fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None")
}
