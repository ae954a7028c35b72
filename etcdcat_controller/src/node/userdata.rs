//! Assembly of the create-only user-data Secret.
//!
//! Everything the VM needs to become an etcd member is resolved here once:
//! CA material, SSH authorized key, optional login password, both service
//! cluster IPs, and the SAN list for the member's serving certificate. The
//! rendered document is persisted create-only; a node's user-data never
//! changes after the fact.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::Api;
use kube::ResourceExt;
use tracing::debug;

use etcdcat_definitions::names::{self, KEY_USER_DATA, PORT_ETCD};
use etcdcat_definitions::userdata::{self, ScriptParams, UserDataParams};
use etcdcat_definitions::{EtcdNode, EtcdNodeStatus, LocalObjectRef, SecretKeyRef};

use crate::k8s;
use crate::{Context, Error, Result};

#[tracing::instrument(skip_all)]
pub async fn reconcile_user_data(
    node: &EtcdNode,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdNodeStatus,
) -> Result<()> {
    let node_name = node.name_any();
    let name = names::user_data_secret_name(&node_name);
    if let Some(r) = &status.user_data_ref {
        if r.name != name {
            return Err(Error::ForeignReference {
                kind: "user-data secret",
                owner: node_name.clone(),
                expected: name,
                found: r.name.clone(),
            });
        }
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    if status.user_data_ref.is_some() {
        if secrets.get_opt(&name).await?.is_some() {
            // immutable once created
            return Ok(());
        }
        debug!(secret = %name, "recorded user-data secret vanished; rebuilding");
    }

    let ca_certificate = read_key(&secrets, &node.spec.ca_certificate_ref).await?;
    let ca_private_key = read_key(&secrets, &node.spec.ca_private_key_ref).await?;
    let ssh_public_key = read_key(&secrets, &node.spec.ssh_public_key_ref).await?;
    let login_password = match &node.spec.login_password_secret_key_ref {
        Some(r) => Some(read_key(&secrets, r).await?),
        None => None,
    };

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let cluster_service = services
        .get_opt(&node.spec.service_ref.name)
        .await?
        .ok_or_else(|| Error::waiting_for("cluster service"))?;
    let cluster_ip = super::service::cluster_ip(&cluster_service)
        .ok_or_else(|| Error::waiting_for("cluster service address"))?;
    let peer_name = names::peer_service_name(&node_name);
    let peer_service = services
        .get_opt(&peer_name)
        .await?
        .ok_or_else(|| Error::waiting_for("peer service"))?;
    let peer_ip = super::service::cluster_ip(&peer_service)
        .ok_or_else(|| Error::waiting_for("peer service address"))?;

    let cluster_service_name = node.spec.service_ref.name.clone();
    let extra_sans = vec![
        peer_ip,
        format!("{}.{}.svc", peer_name, namespace),
        format!("{}.{}", peer_name, namespace),
        cluster_ip.clone(),
        format!("{}.{}.svc", cluster_service_name, namespace),
        format!("{}.{}", cluster_service_name, namespace),
    ];

    let scripts = userdata::render_scripts(&ScriptParams {
        etcd_version: &node.spec.version,
        etcdadm_version: &ctx.config.etcdadm_version,
        member_name: &peer_name,
        cluster_endpoint: &format!("https://{}:{}", cluster_ip, PORT_ETCD),
        extra_sans: &extra_sans,
    })?;
    let document = userdata::render_user_data(&UserDataParams {
        hostname: &peer_name,
        scripts: &scripts,
        ca_certificate_pem: &ca_certificate,
        ca_private_key_pem: &ca_private_key,
        ssh_authorized_key: &ssh_public_key,
        login_password: login_password.as_deref(),
    })?;

    let mut data = BTreeMap::new();
    data.insert(KEY_USER_DATA.to_string(), document.into_bytes());
    let secret = k8s::build_secret(
        &name,
        namespace,
        super::child_labels(node),
        k8s::owner_reference(node)?,
        "Opaque",
        data,
    );
    k8s::create_only(&secrets, &secret).await?;
    status.user_data_ref = Some(LocalObjectRef::to(&name));
    Ok(())
}

async fn read_key(api: &Api<Secret>, reference: &SecretKeyRef) -> Result<String> {
    let secret = api
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::waiting_for("secret material"))?;
    k8s::secret_string(&secret, &reference.key)
}
