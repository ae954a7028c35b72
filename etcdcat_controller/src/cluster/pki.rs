//! Reconciliation of the four secret-material Secrets a cluster owns: the
//! CA, the api client identity, the peer identity, and the SSH keypair.
//!
//! Each reconciler is idempotent: material that already exists and still
//! parses is adopted as-is, anything missing or truncated is regenerated.
//! Status references are checked against the deterministic names before any
//! read, so a mis-edited status can never pull foreign secrets into play.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

use etcdcat_definitions::names::{
    self, KEY_SSH_PRIVATE, KEY_SSH_PUBLIC, KEY_TLS_CERT, KEY_TLS_KEY,
};
use etcdcat_definitions::pki::{self, CertifiedKey};
use etcdcat_definitions::sshkeys;
use etcdcat_definitions::{EtcdCluster, EtcdClusterStatus, SecretKeyRef};

use crate::k8s;
use crate::{Context, Error, Result};

const TYPE_TLS: &str = "kubernetes.io/tls";
const TYPE_SSH: &str = "kubernetes.io/ssh-auth";

/// Guard against a status reference that does not match the deterministic
/// child name.
pub fn check_ref(
    cluster: &EtcdCluster,
    what: &'static str,
    reference: &Option<SecretKeyRef>,
    expected: &str,
) -> Result<()> {
    if let Some(r) = reference {
        if r.name != expected {
            return Err(Error::ForeignReference {
                kind: what,
                owner: cluster.name_any(),
                expected: expected.to_string(),
                found: r.name.clone(),
            });
        }
    }
    Ok(())
}

/// Steps 1-4 of the converge order: CA, client, peer, SSH keypair.
#[tracing::instrument(skip_all)]
pub async fn reconcile_secret_material(
    cluster: &EtcdCluster,
    namespace: &str,
    ctx: &Context,
    status: &mut EtcdClusterStatus,
) -> Result<()> {
    let name = cluster.name_any();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);

    let ca_name = names::ca_secret_name(&name);
    check_ref(cluster, "ca certificate", &status.ca_certificate_ref, &ca_name)?;
    check_ref(cluster, "ca private key", &status.ca_private_key_ref, &ca_name)?;
    let ca = match load_tls(&secrets, &ca_name).await? {
        Some(material) => material,
        None => {
            info!(secret = %ca_name, "generating cluster CA");
            let ca = pki::issue_ca(&name)?;
            persist_tls(cluster, namespace, &secrets, &ca_name, &ca).await?;
            ca
        }
    };
    status.ca_certificate_ref = Some(SecretKeyRef::to(&ca_name, KEY_TLS_CERT));
    status.ca_private_key_ref = Some(SecretKeyRef::to(&ca_name, KEY_TLS_KEY));

    let client_name = names::api_client_secret_name(&name);
    check_ref(cluster, "client certificate", &status.client_certificate_ref, &client_name)?;
    check_ref(cluster, "client private key", &status.client_private_key_ref, &client_name)?;
    if load_tls(&secrets, &client_name).await?.is_none() {
        info!(secret = %client_name, "issuing api client identity");
        let client = pki::issue_client(&name, &ca)?;
        persist_tls(cluster, namespace, &secrets, &client_name, &client).await?;
    }
    status.client_certificate_ref = Some(SecretKeyRef::to(&client_name, KEY_TLS_CERT));
    status.client_private_key_ref = Some(SecretKeyRef::to(&client_name, KEY_TLS_KEY));

    let peer_name = names::peer_secret_name(&name);
    check_ref(cluster, "peer certificate", &status.peer_certificate_ref, &peer_name)?;
    check_ref(cluster, "peer private key", &status.peer_private_key_ref, &peer_name)?;
    if load_tls(&secrets, &peer_name).await?.is_none() {
        info!(secret = %peer_name, "issuing peer identity");
        let peer = pki::issue_peer(&name, &ca, &service_sans(&name, namespace))?;
        persist_tls(cluster, namespace, &secrets, &peer_name, &peer).await?;
    }
    status.peer_certificate_ref = Some(SecretKeyRef::to(&peer_name, KEY_TLS_CERT));
    status.peer_private_key_ref = Some(SecretKeyRef::to(&peer_name, KEY_TLS_KEY));

    let ssh_name = names::ssh_keypair_secret_name(&name);
    check_ref(cluster, "ssh private key", &status.ssh_private_key_ref, &ssh_name)?;
    check_ref(cluster, "ssh public key", &status.ssh_public_key_ref, &ssh_name)?;
    reconcile_ssh_keypair(cluster, namespace, &secrets, &ssh_name).await?;
    status.ssh_private_key_ref = Some(SecretKeyRef::to(&ssh_name, KEY_SSH_PRIVATE));
    status.ssh_public_key_ref = Some(SecretKeyRef::to(&ssh_name, KEY_SSH_PUBLIC));

    Ok(())
}

/// DNS names the peer identity must answer for.
pub fn service_sans(cluster: &str, namespace: &str) -> Vec<String> {
    let service = names::cluster_service_name(cluster);
    vec![
        service.clone(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ]
}

async fn load_tls(api: &Api<Secret>, name: &str) -> Result<Option<CertifiedKey>> {
    let Some(secret) = api.get_opt(name).await? else {
        return Ok(None);
    };
    if !k8s::has_secret_key(&secret, KEY_TLS_CERT) || !k8s::has_secret_key(&secret, KEY_TLS_KEY) {
        debug!(secret = %name, "tls secret incomplete; will regenerate");
        return Ok(None);
    }
    let material = CertifiedKey {
        certificate_pem: k8s::secret_string(&secret, KEY_TLS_CERT)?,
        private_key_pem: k8s::secret_string(&secret, KEY_TLS_KEY)?,
    };
    if !pki::parses(&material) {
        debug!(secret = %name, "tls secret unparsable; will regenerate");
        return Ok(None);
    }
    Ok(Some(material))
}

async fn persist_tls(
    cluster: &EtcdCluster,
    namespace: &str,
    api: &Api<Secret>,
    name: &str,
    material: &CertifiedKey,
) -> Result<()> {
    let mut data = BTreeMap::new();
    data.insert(KEY_TLS_CERT.to_string(), material.certificate_pem.clone().into_bytes());
    data.insert(KEY_TLS_KEY.to_string(), material.private_key_pem.clone().into_bytes());
    persist(cluster, namespace, api, name, TYPE_TLS, data).await
}

async fn reconcile_ssh_keypair(
    cluster: &EtcdCluster,
    namespace: &str,
    api: &Api<Secret>,
    name: &str,
) -> Result<()> {
    if let Some(secret) = api.get_opt(name).await? {
        if k8s::has_secret_key(&secret, KEY_SSH_PRIVATE)
            && k8s::has_secret_key(&secret, KEY_SSH_PUBLIC)
        {
            return Ok(());
        }
        debug!(secret = %name, "ssh secret incomplete; will regenerate");
    }
    info!(secret = %name, "generating ssh keypair");
    let pair = sshkeys::generate(&format!("etcdcat@{}", cluster.name_any()))?;
    let mut data = BTreeMap::new();
    data.insert(KEY_SSH_PRIVATE.to_string(), pair.private_key.into_bytes());
    data.insert(KEY_SSH_PUBLIC.to_string(), pair.public_key.into_bytes());
    persist(cluster, namespace, api, name, TYPE_SSH, data).await
}

/// Create the secret, or replace its data when a half-written copy exists.
async fn persist(
    cluster: &EtcdCluster,
    namespace: &str,
    api: &Api<Secret>,
    name: &str,
    type_: &str,
    data: BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    let owner = k8s::owner_reference(cluster)?;
    let secret = k8s::build_secret(
        name,
        namespace,
        names::common_labels(&cluster.name_any()),
        owner,
        type_,
        data,
    );
    match api.create(&PostParams::default(), &secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            let existing = api.get(name).await?;
            let mut replacement = secret;
            replacement.metadata.resource_version = existing.resource_version();
            api.replace(name, &PostParams::default(), &replacement).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
