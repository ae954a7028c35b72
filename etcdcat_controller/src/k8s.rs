//! Small helpers over the kube client: ownership, finalizers, optimistic
//! patches, and the create-only idiom the secrets and VMs rely on.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use etcdcat_definitions::names;

use super::{Error, Result};

/// `namespace/name`, the owner key used by the expectation tracker.
pub fn owner_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

pub fn namespace_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<String> {
    obj.namespace().ok_or_else(|| Error::MissingNamespace {
        kind: K::kind(&()).into_owned(),
        name: obj.name_any(),
    })
}

/// Controlling owner reference pointing at `owner`.
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    let uid = owner.uid().ok_or_else(|| Error::MissingUid {
        kind: K::kind(&()).into_owned(),
        name: owner.name_any(),
    })?;
    Ok(OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: owner.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Whether `child` is controlled by the owner with the given uid.
pub fn is_controlled_by<K: Resource>(child: &K, owner_uid: &str) -> bool {
    child
        .owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && o.uid == owner_uid)
}

pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == names::FINALIZER)
}

/// Attach our finalizer, guarded by the object's current resourceVersion so
/// a concurrent writer loses cleanly instead of silently.
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(names::FINALIZER.to_string());
    patch_finalizers(api, obj, finalizers).await
}

pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != names::FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, obj, finalizers).await
}

async fn patch_finalizers<K>(api: &Api<K>, obj: &K, finalizers: Vec<String>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// List objects matching `selector` that are controlled by `owner_uid`.
///
/// The label selector narrows server-side; the uid filter drops anything
/// that merely shares labels.
pub async fn list_owned<K>(
    api: &Api<K>,
    selector: &BTreeMap<String, String>,
    owner_uid: &str,
) -> Result<Vec<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut params = ListParams::default();
    if !selector.is_empty() {
        params = params.labels(&selector_string(selector));
    }
    let list = api.list(&params).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|child| is_controlled_by(child, owner_uid))
        .collect())
}

/// Create an object that must never be mutated once it exists.
///
/// A second attempt while the object is present hands back the stored
/// object untouched, which is what makes user-data Secrets and VMs stable
/// across reconciles.
pub async fn create_only<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Resource + Serialize + Clone + DeserializeOwned + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(api.get(&obj.name_any()).await?),
        Err(e) => Err(e.into()),
    }
}

/// Server-side apply under the controller's field manager.
pub async fn apply<K>(api: &Api<K>, name: &str, obj: &K) -> Result<K>
where
    K: Resource + Serialize + Clone + DeserializeOwned + Debug,
{
    let params = PatchParams::apply(names::MANAGER_NAME).force();
    Ok(api.patch(name, &params, &Patch::Apply(obj)).await?)
}

/// Merge-patch only the status subresource, leaving every field another
/// writer owns untouched.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    Ok(api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

pub fn secret_bytes(secret: &Secret, key: &str) -> Result<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|b| b.0.clone())
        .ok_or_else(|| Error::MissingSecretKey {
            secret: secret.name_any(),
            key: key.to_string(),
        })
}

pub fn secret_string(secret: &Secret, key: &str) -> Result<String> {
    String::from_utf8(secret_bytes(secret, key)?).map_err(|_| Error::SecretNotUtf8 {
        secret: secret.name_any(),
        key: key.to_string(),
    })
}

pub fn has_secret_key(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .map(|data| data.contains_key(key))
        .unwrap_or(false)
}

/// Assemble a Secret owned by `owner` with the given type and data.
pub fn build_secret(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    owner: OwnerReference,
    type_: &str,
    data: BTreeMap<String, Vec<u8>>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        type_: Some(type_.to_string()),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        ..Secret::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etcdcat_definitions::{EtcdCluster, EtcdClusterSpec};

    fn owner() -> EtcdCluster {
        let mut c = EtcdCluster::new(
            "example",
            EtcdClusterSpec {
                version: "3.5.1".into(),
                replicas: 3,
                login_password_secret_key_ref: None,
            },
        );
        c.metadata.namespace = Some("default".into());
        c.metadata.uid = Some("1111-2222".into());
        c
    }

    #[test]
    fn owner_reference_is_controlling() {
        let or = owner_reference(&owner()).unwrap();
        assert_eq!(or.kind, "EtcdCluster");
        assert_eq!(or.api_version, "etcdcat.io/v1alpha1");
        assert_eq!(or.name, "example");
        assert_eq!(or.uid, "1111-2222");
        assert_eq!(or.controller, Some(true));
    }

    #[test]
    fn owner_reference_requires_a_uid() {
        let mut c = owner();
        c.metadata.uid = None;
        assert!(matches!(
            owner_reference(&c),
            Err(Error::MissingUid { .. })
        ));
    }

    #[test]
    fn controlled_by_matches_on_uid() {
        let or = owner_reference(&owner()).unwrap();
        let secret = build_secret(
            "ca-example",
            "default",
            BTreeMap::new(),
            or,
            "kubernetes.io/tls",
            BTreeMap::new(),
        );
        assert!(is_controlled_by(&secret, "1111-2222"));
        assert!(!is_controlled_by(&secret, "3333-4444"));
    }

    #[test]
    fn selector_strings_are_comma_joined() {
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());
        assert_eq!(selector_string(&labels), "a=1,b=2");
    }

    #[test]
    fn secret_data_accessors() {
        let or = owner_reference(&owner()).unwrap();
        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), b"pem".to_vec());
        let secret = build_secret(
            "ca-example",
            "default",
            BTreeMap::new(),
            or,
            "kubernetes.io/tls",
            data,
        );
        assert!(has_secret_key(&secret, "tls.crt"));
        assert!(!has_secret_key(&secret, "tls.key"));
        assert_eq!(secret_string(&secret, "tls.crt").unwrap(), "pem");
        assert!(matches!(
            secret_bytes(&secret, "tls.key"),
            Err(Error::MissingSecretKey { .. })
        ));
    }
}
