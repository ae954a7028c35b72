use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace
///
/// ```yaml
/// serviceRef:
///   name: example
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectRef {
    pub name: String,
}

impl LocalObjectRef {
    pub fn to<S: Into<String>>(name: S) -> Self {
        LocalObjectRef { name: name.into() }
    }
}

/// Reference to a single data key of a Secret in the same namespace
///
/// ```yaml
/// caCertificateRef:
///   name: ca-example
///   key: tls.crt
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

impl SecretKeyRef {
    pub fn to<S: Into<String>, K: Into<String>>(name: S, key: K) -> Self {
        SecretKeyRef {
            name: name.into(),
            key: key.into(),
        }
    }
}
