//! The mutual-TLS health-check client.
//!
//! Verification stays on: the SAN lists baked into the serving certificates
//! cover every IP and DNS name we dial, so a verification failure is a real
//! signal, not noise to be skipped.

use std::time::Duration;

use serde::Deserialize;

use etcdcat_definitions::names::PORT_ETCD;

use crate::Result;

pub struct ProbeClient {
    http: reqwest::Client,
}

#[derive(Debug)]
pub enum ProbeResult {
    Healthy,
    Unhealthy(String),
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Health endpoint body; both the status code and this are checked.
#[derive(Deserialize)]
struct HealthBody {
    health: String,
}

impl ProbeClient {
    pub fn new(
        ca_certificate_pem: &[u8],
        client_certificate_pem: &[u8],
        client_key_pem: &[u8],
        timeout: Duration,
    ) -> Result<ProbeClient> {
        let ca = reqwest::Certificate::from_pem(ca_certificate_pem)?;
        let mut identity_pem =
            Vec::with_capacity(client_certificate_pem.len() + client_key_pem.len() + 1);
        identity_pem.extend_from_slice(client_certificate_pem);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(client_key_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(timeout)
            .build()?;
        Ok(ProbeClient { http })
    }

    /// One GET against `https://<host>:2379/health`.
    ///
    /// Transport failures come back as Unhealthy with the error text; they
    /// are expected during member churn and must not feed back-off.
    pub async fn health(&self, host: &str) -> ProbeResult {
        let url = format!("https://{}:{}/health", host, PORT_ETCD);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthBody>().await {
                    Ok(body) if body.health == "true" => ProbeResult::Healthy,
                    Ok(body) => ProbeResult::Unhealthy(format!("reports health={:?}", body.health)),
                    Err(err) => ProbeResult::Unhealthy(format!("unreadable health body: {}", err)),
                }
            }
            Ok(response) => ProbeResult::Unhealthy(format!("http status {}", response.status())),
            Err(err) => ProbeResult::Unhealthy(err.to_string()),
        }
    }
}
