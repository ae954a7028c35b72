//! X.509 material for one EtcdCluster.
//!
//! Each cluster gets a self-signed CA plus two leaf identities signed by it:
//! an `api-client` pair the prober (and any operator tooling) dials etcd
//! with, and a `peer` pair for the service endpoint. The per-member serving
//! certificates are minted on the VM by etcdadm from the same CA, with the
//! SAN list rendered into the provisioning scripts.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use super::Result;

/// A PEM-encoded certificate plus its PEM-encoded private key.
#[derive(Clone, Debug)]
pub struct CertifiedKey {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Generate the self-signed CA for a cluster.
pub fn issue_ca(cluster: &str) -> Result<CertifiedKey> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&format!("{} etcd CA", cluster));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let cert = params.self_signed(&key)?;
    Ok(CertifiedKey {
        certificate_pem: cert.pem(),
        private_key_pem: key.serialize_pem(),
    })
}

/// Rebuild an issuer from persisted CA material.
///
/// The regenerated `Certificate` only contributes subject and key identity
/// during signing; the persisted PEM stays the single source of truth for
/// what gets distributed to clients.
fn ca_issuer(ca: &CertifiedKey) -> Result<(Certificate, KeyPair)> {
    let key = KeyPair::from_pem(&ca.private_key_pem)?;
    let params = CertificateParams::from_ca_cert_pem(&ca.certificate_pem)?;
    let cert = params.self_signed(&key)?;
    Ok((cert, key))
}

/// Issue the client identity used for etcd health checks and API access.
pub fn issue_client(cluster: &str, ca: &CertifiedKey) -> Result<CertifiedKey> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name = distinguished_name(&format!("{} etcd api client", cluster));
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let (issuer, issuer_key) = ca_issuer(ca)?;
    let cert = params.signed_by(&key, &issuer, &issuer_key)?;
    Ok(CertifiedKey {
        certificate_pem: cert.pem(),
        private_key_pem: key.serialize_pem(),
    })
}

/// Issue the peer identity for the cluster service endpoint.
///
/// `subject_alt_names` takes DNS names and bare IPs alike; IPs are detected
/// and encoded as IP SANs.
pub fn issue_peer(cluster: &str, ca: &CertifiedKey, subject_alt_names: &[String]) -> Result<CertifiedKey> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(subject_alt_names.to_vec())?;
    params.distinguished_name = distinguished_name(&format!("{} etcd peer", cluster));
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let (issuer, issuer_key) = ca_issuer(ca)?;
    let cert = params.signed_by(&key, &issuer, &issuer_key)?;
    Ok(CertifiedKey {
        certificate_pem: cert.pem(),
        private_key_pem: key.serialize_pem(),
    })
}

/// Whether persisted PEM material still parses as a certificate and key.
///
/// Used by the idempotent secret reconcilers to decide between "keep" and
/// "regenerate" when a status reference exists but the Secret was tampered
/// with or truncated.
pub fn parses(certified: &CertifiedKey) -> bool {
    KeyPair::from_pem(&certified.private_key_pem).is_ok()
        && certified.certificate_pem.contains("BEGIN CERTIFICATE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_is_pem_encoded() {
        let ca = issue_ca("example").unwrap();
        assert!(ca.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.private_key_pem.contains("PRIVATE KEY"));
        assert!(parses(&ca));
    }

    #[test]
    fn leaf_identities_are_signed_by_a_reloaded_ca() {
        let ca = issue_ca("example").unwrap();
        // simulate reading the CA back from the Secret: only the PEM survives
        let persisted = CertifiedKey {
            certificate_pem: ca.certificate_pem.clone(),
            private_key_pem: ca.private_key_pem.clone(),
        };
        let client = issue_client("example", &persisted).unwrap();
        assert!(parses(&client));

        let sans = vec![
            "example.default.svc".to_string(),
            "example.default".to_string(),
            "10.0.12.34".to_string(),
        ];
        let peer = issue_peer("example", &persisted, &sans).unwrap();
        assert!(parses(&peer));
        assert_ne!(peer.certificate_pem, client.certificate_pem);
    }
}
