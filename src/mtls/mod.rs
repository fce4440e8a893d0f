// src/mtls/mod.rs

//! Fleet mTLS material: the gossip-distributed cluster CA and the per-node
//! identities derived from it.
//!
//! The first node of a fleet generates the CA; every joiner adopts it through
//! the gossip state exchange. Leaf certificates are minted locally at
//! bootstrap with SANs covering the node's hostname and resolved addresses.

use crate::core::BeskarError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use std::io::BufReader;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const CA_COMMON_NAME: &str = "Beskar Cluster CA";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// PEM-encoded CA certificate and key, shared fleet-wide through the gossip
/// remote state.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct CaBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CaBundle {
    /// Binary form carried as the gossip remote state.
    pub fn encode(&self) -> Result<Vec<u8>, BeskarError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BeskarError> {
        let (bundle, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(bundle)
    }
}

/// A freshly minted leaf identity (certificate plus private key, both PEM).
#[derive(Debug, Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl Identity {
    /// Key and certificate concatenated, the layout `reqwest::Identity`
    /// expects.
    pub fn bundle_pem(&self) -> String {
        format!("{}{}", self.key_pem, self.cert_pem)
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);
    params
}

/// Generates a new cluster CA. Called exactly once per fleet, by the first
/// node that finds no remote state to adopt.
pub fn generate_ca() -> Result<CaBundle, BeskarError> {
    let cert = Certificate::from_params(ca_params())?;
    Ok(CaBundle {
        cert_pem: cert.serialize_pem()?,
        key_pem: cert.serialize_private_key_pem(),
    })
}

/// Rebuilds the CA signer from its PEM bundle. The parameters mirror
/// [`ca_params`] so issuer name and authority key identifier match the
/// distributed certificate.
fn ca_signer(bundle: &CaBundle) -> Result<Certificate, BeskarError> {
    let key_pair = KeyPair::from_pem(&bundle.key_pem)?;
    let mut params = ca_params();
    params.key_pair = Some(key_pair);
    Ok(Certificate::from_params(params)?)
}

/// Issues a leaf identity signed by the cluster CA. `sans` carries the
/// hostname and every address the node answers on; plain IP strings are
/// encoded as IP SANs.
pub fn issue_identity(
    bundle: &CaBundle,
    common_name: &str,
    sans: Vec<String>,
) -> Result<Identity, BeskarError> {
    let ca = ca_signer(bundle)?;

    let mut params = CertificateParams::new(sans);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let cert = Certificate::from_params(params)?;
    Ok(Identity {
        cert_pem: cert.serialize_pem_with_signer(&ca)?,
        key_pem: cert.serialize_private_key_pem(),
    })
}

/// The SAN list for this node: hostname, loopback, and whatever the hostname
/// resolves to.
pub async fn local_sans(host: &str) -> Vec<String> {
    let mut sans = vec![
        host.to_string(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ];
    if let Ok(addrs) = tokio::net::lookup_host((host, 0u16)).await {
        for addr in addrs {
            let ip = addr.ip().to_string();
            if !sans.contains(&ip) {
                sans.push(ip);
            }
        }
    }
    sans
}

/// Parses certificates out of a PEM string.
fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, BeskarError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BeskarError::Tls(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(BeskarError::Tls("no certificates found in PEM".to_string()));
    }
    Ok(certs)
}

/// Parses a private key out of a PEM string.
fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, BeskarError> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BeskarError::Tls(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| BeskarError::Tls("no private key found in PEM".to_string()))
}

/// Builds the server TLS configuration installed into the multiplexer.
/// Client certificates are verified against the cluster CA when presented;
/// anonymous clients are still admitted so the plaintext/TLS gate stays at
/// the HTTP middleware.
pub fn server_config(bundle: &CaBundle, identity: &Identity) -> Result<ServerConfig, BeskarError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(&bundle.cert_pem)? {
        roots
            .add(cert)
            .map_err(|e| BeskarError::Tls(e.to_string()))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()
        .map_err(|e| BeskarError::Tls(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_certs(&identity.cert_pem)?, parse_key(&identity.key_pem)?)?;
    Ok(config)
}
