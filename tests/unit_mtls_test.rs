use beskar::mtls::{self, CaBundle};

#[test]
fn test_generate_ca_produces_pem_bundle() {
    let ca = mtls::generate_ca().unwrap();
    assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(ca.key_pem.contains("PRIVATE KEY"));
}

#[test]
fn test_ca_bundle_state_roundtrip() {
    let ca = mtls::generate_ca().unwrap();
    let bytes = ca.encode().unwrap();
    let decoded = CaBundle::decode(&bytes).unwrap();
    assert_eq!(decoded.cert_pem, ca.cert_pem);
    assert_eq!(decoded.key_pem, ca.key_pem);
}

#[test]
fn test_issue_identity_signed_by_ca() {
    let ca = mtls::generate_ca().unwrap();
    let identity = mtls::issue_identity(
        &ca,
        "node-1",
        vec![
            "node-1".to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ],
    )
    .unwrap();
    assert!(identity.cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(identity.key_pem.contains("PRIVATE KEY"));
    // Leaf key comes first in the reqwest identity bundle.
    assert!(identity.bundle_pem().starts_with(&identity.key_pem));
}

#[test]
fn test_server_config_builds_from_issued_identity() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let ca = mtls::generate_ca().unwrap();
    let identity =
        mtls::issue_identity(&ca, "node-1", vec!["localhost".to_string()]).unwrap();
    let config = mtls::server_config(&ca, &identity).unwrap();
    // Client certificates are optional; the HTTP middleware owns the gate.
    assert!(!config.alpn_protocols.iter().any(|p| p == b"h3"));
}

#[tokio::test]
async fn test_local_sans_cover_loopback() {
    let sans = mtls::local_sans("localhost").await;
    assert!(sans.contains(&"localhost".to_string()));
    assert!(sans.contains(&"127.0.0.1".to_string()));
}
