// src/plugin/transport.rs

//! The outbound registry transport and registry discovery.
//!
//! The client dialing the discovered registry presents the node's client
//! certificate, trusts only the cluster CA, and refuses plaintext.

use crate::core::BeskarError;
use crate::gossip::{Gossip, GossipEvent, NodeKind};
use crate::mtls::{CaBundle, Identity};
use crate::plugin::registry::RegistryEndpoint;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Bounded wait for the first registry member to appear in the fleet.
pub const REGISTRY_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// The mTLS client used exclusively for the registry host:port.
pub fn registry_http_client(
    ca: &CaBundle,
    identity: &Identity,
) -> Result<reqwest::Client, BeskarError> {
    let ca_cert = reqwest::Certificate::from_pem(ca.cert_pem.as_bytes())?;
    let client_identity = reqwest::Identity::from_pem(identity.bundle_pem().as_bytes())?;
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(ca_cert)
        .identity(client_identity)
        .https_only(true)
        .build()?)
}

fn registry_member(meta: &crate::gossip::MemberMeta) -> Option<RegistryEndpoint> {
    (meta.kind == NodeKind::Registry).then(|| RegistryEndpoint {
        host: meta.hostname.clone(),
        port: meta.registry_port,
    })
}

/// Waits for the first registry instance to appear, checking the current
/// membership first and then the gossip event stream.
pub async fn discover_registry(
    gossip: &Gossip,
    events: &mut mpsc::Receiver<GossipEvent>,
    wait: Duration,
) -> Result<RegistryEndpoint, BeskarError> {
    for meta in gossip.members() {
        if let Some(endpoint) = registry_member(&meta) {
            info!("Discovered registry at {}:{}.", endpoint.host, endpoint.port);
            return Ok(endpoint);
        }
    }

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| {
                BeskarError::Unavailable(format!(
                    "no registry instance appeared in the fleet within {wait:?}; \
                     is a registry running and gossiping with this plugin?"
                ))
            })?;
        match event {
            Some(GossipEvent::Join(meta)) | Some(GossipEvent::Update(meta)) => {
                if let Some(endpoint) = registry_member(&meta) {
                    info!("Discovered registry at {}:{}.", endpoint.host, endpoint.port);
                    return Ok(endpoint);
                }
            }
            Some(_) => {}
            None => {
                return Err(BeskarError::Gossip(
                    "gossip event stream closed during registry discovery".to_string(),
                ));
            }
        }
    }
}
