// src/gossip/state.rs

//! TCP push/pull of the full membership state and the opaque remote-state
//! blob (the cluster CA bundle).
//!
//! Each side sends one length-delimited frame and reads one back. With a
//! fleet key configured, frames are encrypted with AES-256-GCM keyed by the
//! SHA-256 of the key; the remote state carries private CA material and must
//! not cross the wire in the clear.

use crate::core::BeskarError;
use crate::gossip::member::MemberMeta;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const EXCHANGE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const EXCHANGE_IO_TIMEOUT: Duration = Duration::from_secs(5);
const NONCE_SIZE: usize = 12;

/// One side's view handed over during the push/pull.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StateExchange {
    pub members: Vec<MemberMeta>,
    pub state: Option<Vec<u8>>,
}

fn cipher(key: &str) -> Result<Aes256Gcm, BeskarError> {
    let digest = Sha256::digest(key.as_bytes());
    Aes256Gcm::new_from_slice(&digest)
        .map_err(|_| BeskarError::Gossip("failed to derive state cipher".to_string()))
}

/// Encodes and, with a key configured, encrypts an exchange frame.
pub fn seal_exchange(
    exchange: &StateExchange,
    key: &Option<String>,
) -> Result<Vec<u8>, BeskarError> {
    let plain = bincode::encode_to_vec(exchange, bincode::config::standard())?;
    let Some(key) = key else {
        return Ok(plain);
    };

    let nonce_bytes: [u8; NONCE_SIZE] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher(key)?
        .encrypt(nonce, plain.as_ref())
        .map_err(|_| BeskarError::Gossip("failed to encrypt state exchange".to_string()))?;

    let mut frame = Vec::with_capacity(NONCE_SIZE + sealed.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

/// Decrypts and decodes an exchange frame.
pub fn open_exchange(frame: &[u8], key: &Option<String>) -> Result<StateExchange, BeskarError> {
    let plain = match key {
        None => frame.to_vec(),
        Some(key) => {
            if frame.len() <= NONCE_SIZE {
                return Err(BeskarError::Gossip("state exchange frame too short".to_string()));
            }
            let nonce = Nonce::from_slice(&frame[..NONCE_SIZE]);
            cipher(key)?
                .decrypt(nonce, &frame[NONCE_SIZE..])
                .map_err(|_| BeskarError::Gossip("failed to decrypt state exchange".to_string()))?
        }
    };
    let (exchange, _) = bincode::decode_from_slice(&plain, bincode::config::standard())?;
    Ok(exchange)
}

/// Initiator side: connect to a peer, push our view, pull theirs.
pub async fn exchange_with_peer(
    addr: SocketAddr,
    key: &Option<String>,
    local: &StateExchange,
) -> Result<StateExchange, BeskarError> {
    let stream = tokio::time::timeout(EXCHANGE_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| BeskarError::Gossip(format!("connect timeout to peer {addr}")))??;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let frame = seal_exchange(local, key)?;
    tokio::time::timeout(EXCHANGE_IO_TIMEOUT, framed.send(Bytes::from(frame)))
        .await
        .map_err(|_| BeskarError::Gossip(format!("push timeout to peer {addr}")))?
        .map_err(|e| BeskarError::Gossip(format!("push to peer {addr} failed: {e}")))?;

    let reply = tokio::time::timeout(EXCHANGE_IO_TIMEOUT, framed.next())
        .await
        .map_err(|_| BeskarError::Gossip(format!("pull timeout from peer {addr}")))?
        .ok_or_else(|| BeskarError::Gossip(format!("peer {addr} closed during pull")))?
        .map_err(|e| BeskarError::Gossip(format!("pull from peer {addr} failed: {e}")))?;

    open_exchange(&reply, key)
}

/// Acceptor side: pull the initiator's view, push ours back. Returns what the
/// initiator sent so the caller can merge it.
pub async fn serve_exchange(
    stream: TcpStream,
    key: &Option<String>,
    local: &StateExchange,
) -> Result<StateExchange, BeskarError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let frame = tokio::time::timeout(EXCHANGE_IO_TIMEOUT, framed.next())
        .await
        .map_err(|_| BeskarError::Gossip("pull timeout from joiner".to_string()))?
        .ok_or_else(|| BeskarError::Gossip("joiner closed during pull".to_string()))?
        .map_err(|e| BeskarError::Gossip(format!("pull from joiner failed: {e}")))?;
    let remote = open_exchange(&frame, key)?;

    let reply = seal_exchange(local, key)?;
    tokio::time::timeout(EXCHANGE_IO_TIMEOUT, framed.send(Bytes::from(reply)))
        .await
        .map_err(|_| BeskarError::Gossip("push timeout to joiner".to_string()))?
        .map_err(|e| BeskarError::Gossip(format!("push to joiner failed: {e}")))?;

    Ok(remote)
}
