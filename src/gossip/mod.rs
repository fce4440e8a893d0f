// src/gossip/mod.rs

//! Weakly consistent cluster membership for the plugin fabric.
//!
//! Members discover each other over UDP gossip and exchange the full state
//! (membership plus the cluster CA blob) over TCP push/pull at join time.
//! Consumers observe the fleet through an event stream; all errors surface
//! there and the consumer decides whether they are fatal.

use crate::config::GossipConfig;
use crate::core::BeskarError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket, lookup_host};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, info, warn};

pub mod member;
pub mod message;
pub mod state;

pub use member::{MAX_META_SIZE, MemberMeta, NodeKind};
pub use message::{GossipMessage, SealedMessage};
pub use state::StateExchange;

const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
const NODE_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const UDP_BUFFER_SIZE: usize = 65535;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fleet events delivered to the consumer.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    Join(MemberMeta),
    Leave(MemberMeta),
    Update(MemberMeta),
    Error(String),
}

struct MemberState {
    meta: MemberMeta,
    addr: SocketAddr,
    last_seen: Instant,
}

/// Handle to the running membership fabric.
pub struct Gossip {
    meta: RwLock<MemberMeta>,
    key: Option<String>,
    members: DashMap<String, MemberState>,
    remote_state: RwLock<Option<Vec<u8>>>,
    socket: Arc<UdpSocket>,
    events_tx: mpsc::Sender<GossipEvent>,
    shutdown_tx: broadcast::Sender<()>,
    broadcast_timeout: Duration,
}

impl Gossip {
    /// Binds the fabric, joins the configured peers, and spawns the
    /// background tasks. With a non-empty peer list, zero successful joins
    /// within the first-contact deadline is fatal.
    pub async fn start(
        config: &GossipConfig,
        meta: MemberMeta,
        local_state: Option<Vec<u8>>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<GossipEvent>), BeskarError> {
        let socket = UdpSocket::bind(&config.addr)
            .await
            .map_err(|e| BeskarError::Gossip(format!("failed to bind gossip UDP socket: {e}")))?;
        let tcp = TcpListener::bind(&config.addr)
            .await
            .map_err(|e| BeskarError::Gossip(format!("failed to bind gossip TCP socket: {e}")))?;
        info!("Gossip fabric listening on {}", config.addr);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let gossip = Arc::new(Self {
            meta: RwLock::new(meta),
            key: config.key.clone(),
            members: DashMap::new(),
            remote_state: RwLock::new(local_state),
            socket: Arc::new(socket),
            events_tx,
            shutdown_tx,
            broadcast_timeout: config.broadcast_timeout,
        });

        gossip.join_peers(config).await?;

        let receiver = gossip.clone();
        tokio::spawn(async move { receiver.run_udp_receiver().await });
        let acceptor = gossip.clone();
        tokio::spawn(async move { acceptor.run_state_listener(tcp).await });
        let prober = gossip.clone();
        tokio::spawn(async move { prober.run_prober().await });

        Ok((gossip, events_rx))
    }

    pub fn id(&self) -> String {
        self.meta.read().id.clone()
    }

    pub fn meta(&self) -> MemberMeta {
        self.meta.read().clone()
    }

    /// Snapshot of all known remote members.
    pub fn members(&self) -> Vec<MemberMeta> {
        self.members.iter().map(|e| e.value().meta.clone()).collect()
    }

    /// The adopted (or locally installed) remote state blob.
    pub fn remote_state(&self) -> Option<Vec<u8>> {
        self.remote_state.read().clone()
    }

    /// Installs this node's state blob, served to joiners from now on.
    pub fn set_local_state(&self, state: Vec<u8>) {
        *self.remote_state.write() = Some(state);
    }

    /// Flips the ready flag and broadcasts the updated metadata, bounded by
    /// the configured broadcast timeout.
    pub async fn mark_as_ready(&self) -> Result<(), BeskarError> {
        let updated = {
            let mut meta = self.meta.write();
            meta.ready = true;
            meta.clone()
        };
        time::timeout(
            self.broadcast_timeout,
            self.broadcast(GossipMessage::Update { member: updated }),
        )
        .await
        .map_err(|_| BeskarError::Gossip("timed out broadcasting readiness".to_string()))
    }

    /// Graceful leave: announce departure within the broadcast timeout, then
    /// force the background tasks down.
    pub async fn shutdown(&self) {
        let id = self.id();
        if time::timeout(
            self.broadcast_timeout,
            self.broadcast(GossipMessage::Leave { id }),
        )
        .await
        .is_err()
        {
            warn!("Timed out announcing gossip leave; closing anyway.");
        }
        let _ = self.shutdown_tx.send(());
    }

    async fn join_peers(&self, config: &GossipConfig) -> Result<(), BeskarError> {
        if config.peers.is_empty() {
            info!("No gossip peers configured; bootstrapping a new fleet.");
            return Ok(());
        }

        let deadline = Instant::now() + config.state_timeout;
        loop {
            let mut joined = 0usize;
            for peer in &config.peers {
                match self.join_one(peer).await {
                    Ok(()) => joined += 1,
                    Err(e) => warn!("Failed to join gossip peer {peer}: {e}"),
                }
            }
            if joined > 0 {
                info!("Joined {joined}/{} gossip peers.", config.peers.len());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BeskarError::Gossip(format!(
                    "failed to join any of the configured gossip peers within {:?}",
                    config.state_timeout
                )));
            }
            time::sleep(JOIN_RETRY_INTERVAL).await;
        }
    }

    async fn join_one(&self, peer: &str) -> Result<(), BeskarError> {
        let addr = lookup_host(peer)
            .await
            .map_err(|e| BeskarError::Gossip(format!("cannot resolve peer '{peer}': {e}")))?
            .next()
            .ok_or_else(|| BeskarError::Gossip(format!("peer '{peer}' resolved to nothing")))?;

        let local = self.local_exchange();
        let remote = state::exchange_with_peer(addr, &self.key, &local).await?;
        self.merge_exchange(remote);

        // Announce ourselves over the gossip plane as well, so the peer's
        // liveness tracking picks us up immediately.
        self.send_message(addr, GossipMessage::Join { member: self.meta() })
            .await;
        Ok(())
    }

    fn local_exchange(&self) -> StateExchange {
        let mut members = vec![self.meta()];
        members.extend(self.members());
        StateExchange {
            members,
            state: self.remote_state(),
        }
    }

    fn merge_exchange(&self, exchange: StateExchange) {
        if exchange.state.is_some() {
            let mut state = self.remote_state.write();
            if state.is_none() {
                *state = exchange.state;
                info!("Adopted remote state from peer.");
            }
        }
        for meta in exchange.members {
            self.observe_member(meta, None);
        }
    }

    /// Records a member, emitting Join or Update events as appropriate.
    fn observe_member(&self, meta: MemberMeta, seen_from: Option<SocketAddr>) {
        if meta.id == self.id() {
            return;
        }
        let addr = match seen_from {
            Some(addr) => Some(addr),
            None => meta.addr.parse().ok(),
        };
        let Some(addr) = addr else {
            debug!("Ignoring member {} with unusable address '{}'", meta.id, meta.addr);
            return;
        };

        match self.members.get_mut(&meta.id) {
            Some(mut entry) => {
                let changed = entry.meta != meta;
                entry.meta = meta.clone();
                entry.addr = addr;
                entry.last_seen = Instant::now();
                if changed {
                    self.emit(GossipEvent::Update(meta));
                }
            }
            None => {
                info!("Member {} ({:?}) joined the fleet.", meta.id, meta.kind);
                self.members.insert(
                    meta.id.clone(),
                    MemberState {
                        meta: meta.clone(),
                        addr,
                        last_seen: Instant::now(),
                    },
                );
                self.emit(GossipEvent::Join(meta));
            }
        }
    }

    fn emit(&self, event: GossipEvent) {
        if self.events_tx.try_send(event).is_err() {
            debug!("Gossip event channel full; dropping event.");
        }
    }

    async fn send_message(&self, addr: SocketAddr, message: GossipMessage) {
        match SealedMessage::new(message, &self.key).and_then(|m| m.encode()) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    warn!("Failed to send gossip message to {addr}: {e}");
                }
            }
            Err(e) => self.emit(GossipEvent::Error(e.to_string())),
        }
    }

    async fn broadcast(&self, message: GossipMessage) {
        let targets: Vec<SocketAddr> = self.members.iter().map(|e| e.value().addr).collect();
        for addr in targets {
            self.send_message(addr, message.clone()).await;
        }
    }

    async fn run_udp_receiver(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Gossip receiver shutting down.");
                    return;
                }
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, src)) => self.handle_packet(&buf[..len], src).await,
                        Err(e) => self.emit(GossipEvent::Error(format!("gossip receive error: {e}"))),
                    }
                }
            }
        }
    }

    async fn handle_packet(&self, bytes: &[u8], src: SocketAddr) {
        let sealed = match SealedMessage::decode(bytes) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Failed to decode gossip message from {src}: {e}");
                return;
            }
        };
        match sealed.verify(&self.key) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Received gossip message with invalid signature from {src}. Ignoring.");
                return;
            }
            Err(e) => {
                warn!("Error verifying gossip message signature from {src}: {e}");
                return;
            }
        }

        match sealed.message {
            GossipMessage::Join { member } => {
                self.observe_member(member, Some(src));
                let pong = GossipMessage::Pong {
                    sender_id: self.id(),
                    members: self.local_exchange().members,
                };
                self.send_message(src, pong).await;
            }
            GossipMessage::Ping { sender_id } => {
                self.touch(&sender_id);
                let pong = GossipMessage::Pong {
                    sender_id: self.id(),
                    members: self.local_exchange().members,
                };
                self.send_message(src, pong).await;
            }
            GossipMessage::Pong { sender_id, members } => {
                self.touch(&sender_id);
                for meta in members {
                    let known = self.members.contains_key(&meta.id) || meta.id == self.id();
                    self.observe_member(meta.clone(), None);
                    // Introduce ourselves to members we just learned about so
                    // the view converges without a central seed.
                    if !known {
                        if let Ok(addr) = meta.addr.parse() {
                            self.send_message(addr, GossipMessage::Join { member: self.meta() })
                                .await;
                        }
                    }
                }
            }
            GossipMessage::Update { member } => {
                self.observe_member(member, Some(src));
            }
            GossipMessage::Leave { id } => {
                if let Some((_, state)) = self.members.remove(&id) {
                    info!("Member {} left the fleet.", id);
                    self.emit(GossipEvent::Leave(state.meta));
                }
            }
        }
    }

    fn touch(&self, id: &str) {
        if let Some(mut entry) = self.members.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    async fn run_prober(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = time::interval(GOSSIP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Gossip prober shutting down.");
                    return;
                }
                _ = tick.tick() => {
                    let sender_id = self.id();
                    let targets: Vec<SocketAddr> =
                        self.members.iter().map(|e| e.value().addr).collect();
                    for addr in targets {
                        self.send_message(addr, GossipMessage::Ping { sender_id: sender_id.clone() })
                            .await;
                    }

                    let expired: Vec<String> = self
                        .members
                        .iter()
                        .filter(|e| e.value().last_seen.elapsed() > NODE_TIMEOUT)
                        .map(|e| e.key().clone())
                        .collect();
                    for id in expired {
                        if let Some((_, state)) = self.members.remove(&id) {
                            warn!("Member {} timed out; dropping from the fleet.", id);
                            self.emit(GossipEvent::Leave(state.meta));
                        }
                    }
                }
            }
        }
    }

    async fn run_state_listener(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Gossip state listener shutting down.");
                    return;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, src)) => {
                            debug!("Serving state exchange to {src}");
                            let local = self.local_exchange();
                            match state::serve_exchange(stream, &self.key, &local).await {
                                Ok(remote) => self.merge_exchange(remote),
                                Err(e) => {
                                    warn!("State exchange with {src} failed: {e}");
                                }
                            }
                        }
                        Err(e) => self.emit(GossipEvent::Error(format!("gossip accept error: {e}"))),
                    }
                }
            }
        }
    }
}
