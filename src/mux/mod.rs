// src/mux/mod.rs

//! Single-port connection multiplexer.
//!
//! Every inbound connection has its first byte peeked within a short
//! deadline. A TLS ClientHello record (`0x16`) routes the connection through
//! the currently installed TLS configuration; anything else is served as
//! plaintext with the peeked byte replayed ahead of the stream. The TLS
//! configuration is atomically replaceable so the listener can accept
//! plaintext before gossip has delivered the cluster CA and switch
//! transparently once it has.
//!
//! The peek runs lazily on the connection's first poll, never inside
//! `accept`: an idle peer that sends nothing only stalls its own
//! connection, not the accept loop.

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::warn;

/// First byte of a TLS record carrying a ClientHello.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// How long to wait for the first byte before passing the connection through
/// as plaintext.
const PEEK_TIMEOUT: Duration = Duration::from_millis(100);

/// Atomically replaceable server TLS configuration shared between the
/// listener and the bootstrap code that installs the cluster certificate.
#[derive(Clone, Default)]
pub struct TlsSlot(Arc<RwLock<Option<TlsAcceptor>>>);

impl TlsSlot {
    pub fn install(&self, config: Arc<ServerConfig>) {
        *self.0.write() = Some(TlsAcceptor::from(config));
    }

    pub fn installed(&self) -> bool {
        self.0.read().is_some()
    }

    fn acceptor(&self) -> Option<TlsAcceptor> {
        self.0.read().clone()
    }
}

/// A stream wrapper that replays the peeked byte and surfaces a deferred
/// peek error on the next read. The multiplexer never rejects a connection
/// for arriving early or broken; whatever came through is passed along.
pub struct PeekStream<S> {
    inner: S,
    replay: Option<u8>,
    pending_err: Option<io::Error>,
}

impl<S> PeekStream<S> {
    pub fn new(inner: S, replay: Option<u8>, pending_err: Option<io::Error>) -> Self {
        Self {
            inner,
            replay,
            pending_err,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.pending_err.take() {
            return Poll::Ready(Err(e));
        }
        if let Some(byte) = this.replay.take() {
            if buf.remaining() == 0 {
                this.replay = Some(byte);
                return Poll::Ready(Ok(()));
            }
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The stream once the first byte decided its flavor.
enum Settled {
    Plain(PeekStream<TcpStream>),
    Tls(Box<TlsStream<PeekStream<TcpStream>>>),
}

enum StreamState {
    /// Peek (and TLS handshake, when routed there) still in flight.
    Pending(BoxFuture<'static, io::Result<Settled>>),
    Settled(Settled),
    /// Setup failed; the error was already surfaced once.
    Failed,
}

/// Peeks the first byte and routes the connection. A peek timeout, EOF, or
/// error all fall through to the plaintext path; an error is stored and
/// surfaces on the connection's next read.
async fn settle(
    mut stream: TcpStream,
    tls: TlsSlot,
    tls_flag: Arc<AtomicBool>,
) -> io::Result<Settled> {
    let mut first = [0u8; 1];
    let (replay, pending_err) =
        match tokio::time::timeout(PEEK_TIMEOUT, stream.read(&mut first)).await {
            Ok(Ok(0)) => (None, None),
            Ok(Ok(_)) => (Some(first[0]), None),
            Ok(Err(e)) => (None, Some(e)),
            Err(_) => (None, None),
        };
    let peeked = PeekStream::new(stream, replay, pending_err);

    if replay == Some(TLS_HANDSHAKE_BYTE) {
        if let Some(acceptor) = tls.acceptor() {
            tls_flag.store(true, Ordering::Release);
            let stream = acceptor.accept(peeked).await?;
            return Ok(Settled::Tls(Box::new(stream)));
        }
    }
    Ok(Settled::Plain(peeked))
}

/// A multiplexed connection. The first poll drives the peek and, when the
/// first byte was a ClientHello, the TLS handshake.
pub struct MuxStream {
    state: StreamState,
}

impl MuxStream {
    fn new(stream: TcpStream, tls: TlsSlot, tls_flag: Arc<AtomicBool>) -> Self {
        Self {
            state: StreamState::Pending(Box::pin(settle(stream, tls, tls_flag))),
        }
    }

    /// Drives connection setup one step. Ready means the stream settled into
    /// its final flavor and the caller can proceed.
    fn poll_settle(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let StreamState::Pending(fut) = &mut self.state {
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(settled)) => {
                    self.state = StreamState::Settled(settled);
                }
                Poll::Ready(Err(e)) => {
                    self.state = StreamState::Failed;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_settle(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        match &mut this.state {
            StreamState::Settled(Settled::Plain(s)) => Pin::new(s).poll_read(cx, buf),
            StreamState::Settled(Settled::Tls(s)) => Pin::new(s.as_mut()).poll_read(cx, buf),
            StreamState::Failed => {
                Poll::Ready(Err(io::Error::other("connection setup failed")))
            }
            StreamState::Pending(_) => unreachable!("setup settled above"),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        match this.poll_settle(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        match &mut this.state {
            StreamState::Settled(Settled::Plain(s)) => Pin::new(s).poll_write(cx, buf),
            StreamState::Settled(Settled::Tls(s)) => Pin::new(s.as_mut()).poll_write(cx, buf),
            StreamState::Failed => {
                Poll::Ready(Err(io::Error::other("connection setup failed")))
            }
            StreamState::Pending(_) => unreachable!("setup settled above"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match &mut self.get_mut().state {
            StreamState::Settled(Settled::Plain(s)) => Pin::new(s).poll_flush(cx),
            StreamState::Settled(Settled::Tls(s)) => Pin::new(s.as_mut()).poll_flush(cx),
            StreamState::Pending(_) | StreamState::Failed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match &mut self.get_mut().state {
            StreamState::Settled(Settled::Plain(s)) => Pin::new(s).poll_shutdown(cx),
            StreamState::Settled(Settled::Tls(s)) => Pin::new(s.as_mut()).poll_shutdown(cx),
            StreamState::Pending(_) | StreamState::Failed => Poll::Ready(Ok(())),
        }
    }
}

/// Per-connection address information handed to the HTTP layer. The TLS
/// flag settles when the connection's first byte arrives; by the time a
/// request has been parsed off the connection it is final.
#[derive(Clone, Debug)]
pub struct MuxAddr {
    pub remote: SocketAddr,
    tls: Arc<AtomicBool>,
}

/// The multiplexing listener wrapping one TCP socket.
pub struct MuxListener {
    listener: TcpListener,
    tls: TlsSlot,
}

impl MuxListener {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            tls: TlsSlot::default(),
        }
    }

    /// A handle the bootstrap uses to install the server TLS configuration
    /// once the cluster CA is known.
    pub fn tls_slot(&self) -> TlsSlot {
        self.tls.clone()
    }
}

impl Listener for MuxListener {
    type Io = MuxStream;
    type Addr = MuxAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let tls_flag = Arc::new(AtomicBool::new(false));
                    let io = MuxStream::new(stream, self.tls.clone(), tls_flag.clone());
                    return (io, MuxAddr { remote, tls: tls_flag });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(MuxAddr {
            remote: self.listener.local_addr()?,
            tls: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Connection info exposed to handlers through `ConnectInfo`.
#[derive(Clone, Debug)]
pub struct ClientConn {
    pub remote: SocketAddr,
    tls: Arc<AtomicBool>,
}

impl ClientConn {
    /// Whether the connection carrying the current request is TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Acquire)
    }
}

impl Connected<IncomingStream<'_, MuxListener>> for ClientConn {
    fn connect_info(stream: IncomingStream<'_, MuxListener>) -> Self {
        let addr = stream.remote_addr();
        ClientConn {
            remote: addr.remote,
            tls: addr.tls.clone(),
        }
    }
}
