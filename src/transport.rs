//! Transport-agnostic connection context
//!
//! Wraps one transport socket (TCP, or kernel SCTP behind the `kernel-sctp`
//! feature) with optional TLS, and provides uniform send/receive/handshake
//! operations plus Diameter frame delimiting based on the 3-byte length field
//! in the message header.
//!
//! A context starts in synchronous mode: `recv` blocks up to a deadline and
//! returns one message. Once `set_alt_queue` is called, a reader task owns
//! the receive side and every inbound message is delivered asynchronously as
//! a [`PeerEvent::ConnMessage`]; transport faults on that path surface as a
//! [`PeerEvent::ConnError`] instead of an error at any call site.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::config::TlsConfig;
use crate::error::{AgentError, AgentResult};
use crate::event::PeerEvent;
use crate::message::{Message, HEADER_SIZE};
use crate::DIAMETER_VERSION;

/// Maximum accepted frame size (default 64KB, RFC allows up to 16MB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Transport protocol in use by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Sctp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Sctp => write!(f, "SCTP"),
        }
    }
}

/// Role the local node played when the connection was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Initiator,
    Acceptor,
}

/// TLS configuration material shared by every connection of the agent
#[derive(Clone, Default)]
pub struct TlsMaterial {
    pub server: Option<Arc<ServerConfig>>,
    pub client: Option<Arc<ClientConfig>>,
}

impl TlsMaterial {
    /// Build both sides from the agent credential material
    pub fn from_config(tls: &TlsConfig) -> AgentResult<Self> {
        Ok(Self {
            server: Some(Arc::new(crate::tls::build_server_config(tls)?)),
            client: Some(Arc::new(crate::tls::build_client_config(tls, false)?)),
        })
    }
}

/// Underlying byte stream of a connection
pub(crate) enum IoStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(feature = "kernel-sctp")]
    Sctp(crate::sctp::SctpStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "kernel-sctp")]
            IoStream::Sctp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_write(cx, data),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            #[cfg(feature = "kernel-sctp")]
            IoStream::Sctp(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(feature = "kernel-sctp")]
            IoStream::Sctp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "kernel-sctp")]
            IoStream::Sctp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Split a complete frame off the front of `buf`, if one is available.
fn split_frame(buf: &mut BytesMut) -> AgentResult<Option<Bytes>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    if buf[0] != DIAMETER_VERSION {
        return Err(AgentError::MalformedFrame(format!(
            "unsupported Diameter version {}",
            buf[0]
        )));
    }

    // Message length from header bytes 1-3 (3-byte big-endian)
    let msg_len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;

    if msg_len < HEADER_SIZE {
        return Err(AgentError::MalformedFrame(format!(
            "message length {msg_len} is less than header size"
        )));
    }
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(AgentError::MalformedFrame(format!(
            "message length {msg_len} exceeds maximum {MAX_MESSAGE_SIZE}"
        )));
    }

    if buf.len() < msg_len {
        return Ok(None);
    }

    Ok(Some(buf.split_to(msg_len).freeze()))
}

/// Read one framed message, filling `buf` from `io` as needed.
async fn read_frame<R>(io: &mut R, buf: &mut BytesMut) -> AgentResult<Message>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = split_frame(buf)? {
            return Message::decode(frame);
        }

        let n = io.read_buf(buf).await?;
        if n == 0 {
            return if buf.is_empty() {
                Err(AgentError::ConnectionClosed)
            } else {
                Err(AgentError::MalformedFrame("truncated frame at EOF".into()))
            };
        }
    }
}

enum Inner {
    /// Single-owner stream; `recv` reads it directly
    Whole(IoStream),
    /// Receive side owned by the reader task; only sends go through here
    Redirected(WriteHalf<IoStream>),
    /// All sockets closed
    Closed,
}

/// One transport connection to a remote peer
pub struct Connection {
    kind: TransportKind,
    role: ConnRole,
    inner: Inner,
    read_buf: BytesMut,
    started: bool,
    loop_mode: bool,
    tls_active: bool,
    hostname: Option<String>,
    local_eps: Vec<SocketAddr>,
    remote_eps: Vec<SocketAddr>,
    remote_certs: Vec<CertificateDer<'static>>,
    alt_tx: Option<mpsc::Sender<PeerEvent>>,
    loop_pending: VecDeque<Message>,
    reader_task: Option<JoinHandle<()>>,
}

impl Connection {
    fn from_tcp(stream: TcpStream, role: ConnRole) -> AgentResult<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            kind: TransportKind::Tcp,
            role,
            inner: Inner::Whole(IoStream::Tcp(stream)),
            read_buf: BytesMut::with_capacity(4096),
            started: false,
            loop_mode: false,
            tls_active: false,
            hostname: None,
            local_eps: vec![local],
            remote_eps: vec![remote],
            remote_certs: Vec::new(),
            alt_tx: None,
            loop_pending: VecDeque::new(),
            reader_task: None,
        })
    }

    #[cfg(feature = "kernel-sctp")]
    fn from_sctp(stream: crate::sctp::SctpStream, role: ConnRole) -> Self {
        let local_eps = stream.local_endpoints();
        let remote_eps = stream.remote_endpoints();
        Self {
            kind: TransportKind::Sctp,
            role,
            inner: Inner::Whole(IoStream::Sctp(stream)),
            read_buf: BytesMut::with_capacity(4096),
            started: false,
            loop_mode: false,
            tls_active: false,
            hostname: None,
            local_eps,
            remote_eps,
            remote_certs: Vec::new(),
            alt_tx: None,
            loop_pending: VecDeque::new(),
            reader_task: None,
        }
    }

    /// Connect to one of the candidate remote endpoints, bounded by `timeout`.
    pub async fn connect(
        kind: TransportKind,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> AgentResult<Self> {
        if addrs.is_empty() {
            return Err(AgentError::ConnectFailed("no candidate endpoints".into()));
        }

        match kind {
            TransportKind::Tcp => {
                let attempt = async {
                    let mut last: Option<std::io::Error> = None;
                    for addr in addrs {
                        match TcpStream::connect(addr).await {
                            Ok(stream) => return Ok(stream),
                            Err(e) => {
                                log::debug!("connect to {addr} failed: {e}");
                                last = Some(e);
                            }
                        }
                    }
                    Err(AgentError::ConnectFailed(
                        last.map(|e| e.to_string()).unwrap_or_default(),
                    ))
                };
                let stream = tokio::time::timeout(timeout, attempt)
                    .await
                    .map_err(|_| AgentError::ConnectTimeout)??;
                Self::from_tcp(stream, ConnRole::Initiator)
            }
            #[cfg(feature = "kernel-sctp")]
            TransportKind::Sctp => {
                let stream = crate::sctp::SctpStream::connect(addrs, timeout).await?;
                Ok(Self::from_sctp(stream, ConnRole::Initiator))
            }
            #[cfg(not(feature = "kernel-sctp"))]
            TransportKind::Sctp => Err(AgentError::TransportUnavailable(
                "built without the kernel-sctp feature",
            )),
        }
    }

    /// Permit the context to operate cleartext. In loop mode every sent
    /// message is delivered back locally instead of hitting the wire, for
    /// self-tests.
    pub fn start_clear(&mut self, loop_mode: bool) -> AgentResult<()> {
        if matches!(self.inner, Inner::Closed) {
            return Err(AgentError::ConnectionClosed);
        }
        self.started = true;
        self.loop_mode = loop_mode;
        Ok(())
    }

    /// Negotiate TLS on an established TCP connection, bounded by `timeout`.
    ///
    /// `as_server` selects the negotiation side, independent of who opened
    /// the transport connection.
    pub async fn handshake(
        &mut self,
        as_server: bool,
        material: &TlsMaterial,
        timeout: Duration,
    ) -> AgentResult<()> {
        if self.tls_active {
            return Ok(());
        }

        let stream = match mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Whole(IoStream::Tcp(stream)) => stream,
            other => {
                self.inner = other;
                return Err(AgentError::HandshakeRefused(
                    "connection not in a state that permits a TLS handshake".into(),
                ));
            }
        };

        let negotiated = if as_server {
            let config = material
                .server
                .clone()
                .ok_or_else(|| AgentError::BadCredentials("no server TLS material".into()))?;
            let accept = TlsAcceptor::from(config).accept(stream);
            let tls = tokio::time::timeout(timeout, accept)
                .await
                .map_err(|_| AgentError::HandshakeTimeout)?
                .map_err(|e| AgentError::HandshakeRefused(e.to_string()))?;
            let certs = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(|c| c.to_vec())
                .unwrap_or_default();
            (TlsStream::Server(tls), certs)
        } else {
            let config = material
                .client
                .clone()
                .ok_or_else(|| AgentError::BadCredentials("no client TLS material".into()))?;
            let name = match &self.hostname {
                Some(host) => ServerName::try_from(host.clone())
                    .map_err(|e| AgentError::BadCredentials(format!("bad server name: {e}")))?,
                None => {
                    let ip = self
                        .remote_eps
                        .first()
                        .map(|a| a.ip())
                        .ok_or_else(|| AgentError::ConnectFailed("no remote endpoint".into()))?;
                    ServerName::IpAddress(ip.into())
                }
            };
            let connect = TlsConnector::from(config).connect(name, stream);
            let tls = tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| AgentError::HandshakeTimeout)?
                .map_err(|e| AgentError::HandshakeRefused(e.to_string()))?;
            let certs = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(|c| c.to_vec())
                .unwrap_or_default();
            (TlsStream::Client(tls), certs)
        };

        self.inner = Inner::Whole(IoStream::Tls(Box::new(negotiated.0)));
        self.remote_certs = negotiated.1;
        self.tls_active = true;
        self.started = true;
        Ok(())
    }

    /// Transmit one framed message.
    pub async fn send(&mut self, msg: &Message) -> AgentResult<()> {
        if !self.started {
            return Err(AgentError::Protocol(
                "connection not started (no start_clear or handshake)".into(),
            ));
        }

        if self.loop_mode {
            match &self.alt_tx {
                Some(tx) => tx
                    .send(PeerEvent::ConnMessage(msg.clone()))
                    .await
                    .map_err(|_| AgentError::QueueClosed)?,
                None => self.loop_pending.push_back(msg.clone()),
            }
            return Ok(());
        }

        let encoded = msg.encode();
        match &mut self.inner {
            Inner::Whole(io) => {
                io.write_all(&encoded).await?;
                io.flush().await?;
            }
            Inner::Redirected(io) => {
                io.write_all(&encoded).await?;
                io.flush().await?;
            }
            Inner::Closed => return Err(AgentError::ConnectionClosed),
        }
        Ok(())
    }

    /// Receive one message, blocking up to `deadline`.
    pub async fn recv(&mut self, deadline: Duration) -> AgentResult<Message> {
        if !self.started {
            return Err(AgentError::Protocol(
                "connection not started (no start_clear or handshake)".into(),
            ));
        }

        if let Some(msg) = self.loop_pending.pop_front() {
            return Ok(msg);
        }

        match &mut self.inner {
            Inner::Whole(io) => tokio::time::timeout(deadline, read_frame(io, &mut self.read_buf))
                .await
                .map_err(|_| AgentError::RecvTimeout)?,
            Inner::Redirected(_) => Err(AgentError::Protocol(
                "synchronous receive after redirect".into(),
            )),
            Inner::Closed => Err(AgentError::ConnectionClosed),
        }
    }

    /// Redirect all subsequent inbound messages to the given event queue.
    ///
    /// Spawns the reader task; after this call `recv` is no longer usable.
    pub fn set_alt_queue(&mut self, tx: mpsc::Sender<PeerEvent>) -> AgentResult<()> {
        if !self.started {
            return Err(AgentError::Protocol(
                "connection not started (no start_clear or handshake)".into(),
            ));
        }

        let io = match mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Whole(io) => io,
            other => {
                self.inner = other;
                return Err(AgentError::Protocol("redirect already active".into()));
            }
        };

        let (mut rd, wr): (ReadHalf<IoStream>, WriteHalf<IoStream>) = tokio::io::split(io);
        self.inner = Inner::Redirected(wr);

        // Frames looped back before the redirect are flushed to the queue
        let pending: Vec<Message> = self.loop_pending.drain(..).collect();
        let mut buf = mem::replace(&mut self.read_buf, BytesMut::new());
        let reader_tx = tx.clone();
        let conn_id = self.id();

        let handle = tokio::spawn(async move {
            for msg in pending {
                if reader_tx.send(PeerEvent::ConnMessage(msg)).await.is_err() {
                    return;
                }
            }
            loop {
                match read_frame(&mut rd, &mut buf).await {
                    Ok(msg) => {
                        if reader_tx.send(PeerEvent::ConnMessage(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("receiver for {conn_id} stopped: {e}");
                        let _ = reader_tx.send(PeerEvent::ConnError).await;
                        break;
                    }
                }
            }
        });

        self.reader_task = Some(handle);
        self.alt_tx = Some(tx);
        Ok(())
    }

    /// Close all sockets and stop any background delivery. Idempotent.
    pub async fn destroy(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        match mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Whole(mut io) => {
                let _ = io.shutdown().await;
            }
            Inner::Redirected(mut wr) => {
                let _ = wr.shutdown().await;
            }
            Inner::Closed => {}
        }
        self.alt_tx = None;
        self.loop_pending.clear();
    }

    /// Local identity string for logs
    pub fn id(&self) -> String {
        format!(
            "{}{} {} -> {}",
            self.kind,
            if self.tls_active { "/TLS" } else { "" },
            self.local_eps
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".into()),
            self.remote_eps
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".into()),
        )
    }

    /// Remote identity: the configured hostname when known, the address
    /// otherwise
    pub fn remote_id(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            self.remote_eps
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".into())
        })
    }

    /// Pin the remote hostname, used for TLS server-name verification
    pub fn set_hostname(&mut self, hostname: &str) {
        self.hostname = Some(hostname.to_string());
    }

    /// Transport protocol in use
    pub fn proto(&self) -> TransportKind {
        self.kind
    }

    /// Connection role
    pub fn role(&self) -> ConnRole {
        self.role
    }

    /// Whether TLS protects this connection
    pub fn is_tls(&self) -> bool {
        self.tls_active
    }

    /// Certificate chain presented by the remote peer, when TLS is active
    pub fn remote_certificates(&self) -> &[CertificateDer<'static>] {
        &self.remote_certs
    }

    /// Local endpoint set (more than one for multihomed transports)
    pub fn local_endpoints(&self) -> &[SocketAddr] {
        &self.local_eps
    }

    /// Remote endpoint set
    pub fn remote_endpoints(&self) -> &[SocketAddr] {
        &self.remote_eps
    }

    /// Replace the remote endpoint set after an address change notification
    pub fn update_remote_endpoints(&mut self, eps: Vec<SocketAddr>) {
        self.remote_eps = eps;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("tls", &self.tls_active)
            .field("local", &self.local_eps)
            .field("remote", &self.remote_eps)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(feature = "kernel-sctp")]
    Sctp(crate::sctp::SctpListener),
}

/// Listening socket that accepts peer connections
pub struct Listener {
    inner: ListenerInner,
    kind: TransportKind,
}

impl Listener {
    /// Bind a TCP listener on the given address
    pub async fn bind_tcp(addr: SocketAddr) -> AgentResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            inner: ListenerInner::Tcp(listener),
            kind: TransportKind::Tcp,
        })
    }

    /// Bind an SCTP listener over the given endpoint list
    #[cfg(feature = "kernel-sctp")]
    pub fn bind_sctp(port: u16, endpoints: &[std::net::IpAddr]) -> AgentResult<Self> {
        let listener = crate::sctp::SctpListener::bind(port, endpoints)?;
        Ok(Self {
            inner: ListenerInner::Sctp(listener),
            kind: TransportKind::Sctp,
        })
    }

    /// Bind an SCTP listener over the given endpoint list
    #[cfg(not(feature = "kernel-sctp"))]
    pub fn bind_sctp(_port: u16, _endpoints: &[std::net::IpAddr]) -> AgentResult<Self> {
        Err(AgentError::TransportUnavailable(
            "built without the kernel-sctp feature",
        ))
    }

    /// Accept one inbound connection, yielding a new context
    pub async fn accept(&self) -> AgentResult<Connection> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Connection::from_tcp(stream, ConnRole::Acceptor)
            }
            #[cfg(feature = "kernel-sctp")]
            ListenerInner::Sctp(listener) => {
                let stream = listener.accept().await?;
                Ok(Connection::from_sctp(stream, ConnRole::Acceptor))
            }
        }
    }

    /// Transport this listener accepts
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Local address the listener is bound to
    pub fn local_addr(&self) -> AgentResult<SocketAddr> {
        match &self.inner {
            ListenerInner::Tcp(listener) => Ok(listener.local_addr()?),
            #[cfg(feature = "kernel-sctp")]
            ListenerInner::Sctp(listener) => listener.local_addr(),
        }
    }
}
