//! # Transport Abstraction and Implementations
//!
//! A transport is the realisation of one wire endpoint: address family,
//! framing and connection semantics. All kinds implement the same
//! [`Transport`] trait so the client and server cores stay
//! mechanism-agnostic, mirroring a tagged-descriptor + capability-trait
//! design rather than C-style function-table structs.
//!
//! ## Supported kinds
//!
//! - **UNIX domain** stream sockets, path derived from the service name
//! - **TCP** over IPv4/IPv6 with optional device binding
//! - **TIPC** service addressing (`name_type`/`instance`)
//! - **Loopback**: a client paired directly with an in-process server
//! - **Forwarding**: a caller-supplied send callback, no socket at all
//! - **Broadcast**: descriptor-only; fan-out is served by the composite
//!   client
//!
//! ## Receive protocol
//!
//! Receives are peek-then-read: the fixed header (or the 8-byte crypto
//! prefix) is read first under the peek timeout and the outcome classified
//! into `{frame, closed, reset, timed-out, error}`, then the remainder of
//! the frame is read. A timeout with no bytes is not an error; it reports
//! "nothing received".

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::TransportError;
use crate::header::{self, HEADER_LEN};

pub mod forwarding;
pub mod loopback;
pub mod tcp;
pub mod tipc;
pub mod unix;

pub use forwarding::{ForwardingSendFn, ForwardingTransport};
pub use loopback::LoopbackTransport;
pub use tcp::TcpTransport;
pub use tipc::{TipcStream, TipcTransport};
pub use unix::{unix_server_ready, unix_socket_path, UnixTransport};

/// Default receive peek timeout used by clients waiting for a reply.
pub const CLIENT_PEEK_TIMEOUT: Duration = Duration::from_secs(100);

/// Default receive peek timeout used by servers waiting for a header.
pub const SERVER_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_TRANSPORT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Address family and endpoint tuple of a transport.
///
/// Equality is structural (kind plus address tuple) and is the basis for
/// composite-child lookups and queued-entry purging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    Unix {
        path: PathBuf,
    },
    Tcp {
        addr: IpAddr,
        port: u16,
        scope_id: u32,
        bind_device: Option<String>,
    },
    Tipc {
        name_type: u32,
        instance: u32,
        scope: u32,
    },
    Loopback,
    Forwarding,
    Broadcast,
}

impl TransportKind {
    fn tag(&self) -> &'static str {
        match self {
            TransportKind::Unix { .. } => "unix",
            TransportKind::Tcp { .. } => "tcp",
            TransportKind::Tipc { .. } => "tipc",
            TransportKind::Loopback => "lpb",
            TransportKind::Forwarding => "fwd",
            TransportKind::Broadcast => "bc",
        }
    }
}

/// Everything a built transport carries besides its live connection state.
#[derive(Debug, Clone)]
pub struct TransportDescriptor {
    pub kind: TransportKind,
    /// Fire-and-forget: no reply is ever read on this transport.
    pub oneway: bool,
    pub send_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub peek_timeout: Duration,
    /// Unique textual id used in logs.
    pub id: String,
}

impl TransportDescriptor {
    pub fn new(kind: TransportKind, oneway: bool) -> Self {
        let seq = NEXT_TRANSPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}.{}", kind.tag(), seq);
        Self {
            kind,
            oneway,
            send_timeout: None,
            connect_timeout: None,
            peek_timeout: CLIENT_PEEK_TIMEOUT,
            id,
        }
    }

    /// Structural match: same kind, same address tuple, same direction.
    pub fn matches(&self, other: &TransportDescriptor) -> bool {
        self.kind == other.kind && self.oneway == other.oneway
    }
}

/// Peer identity of a connection, used to key security associations and
/// composite lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix(String),
    Tipc(u32),
    Local,
}

/// Whether a frame on the wire is plain or wrapped in the crypto envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Plain,
    Encrypted,
}

/// Classified outcome of a peek-then-read receive.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A complete frame (plain mode) or envelope payload (encrypted mode).
    Frame(Vec<u8>),
    /// Orderly shutdown by the peer.
    Closed,
    /// Connection reset by the peer.
    Reset,
    /// Peek timeout expired with nothing received.
    TimedOut,
    /// Anything else.
    Error(std::io::Error),
}

/// A connected byte stream of any supported address family.
///
/// Accepted server connections and connected client transports both speak
/// through this so framing logic exists exactly once.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tipc(TipcStream),
}

impl Stream {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
            Stream::Unix(s) => s.read_exact(buf).await.map(|_| ()),
            Stream::Tipc(s) => s.read_exact(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            Stream::Unix(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            Stream::Tipc(s) => s.write_all(buf).await,
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            Stream::Tcp(s) => {
                let _ = s.shutdown().await;
            }
            Stream::Unix(s) => {
                let _ = s.shutdown().await;
            }
            Stream::Tipc(s) => s.shutdown(),
        }
    }

    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tipc(s) => s.as_raw_fd(),
        }
    }

    pub fn peer(&self) -> PeerAddr {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(PeerAddr::Tcp)
                .unwrap_or(PeerAddr::Local),
            Stream::Unix(s) => PeerAddr::Unix(
                s.peer_addr()
                    .ok()
                    .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                    .unwrap_or_default(),
            ),
            Stream::Tipc(s) => PeerAddr::Tipc(s.peer_instance()),
        }
    }
}

fn classify_io(err: std::io::Error) -> RecvOutcome {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            RecvOutcome::Closed
        }
        ErrorKind::ConnectionReset => RecvOutcome::Reset,
        // An interrupted poll is a timeout with zero progress.
        ErrorKind::Interrupted => RecvOutcome::TimedOut,
        _ => RecvOutcome::Error(err),
    }
}

async fn read_exact_classified(
    stream: &mut Stream,
    buf: &mut [u8],
    limit: Duration,
) -> Option<RecvOutcome> {
    match timeout(limit, stream.read_exact(buf)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(classify_io(e)),
        Err(_) => Some(RecvOutcome::TimedOut),
    }
}

/// Peek-then-read one unit off the stream.
///
/// Plain mode returns the complete frame (header, TLVs, body). Encrypted
/// mode validates the 4-byte magic, then returns the envelope payload
/// (nonce or ciphertext) that follows the 8-byte prefix.
pub async fn read_frame(
    stream: &mut Stream,
    mode: FrameMode,
    peek_timeout: Duration,
) -> RecvOutcome {
    match mode {
        FrameMode::Plain => {
            let mut head = [0u8; HEADER_LEN];
            if let Some(outcome) = read_exact_classified(stream, &mut head, peek_timeout).await {
                return outcome;
            }
            let parsed = match header::parse(&head) {
                Ok(h) => h,
                Err(e) => {
                    return RecvOutcome::Error(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        e,
                    ))
                }
            };
            let remaining = parsed.frame_len() - HEADER_LEN;
            let mut frame = Vec::with_capacity(parsed.frame_len());
            frame.extend_from_slice(&head);
            if remaining > 0 {
                let mut rest = vec![0u8; remaining];
                if let Some(outcome) =
                    read_exact_classified(stream, &mut rest, peek_timeout).await
                {
                    return outcome;
                }
                frame.extend_from_slice(&rest);
            }
            RecvOutcome::Frame(frame)
        }
        FrameMode::Encrypted => {
            let mut prefix = [0u8; 8];
            if let Some(outcome) = read_exact_classified(stream, &mut prefix, peek_timeout).await
            {
                return outcome;
            }
            if &prefix[0..4] != crate::crypto::ENVELOPE_MAGIC {
                return RecvOutcome::Error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "envelope magic mismatch",
                ));
            }
            let len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
            let mut payload = vec![0u8; len];
            if let Some(outcome) =
                read_exact_classified(stream, &mut payload, peek_timeout).await
            {
                return outcome;
            }
            RecvOutcome::Frame(payload)
        }
    }
}

/// Write one frame, honouring the descriptor's send timeout when set.
pub async fn write_frame(
    stream: &mut Stream,
    frame: &[u8],
    send_timeout: Option<Duration>,
) -> Result<(), TransportError> {
    match send_timeout {
        Some(limit) => match timeout(limit, stream.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::SendTimeout),
        },
        None => stream.write_all(frame).await.map_err(TransportError::Io),
    }
}

/// The capability contract between transports and the client/server cores.
#[async_trait]
pub trait Transport: Send {
    fn descriptor(&self) -> &TransportDescriptor;

    fn descriptor_mut(&mut self) -> &mut TransportDescriptor;

    /// Establish the client-side connection. Idempotent when already
    /// connected.
    async fn connect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Close the connection. Safe to call when not connected.
    async fn close(&mut self);

    /// Send a complete frame on the connected stream.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame from the connected stream.
    async fn recv_frame(&mut self, mode: FrameMode) -> RecvOutcome;

    /// Bind the server-side listening endpoint.
    async fn listen(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Accept one connection from the listening endpoint.
    async fn accept(&mut self) -> Result<(Stream, PeerAddr), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn peer(&self) -> Option<PeerAddr>;

    /// Whether a reply is read after a request. Oneway transports say no,
    /// which the client core treats as "no reply expected".
    fn supports_reply(&self) -> bool {
        !self.descriptor().oneway
    }

    /// Whether the kernel send queue has backed up past the high-water
    /// mark. Only meaningful for socket transports.
    fn is_congested(&self) -> bool {
        false
    }

    /// The raw descriptor of the connected socket, for callers that want
    /// to poll it themselves (the echo protocol does this).
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }

    /// Capability hook: the forwarding transport exposes its
    /// data-injection surface through this, everything else says no.
    fn as_forwarding(&mut self) -> Option<&mut ForwardingTransport> {
        None
    }
}

/// Build a transport from its descriptor.
///
/// Forwarding transports are constructed directly (they need the caller's
/// send callback) and broadcast is descriptor-only, so both are rejected
/// here.
pub fn build(descriptor: TransportDescriptor) -> Result<Box<dyn Transport>, TransportError> {
    match &descriptor.kind {
        TransportKind::Unix { .. } => Ok(Box::new(UnixTransport::new(descriptor))),
        TransportKind::Tcp { .. } => Ok(Box::new(TcpTransport::new(descriptor))),
        TransportKind::Tipc { .. } => Ok(Box::new(TipcTransport::new(descriptor))),
        TransportKind::Loopback => Ok(Box::new(LoopbackTransport::new(descriptor))),
        TransportKind::Forwarding | TransportKind::Broadcast => {
            debug!(id = %descriptor.id, "transport kind cannot be factory-built");
            Err(TransportError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_ids_are_unique() {
        let a = TransportDescriptor::new(TransportKind::Loopback, false);
        let b = TransportDescriptor::new(TransportKind::Loopback, false);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("lpb."));
    }

    #[test]
    fn structural_match_ignores_timeouts() {
        let kind = TransportKind::Tcp {
            addr: "127.0.0.1".parse().unwrap(),
            port: 18888,
            scope_id: 0,
            bind_device: None,
        };
        let mut a = TransportDescriptor::new(kind.clone(), false);
        let b = TransportDescriptor::new(kind.clone(), false);
        a.send_timeout = Some(Duration::from_secs(5));
        assert!(a.matches(&b));

        let oneway = TransportDescriptor::new(kind, true);
        assert!(!a.matches(&oneway));
    }
}
