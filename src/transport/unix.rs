//! UNIX domain stream transport.
//!
//! Socket paths are derived from the service name with a fixed prefix. A
//! plain existence probe on the path doubles as the "server ready" check
//! that callers poll before creating a client.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::unistd::{access, AccessFlags};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::debug;

use super::{
    read_frame, write_frame, FrameMode, PeerAddr, RecvOutcome, Stream, Transport,
    TransportDescriptor, TransportKind,
};
use crate::error::TransportError;
use crate::service::ServiceDescriptor;

/// Fixed prefix for all CMSG UNIX socket paths.
pub const UNIX_PATH_PREFIX: &str = "/tmp/cmsg.";

/// Derive the socket path for a service.
pub fn unix_socket_path(service: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", UNIX_PATH_PREFIX, service))
}

/// Probe whether a UNIX server for the service is accepting connections.
/// The listening socket's path is created on bind, so existence is the
/// readiness signal.
pub fn unix_server_ready(descriptor: &ServiceDescriptor) -> bool {
    access(unix_socket_path(descriptor.name).as_path(), AccessFlags::F_OK).is_ok()
}

pub struct UnixTransport {
    descriptor: TransportDescriptor,
    stream: Option<Stream>,
    listener: Option<UnixListener>,
    accept_seq: u64,
}

impl UnixTransport {
    pub fn new(descriptor: TransportDescriptor) -> Self {
        debug_assert!(matches!(descriptor.kind, TransportKind::Unix { .. }));
        Self {
            descriptor,
            stream: None,
            listener: None,
            accept_seq: 0,
        }
    }

    fn path(&self) -> &Path {
        match &self.descriptor.kind {
            TransportKind::Unix { path } => path,
            _ => unreachable!("UnixTransport built from non-UNIX descriptor"),
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut TransportDescriptor {
        &mut self.descriptor
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let path = self.path().to_path_buf();
        debug!(id = %self.descriptor.id, path = %path.display(), "connecting");

        let connect = UnixStream::connect(&path);
        let stream = match self.descriptor.connect_timeout {
            Some(limit) => timeout(limit, connect)
                .await
                .map_err(|_| TransportError::ConnectTimeout)??,
            None => connect.await?,
        };
        self.stream = Some(Stream::Unix(stream));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
            debug!(id = %self.descriptor.id, "closed");
        }
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let send_timeout = self.descriptor.send_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(stream, frame, send_timeout).await
    }

    async fn recv_frame(&mut self, mode: FrameMode) -> RecvOutcome {
        let peek = self.descriptor.peek_timeout;
        match self.stream.as_mut() {
            Some(stream) => read_frame(stream, mode, peek).await,
            None => RecvOutcome::Closed,
        }
    }

    async fn listen(&mut self) -> Result<(), TransportError> {
        let path = self.path().to_path_buf();
        // A stale socket file from an unclean shutdown blocks the bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        debug!(id = %self.descriptor.id, path = %path.display(), "listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> Result<(Stream, PeerAddr), TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotConnected)?;
        let (stream, _) = listener.accept().await?;
        debug!(id = %self.descriptor.id, "accepted");
        // UNIX peers are anonymous; a per-listener sequence keeps each
        // accepted connection's identity (and security association)
        // distinct.
        self.accept_seq += 1;
        let peer = PeerAddr::Unix(format!(
            "{}#{}",
            self.path().display(),
            self.accept_seq
        ));
        Ok((Stream::Unix(stream), peer))
    }

    fn peer(&self) -> Option<PeerAddr> {
        self.stream
            .as_ref()
            .map(|_| PeerAddr::Unix(self.path().display().to_string()))
    }

    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.stream.as_ref().map(|s| s.raw_fd())
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        // The bind owner removes its socket path.
        if self.listener.is_some() {
            let _ = std::fs::remove_file(self.path());
        }
    }
}
