//! TCP transport for IPv4 and IPv6.
//!
//! Sockets are tuned for low latency on connect/accept: Nagle disabled and
//! an optional `SO_BINDTODEVICE` so clustered deployments can pin traffic
//! to a management interface.

use std::net::{IpAddr, SocketAddr, SocketAddrV6};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use super::{
    read_frame, write_frame, FrameMode, PeerAddr, RecvOutcome, Stream, Transport,
    TransportDescriptor, TransportKind,
};
use crate::error::TransportError;

pub struct TcpTransport {
    descriptor: TransportDescriptor,
    stream: Option<Stream>,
    listener: Option<TcpListener>,
}

impl TcpTransport {
    pub fn new(descriptor: TransportDescriptor) -> Self {
        debug_assert!(matches!(descriptor.kind, TransportKind::Tcp { .. }));
        Self {
            descriptor,
            stream: None,
            listener: None,
        }
    }

    fn socket_addr(&self) -> SocketAddr {
        match &self.descriptor.kind {
            TransportKind::Tcp {
                addr,
                port,
                scope_id,
                ..
            } => match addr {
                IpAddr::V4(v4) => SocketAddr::from((*v4, *port)),
                IpAddr::V6(v6) => {
                    SocketAddr::V6(SocketAddrV6::new(*v6, *port, 0, *scope_id))
                }
            },
            _ => unreachable!("TcpTransport built from non-TCP descriptor"),
        }
    }

    fn bind_device(&self) -> Option<&str> {
        match &self.descriptor.kind {
            TransportKind::Tcp { bind_device, .. } => bind_device.as_deref(),
            _ => None,
        }
    }

    /// Disable Nagle and apply the optional device binding.
    fn tune(&self, stream: TcpStream) -> std::io::Result<TcpStream> {
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(true)?;
        if let Some(dev) = self.bind_device() {
            socket.bind_device(Some(dev.as_bytes()))?;
        }
        TcpStream::from_std(std_stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
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
        let addr = self.socket_addr();
        debug!(id = %self.descriptor.id, %addr, "connecting");

        let connect = TcpStream::connect(addr);
        let stream = match self.descriptor.connect_timeout {
            Some(limit) => timeout(limit, connect)
                .await
                .map_err(|_| TransportError::ConnectTimeout)??,
            None => connect.await?,
        };
        let stream = self.tune(stream)?;
        self.stream = Some(Stream::Tcp(stream));
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
        let addr = self.socket_addr();
        let listener = TcpListener::bind(addr).await?;
        debug!(id = %self.descriptor.id, local = %listener.local_addr()?, "listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> Result<(Stream, PeerAddr), TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotConnected)?;
        let (stream, peer) = listener.accept().await?;
        debug!(id = %self.descriptor.id, %peer, "accepted");
        let stream = self.tune(stream)?;
        Ok((Stream::Tcp(stream), PeerAddr::Tcp(peer)))
    }

    fn peer(&self) -> Option<PeerAddr> {
        self.stream.as_ref().map(|s| s.peer())
    }

    fn is_congested(&self) -> bool {
        // Bytes still sitting in the kernel send queue past the
        // high-water mark mean the peer is not draining us.
        const TX_QUEUE_HIGH_WATER: libc::c_int = 64 * 1024;
        if let Some(stream) = &self.stream {
            let mut pending: libc::c_int = 0;
            let rc = unsafe { libc::ioctl(stream.raw_fd(), libc::TIOCOUTQ, &mut pending) };
            return rc == 0 && pending > TX_QUEUE_HIGH_WATER;
        }
        false
    }

    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.stream.as_ref().map(|s| s.raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{self, MsgType, StatusCode};

    fn tcp_descriptor(port: u16, oneway: bool) -> TransportDescriptor {
        TransportDescriptor::new(
            TransportKind::Tcp {
                addr: "127.0.0.1".parse().unwrap(),
                port,
                scope_id: 0,
                bind_device: None,
            },
            oneway,
        )
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let mut server = TcpTransport::new(tcp_descriptor(19821, false));
        server.listen().await.unwrap();

        let mut client = TcpTransport::new(tcp_descriptor(19821, false));

        let accept = tokio::spawn(async move {
            let (mut stream, _peer) = server.accept().await.unwrap();
            let outcome = read_frame(
                &mut stream,
                FrameMode::Plain,
                std::time::Duration::from_secs(5),
            )
            .await;
            match outcome {
                RecvOutcome::Frame(frame) => frame,
                other => panic!("unexpected outcome: {:?}", other),
            }
        });

        client.connect().await.unwrap();
        let frame = header::pack(MsgType::MethodReq, StatusCode::Unset, Some("m"), &[7, 8, 9]);
        client.send_frame(&frame).await.unwrap();

        let received = accept.await.unwrap();
        assert_eq!(received, frame);
        client.close().await;
    }

    #[tokio::test]
    async fn recv_reports_closed_on_peer_shutdown() {
        let mut server = TcpTransport::new(tcp_descriptor(19822, false));
        server.listen().await.unwrap();

        let mut client = TcpTransport::new(tcp_descriptor(19822, false));
        client.connect().await.unwrap();

        let (mut accepted, _) = server.accept().await.unwrap();
        accepted.shutdown().await;
        drop(accepted);

        client.descriptor_mut().peek_timeout = std::time::Duration::from_secs(2);
        match client.recv_frame(FrameMode::Plain).await {
            RecvOutcome::Closed | RecvOutcome::Reset => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn recv_times_out_when_idle() {
        let mut server = TcpTransport::new(tcp_descriptor(19823, false));
        server.listen().await.unwrap();

        let mut client = TcpTransport::new(tcp_descriptor(19823, false));
        client.connect().await.unwrap();
        client.descriptor_mut().peek_timeout = std::time::Duration::from_millis(50);

        match client.recv_frame(FrameMode::Plain).await {
            RecvOutcome::TimedOut => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
