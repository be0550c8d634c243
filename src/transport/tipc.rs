//! TIPC stream transport.
//!
//! TIPC addresses services by a `{type, instance}` pair rather than a host
//! and port, which is what makes it attractive on clustered backplanes:
//! clients connect to wherever the service instance currently lives. Only
//! the connection-oriented socket type is used here; datagram and multicast
//! modes are not.
//!
//! There is no std or tokio support for `AF_TIPC`, so the socket is created
//! through libc and driven through [`AsyncFd`] readiness.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::timeout;
use tracing::debug;

use super::{
    read_frame, write_frame, FrameMode, PeerAddr, RecvOutcome, Stream, Transport,
    TransportDescriptor, TransportKind,
};
use crate::error::TransportError;

const AF_TIPC: libc::c_int = 30;

// sockaddr_tipc addrtype values
const TIPC_ADDR_NAMESEQ: u8 = 1;
const TIPC_ADDR_NAME: u8 = 2;

/// `struct sockaddr_tipc` with the address union flattened to three words:
/// `{type, instance, domain}` for a service name, `{type, lower, upper}`
/// for a service range.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrTipc {
    family: libc::sa_family_t,
    addrtype: u8,
    scope: i8,
    addr: [u32; 3],
}

impl SockaddrTipc {
    fn service(name_type: u32, instance: u32, scope: u32) -> Self {
        Self {
            family: AF_TIPC as libc::sa_family_t,
            addrtype: TIPC_ADDR_NAME,
            scope: scope as i8,
            addr: [name_type, instance, 0],
        }
    }

    fn service_range(name_type: u32, instance: u32, scope: u32) -> Self {
        Self {
            family: AF_TIPC as libc::sa_family_t,
            addrtype: TIPC_ADDR_NAMESEQ,
            scope: scope as i8,
            addr: [name_type, instance, instance],
        }
    }
}

fn last_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

fn tipc_socket() -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            AF_TIPC,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(last_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn socket_error(fd: RawFd) -> std::io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_error());
    }
    if err != 0 {
        return Err(std::io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// A connected TIPC stream driven through readiness notifications.
pub struct TipcStream {
    fd: AsyncFd<OwnedFd>,
    peer_ref: u32,
}

impl TipcStream {
    fn new(fd: OwnedFd, peer_ref: u32) -> std::io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
            peer_ref,
        })
    }

    /// The peer's port reference, used only as a log/SA key.
    pub fn peer_instance(&self) -> u32 {
        self.peer_ref
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(last_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        buf[written..].as_ptr() as *const libc::c_void,
                        buf.len() - written,
                    )
                };
                if n < 0 {
                    Err(last_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

pub struct TipcTransport {
    descriptor: TransportDescriptor,
    stream: Option<Stream>,
    listener: Option<AsyncFd<OwnedFd>>,
}

impl TipcTransport {
    pub fn new(descriptor: TransportDescriptor) -> Self {
        debug_assert!(matches!(descriptor.kind, TransportKind::Tipc { .. }));
        Self {
            descriptor,
            stream: None,
            listener: None,
        }
    }

    fn address(&self) -> (u32, u32, u32) {
        match &self.descriptor.kind {
            TransportKind::Tipc {
                name_type,
                instance,
                scope,
            } => (*name_type, *instance, *scope),
            _ => unreachable!("TipcTransport built from non-TIPC descriptor"),
        }
    }

    async fn connect_inner(&self) -> std::io::Result<TipcStream> {
        let (name_type, instance, scope) = self.address();
        let fd = tipc_socket()?;
        let addr = SockaddrTipc::service(name_type, instance, scope);
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrTipc>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = last_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
        }
        let stream = TipcStream::new(fd, instance)?;
        // Wait until the non-blocking connect resolves, then check SO_ERROR.
        let guard = stream.fd.writable().await?;
        socket_error(stream.fd.as_raw_fd())?;
        drop(guard);
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TipcTransport {
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
        let (name_type, instance, _) = self.address();
        debug!(id = %self.descriptor.id, name_type, instance, "connecting");

        let stream = match self.descriptor.connect_timeout {
            Some(limit) => timeout(limit, self.connect_inner())
                .await
                .map_err(|_| TransportError::ConnectTimeout)??,
            None => self.connect_inner().await?,
        };
        self.stream = Some(Stream::Tipc(stream));
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
        let (name_type, instance, scope) = self.address();
        let fd = tipc_socket()?;
        let addr = SockaddrTipc::service_range(name_type, instance, scope);
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrTipc>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TransportError::Io(last_error()));
        }
        if unsafe { libc::listen(fd.as_raw_fd(), 16) } < 0 {
            return Err(TransportError::Io(last_error()));
        }
        debug!(id = %self.descriptor.id, name_type, instance, "listening");
        self.listener = Some(AsyncFd::with_interest(fd, Interest::READABLE)?);
        Ok(())
    }

    async fn accept(&mut self) -> Result<(Stream, PeerAddr), TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotConnected)?;
        loop {
            let mut guard = listener
                .readable()
                .await
                .map_err(TransportError::Io)?;
            let accepted = guard.try_io(|inner| {
                let mut addr: SockaddrTipc = unsafe { std::mem::zeroed() };
                let mut len = std::mem::size_of::<SockaddrTipc>() as libc::socklen_t;
                let fd = unsafe {
                    libc::accept4(
                        inner.as_raw_fd(),
                        &mut addr as *mut _ as *mut libc::sockaddr,
                        &mut len,
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                if fd < 0 {
                    Err(last_error())
                } else {
                    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, addr.addr[0]))
                }
            });
            match accepted {
                Ok(Ok((fd, peer_ref))) => {
                    debug!(id = %self.descriptor.id, peer_ref, "accepted");
                    let stream = TipcStream::new(fd, peer_ref).map_err(TransportError::Io)?;
                    return Ok((Stream::Tipc(stream), PeerAddr::Tipc(peer_ref)));
                }
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    fn peer(&self) -> Option<PeerAddr> {
        self.stream.as_ref().map(|s| s.peer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_addr_layout() {
        let addr = SockaddrTipc::service(18888, 3, 0);
        assert_eq!(addr.addrtype, TIPC_ADDR_NAME);
        assert_eq!(addr.addr, [18888, 3, 0]);
        assert_eq!(std::mem::size_of::<SockaddrTipc>(), 16);
    }

    #[test]
    fn range_addr_covers_single_instance() {
        let addr = SockaddrTipc::service_range(18888, 7, 0);
        assert_eq!(addr.addrtype, TIPC_ADDR_NAMESEQ);
        assert_eq!(addr.addr, [18888, 7, 7]);
    }
}
