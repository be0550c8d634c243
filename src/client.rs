//! # Client Core
//!
//! A client drives one transport towards one server. The invoke pipeline
//! for a single call:
//!
//! 1. Filter lookup: `Drop` returns immediately, `Queue` packs the frame
//!    onto the send queue, `Process` continues.
//! 2. Pack the header, METHOD TLV and protobuf body.
//! 3. Take the invoke mutex, so one in-flight send/recv per client no
//!    matter how many tasks share it.
//! 4. Connect if not already connected.
//! 5. Send; on failure close, reconnect once and retry.
//! 6. When the transport is an RPC one, receive the reply (peek, body,
//!    decrypt, parse, unpack).
//!
//! Every invocation produces exactly one outcome: a reply
//! ([`InvokeReply`]) or a [`ClientError`]. Connection loss is reported as
//! [`ClientError::Closed`] and logged at debug level only; the socket is
//! closed so the next invoke reconnects.

use std::net::IpAddr;
use std::sync::Arc;

use prost::Message;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error};

use crate::crypto::{self, SaDeriveFn, SecurityAssociation};
use crate::error::{ClientError, TransportError};
use crate::header::{self, Header, MsgType, StatusCode};
use crate::queue::{FilterPolicy, QueueFilter, SendQueue, SendQueueEntry};
use crate::server::Server;
use crate::service::{Service, ServiceDescriptor};
use crate::transport::{
    self, FrameMode, ForwardingSendFn, ForwardingTransport, RecvOutcome, Transport,
    TransportDescriptor, TransportKind,
};

/// Connection state of a client.
///
/// `Queued` is a one-shot outcome reported to the caller when a message is
/// enqueued instead of sent; the underlying connection is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Connected,
    Failed,
    Closed,
    Queued,
}

/// Successful outcomes of an invoke.
#[derive(Debug, PartialEq)]
pub enum InvokeReply<O> {
    /// The call ran; `None` is a valid empty reply (and the only reply for
    /// oneway transports).
    Ok(Option<O>),
    /// The message was enqueued, locally or by the server.
    Queued,
    /// The message was dropped by filter, locally or by the server.
    Dropped,
}

/// Outcome of the send phase, used by the composite client to fan out
/// before collecting any replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendPhase {
    Sent,
    Queued,
    Dropped,
}

struct ClientIo {
    transport: Box<dyn Transport>,
    state: ClientState,
    sa: Option<SecurityAssociation>,
    derive: Option<SaDeriveFn>,
    /// Reply captured during the send phase of a loopback invoke.
    pending_loopback: Option<(StatusCode, Vec<u8>)>,
}

pub struct Client {
    descriptor: &'static ServiceDescriptor,
    /// Serialises whole invocations; held across send and recv.
    invoke_lock: Arc<Mutex<()>>,
    /// Guards the transport and connection state; the send path.
    io: Mutex<ClientIo>,
    queue: SendQueue,
    filter: QueueFilter,
    loopback: Option<Arc<Server>>,
    transport_snapshot: TransportDescriptor,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>, descriptor: &'static ServiceDescriptor) -> Arc<Self> {
        let transport_snapshot = transport.descriptor().clone();
        Arc::new(Self {
            descriptor,
            invoke_lock: Arc::new(Mutex::new(())),
            io: Mutex::new(ClientIo {
                transport,
                state: ClientState::Init,
                sa: None,
                derive: None,
                pending_loopback: None,
            }),
            queue: SendQueue::new(),
            filter: QueueFilter::new(descriptor),
            loopback: None,
            transport_snapshot,
        })
    }

    /// RPC client over the UNIX socket derived from the service name.
    pub fn unix(descriptor: &'static ServiceDescriptor) -> Result<Arc<Self>, TransportError> {
        Self::unix_with_direction(descriptor, false)
    }

    /// Fire-and-forget client over the service's UNIX socket.
    pub fn unix_oneway(
        descriptor: &'static ServiceDescriptor,
    ) -> Result<Arc<Self>, TransportError> {
        Self::unix_with_direction(descriptor, true)
    }

    fn unix_with_direction(
        descriptor: &'static ServiceDescriptor,
        oneway: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let kind = TransportKind::Unix {
            path: transport::unix_socket_path(descriptor.name),
        };
        let built = transport::build(TransportDescriptor::new(kind, oneway))?;
        Ok(Self::new(built, descriptor))
    }

    pub fn tcp(
        addr: IpAddr,
        port: u16,
        bind_device: Option<&str>,
        descriptor: &'static ServiceDescriptor,
    ) -> Result<Arc<Self>, TransportError> {
        Self::tcp_with_direction(addr, port, bind_device, descriptor, false)
    }

    pub fn tcp_oneway(
        addr: IpAddr,
        port: u16,
        bind_device: Option<&str>,
        descriptor: &'static ServiceDescriptor,
    ) -> Result<Arc<Self>, TransportError> {
        Self::tcp_with_direction(addr, port, bind_device, descriptor, true)
    }

    fn tcp_with_direction(
        addr: IpAddr,
        port: u16,
        bind_device: Option<&str>,
        descriptor: &'static ServiceDescriptor,
        oneway: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let kind = TransportKind::Tcp {
            addr,
            port,
            scope_id: 0,
            bind_device: bind_device.map(str::to_string),
        };
        let built = transport::build(TransportDescriptor::new(kind, oneway))?;
        Ok(Self::new(built, descriptor))
    }

    pub fn tipc(
        name_type: u32,
        instance: u32,
        scope: u32,
        descriptor: &'static ServiceDescriptor,
    ) -> Result<Arc<Self>, TransportError> {
        let kind = TransportKind::Tipc {
            name_type,
            instance,
            scope,
        };
        let built = transport::build(TransportDescriptor::new(kind, false))?;
        Ok(Self::new(built, descriptor))
    }

    /// Client paired directly with an in-process server running `service`.
    /// Invokes route into the server's dispatcher without framing.
    pub fn loopback(service: Arc<dyn Service>) -> Result<Arc<Self>, TransportError> {
        let descriptor = service.descriptor();
        let server = Server::loopback(service)?;
        let built = transport::build(TransportDescriptor::new(TransportKind::Loopback, false))?;
        let transport_snapshot = built.descriptor().clone();
        Ok(Arc::new(Self {
            descriptor,
            invoke_lock: Arc::new(Mutex::new(())),
            io: Mutex::new(ClientIo {
                transport: built,
                state: ClientState::Init,
                sa: None,
                derive: None,
                pending_loopback: None,
            }),
            queue: SendQueue::new(),
            filter: QueueFilter::new(descriptor),
            loopback: Some(server),
            transport_snapshot,
        }))
    }

    /// Client whose frames are handed to `send_fn` instead of a socket.
    pub fn forwarding(
        descriptor: &'static ServiceDescriptor,
        send_fn: ForwardingSendFn,
        oneway: bool,
    ) -> Arc<Self> {
        Self::new(Box::new(ForwardingTransport::new(oneway, send_fn)), descriptor)
    }

    /// Install bytes for the next receive on a forwarding client.
    pub async fn forwarding_data_set(&self, data: &[u8]) {
        let mut io = self.io.lock().await;
        if let Some(fwd) = io.transport.as_forwarding() {
            fwd.set_receive_data(data);
        }
    }

    pub fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    /// Structural descriptor of the underlying transport.
    pub fn transport_descriptor(&self) -> &TransportDescriptor {
        &self.transport_snapshot
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback.is_some()
    }

    pub fn filter(&self) -> &QueueFilter {
        &self.filter
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drain this client's send queue.
    pub async fn queue_process_all(self: &Arc<Self>) -> u32 {
        self.queue.process_all().await
    }

    pub async fn state(&self) -> ClientState {
        self.io.lock().await.state
    }

    /// The raw descriptor of the connected socket, for callers that poll
    /// between the echo phases. `None` for socketless transports.
    pub async fn get_socket(&self) -> Option<std::os::fd::RawFd> {
        self.io.lock().await.transport.raw_fd()
    }

    /// Whether the transport's kernel send queue has backed up.
    pub async fn is_congested(&self) -> bool {
        self.io.lock().await.transport.is_congested()
    }

    /// Enable the encrypted envelope with a caller-supplied association and
    /// derivation function. The first send performs the nonce handshake.
    pub async fn crypto_enable(&self, sa: SecurityAssociation, derive: SaDeriveFn) {
        let mut io = self.io.lock().await;
        io.sa = Some(sa);
        io.derive = Some(derive);
    }

    pub async fn crypto_enabled(&self) -> bool {
        self.io.lock().await.sa.is_some()
    }

    pub async fn set_send_timeout(&self, timeout: std::time::Duration) {
        self.io.lock().await.transport.descriptor_mut().send_timeout = Some(timeout);
    }

    pub async fn set_connect_timeout(&self, timeout: std::time::Duration) {
        self.io.lock().await.transport.descriptor_mut().connect_timeout = Some(timeout);
    }

    /// Reconfigure the reply peek timeout. Takes effect on the next peek.
    pub async fn set_receive_timeout(&self, timeout: std::time::Duration) {
        self.io.lock().await.transport.descriptor_mut().peek_timeout = timeout;
    }

    /// Explicitly establish the connection.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut io = self.io.lock().await;
        Self::connect_locked(&mut io).await
    }

    /// Close the connection. The next invoke reconnects.
    pub async fn close(&self) {
        let mut io = self.io.lock().await;
        Self::close_locked(&mut io).await;
    }

    async fn connect_locked(io: &mut ClientIo) -> Result<(), ClientError> {
        if io.transport.is_connected() {
            io.state = ClientState::Connected;
            return Ok(());
        }
        match io.transport.connect().await {
            Ok(()) => {
                io.state = ClientState::Connected;
                Ok(())
            }
            Err(e) => {
                io.state = ClientState::Failed;
                debug!(id = %io.transport.descriptor().id, "connect failed: {e}");
                Err(ClientError::Closed)
            }
        }
    }

    async fn close_locked(io: &mut ClientIo) {
        io.transport.close().await;
        io.state = ClientState::Closed;
        // A fresh connection starts with a fresh handshake.
        if let Some(sa) = io.sa.as_mut() {
            sa.reset();
        }
    }

    /// Send one frame, running the nonce handshake first when the
    /// association is not yet initialised.
    async fn send_frame_locked(io: &mut ClientIo, frame: &[u8]) -> Result<(), ClientError> {
        if io.sa.is_some() {
            let needs_handshake = !io.sa.as_ref().map(|s| s.initialised()).unwrap_or(false);
            if needs_handshake {
                let nonce = crypto::generate_nonce();
                io.transport
                    .send_frame(&crypto::envelope(&nonce))
                    .await?;
                let derive = io.derive.clone();
                let sa = io.sa.as_mut().ok_or(ClientError::Closed)?;
                match derive {
                    Some(derive) => derive(sa, &nonce)?,
                    None => sa.derive_from_nonce(&nonce)?,
                }
                debug!(id = %io.transport.descriptor().id, "crypto handshake sent");
            }
            let sa = io.sa.as_mut().ok_or(ClientError::Closed)?;
            let enveloped = sa.encrypt(frame)?;
            io.transport.send_frame(&enveloped).await?;
        } else {
            io.transport.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Take the invoke mutex as an owned guard, for callers (the composite
    /// client) that split the send and receive phases.
    pub(crate) async fn lock_invoke(&self) -> OwnedMutexGuard<()> {
        self.invoke_lock.clone().lock_owned().await
    }

    /// Send phase of the invoke pipeline. Caller must hold the invoke
    /// mutex.
    pub(crate) async fn invoke_send_locked(
        self: &Arc<Self>,
        method: &str,
        payload: &[u8],
    ) -> Result<SendPhase, ClientError> {
        match self.filter.lookup(method) {
            FilterPolicy::Drop => return Ok(SendPhase::Dropped),
            FilterPolicy::Error => {
                error!(method, service = self.descriptor.name, "no filter entry for method");
                return Err(ClientError::FilterError(method.to_string()));
            }
            FilterPolicy::Queue => {
                let frame =
                    header::pack(MsgType::MethodReq, StatusCode::Unset, Some(method), payload);
                self.queue.push(SendQueueEntry {
                    frame,
                    method: method.to_string(),
                    client: self.clone(),
                    transport: self.transport_snapshot.clone(),
                });
                return Ok(SendPhase::Queued);
            }
            FilterPolicy::Process => {}
        }

        let mut io = self.io.lock().await;

        if let Some(server) = &self.loopback {
            io.state = ClientState::Connected;
            let reply = server.dispatch_local(method, payload).await;
            io.pending_loopback = Some(reply);
            return Ok(SendPhase::Sent);
        }

        Self::connect_locked(&mut io).await?;

        let frame = header::pack(MsgType::MethodReq, StatusCode::Unset, Some(method), payload);
        match Self::send_frame_locked(&mut io, &frame).await {
            Ok(()) => Ok(SendPhase::Sent),
            Err(first) => {
                debug!(id = %io.transport.descriptor().id, "send failed, reconnecting: {first}");
                Self::close_locked(&mut io).await;
                Self::connect_locked(&mut io).await?;
                match Self::send_frame_locked(&mut io, &frame).await {
                    Ok(()) => Ok(SendPhase::Sent),
                    Err(second) => {
                        io.transport.close().await;
                        io.state = ClientState::Failed;
                        debug!(id = %io.transport.descriptor().id, "send retry failed: {second}");
                        Err(ClientError::Closed)
                    }
                }
            }
        }
    }

    /// Receive phase of the invoke pipeline. Caller must hold the invoke
    /// mutex and have completed a successful send phase.
    pub(crate) async fn invoke_recv_locked<O: Message + Default>(
        &self,
    ) -> Result<InvokeReply<O>, ClientError> {
        let mut io = self.io.lock().await;

        if self.loopback.is_some() {
            let (status, body) = io
                .pending_loopback
                .take()
                .unwrap_or((StatusCode::ServiceFailed, Vec::new()));
            return Self::reply_from_status(status, &body);
        }

        if !io.transport.supports_reply() {
            return Ok(InvokeReply::Ok(None));
        }

        let mode = if io.sa.is_some() {
            FrameMode::Encrypted
        } else {
            FrameMode::Plain
        };

        let frame = match io.transport.recv_frame(mode).await {
            RecvOutcome::Frame(bytes) => match mode {
                FrameMode::Plain => bytes,
                FrameMode::Encrypted => {
                    let sa = io.sa.as_mut().ok_or(ClientError::Closed)?;
                    sa.decrypt(&bytes)?
                }
            },
            RecvOutcome::Closed | RecvOutcome::Reset => {
                Self::close_locked(&mut io).await;
                return Err(ClientError::Closed);
            }
            RecvOutcome::TimedOut => {
                Self::close_locked(&mut io).await;
                return Err(ClientError::Transport(TransportError::Io(
                    std::io::ErrorKind::TimedOut.into(),
                )));
            }
            RecvOutcome::Error(e) => {
                Self::close_locked(&mut io).await;
                return Err(ClientError::Transport(TransportError::Io(e)));
            }
        };

        drop(io);
        let (header, body) = Self::split_reply(&frame)?;
        if header.msg_type != MsgType::MethodReply {
            return Err(ClientError::BadStatus(header.status_code));
        }
        Self::reply_from_status(header.status_code, body)
    }

    fn split_reply(frame: &[u8]) -> Result<(Header, &[u8]), ClientError> {
        let header = header::parse(frame).map_err(|e| {
            debug!("reply header unparseable: {e}");
            ClientError::Closed
        })?;
        if frame.len() < header.frame_len() {
            return Err(ClientError::Closed);
        }
        Ok((header, &frame[header.header_length as usize..header.frame_len()]))
    }

    fn reply_from_status<O: Message + Default>(
        status: StatusCode,
        body: &[u8],
    ) -> Result<InvokeReply<O>, ClientError> {
        match status {
            StatusCode::Success => {
                if body.is_empty() {
                    Ok(InvokeReply::Ok(None))
                } else {
                    Ok(InvokeReply::Ok(Some(O::decode(body)?)))
                }
            }
            StatusCode::ServiceQueued => Ok(InvokeReply::Queued),
            StatusCode::ServiceDropped => Ok(InvokeReply::Dropped),
            StatusCode::ServerMethodNotFound => Err(ClientError::MethodNotFound),
            StatusCode::ConnectionClosed | StatusCode::ServerConnReset => Err(ClientError::Closed),
            other => Err(ClientError::BadStatus(other)),
        }
    }

    /// Invoke `method` with `input`, returning the decoded reply.
    ///
    /// For oneway transports the reply is always `Ok(None)`.
    pub async fn invoke<I: Message, O: Message + Default>(
        self: &Arc<Self>,
        method: &str,
        input: &I,
    ) -> Result<InvokeReply<O>, ClientError> {
        let payload = input.encode_to_vec();
        let _guard = self.invoke_lock.lock().await;
        match self.invoke_send_locked(method, &payload).await? {
            SendPhase::Dropped => Ok(InvokeReply::Dropped),
            SendPhase::Queued => Ok(InvokeReply::Queued),
            SendPhase::Sent => self.invoke_recv_locked::<O>().await,
        }
    }

    /// Invoke discarding any reply payload.
    pub async fn invoke_oneway<I: Message>(
        self: &Arc<Self>,
        method: &str,
        input: &I,
    ) -> Result<InvokeReply<crate::proto::Empty>, ClientError> {
        self.invoke::<I, crate::proto::Empty>(method, input).await
    }

    /// Send a raw, already-packed frame with retries. Used by the queue
    /// drain path.
    pub async fn buffer_send_retry(
        &self,
        frame: &[u8],
        method: &str,
        max_tries: u32,
    ) -> Result<(), ClientError> {
        let mut last = ClientError::Closed;
        for attempt in 0..max_tries {
            if attempt > 0 {
                tokio::time::sleep(crate::queue::SEND_RETRY_PAUSE).await;
            }
            let mut io = self.io.lock().await;
            if let Err(e) = Self::connect_locked(&mut io).await {
                last = e;
                continue;
            }
            match Self::send_frame_locked(&mut io, frame).await {
                Ok(()) => {
                    debug!(method, "queued frame delivered");
                    return Ok(());
                }
                Err(e) => {
                    Self::close_locked(&mut io).await;
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// First half of the echo (liveness) protocol.
    pub async fn send_echo_request(&self) -> Result<(), ClientError> {
        let frame = header::pack(MsgType::EchoReq, StatusCode::Unset, None, &[]);
        let mut io = self.io.lock().await;
        Self::connect_locked(&mut io).await?;
        Self::send_frame_locked(&mut io, &frame).await
    }

    /// Second half of the echo protocol: block for the `EchoReply`.
    pub async fn recv_echo_reply(&self) -> Result<(), ClientError> {
        let mut io = self.io.lock().await;
        let mode = if io.sa.is_some() {
            FrameMode::Encrypted
        } else {
            FrameMode::Plain
        };
        let frame = match io.transport.recv_frame(mode).await {
            RecvOutcome::Frame(bytes) => match mode {
                FrameMode::Plain => bytes,
                FrameMode::Encrypted => {
                    let sa = io.sa.as_mut().ok_or(ClientError::Closed)?;
                    sa.decrypt(&bytes)?
                }
            },
            _ => {
                Self::close_locked(&mut io).await;
                return Err(ClientError::Closed);
            }
        };
        let header = header::parse(&frame).map_err(|_| ClientError::Closed)?;
        if header.msg_type == MsgType::EchoReply {
            Ok(())
        } else {
            Err(ClientError::BadStatus(header.status_code))
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.descriptor.name)
            .field("transport", &self.transport_snapshot.id)
            .finish()
    }
}
