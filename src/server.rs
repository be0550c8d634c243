//! # Server Core
//!
//! A server owns a listening transport, a set of accepted connections and
//! the receive-side queueing state. The accept loop runs as its own task
//! and hands new connections over a channel to the event task, which
//! spawns one handler per connection; shutdown is a watch channel observed
//! at every await point, so a handler can only stop between frames and an
//! accept can only be abandoned cleanly.
//!
//! Per-connection reception:
//!
//! 1. Peek the header under the server peek timeout; `closed`, `reset` and
//!    hard errors close the accepted socket (and discard its security
//!    association).
//! 2. Read the remainder of the frame, decrypting when the connection has
//!    an association.
//! 3. Parse the header and TLV, resolve the method name; an unknown name
//!    is answered with `ServerMethodNotFound`.
//! 4. `MethodReq` consults the receive filter (`drop` answers
//!    `ServiceDropped`, `queue` enqueues and answers `ServiceQueued`),
//!    then dispatches to the implementation. `EchoReq` is answered with an
//!    empty `EchoReply`. `ConnOpen` is a no-op.
//!
//! Queued requests are replayed with [`Server::queue_process_some`] /
//! [`Server::queue_process_all`] in enqueue order; replayed dispatches
//! carry a processing reason that suppresses reply generation, because the
//! original caller already received `ServiceQueued`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::crypto::{SaCreateFn, SaDeriveFn, SecurityAssociation};
use crate::error::TransportError;
use crate::header::{self, MsgType, StatusCode, HEADER_LEN};
use crate::queue::{FilterPolicy, QueueFilter, ReceiveQueue, ReceiveQueueEntry};
use crate::service::{MethodContext, ProcessingReason, Service, ServiceDescriptor};
use crate::transport::{
    self, FrameMode, PeerAddr, RecvOutcome, Stream, Transport, TransportDescriptor,
    TransportKind, SERVER_PEEK_TIMEOUT,
};

/// Caller-supplied hooks for the encrypted envelope.
pub struct ServerCrypto {
    /// Mints an association for a connecting peer; `None` rejects it.
    pub sa_create: SaCreateFn,
    /// Initialises an association's cipher states from the client nonce.
    pub derive: SaDeriveFn,
}

struct ServerInner {
    service: Arc<dyn Service>,
    descriptor: &'static ServiceDescriptor,
    oneway: bool,
    recv_queue: ReceiveQueue,
    filter: QueueFilter,
    crypto: parking_lot::Mutex<Option<Arc<ServerCrypto>>>,
    sa_table: parking_lot::Mutex<HashMap<PeerAddr, SecurityAssociation>>,
    /// Bounds concurrent dispatches for the worker-pool variant.
    dispatch_limit: parking_lot::Mutex<Option<Arc<Semaphore>>>,
    app_owns_all_msgs: AtomicBool,
    transport_snapshot: TransportDescriptor,
}

struct ServerControl {
    transport: Option<Box<dyn Transport>>,
    accept_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

pub struct Server {
    inner: Arc<ServerInner>,
    control: Mutex<ServerControl>,
}

impl Server {
    pub fn new(transport: Box<dyn Transport>, service: Arc<dyn Service>) -> Arc<Self> {
        let descriptor = service.descriptor();
        let transport_snapshot = transport.descriptor().clone();
        let oneway = transport_snapshot.oneway;
        Arc::new(Self {
            inner: Arc::new(ServerInner {
                service,
                descriptor,
                oneway,
                recv_queue: ReceiveQueue::new(),
                filter: QueueFilter::new(descriptor),
                crypto: parking_lot::Mutex::new(None),
                sa_table: parking_lot::Mutex::new(HashMap::new()),
                dispatch_limit: parking_lot::Mutex::new(None),
                app_owns_all_msgs: AtomicBool::new(false),
                transport_snapshot,
            }),
            control: Mutex::new(ServerControl {
                transport: Some(transport),
                accept_task: None,
                event_task: None,
                shutdown: None,
            }),
        })
    }

    /// RPC server on the UNIX socket derived from the service name.
    pub fn unix(service: Arc<dyn Service>) -> Result<Arc<Self>, TransportError> {
        Self::unix_with_direction(service, false)
    }

    pub fn unix_oneway(service: Arc<dyn Service>) -> Result<Arc<Self>, TransportError> {
        Self::unix_with_direction(service, true)
    }

    fn unix_with_direction(
        service: Arc<dyn Service>,
        oneway: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let kind = TransportKind::Unix {
            path: transport::unix_socket_path(service.descriptor().name),
        };
        let built = transport::build(TransportDescriptor::new(kind, oneway))?;
        Ok(Self::new(built, service))
    }

    pub fn tcp(
        addr: IpAddr,
        port: u16,
        bind_device: Option<&str>,
        service: Arc<dyn Service>,
    ) -> Result<Arc<Self>, TransportError> {
        Self::tcp_with_direction(addr, port, bind_device, service, false)
    }

    pub fn tcp_oneway(
        addr: IpAddr,
        port: u16,
        bind_device: Option<&str>,
        service: Arc<dyn Service>,
    ) -> Result<Arc<Self>, TransportError> {
        Self::tcp_with_direction(addr, port, bind_device, service, true)
    }

    fn tcp_with_direction(
        addr: IpAddr,
        port: u16,
        bind_device: Option<&str>,
        service: Arc<dyn Service>,
        oneway: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let kind = TransportKind::Tcp {
            addr,
            port,
            scope_id: 0,
            bind_device: bind_device.map(str::to_string),
        };
        let built = transport::build(TransportDescriptor::new(kind, oneway))?;
        Ok(Self::new(built, service))
    }

    pub fn tipc(
        name_type: u32,
        instance: u32,
        scope: u32,
        service: Arc<dyn Service>,
    ) -> Result<Arc<Self>, TransportError> {
        let kind = TransportKind::Tipc {
            name_type,
            instance,
            scope,
        };
        let built = transport::build(TransportDescriptor::new(kind, false))?;
        Ok(Self::new(built, service))
    }

    /// In-process server reached only through a paired loopback client or
    /// [`Server::receive_forwarded`]. Never listens.
    pub fn loopback(service: Arc<dyn Service>) -> Result<Arc<Self>, TransportError> {
        let built = transport::build(TransportDescriptor::new(TransportKind::Loopback, false))?;
        Ok(Self::new(built, service))
    }

    pub fn descriptor(&self) -> &'static ServiceDescriptor {
        self.inner.descriptor
    }

    /// Structural descriptor of the listening transport.
    pub fn transport_descriptor(&self) -> &TransportDescriptor {
        &self.inner.transport_snapshot
    }

    pub fn filter(&self) -> &QueueFilter {
        &self.inner.filter
    }

    pub fn queue_len(&self) -> usize {
        self.inner.recv_queue.len()
    }

    /// Discard every queued request without replaying it.
    pub fn drop_all_queued(&self) {
        self.inner.recv_queue.clear();
    }

    /// Hand ownership of every received message to the implementation.
    pub fn set_app_owns_all_msgs(&self, owns: bool) {
        self.inner.app_owns_all_msgs.store(owns, Ordering::Relaxed);
    }

    /// Bound concurrent dispatches across connections. One message is read
    /// and dispatched per worker slot; within a connection dispatch stays
    /// serial.
    pub fn set_worker_limit(&self, workers: usize) {
        *self.inner.dispatch_limit.lock() = Some(Arc::new(Semaphore::new(workers)));
    }

    /// Enable the encrypted envelope. Associations are created lazily as
    /// peers connect.
    pub fn crypto_enable(&self, sa_create: SaCreateFn, derive: SaDeriveFn) {
        *self.inner.crypto.lock() = Some(Arc::new(ServerCrypto { sa_create, derive }));
    }

    pub fn crypto_enabled(&self) -> bool {
        self.inner.crypto.lock().is_some()
    }

    /// Bind the listening endpoint and start the accept and event tasks.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut control = self.control.lock().await;
        let mut transport = control.transport.take().ok_or(TransportError::NotConnected)?;
        transport.listen().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (conn_tx, conn_rx) = mpsc::channel::<(Stream, PeerAddr)>(64);

        let accept_shutdown = shutdown_rx.clone();
        let accept_id = transport.descriptor().id.clone();
        control.accept_task = Some(tokio::spawn(accept_loop(
            transport,
            conn_tx,
            accept_shutdown,
            accept_id,
        )));

        let inner = self.inner.clone();
        control.event_task = Some(tokio::spawn(event_loop(inner, conn_rx, shutdown_rx)));
        control.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Signal shutdown and wait for the accept and event tasks to finish.
    /// Connections queued but never claimed are closed by drop.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        if let Some(shutdown) = control.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = control.accept_task.take() {
            let _ = task.await;
        }
        if let Some(task) = control.event_task.take() {
            let _ = task.await;
        }
    }

    /// Dispatch a request directly, bypassing the wire and the receive
    /// filter. The loopback invoke path.
    pub async fn dispatch_local(&self, method: &str, payload: &[u8]) -> (StatusCode, Vec<u8>) {
        match self.inner.descriptor.method_index(method) {
            Some(index) => {
                self.inner
                    .dispatch(index, method, payload.to_vec(), ProcessingReason::Invoke)
                    .await
            }
            None => (StatusCode::ServerMethodNotFound, Vec::new()),
        }
    }

    /// Feed a complete frame delivered by a forwarding medium through the
    /// normal processing path. Returns the packed reply frame, when one is
    /// due.
    pub async fn receive_forwarded(&self, frame: &[u8]) -> Option<Vec<u8>> {
        self.inner.process_frame(frame).await
    }

    /// Replay at most `n` queued requests in enqueue order.
    pub async fn queue_process_some(&self, n: u32) -> u32 {
        let mut processed = 0;
        while processed < n {
            let Some(entry) = self.inner.recv_queue.pop() else {
                break;
            };
            self.replay(entry).await;
            processed += 1;
        }
        processed
    }

    /// Replay every queued request.
    pub async fn queue_process_all(&self) -> u32 {
        let mut processed = 0;
        while let Some(entry) = self.inner.recv_queue.pop() {
            self.replay(entry).await;
            processed += 1;
        }
        processed
    }

    async fn replay(&self, entry: ReceiveQueueEntry) {
        self.inner
            .dispatch(
                entry.method_index,
                &entry.method_name,
                entry.body,
                ProcessingReason::InvokingFromQueue,
            )
            .await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("service", &self.inner.descriptor.name)
            .field("transport", &self.inner.transport_snapshot.id)
            .finish()
    }
}

async fn accept_loop(
    mut transport: Box<dyn Transport>,
    conn_tx: mpsc::Sender<(Stream, PeerAddr)>,
    mut shutdown: watch::Receiver<bool>,
    id: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = transport.accept() => match accepted {
                Ok(conn) => {
                    if conn_tx.send(conn).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(id = %id, "accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    transport.close().await;
    debug!(id = %id, "accept loop finished");
}

async fn event_loop(
    inner: Arc<ServerInner>,
    mut conn_rx: mpsc::Receiver<(Stream, PeerAddr)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            conn = conn_rx.recv() => match conn {
                Some((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        inner.clone(),
                        stream,
                        peer,
                        shutdown.clone(),
                    ));
                }
                None => break,
            },
        }
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    mut stream: Stream,
    peer: PeerAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let crypto = inner.crypto.lock().clone();

    // Associations are created lazily on accept.
    if let Some(crypto) = &crypto {
        match (crypto.sa_create)(&peer) {
            Some(sa) => {
                inner.sa_table.lock().insert(peer.clone(), sa);
            }
            None => {
                warn!(?peer, "security association rejected, dropping connection");
                stream.shutdown().await;
                return;
            }
        }
    }

    let mode = if crypto.is_some() {
        FrameMode::Encrypted
    } else {
        FrameMode::Plain
    };

    loop {
        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            outcome = transport::read_frame(&mut stream, mode, SERVER_PEEK_TIMEOUT) => outcome,
        };

        let received = match outcome {
            RecvOutcome::Frame(bytes) => bytes,
            // Nothing arrived within the peek window; keep waiting.
            RecvOutcome::TimedOut => continue,
            RecvOutcome::Closed | RecvOutcome::Reset => break,
            RecvOutcome::Error(e) => {
                debug!(?peer, "receive error: {e}");
                break;
            }
        };

        let frame = match mode {
            FrameMode::Plain => received,
            FrameMode::Encrypted => {
                match decrypt_or_handshake(&inner, crypto.as_deref(), &peer, received) {
                    Ok(Some(frame)) => frame,
                    // A handshake datagram; nothing further to process.
                    Ok(None) => continue,
                    Err(()) => break,
                }
            }
        };

        if let Some(reply) = inner.process_frame(&frame).await {
            let wire_reply = match mode {
                FrameMode::Plain => reply,
                FrameMode::Encrypted => {
                    let mut table = inner.sa_table.lock();
                    match table.get_mut(&peer).map(|sa| sa.encrypt(&reply)) {
                        Some(Ok(enveloped)) => enveloped,
                        _ => break,
                    }
                }
            };
            if let Err(e) = stream.write_all(&wire_reply).await {
                debug!(?peer, "reply send failed: {e}");
                break;
            }
        }
    }

    stream.shutdown().await;
    inner.sa_table.lock().remove(&peer);
    debug!(?peer, "connection finished");
}

/// Either run the nonce handshake (first datagram of a fresh association)
/// or decrypt a data frame.
fn decrypt_or_handshake(
    inner: &ServerInner,
    crypto: Option<&ServerCrypto>,
    peer: &PeerAddr,
    payload: Vec<u8>,
) -> Result<Option<Vec<u8>>, ()> {
    let crypto = crypto.ok_or(())?;
    let mut table = inner.sa_table.lock();
    let sa = table.get_mut(peer).ok_or(())?;

    if !sa.initialised() {
        if let Err(e) = (crypto.derive)(sa, &payload) {
            warn!(?peer, "nonce derivation failed: {e}");
            return Err(());
        }
        debug!(?peer, "crypto handshake complete");
        return Ok(None);
    }

    match sa.decrypt(&payload) {
        Ok(frame) => Ok(Some(frame)),
        Err(e) => {
            warn!(?peer, "frame decryption failed: {e}");
            Err(())
        }
    }
}

impl ServerInner {
    /// Parse and act on one received frame, returning the reply frame when
    /// one is due.
    async fn process_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let header = match header::parse(frame) {
            Ok(h) => h,
            Err(e) => {
                debug!(service = self.descriptor.name, "bad header: {e}");
                return None;
            }
        };
        if frame.len() < header.frame_len() {
            debug!(service = self.descriptor.name, "frame shorter than header claims");
            return None;
        }
        let extra = &frame[HEADER_LEN..header.header_length as usize];
        let body = &frame[header.header_length as usize..header.frame_len()];

        match header.msg_type {
            MsgType::EchoReq => {
                Some(header::pack(MsgType::EchoReply, StatusCode::Success, None, &[]))
            }
            MsgType::ConnOpen => None,
            MsgType::MethodReq => self.process_request(extra, body).await,
            MsgType::MethodReply | MsgType::EchoReply => {
                debug!(service = self.descriptor.name, "ignoring reply-typed frame");
                None
            }
        }
    }

    async fn process_request(&self, extra: &[u8], body: &[u8]) -> Option<Vec<u8>> {
        let resolution = match header::parse_tlv(extra, self.descriptor) {
            Ok(Some(r)) => r,
            Ok(None) | Err(_) => {
                return self.reply(StatusCode::ServerMethodNotFound, &[]);
            }
        };
        if resolution.is_undefined() {
            debug!(
                service = self.descriptor.name,
                method = %resolution.name,
                "method not found"
            );
            return self.reply(StatusCode::ServerMethodNotFound, &[]);
        }

        match self.filter.lookup(&resolution.name) {
            FilterPolicy::Drop => self.reply(StatusCode::ServiceDropped, &[]),
            FilterPolicy::Queue => {
                self.recv_queue.push(ReceiveQueueEntry {
                    body: body.to_vec(),
                    method_index: resolution.index,
                    method_name: resolution.name,
                });
                self.reply(StatusCode::ServiceQueued, &[])
            }
            // The name resolved against the descriptor, so a missing
            // filter entry can only mean the table was never seeded.
            FilterPolicy::Error => self.reply(StatusCode::ServerMethodNotFound, &[]),
            FilterPolicy::Process => {
                let (status, reply_body) = self
                    .dispatch(
                        resolution.index,
                        &resolution.name,
                        body.to_vec(),
                        ProcessingReason::Invoke,
                    )
                    .await;
                self.reply(status, &reply_body)
            }
        }
    }

    fn reply(&self, status: StatusCode, body: &[u8]) -> Option<Vec<u8>> {
        if self.oneway {
            return None;
        }
        Some(header::pack(MsgType::MethodReply, status, None, body))
    }

    async fn dispatch(
        &self,
        method_index: u32,
        method_name: &str,
        payload: Vec<u8>,
        reason: ProcessingReason,
    ) -> (StatusCode, Vec<u8>) {
        let limit = self.dispatch_limit.lock().clone();
        let _permit = match &limit {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let mut ctx = MethodContext::new(reason, method_index, method_name, payload);
        self.service.invoke(method_index, &mut ctx).await;

        if self.app_owns_all_msgs.load(Ordering::Relaxed) && !ctx.payload_was_taken() {
            debug!(
                service = self.descriptor.name,
                method = method_name,
                "implementation owns messages but did not take this one"
            );
        }
        ctx.into_reply()
    }
}
