//! Client-side API to the service-listener daemon.
//!
//! Registration is fire-and-forget over a short-lived oneway UNIX client.
//! Listening spins up a small oneway event server whose implementation
//! feeds an in-process channel; the caller consumes [`ServiceEvent`]s from
//! the returned handle, or lets [`ListenHandle::run`] drive a handler that
//! can return `false` to unlisten.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::mpsc;
use tracing::debug;

use super::{CONFIGURATION_DESCRIPTOR, EVENTS_DESCRIPTOR};
use crate::client::Client;
use crate::error::ClientError;
use crate::proto::{ListenerInfo, ServerNotification, ServiceInfo, TransportInfo};
use crate::server::Server;
use crate::service::{MethodContext, Service, ServiceDescriptor};
use crate::transport::{self, TransportDescriptor, TransportKind};

static LISTENER_SEQ: AtomicU64 = AtomicU64::new(1);

/// A server came or went for the listened-to service.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Added(TransportInfo),
    Removed(TransportInfo),
}

fn service_info_for(server: &Server) -> ServiceInfo {
    ServiceInfo {
        service: server.descriptor().name.to_string(),
        server_info: Some(TransportInfo::from_descriptor(server.transport_descriptor())),
        pid: std::process::id(),
    }
}

/// Tell the daemon a server is up.
pub async fn register_server(server: &Server) -> Result<(), ClientError> {
    let client = Client::unix_oneway(&CONFIGURATION_DESCRIPTOR)?;
    client
        .invoke_oneway("add_server", &service_info_for(server))
        .await
        .map(|_| ())
}

/// Tell the daemon a server is going away.
pub async fn unregister_server(server: &Server) -> Result<(), ClientError> {
    let client = Client::unix_oneway(&CONFIGURATION_DESCRIPTOR)?;
    client
        .invoke_oneway("remove_server", &service_info_for(server))
        .await
        .map(|_| ())
}

/// Event server implementation: forwards daemon events into the channel.
struct EventsService {
    tx: mpsc::Sender<ServiceEvent>,
}

#[async_trait]
impl Service for EventsService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &EVENTS_DESCRIPTOR
    }

    async fn invoke(&self, method_index: u32, ctx: &mut MethodContext) {
        let Ok(notification) = ServerNotification::decode(ctx.payload()) else {
            return;
        };
        let Some(info) = notification.server_info else {
            return;
        };
        let event = match EVENTS_DESCRIPTOR.method_name(method_index) {
            Some("server_added") => ServiceEvent::Added(info),
            Some("server_removed") => ServiceEvent::Removed(info),
            _ => return,
        };
        let _ = self.tx.send(event).await;
    }
}

/// A live listener registration.
pub struct ListenHandle {
    service: String,
    listener_id: u64,
    events_server: Arc<Server>,
    events_rx: mpsc::Receiver<ServiceEvent>,
}

impl ListenHandle {
    /// The next event, in the order the daemon observed them.
    pub async fn next(&mut self) -> Option<ServiceEvent> {
        self.events_rx.recv().await
    }

    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Drive `handler` until it returns `false`, then unlisten.
    pub async fn run<F>(mut self, mut handler: F) -> Result<(), ClientError>
    where
        F: FnMut(ServiceEvent) -> bool + Send,
    {
        while let Some(event) = self.next().await {
            if !handler(event) {
                break;
            }
        }
        self.unlisten().await
    }

    /// Deregister from the daemon and stop the event server.
    pub async fn unlisten(self) -> Result<(), ClientError> {
        let info = ListenerInfo {
            service: self.service.clone(),
            transport_info: Some(TransportInfo::from_descriptor(
                self.events_server.transport_descriptor(),
            )),
            id: self.listener_id,
        };
        let result = match Client::unix_oneway(&CONFIGURATION_DESCRIPTOR) {
            Ok(client) => client
                .invoke_oneway("remove_listener", &info)
                .await
                .map(|_| ()),
            Err(e) => Err(ClientError::Transport(e)),
        };
        self.events_server.stop().await;
        debug!(service = %self.service, id = self.listener_id, "unlistened");
        result
    }
}

/// Register interest in `service` with the daemon.
///
/// Any servers already registered are replayed as `Added` events before
/// this returns a handle.
pub async fn listen(service: &str) -> Result<ListenHandle, ClientError> {
    let listener_id = LISTENER_SEQ.fetch_add(1, Ordering::Relaxed);
    let (tx, events_rx) = mpsc::channel(64);

    // Each listener hosts its own oneway event endpoint.
    let path = transport::unix_socket_path(&format!(
        "{}.{}.{}",
        EVENTS_DESCRIPTOR.name,
        std::process::id(),
        listener_id
    ));
    let built = transport::build(TransportDescriptor::new(
        TransportKind::Unix { path },
        true,
    ))?;
    let events_server = Server::new(built, Arc::new(EventsService { tx }));
    events_server.start().await.map_err(ClientError::Transport)?;

    let info = ListenerInfo {
        service: service.to_string(),
        transport_info: Some(TransportInfo::from_descriptor(
            events_server.transport_descriptor(),
        )),
        id: listener_id,
    };
    let client = Client::unix_oneway(&CONFIGURATION_DESCRIPTOR)?;
    if let Err(e) = client.invoke_oneway("add_listener", &info).await {
        events_server.stop().await;
        return Err(e);
    }

    debug!(service, id = listener_id, "listening for service events");
    Ok(ListenHandle {
        service: service.to_string(),
        listener_id,
        events_server,
        events_rx,
    })
}
