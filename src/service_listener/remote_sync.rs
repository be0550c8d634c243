//! Remote registry sync.
//!
//! Daemons on different nodes mirror each other's server registries. With
//! a local address configured the daemon runs a TCP sync server and a
//! composite client with one child per peer. Local registrations fan out
//! to every peer as they happen; a freshly added peer receives a bulk
//! snapshot of the local registry first. Entries learned from a peer are
//! flagged remote so they are never re-sent.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::DaemonCmd;
use crate::client::Client;
use crate::composite::CompositeClient;
use crate::error::TransportError;
use crate::proto::{RegistrySnapshot, ServiceInfo};
use crate::server::Server;
use crate::service::{MethodContext, Service, ServiceDescriptor};
use crate::transport::{TransportDescriptor, TransportKind};

/// TCP port the sync servers listen on.
pub const REMOTE_SYNC_PORT: u16 = 18232;

pub static REMOTE_SYNC_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-sld.remote-sync",
    methods: &["sync_server_added", "sync_server_removed", "bulk_sync"],
};

pub(crate) struct RemoteSync {
    local_addr: Ipv4Addr,
    peers: CompositeClient,
    server: Arc<Server>,
}

impl RemoteSync {
    pub(crate) async fn start(
        local_addr: Ipv4Addr,
        cmd_tx: mpsc::Sender<DaemonCmd>,
    ) -> Result<Self, TransportError> {
        let server = Server::tcp_oneway(
            IpAddr::V4(local_addr),
            REMOTE_SYNC_PORT,
            None,
            Arc::new(SyncService { cmd_tx }),
        )?;
        server.start().await?;
        Ok(Self {
            local_addr,
            peers: CompositeClient::new(&REMOTE_SYNC_DESCRIPTOR),
            server,
        })
    }

    /// Whether a registration's transport points back at this node.
    pub(crate) fn is_local_address(&self, transport: &TransportDescriptor) -> bool {
        matches!(
            transport.kind,
            TransportKind::Tcp { addr, .. } if addr == IpAddr::V4(self.local_addr)
        )
    }

    /// Connect to a new peer and bulk-send the local registry.
    pub(crate) async fn add_host(&self, addr: Ipv4Addr, snapshot: Vec<ServiceInfo>) {
        if addr == self.local_addr {
            return;
        }
        if self
            .peers
            .find_by_ipv4(addr)
            .await
            .is_some()
        {
            debug!(%addr, "peer already known");
            return;
        }
        let client = match Client::tcp_oneway(
            IpAddr::V4(addr),
            REMOTE_SYNC_PORT,
            None,
            &REMOTE_SYNC_DESCRIPTOR,
        ) {
            Ok(client) => client,
            Err(e) => {
                warn!(%addr, "cannot create sync client: {e}");
                return;
            }
        };

        let count = snapshot.len();
        if let Err(e) = client
            .invoke_oneway("bulk_sync", &RegistrySnapshot { servers: snapshot })
            .await
        {
            warn!(%addr, "bulk sync failed: {e}");
            return;
        }
        debug!(%addr, count, "bulk sync sent");
        self.peers.add_child(client).await;
    }

    pub(crate) async fn fan_add(&self, info: &ServiceInfo) {
        self.fan("sync_server_added", info).await;
    }

    pub(crate) async fn fan_remove(&self, info: &ServiceInfo) {
        self.fan("sync_server_removed", info).await;
    }

    async fn fan(&self, method: &str, info: &ServiceInfo) {
        if let Err(e) = self.peers.invoke::<_, crate::proto::Empty>(method, info).await {
            // Peer loss is routine in a cluster; the event is not retried.
            debug!(method, "sync fan-out incomplete: {e}");
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.server.stop().await;
    }
}

/// Receives peer events and forwards them to the registry actor with the
/// remote flag set.
struct SyncService {
    cmd_tx: mpsc::Sender<DaemonCmd>,
}

#[async_trait]
impl Service for SyncService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &REMOTE_SYNC_DESCRIPTOR
    }

    async fn invoke(&self, method_index: u32, ctx: &mut MethodContext) {
        match REMOTE_SYNC_DESCRIPTOR.method_name(method_index) {
            Some("sync_server_added") => {
                if let Ok(info) = ServiceInfo::decode(ctx.payload()) {
                    let _ = self
                        .cmd_tx
                        .send(DaemonCmd::AddServer { info, remote: true })
                        .await;
                }
            }
            Some("sync_server_removed") => {
                if let Ok(info) = ServiceInfo::decode(ctx.payload()) {
                    let _ = self
                        .cmd_tx
                        .send(DaemonCmd::RemoveServer { info, remote: true })
                        .await;
                }
            }
            Some("bulk_sync") => {
                if let Ok(snapshot) = RegistrySnapshot::decode(ctx.payload()) {
                    for info in snapshot.servers {
                        let _ = self
                            .cmd_tx
                            .send(DaemonCmd::AddServer { info, remote: true })
                            .await;
                    }
                }
            }
            _ => {}
        }
    }
}
