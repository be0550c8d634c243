//! # Service Listener
//!
//! A small discovery daemon (`cmsg-sld`) plus the client API that talks to
//! it. Servers register themselves as they start and unregister as they
//! stop; listeners subscribe to a service name and receive
//! `server_added`/`server_removed` events. Dead publishers are garbage
//! collected by process watching (pidfd when the kernel supports it,
//! netlink connector otherwise), and daemons on different nodes mirror
//! each other's registries over TCP.
//!
//! The daemon's registry is owned by a single actor task; the RPC service
//! implementations only forward commands over a channel, so the registry
//! itself needs no locking and listeners observe events in the order the
//! daemon processed them.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::proto::{HostAddress, ListenerInfo, ServiceInfo};
use crate::server::Server;
use crate::service::{MethodContext, Service, ServiceDescriptor};

pub mod api;
pub mod data;
pub mod netlink;
pub mod process_watch;
pub mod remote_sync;

pub use api::{listen, register_server, unregister_server, ListenHandle, ServiceEvent};

/// The daemon's UNIX-socket RPC surface.
pub static CONFIGURATION_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-sld.configuration",
    methods: &[
        "add_server",
        "remove_server",
        "add_listener",
        "remove_listener",
        "add_host",
    ],
};

/// The oneway event service every listener hosts.
pub static EVENTS_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-sld.events",
    methods: &["server_added", "server_removed"],
};

/// Commands processed by the registry actor.
pub(crate) enum DaemonCmd {
    AddServer { info: ServiceInfo, remote: bool },
    RemoveServer { info: ServiceInfo, remote: bool },
    AddListener(ListenerInfo),
    RemoveListener(ListenerInfo),
    AddHost(Ipv4Addr),
    PidExited(u32),
    Dump(oneshot::Sender<String>),
    /// Stop the registry actor. Senders are held by long-lived watch
    /// tasks, so channel closure alone cannot end the loop.
    Shutdown,
}

pub struct DaemonOptions {
    /// Address remote peers can reach this node on. Enables remote sync.
    pub local_addr: Option<Ipv4Addr>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self { local_addr: None }
    }
}

/// A running service-listener daemon.
pub struct Daemon {
    cmd_tx: mpsc::Sender<DaemonCmd>,
    config_server: Arc<Server>,
    actor: JoinHandle<()>,
    netlink_task: Option<JoinHandle<()>>,
}

impl Daemon {
    pub async fn start(options: DaemonOptions) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let sync = match options.local_addr {
            Some(addr) => {
                let sync = remote_sync::RemoteSync::start(addr, cmd_tx.clone()).await?;
                info!(%addr, "remote registry sync enabled");
                Some(sync)
            }
            None => None,
        };

        // Pick the process-watch capability once at startup.
        let (watch, netlink_task) = if process_watch::pidfd_supported() {
            debug!("process watching via pidfd");
            (
                Some(process_watch::ProcessWatch::new(cmd_tx.clone())),
                None,
            )
        } else {
            debug!("pidfd unavailable, falling back to netlink connector");
            let task = netlink::spawn_exit_watch(cmd_tx.clone())
                .map_err(|e| {
                    warn!("netlink connector unavailable: {e}");
                    e
                })
                .ok();
            (None, task)
        };

        let actor = tokio::spawn(data::Registry::new(watch, sync).run(cmd_rx));

        let config_server = Server::unix(Arc::new(ConfigurationService {
            cmd_tx: cmd_tx.clone(),
        }))?;
        config_server.start().await?;
        info!("service listener ready");

        Ok(Self {
            cmd_tx,
            config_server,
            actor,
            netlink_task,
        })
    }

    /// Mirror registries with the daemon running at `addr`.
    pub async fn add_host(&self, addr: Ipv4Addr) {
        let _ = self.cmd_tx.send(DaemonCmd::AddHost(addr)).await;
    }

    /// Render the registry for the debug dump file.
    pub async fn dump(&self) -> String {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(DaemonCmd::Dump(tx)).await.is_err() {
            return String::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(self) {
        self.config_server.stop().await;
        if let Some(task) = self.netlink_task {
            task.abort();
        }
        let _ = self.cmd_tx.send(DaemonCmd::Shutdown).await;
        let _ = self.actor.await;
    }
}

/// RPC facade over the actor channel.
struct ConfigurationService {
    cmd_tx: mpsc::Sender<DaemonCmd>,
}

#[async_trait]
impl Service for ConfigurationService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &CONFIGURATION_DESCRIPTOR
    }

    async fn invoke(&self, method_index: u32, ctx: &mut MethodContext) {
        let cmd = match CONFIGURATION_DESCRIPTOR.method_name(method_index) {
            Some("add_server") => match ServiceInfo::decode(ctx.payload()) {
                Ok(info) => DaemonCmd::AddServer {
                    info,
                    remote: false,
                },
                Err(_) => return ctx.fail(),
            },
            Some("remove_server") => match ServiceInfo::decode(ctx.payload()) {
                Ok(info) => DaemonCmd::RemoveServer {
                    info,
                    remote: false,
                },
                Err(_) => return ctx.fail(),
            },
            Some("add_listener") => match ListenerInfo::decode(ctx.payload()) {
                Ok(info) => DaemonCmd::AddListener(info),
                Err(_) => return ctx.fail(),
            },
            Some("remove_listener") => match ListenerInfo::decode(ctx.payload()) {
                Ok(info) => DaemonCmd::RemoveListener(info),
                Err(_) => return ctx.fail(),
            },
            Some("add_host") => match HostAddress::decode(ctx.payload()) {
                Ok(host) => DaemonCmd::AddHost(Ipv4Addr::from(host.addr)),
                Err(_) => return ctx.fail(),
            },
            _ => return ctx.fail(),
        };

        if self.cmd_tx.send(cmd).await.is_err() {
            ctx.fail();
            return;
        }
        ctx.reply(&crate::proto::Empty {});
    }
}
