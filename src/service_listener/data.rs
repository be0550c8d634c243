//! Registry storage for the service-listener daemon.
//!
//! One actor task owns the whole registry: a map from service name to the
//! servers running it and the listeners interested in it. Commands arrive
//! over a channel from the RPC facade, the process watcher and the remote
//! sync layer, so event delivery to any one listener follows the order the
//! daemon observed.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::process_watch::ProcessWatch;
use super::remote_sync::RemoteSync;
use super::{DaemonCmd, EVENTS_DESCRIPTOR};
use crate::client::Client;
use crate::proto::{ListenerInfo, ServerNotification, ServiceInfo, TransportInfo};
use crate::transport::{self, TransportDescriptor};

struct ServerRecord {
    info: ServiceInfo,
    transport: TransportDescriptor,
    remote: bool,
}

struct ListenerRecord {
    id: u64,
    transport: TransportDescriptor,
}

#[derive(Default)]
struct ServiceEntry {
    servers: Vec<ServerRecord>,
    listeners: Vec<ListenerRecord>,
}

pub(crate) struct Registry {
    services: HashMap<String, ServiceEntry>,
    watch: Option<ProcessWatch>,
    sync: Option<RemoteSync>,
}

impl Registry {
    pub(crate) fn new(watch: Option<ProcessWatch>, sync: Option<RemoteSync>) -> Self {
        Self {
            services: HashMap::new(),
            watch,
            sync,
        }
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::Receiver<DaemonCmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                DaemonCmd::AddServer { info, remote } => self.add_server(info, remote).await,
                DaemonCmd::RemoveServer { info, remote } => {
                    self.remove_server(&info, remote).await
                }
                DaemonCmd::AddListener(info) => self.add_listener(info).await,
                DaemonCmd::RemoveListener(info) => self.remove_listener(&info),
                DaemonCmd::AddHost(addr) => self.add_host(addr).await,
                DaemonCmd::PidExited(pid) => self.remove_by_pid(pid).await,
                DaemonCmd::Dump(reply) => {
                    let _ = reply.send(self.dump());
                }
                DaemonCmd::Shutdown => break,
            }
        }
        if let Some(sync) = &self.sync {
            sync.shutdown().await;
        }
        debug!("registry actor finished");
    }

    async fn add_server(&mut self, info: ServiceInfo, remote: bool) {
        let Some(transport) = info
            .server_info
            .as_ref()
            .and_then(TransportInfo::to_descriptor)
        else {
            warn!(service = %info.service, "add_server without usable transport info");
            return;
        };

        // A peer reflecting our own registration back is not news.
        if remote {
            if let Some(sync) = &self.sync {
                if sync.is_local_address(&transport) {
                    return;
                }
            }
        }

        let entry = self.services.entry(info.service.clone()).or_default();
        if entry
            .servers
            .iter()
            .any(|s| s.transport.matches(&transport) && s.info.pid == info.pid)
        {
            debug!(service = %info.service, "server already registered");
            return;
        }

        if !remote {
            if let Some(watch) = &mut self.watch {
                watch.add(info.pid);
            }
        }

        let record = ServerRecord {
            info: info.clone(),
            transport,
            remote,
        };
        entry.servers.push(record);
        debug!(service = %info.service, pid = info.pid, remote, "server added");

        self.notify_listeners(&info.service, "server_added", &info)
            .await;

        if !remote {
            if let Some(sync) = &self.sync {
                sync.fan_add(&info).await;
            }
        }
    }

    async fn remove_server(&mut self, info: &ServiceInfo, remote: bool) {
        let Some(transport) = info
            .server_info
            .as_ref()
            .and_then(TransportInfo::to_descriptor)
        else {
            return;
        };

        let Some(entry) = self.services.get_mut(&info.service) else {
            return;
        };
        let Some(at) = entry
            .servers
            .iter()
            .position(|s| s.transport.matches(&transport))
        else {
            return;
        };
        let record = entry.servers.remove(at);
        debug!(service = %info.service, pid = record.info.pid, "server removed");

        if !record.remote {
            if let Some(watch) = &mut self.watch {
                watch.remove(record.info.pid);
            }
        }

        self.notify_listeners(&info.service, "server_removed", &record.info)
            .await;

        if !remote && !record.remote {
            if let Some(sync) = &self.sync {
                sync.fan_remove(&record.info).await;
            }
        }
    }

    async fn add_listener(&mut self, info: ListenerInfo) {
        let Some(transport) = info
            .transport_info
            .as_ref()
            .and_then(TransportInfo::to_descriptor)
        else {
            warn!(service = %info.service, "add_listener without usable transport info");
            return;
        };

        let record = ListenerRecord {
            id: info.id,
            transport,
        };

        // A listener joining late hears about every server already present.
        let existing: Vec<ServiceInfo> = self
            .services
            .get(&info.service)
            .map(|e| e.servers.iter().map(|s| s.info.clone()).collect())
            .unwrap_or_default();
        for server in &existing {
            if !deliver_event(&record, &info.service, "server_added", server).await {
                warn!(service = %info.service, id = info.id, "listener unreachable, not added");
                return;
            }
        }

        self.services
            .entry(info.service.clone())
            .or_default()
            .listeners
            .push(record);
        debug!(service = %info.service, id = info.id, "listener added");
    }

    fn remove_listener(&mut self, info: &ListenerInfo) {
        let Some(transport) = info
            .transport_info
            .as_ref()
            .and_then(TransportInfo::to_descriptor)
        else {
            return;
        };
        if let Some(entry) = self.services.get_mut(&info.service) {
            entry
                .listeners
                .retain(|l| !(l.id == info.id && l.transport.matches(&transport)));
            debug!(service = %info.service, id = info.id, "listener removed");
        }
    }

    async fn add_host(&mut self, addr: std::net::Ipv4Addr) {
        let Some(sync) = &self.sync else {
            warn!(%addr, "add_host ignored, remote sync not configured");
            return;
        };
        // A new peer starts from a full snapshot of our local servers.
        let snapshot: Vec<ServiceInfo> = self
            .services
            .values()
            .flat_map(|e| e.servers.iter())
            .filter(|s| !s.remote)
            .map(|s| s.info.clone())
            .collect();
        sync.add_host(addr, snapshot).await;
    }

    async fn remove_by_pid(&mut self, pid: u32) {
        let doomed: Vec<ServiceInfo> = self
            .services
            .values()
            .flat_map(|e| e.servers.iter())
            .filter(|s| !s.remote && s.info.pid == pid)
            .map(|s| s.info.clone())
            .collect();
        if doomed.is_empty() {
            return;
        }
        debug!(pid, count = doomed.len(), "removing servers of exited process");
        for info in doomed {
            self.remove_server(&info, false).await;
        }
    }

    /// Fan one event to every listener of `service`. Listeners whose
    /// delivery fails are deleted; they are assumed dead and their process
    /// is garbage collected separately.
    async fn notify_listeners(&mut self, service: &str, method: &str, info: &ServiceInfo) {
        let Some(entry) = self.services.get_mut(service) else {
            return;
        };
        let mut kept = Vec::with_capacity(entry.listeners.len());
        for listener in entry.listeners.drain(..) {
            if deliver_event(&listener, service, method, info).await {
                kept.push(listener);
            } else {
                warn!(service, id = listener.id, "dropping unreachable listener");
            }
        }
        entry.listeners = kept;
    }

    fn dump(&self) -> String {
        #[derive(Serialize)]
        struct ServerDump<'a> {
            transport: &'a str,
            pid: u32,
            remote: bool,
        }

        #[derive(Serialize)]
        struct ListenerDump<'a> {
            id: u64,
            transport: &'a str,
        }

        #[derive(Serialize)]
        struct EntryDump<'a> {
            servers: Vec<ServerDump<'a>>,
            listeners: Vec<ListenerDump<'a>>,
        }

        #[derive(Serialize)]
        struct RegistryDump<'a> {
            services: std::collections::BTreeMap<&'a str, EntryDump<'a>>,
        }

        let services = self
            .services
            .iter()
            .map(|(name, entry)| {
                (
                    name.as_str(),
                    EntryDump {
                        servers: entry
                            .servers
                            .iter()
                            .map(|s| ServerDump {
                                transport: &s.transport.id,
                                pid: s.info.pid,
                                remote: s.remote,
                            })
                            .collect(),
                        listeners: entry
                            .listeners
                            .iter()
                            .map(|l| ListenerDump {
                                id: l.id,
                                transport: &l.transport.id,
                            })
                            .collect(),
                    },
                )
            })
            .collect();

        serde_json::to_string_pretty(&RegistryDump { services }).unwrap_or_default()
    }
}

/// Deliver one event through a short-lived oneway client. Returns false
/// when the listener could not be reached.
async fn deliver_event(
    listener: &ListenerRecord,
    service: &str,
    method: &str,
    info: &ServiceInfo,
) -> bool {
    let notification = ServerNotification {
        service: service.to_string(),
        server_info: info.server_info.clone(),
        listener_id: listener.id,
    };
    let Ok(built) = transport::build(listener.transport.clone()) else {
        return false;
    };
    let client = Client::new(built, &EVENTS_DESCRIPTOR);
    match client.invoke_oneway(method, &notification).await {
        Ok(_) => true,
        Err(e) => {
            debug!(service, method, id = listener.id, "event delivery failed: {e}");
            false
        }
    }
}
