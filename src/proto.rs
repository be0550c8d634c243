//! Protobuf message types used by the runtime's own services: the
//! service-listener daemon RPC, listener event delivery, remote registry
//! sync and publish/subscribe administration.
//!
//! These are hand-written prost types rather than generated ones so the
//! crate needs no protoc step; the field tags are the wire contract.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use crate::transport::{TransportDescriptor, TransportKind};

/// An empty request or reply body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TransportType {
    Unix = 0,
    Tcp = 1,
    Tipc = 2,
    Loopback = 3,
    Forwarding = 4,
    Broadcast = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TcpInfo {
    #[prost(bool, tag = "1")]
    pub ipv4: bool,
    /// 4 bytes for IPv4, 16 for IPv6, network order.
    #[prost(bytes = "vec", tag = "2")]
    pub addr: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub port: u32,
    #[prost(uint32, tag = "4")]
    pub scope_id: u32,
    #[prost(string, optional, tag = "5")]
    pub bind_device: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnixInfo {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TipcInfo {
    #[prost(uint32, tag = "1")]
    pub name_type: u32,
    #[prost(uint32, tag = "2")]
    pub instance: u32,
    #[prost(uint32, tag = "3")]
    pub scope: u32,
}

/// Serializable form of a transport descriptor, carried in registry and
/// subscription messages. Equality is structural, matching
/// [`TransportDescriptor::matches`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransportInfo {
    #[prost(enumeration = "TransportType", tag = "1")]
    pub kind: i32,
    #[prost(bool, tag = "2")]
    pub oneway: bool,
    #[prost(message, optional, tag = "3")]
    pub tcp: Option<TcpInfo>,
    #[prost(message, optional, tag = "4")]
    pub unix: Option<UnixInfo>,
    #[prost(message, optional, tag = "5")]
    pub tipc: Option<TipcInfo>,
}

impl TransportInfo {
    pub fn from_descriptor(descriptor: &TransportDescriptor) -> Self {
        let mut info = TransportInfo {
            kind: 0,
            oneway: descriptor.oneway,
            tcp: None,
            unix: None,
            tipc: None,
        };
        match &descriptor.kind {
            TransportKind::Unix { path } => {
                info.kind = TransportType::Unix as i32;
                info.unix = Some(UnixInfo {
                    path: path.display().to_string(),
                });
            }
            TransportKind::Tcp {
                addr,
                port,
                scope_id,
                bind_device,
            } => {
                info.kind = TransportType::Tcp as i32;
                info.tcp = Some(TcpInfo {
                    ipv4: addr.is_ipv4(),
                    addr: match addr {
                        IpAddr::V4(v4) => v4.octets().to_vec(),
                        IpAddr::V6(v6) => v6.octets().to_vec(),
                    },
                    port: *port as u32,
                    scope_id: *scope_id,
                    bind_device: bind_device.clone(),
                });
            }
            TransportKind::Tipc {
                name_type,
                instance,
                scope,
            } => {
                info.kind = TransportType::Tipc as i32;
                info.tipc = Some(TipcInfo {
                    name_type: *name_type,
                    instance: *instance,
                    scope: *scope,
                });
            }
            TransportKind::Loopback => info.kind = TransportType::Loopback as i32,
            TransportKind::Forwarding => info.kind = TransportType::Forwarding as i32,
            TransportKind::Broadcast => info.kind = TransportType::Broadcast as i32,
        }
        info
    }

    /// Rebuild the structural descriptor. Returns `None` when the message
    /// is internally inconsistent.
    pub fn to_descriptor(&self) -> Option<TransportDescriptor> {
        let kind = match TransportType::try_from(self.kind).ok()? {
            TransportType::Unix => TransportKind::Unix {
                path: PathBuf::from(&self.unix.as_ref()?.path),
            },
            TransportType::Tcp => {
                let tcp = self.tcp.as_ref()?;
                let addr = if tcp.ipv4 {
                    let octets: [u8; 4] = tcp.addr.as_slice().try_into().ok()?;
                    IpAddr::V4(Ipv4Addr::from(octets))
                } else {
                    let octets: [u8; 16] = tcp.addr.as_slice().try_into().ok()?;
                    IpAddr::V6(Ipv6Addr::from(octets))
                };
                TransportKind::Tcp {
                    addr,
                    port: tcp.port as u16,
                    scope_id: tcp.scope_id,
                    bind_device: tcp.bind_device.clone(),
                }
            }
            TransportType::Tipc => {
                let tipc = self.tipc.as_ref()?;
                TransportKind::Tipc {
                    name_type: tipc.name_type,
                    instance: tipc.instance,
                    scope: tipc.scope,
                }
            }
            TransportType::Loopback => TransportKind::Loopback,
            TransportType::Forwarding => TransportKind::Forwarding,
            TransportType::Broadcast => TransportKind::Broadcast,
        };
        Some(TransportDescriptor::new(kind, self.oneway))
    }
}

/// One running server, as registered with the service listener.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceInfo {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(message, optional, tag = "2")]
    pub server_info: Option<TransportInfo>,
    #[prost(uint32, tag = "3")]
    pub pid: u32,
}

/// A listener registration: where to deliver events and which id the
/// listening process uses to multiplex them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListenerInfo {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(message, optional, tag = "2")]
    pub transport_info: Option<TransportInfo>,
    #[prost(uint64, tag = "3")]
    pub id: u64,
}

/// Body of `server_added`/`server_removed` events sent to listeners.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerNotification {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(message, optional, tag = "2")]
    pub server_info: Option<TransportInfo>,
    #[prost(uint64, tag = "3")]
    pub listener_id: u64,
}

/// Subscription administration body for the publish/subscribe overlay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionInfo {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub method_name: String,
    #[prost(message, optional, tag = "3")]
    pub transport_info: Option<TransportInfo>,
}

/// A peer node address for remote registry sync.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostAddress {
    /// IPv4 address in network order.
    #[prost(fixed32, tag = "1")]
    pub addr: u32,
}

/// Bulk transfer of the local registry to a freshly added peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrySnapshot {
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<ServiceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn transport_info_round_trips_tcp() {
        let descriptor = TransportDescriptor::new(
            TransportKind::Tcp {
                addr: "10.33.0.1".parse().unwrap(),
                port: 18888,
                scope_id: 0,
                bind_device: Some("eth0".into()),
            },
            true,
        );
        let info = TransportInfo::from_descriptor(&descriptor);
        let encoded = info.encode_to_vec();
        let decoded = TransportInfo::decode(encoded.as_slice()).unwrap();
        let rebuilt = decoded.to_descriptor().unwrap();
        assert!(rebuilt.matches(&descriptor));
    }

    #[test]
    fn transport_info_round_trips_unix() {
        let descriptor = TransportDescriptor::new(
            TransportKind::Unix {
                path: "/tmp/cmsg.cmsg-test".into(),
            },
            false,
        );
        let info = TransportInfo::from_descriptor(&descriptor);
        let rebuilt = info.to_descriptor().unwrap();
        assert!(rebuilt.matches(&descriptor));
    }

    #[test]
    fn inconsistent_info_rejected() {
        let info = TransportInfo {
            kind: TransportType::Tcp as i32,
            oneway: false,
            tcp: None,
            unix: None,
            tipc: None,
        };
        assert!(info.to_descriptor().is_none());
    }
}
