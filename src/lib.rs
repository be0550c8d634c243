//! # CMSG
//!
//! An RPC runtime layered over Protocol Buffers. It provides symmetric
//! client and server endpoints, a publish/subscribe overlay, pluggable
//! transports (UNIX domain, TCP over IPv4/IPv6, TIPC, loopback and
//! caller-supplied forwarding), optional symmetric encryption of the wire
//! stream, per-method queueing with filters, and a companion
//! service-discovery daemon so peers learn about servers coming and going.

pub mod client;
pub mod composite;
pub mod crypto;
pub mod error;
pub mod header;
pub mod proto;
pub mod publisher;
pub mod queue;
pub mod server;
pub mod service;
pub mod service_listener;
pub mod transport;

pub use client::{Client, ClientState, InvokeReply};
pub use composite::{CompositeClient, CompositeReply, CompositeStatus};
pub use crypto::SecurityAssociation;
pub use error::{ClientError, CryptoError, TransportError};
pub use header::{MsgType, StatusCode};
pub use publisher::{PublishOutcome, Publisher, Subscriber};
pub use queue::FilterPolicy;
pub use server::Server;
pub use service::{MethodContext, ProcessingReason, Service, ServiceDescriptor};
pub use transport::{Transport, TransportDescriptor, TransportKind};

/// The current version of the runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
