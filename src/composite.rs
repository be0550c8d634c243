//! # Composite Client
//!
//! A composite client fans one logical invocation across a list of child
//! clients and rejoins their replies. Sends happen in child-list order and
//! each child's invoke mutex is held from its send until its reply is
//! collected, so per-child ordering matches a plain client exactly.
//!
//! Loopback children are kept at the tail of the list: socket-backed
//! children get their sends onto the wire before any in-process child
//! executes its implementation, which preserves the fan-out latency win.
//!
//! Error aggregation: the worst outcome wins, with transport-level errors
//! beating protocol-level ones (`Err > Dropped > Queued > Ok`). The first
//! error observed is the one reported.

use std::net::Ipv4Addr;
use std::sync::Arc;

use prost::Message;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{Client, InvokeReply, SendPhase};
use crate::error::ClientError;
use crate::service::ServiceDescriptor;
use crate::transport::{TransportDescriptor, TransportKind};

/// Aggregated non-error outcome across children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompositeStatus {
    Ok = 0,
    Queued = 1,
    Dropped = 2,
}

/// Result of a composite invocation: per-child replies in send order plus
/// the worst non-error status observed.
#[derive(Debug)]
pub struct CompositeReply<O> {
    pub worst: CompositeStatus,
    /// One entry per child that completed the call, in child-list order.
    pub replies: Vec<Option<O>>,
}

pub struct CompositeClient {
    descriptor: &'static ServiceDescriptor,
    children: Mutex<Vec<Arc<Client>>>,
}

impl CompositeClient {
    pub fn new(descriptor: &'static ServiceDescriptor) -> Self {
        Self {
            descriptor,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    /// Attach a child. Loopback children stay at the tail so socket
    /// children start their sends first.
    pub async fn add_child(&self, child: Arc<Client>) {
        let mut children = self.children.lock().await;
        if child.is_loopback() {
            children.push(child);
        } else {
            let at = children
                .iter()
                .position(|c| c.is_loopback())
                .unwrap_or(children.len());
            children.insert(at, child);
        }
    }

    /// Detach a child. The child itself is not closed or freed.
    pub async fn remove_child(&self, child: &Arc<Client>) -> bool {
        let mut children = self.children.lock().await;
        let before = children.len();
        children.retain(|c| !Arc::ptr_eq(c, child));
        before != children.len()
    }

    /// Detach the child whose transport structurally matches `transport`.
    pub async fn remove_child_by_transport(
        &self,
        transport: &TransportDescriptor,
    ) -> Option<Arc<Client>> {
        let mut children = self.children.lock().await;
        let at = children
            .iter()
            .position(|c| c.transport_descriptor().matches(transport))?;
        Some(children.remove(at))
    }

    /// Detach every child and hand them back; the full-destroy cascade is
    /// then the caller dropping the returned handles.
    pub async fn take_children(&self) -> Vec<Arc<Client>> {
        std::mem::take(&mut *self.children.lock().await)
    }

    pub async fn child_count(&self) -> usize {
        self.children.lock().await.len()
    }

    pub async fn children(&self) -> Vec<Arc<Client>> {
        self.children.lock().await.clone()
    }

    pub async fn find_by_transport(
        &self,
        transport: &TransportDescriptor,
    ) -> Option<Arc<Client>> {
        self.children
            .lock()
            .await
            .iter()
            .find(|c| c.transport_descriptor().matches(transport))
            .cloned()
    }

    pub async fn find_by_tipc_instance(&self, instance: u32) -> Option<Arc<Client>> {
        self.children
            .lock()
            .await
            .iter()
            .find(|c| {
                matches!(
                    c.transport_descriptor().kind,
                    TransportKind::Tipc { instance: i, .. } if i == instance
                )
            })
            .cloned()
    }

    pub async fn find_by_ipv4(&self, addr: Ipv4Addr) -> Option<Arc<Client>> {
        self.children
            .lock()
            .await
            .iter()
            .find(|c| {
                matches!(
                    c.transport_descriptor().kind,
                    TransportKind::Tcp { addr: a, .. } if a == std::net::IpAddr::V4(addr)
                )
            })
            .cloned()
    }

    /// Fan `method` out to every child and collect the replies.
    pub async fn invoke<I: Message, O: Message + Default>(
        &self,
        method: &str,
        input: &I,
    ) -> Result<CompositeReply<O>, ClientError> {
        let children = self.children.lock().await;
        let payload = input.encode_to_vec();

        let mut awaiting = Vec::with_capacity(children.len());
        let mut worst = CompositeStatus::Ok;
        let mut first_error: Option<ClientError> = None;

        // Send phase: every child's send goes out before any reply is
        // collected. Invoke mutexes of successfully-sent children stay held
        // until their reply is read.
        for child in children.iter() {
            let guard = child.lock_invoke().await;
            match child.invoke_send_locked(method, &payload).await {
                Ok(SendPhase::Sent) => awaiting.push((child.clone(), guard)),
                Ok(SendPhase::Queued) => {
                    worst = worst.max(CompositeStatus::Queued);
                }
                Ok(SendPhase::Dropped) => {
                    worst = worst.max(CompositeStatus::Dropped);
                }
                Err(e) => {
                    debug!(method, child = %child.transport_descriptor().id, "send failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Receive phase, in send order.
        let mut replies = Vec::with_capacity(awaiting.len());
        for (child, guard) in awaiting {
            match child.invoke_recv_locked::<O>().await {
                Ok(InvokeReply::Ok(reply)) => replies.push(reply),
                Ok(InvokeReply::Queued) => {
                    worst = worst.max(CompositeStatus::Queued);
                }
                Ok(InvokeReply::Dropped) => {
                    worst = worst.max(CompositeStatus::Dropped);
                }
                Err(e) => {
                    debug!(method, child = %child.transport_descriptor().id, "recv failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
            drop(guard);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(CompositeReply { worst, replies }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportDescriptor;

    const DESC: ServiceDescriptor = ServiceDescriptor {
        name: "cmsg.test",
        methods: &["m"],
    };

    fn socket_child() -> Arc<Client> {
        let kind = TransportKind::Tcp {
            addr: "127.0.0.1".parse().unwrap(),
            port: 1,
            scope_id: 0,
            bind_device: None,
        };
        let transport = crate::transport::build(TransportDescriptor::new(kind, true)).unwrap();
        Client::new(transport, &DESC)
    }

    struct NoopService;

    #[async_trait::async_trait]
    impl crate::service::Service for NoopService {
        fn descriptor(&self) -> &'static ServiceDescriptor {
            &DESC
        }

        async fn invoke(&self, _method_index: u32, _ctx: &mut crate::service::MethodContext) {}
    }

    #[tokio::test]
    async fn loopback_children_stay_at_tail() {
        let composite = CompositeClient::new(&DESC);
        let loopback = Client::loopback(Arc::new(NoopService)).unwrap();
        composite.add_child(loopback).await;
        composite.add_child(socket_child()).await;
        composite.add_child(socket_child()).await;

        let children = composite.children().await;
        assert_eq!(children.len(), 3);
        assert!(!children[0].is_loopback());
        assert!(!children[1].is_loopback());
        assert!(children[2].is_loopback());
    }

    #[tokio::test]
    async fn remove_by_structural_transport() {
        let composite = CompositeClient::new(&DESC);
        let child = socket_child();
        let snapshot = child.transport_descriptor().clone();
        composite.add_child(child).await;
        assert_eq!(composite.child_count().await, 1);

        let removed = composite.remove_child_by_transport(&snapshot).await;
        assert!(removed.is_some());
        assert_eq!(composite.child_count().await, 0);
    }

    #[tokio::test]
    async fn status_precedence_orders_correctly() {
        assert!(CompositeStatus::Dropped > CompositeStatus::Queued);
        assert!(CompositeStatus::Queued > CompositeStatus::Ok);
    }
}
