//! # Publish/Subscribe Overlay
//!
//! A publisher is a composite client whose children are subscribers.
//! Subscribers register per method: they run a small oneway server to
//! receive notifications and carry their subscribe/unsubscribe RPCs on a
//! dedicated admin client pointed at the publisher's subscription service.
//!
//! Publishing consults the publisher's own per-method filter. `Process`
//! delivers to every subscriber of the method immediately; `Queue` packs
//! the notification once and pushes one send-queue entry per subscriber,
//! to be delivered by a later drain. Unsubscribing while entries are
//! queued removes that subscriber's entries by structural transport
//! equality, so a drain after an unsubscribe reaches exactly the remaining
//! subscribers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tracing::{debug, warn};

use crate::client::Client;
use crate::composite::CompositeClient;
use crate::error::{ClientError, TransportError};
use crate::header::{self, MsgType, StatusCode};
use crate::proto::{SubscriptionInfo, TransportInfo};
use crate::queue::{FilterPolicy, QueueFilter, SendQueue, SendQueueEntry};
use crate::server::Server;
use crate::service::{MethodContext, Service, ServiceDescriptor};
use crate::transport::{self, TransportDescriptor, TransportKind};

static SUBSCRIBER_SEQ: AtomicU64 = AtomicU64::new(1);

const SUBSCRIPTION_METHODS: &[&str] = &["subscribe", "unsubscribe", "remove_subscriber"];

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered immediately to this many subscribers.
    Delivered(usize),
    /// One queue entry pushed per subscriber of the method.
    Queued(usize),
    /// Dropped by the publisher's filter.
    Dropped,
}

struct SubscriptionEntry {
    transport: TransportDescriptor,
    methods: HashSet<String>,
}

pub struct Publisher {
    descriptor: &'static ServiceDescriptor,
    composite: CompositeClient,
    subscriptions: tokio::sync::Mutex<Vec<SubscriptionEntry>>,
    queue: SendQueue,
    filter: QueueFilter,
    admin_server: tokio::sync::Mutex<Option<Arc<Server>>>,
}

impl Publisher {
    /// `descriptor` is the notification service the subscribers implement.
    pub fn new(descriptor: &'static ServiceDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            composite: CompositeClient::new(descriptor),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
            queue: SendQueue::new(),
            filter: QueueFilter::new(descriptor),
            admin_server: tokio::sync::Mutex::new(None),
        })
    }

    pub fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    pub fn filter(&self) -> &QueueFilter {
        &self.filter
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.composite.child_count().await
    }

    /// The UNIX path the publisher's subscription service listens on.
    pub fn subscription_service_name(service: &str) -> String {
        format!("{service}.sub")
    }

    /// Start the RPC server that carries subscribe/unsubscribe calls.
    pub async fn start_subscription_server(
        self: &Arc<Self>,
    ) -> Result<(), TransportError> {
        let name: &'static str = Box::leak(
            Self::subscription_service_name(self.descriptor.name).into_boxed_str(),
        );
        let descriptor: &'static ServiceDescriptor = Box::leak(Box::new(ServiceDescriptor {
            name,
            methods: SUBSCRIPTION_METHODS,
        }));
        let service = Arc::new(SubscriptionService {
            publisher: self.clone(),
            descriptor,
        });
        let server = Server::unix(service)?;
        server.start().await?;
        *self.admin_server.lock().await = Some(server);
        Ok(())
    }

    pub async fn stop_subscription_server(&self) {
        if let Some(server) = self.admin_server.lock().await.take() {
            server.stop().await;
        }
    }

    /// Add (or extend) a subscription for the subscriber reachable through
    /// `transport_info`.
    pub async fn subscriber_add(
        &self,
        transport_info: &TransportInfo,
        method: &str,
    ) -> Result<(), ClientError> {
        let descriptor = transport_info
            .to_descriptor()
            .ok_or_else(|| ClientError::FilterError(method.to_string()))?;

        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(entry) = subscriptions
            .iter_mut()
            .find(|e| e.transport.matches(&descriptor))
        {
            entry.methods.insert(method.to_string());
            return Ok(());
        }

        let built = transport::build(descriptor.clone()).map_err(ClientError::Transport)?;
        let client = Client::new(built, self.descriptor);
        self.composite.add_child(client).await;
        let mut methods = HashSet::new();
        methods.insert(method.to_string());
        subscriptions.push(SubscriptionEntry {
            transport: descriptor,
            methods,
        });
        debug!(service = self.descriptor.name, method, "subscriber added");
        Ok(())
    }

    /// Remove one method subscription. Queued notifications bound for the
    /// subscriber and method are purged; the child is detached once its
    /// last method is gone.
    pub async fn subscriber_remove(
        &self,
        transport_info: &TransportInfo,
        method: &str,
    ) -> Result<(), ClientError> {
        let descriptor = transport_info
            .to_descriptor()
            .ok_or_else(|| ClientError::FilterError(method.to_string()))?;

        let mut subscriptions = self.subscriptions.lock().await;
        let Some(at) = subscriptions
            .iter()
            .position(|e| e.transport.matches(&descriptor))
        else {
            return Ok(());
        };

        self.queue.purge_by_transport_method(&descriptor, method);
        subscriptions[at].methods.remove(method);
        if subscriptions[at].methods.is_empty() {
            subscriptions.remove(at);
            self.composite.remove_child_by_transport(&descriptor).await;
            debug!(service = self.descriptor.name, "subscriber removed");
        }
        Ok(())
    }

    /// Drop every subscription of one subscriber, along with its queued
    /// notifications.
    pub async fn remove_subscriber(&self, transport_info: &TransportInfo) {
        let Some(descriptor) = transport_info.to_descriptor() else {
            return;
        };
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|e| !e.transport.matches(&descriptor));
        self.queue.purge_by_transport(&descriptor);
        self.composite.remove_child_by_transport(&descriptor).await;
    }

    /// Publish one notification to every subscriber of `method`.
    pub async fn publish<M: Message>(
        &self,
        method: &str,
        msg: &M,
    ) -> Result<PublishOutcome, ClientError> {
        match self.filter.lookup(method) {
            FilterPolicy::Drop => return Ok(PublishOutcome::Dropped),
            FilterPolicy::Error => {
                warn!(service = self.descriptor.name, method, "no filter entry for method");
                return Err(ClientError::FilterError(method.to_string()));
            }
            FilterPolicy::Queue => {
                // Pack once, one queue entry per subscriber of the method.
                let payload = msg.encode_to_vec();
                let frame =
                    header::pack(MsgType::MethodReq, StatusCode::Unset, Some(method), &payload);
                let subscriptions = self.subscriptions.lock().await;
                let mut queued = 0;
                for entry in subscriptions.iter() {
                    if !entry.methods.contains(method) {
                        continue;
                    }
                    if let Some(client) = self.composite.find_by_transport(&entry.transport).await
                    {
                        self.queue.push(SendQueueEntry {
                            frame: frame.clone(),
                            method: method.to_string(),
                            client,
                            transport: entry.transport.clone(),
                        });
                        queued += 1;
                    }
                }
                return Ok(PublishOutcome::Queued(queued));
            }
            FilterPolicy::Process => {}
        }

        let targets = {
            let subscriptions = self.subscriptions.lock().await;
            let mut targets = Vec::new();
            for entry in subscriptions.iter() {
                if entry.methods.contains(method) {
                    if let Some(client) = self.composite.find_by_transport(&entry.transport).await
                    {
                        targets.push(client);
                    }
                }
            }
            targets
        };

        let mut delivered = 0;
        for client in targets {
            match client.invoke_oneway(method, msg).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!(
                        service = self.descriptor.name,
                        method,
                        subscriber = %client.transport_descriptor().id,
                        "notification delivery failed: {e}"
                    );
                }
            }
        }
        Ok(PublishOutcome::Delivered(delivered))
    }

    /// Drain queued notifications.
    pub async fn queue_process_all(&self) -> u32 {
        self.queue.process_all().await
    }
}

struct SubscriptionService {
    publisher: Arc<Publisher>,
    descriptor: &'static ServiceDescriptor,
}

#[async_trait]
impl Service for SubscriptionService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    async fn invoke(&self, method_index: u32, ctx: &mut MethodContext) {
        let Ok(info) = SubscriptionInfo::decode(ctx.payload()) else {
            ctx.fail();
            return;
        };
        let Some(transport_info) = info.transport_info.as_ref() else {
            ctx.fail();
            return;
        };

        let result = match self.descriptor.method_name(method_index) {
            Some("subscribe") => {
                self.publisher
                    .subscriber_add(transport_info, &info.method_name)
                    .await
            }
            Some("unsubscribe") => {
                self.publisher
                    .subscriber_remove(transport_info, &info.method_name)
                    .await
            }
            Some("remove_subscriber") => {
                self.publisher.remove_subscriber(transport_info).await;
                Ok(())
            }
            _ => {
                ctx.fail();
                return;
            }
        };

        match result {
            Ok(()) => ctx.reply(&crate::proto::Empty {}),
            Err(_) => ctx.fail(),
        }
    }
}

/// The subscriber half: a oneway server receiving notifications plus an
/// admin client for subscription administration.
pub struct Subscriber {
    server: Arc<Server>,
    admin: Arc<Client>,
    service_name: String,
}

impl Subscriber {
    /// `notification_service` handles delivered notifications;
    /// `publisher_service` names the publisher whose subscription service
    /// to administer.
    pub async fn new(
        notification_service: Arc<dyn Service>,
        publisher_service: &str,
    ) -> Result<Self, TransportError> {
        let service_name = notification_service.descriptor().name.to_string();

        // Each subscriber needs its own endpoint; disambiguate the path by
        // pid and sequence so several subscribers can share a host.
        let seq = SUBSCRIBER_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = transport::unix_socket_path(&format!(
            "{}.{}.{}",
            service_name,
            std::process::id(),
            seq
        ));
        let kind = TransportKind::Unix { path };
        let built = transport::build(TransportDescriptor::new(kind, true))?;
        let server = Server::new(built, notification_service);
        server.start().await?;

        let admin_name: &'static str = Box::leak(
            Publisher::subscription_service_name(publisher_service).into_boxed_str(),
        );
        let admin_descriptor: &'static ServiceDescriptor =
            Box::leak(Box::new(ServiceDescriptor {
                name: admin_name,
                methods: SUBSCRIPTION_METHODS,
            }));
        let admin = Client::unix(admin_descriptor)?;

        Ok(Self {
            server,
            admin,
            service_name,
        })
    }

    /// The notification endpoint, as the publisher sees it.
    pub fn transport_info(&self) -> TransportInfo {
        TransportInfo::from_descriptor(self.server.transport_descriptor())
    }

    fn subscription_info(&self, method: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            service: self.service_name.clone(),
            method_name: method.to_string(),
            transport_info: Some(self.transport_info()),
        }
    }

    pub async fn subscribe(&self, method: &str) -> Result<(), ClientError> {
        self.admin
            .invoke_oneway("subscribe", &self.subscription_info(method))
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe(&self, method: &str) -> Result<(), ClientError> {
        self.admin
            .invoke_oneway("unsubscribe", &self.subscription_info(method))
            .await
            .map(|_| ())
    }

    /// Remove every subscription held by this subscriber.
    pub async fn unsubscribe_all(&self) -> Result<(), ClientError> {
        self.admin
            .invoke_oneway("remove_subscriber", &self.subscription_info(""))
            .await
            .map(|_| ())
    }

    pub async fn shutdown(&self) {
        self.server.stop().await;
    }
}
