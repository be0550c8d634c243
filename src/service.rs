//! # Service Model
//!
//! A service is a named collection of RPC methods. The descriptor carries
//! the method-name table used to resolve the METHOD TLV into an index; the
//! [`Service`] trait is the seam a server dispatches through.
//!
//! The reply path is an explicit context object rather than a callback
//! pair: the implementation calls [`MethodContext::reply`] (or
//! [`MethodContext::fail`]) and the server turns the recorded outcome into
//! a `MethodReply` frame. When a request is being replayed from the receive
//! queue the original caller has already been answered with
//! `ServiceQueued`, so the context suppresses any further reply.

use async_trait::async_trait;
use prost::Message;

use crate::header::StatusCode;

/// Compile-time description of a service: its name and method table.
///
/// The position of a method name in `methods` is its wire index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub methods: &'static [&'static str],
}

impl ServiceDescriptor {
    /// Resolve a method name to its index. Comparison is byte-exact.
    pub fn method_index(&self, name: &str) -> Option<u32> {
        self.methods
            .iter()
            .position(|m| *m == name)
            .map(|i| i as u32)
    }

    /// Resolve a method index back to its name.
    pub fn method_name(&self, index: u32) -> Option<&'static str> {
        self.methods.get(index as usize).copied()
    }
}

/// Why the dispatcher is running (or not running) an implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingReason {
    /// Normal dispatch of a just-received request
    Invoke,
    /// Replay of a previously queued request; reply generation is suppressed
    InvokingFromQueue,
    /// The request was enqueued instead of dispatched
    Queued,
    /// The request was dropped by filter
    Dropped,
}

/// Per-invocation context handed to the service implementation.
pub struct MethodContext {
    reason: ProcessingReason,
    method_index: u32,
    method_name: String,
    status: StatusCode,
    reply_body: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    payload_taken: bool,
}

impl MethodContext {
    pub(crate) fn new(
        reason: ProcessingReason,
        method_index: u32,
        method_name: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            reason,
            method_index,
            method_name: method_name.to_string(),
            status: StatusCode::Success,
            reply_body: None,
            payload: Some(payload),
            payload_taken: false,
        }
    }

    pub fn reason(&self) -> ProcessingReason {
        self.reason
    }

    pub fn method_index(&self) -> u32 {
        self.method_index
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// The packed request body.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Take ownership of the packed request body.
    ///
    /// After this the server no longer holds the message; the
    /// implementation is responsible for its lifetime. Equivalent to a
    /// server configured to hand all messages over via
    /// [`crate::server::Server::set_app_owns_all_msgs`].
    pub fn take_payload(&mut self) -> Vec<u8> {
        self.payload_taken = true;
        self.payload.take().unwrap_or_default()
    }

    pub(crate) fn payload_was_taken(&self) -> bool {
        self.payload_taken
    }

    /// Record the reply message. A no-op when replaying from the queue,
    /// since the original caller was already answered with `ServiceQueued`.
    pub fn reply<M: Message>(&mut self, msg: &M) {
        if self.reason == ProcessingReason::InvokingFromQueue {
            return;
        }
        self.reply_body = Some(msg.encode_to_vec());
        self.status = StatusCode::Success;
    }

    /// Report an implementation failure. The caller sees `ServiceFailed`
    /// with no body.
    pub fn fail(&mut self) {
        self.status = StatusCode::ServiceFailed;
        self.reply_body = None;
    }

    /// The status and packed reply body recorded by the implementation.
    /// An empty body on `Success` is a valid empty reply.
    pub(crate) fn into_reply(self) -> (StatusCode, Vec<u8>) {
        (self.status, self.reply_body.unwrap_or_default())
    }
}

/// The dispatch seam between a server and the application.
///
/// `invoke` receives the resolved method index, the context carrying the
/// packed request body, and replies through the context. Implementations
/// decode the payload with the prost type they expect for the method.
#[async_trait]
pub trait Service: Send + Sync {
    fn descriptor(&self) -> &'static ServiceDescriptor;

    async fn invoke(&self, method_index: u32, ctx: &mut MethodContext);
}
