//! # Queueing and Filter Engine
//!
//! Both clients and servers run every method through a per-method policy
//! before doing real work: `Process` invokes normally, `Queue` captures the
//! packed frame for later, `Drop` discards it. The policy table is seeded
//! from the service descriptor with every method set to `Process`; looking
//! up a name that was never in the descriptor yields the `Error` policy,
//! which aborts the invoke as a programmer error.
//!
//! Send-queue entries own a copy of the packed bytes and remember which
//! client and transport they came from. Draining retries each entry a fixed
//! number of times with a pause in between; when an entry exhausts its
//! retries the rest of that transport's entries are purged so one dead peer
//! cannot head-of-line block the others.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::client::Client;
use crate::error::ClientError;
use crate::service::ServiceDescriptor;
use crate::transport::TransportDescriptor;

/// Attempts allowed per send-queue entry before its transport is purged.
pub const SEND_RETRY_COUNT: u32 = 10;

/// Pause between send retries.
pub const SEND_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Per-method policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    Process,
    Queue,
    Drop,
    /// Returned by lookups of methods absent from the table.
    Error,
}

/// The per-method policy table.
pub struct QueueFilter {
    map: Mutex<HashMap<String, FilterPolicy>>,
    descriptor: &'static ServiceDescriptor,
}

impl QueueFilter {
    /// Seed the table from the descriptor: every known method processes.
    pub fn new(descriptor: &'static ServiceDescriptor) -> Self {
        let map = descriptor
            .methods
            .iter()
            .map(|m| (m.to_string(), FilterPolicy::Process))
            .collect();
        Self {
            map: Mutex::new(map),
            descriptor,
        }
    }

    pub fn set(&self, method: &str, policy: FilterPolicy) -> Result<(), ClientError> {
        if self.descriptor.method_index(method).is_none() {
            return Err(ClientError::MethodNotFound);
        }
        self.map.lock().insert(method.to_string(), policy);
        Ok(())
    }

    pub fn clear(&self, method: &str) -> Result<(), ClientError> {
        self.set(method, FilterPolicy::Process)
    }

    pub fn set_all(&self, policy: FilterPolicy) {
        let mut map = self.map.lock();
        for method in self.descriptor.methods {
            map.insert(method.to_string(), policy);
        }
    }

    pub fn clear_all(&self) {
        self.set_all(FilterPolicy::Process);
    }

    /// Look a method up. Unknown names yield `Error`.
    pub fn lookup(&self, method: &str) -> FilterPolicy {
        self.map
            .lock()
            .get(method)
            .copied()
            .unwrap_or(FilterPolicy::Error)
    }
}

/// One packed frame waiting to be sent.
pub struct SendQueueEntry {
    pub frame: Vec<u8>,
    pub method: String,
    /// The client the frame will be sent through when drained.
    pub client: Arc<Client>,
    /// Structural snapshot of the target transport, used for purging.
    pub transport: TransportDescriptor,
}

/// FIFO of packed frames awaiting transmission. Pushes go to the head,
/// drains pop from the tail, so entries leave in arrival order.
#[derive(Default)]
pub struct SendQueue {
    inner: Mutex<VecDeque<SendQueueEntry>>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: SendQueueEntry) {
        self.inner.lock().push_front(entry);
    }

    pub fn pop(&self) -> Option<SendQueueEntry> {
        self.inner.lock().pop_back()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Remove every entry bound for the given transport.
    pub fn purge_by_transport(&self, transport: &TransportDescriptor) -> usize {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|e| !e.transport.matches(transport));
        before - queue.len()
    }

    /// Remove entries bound for the given transport and method.
    pub fn purge_by_transport_method(
        &self,
        transport: &TransportDescriptor,
        method: &str,
    ) -> usize {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|e| !(e.transport.matches(transport) && e.method == method));
        before - queue.len()
    }

    /// Drain the queue, oldest entry first.
    ///
    /// Each entry is retried up to [`SEND_RETRY_COUNT`] times with
    /// [`SEND_RETRY_PAUSE`] between attempts. An entry that exhausts its
    /// retries purges the remaining entries of its transport. Returns the
    /// number of entries delivered.
    pub async fn process_all(&self) -> u32 {
        let mut sent = 0;
        while let Some(entry) = self.pop() {
            match entry
                .client
                .buffer_send_retry(&entry.frame, &entry.method, SEND_RETRY_COUNT)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    error!(
                        method = %entry.method,
                        transport = %entry.transport.id,
                        "queued send failed after retries: {e}"
                    );
                    let purged = self.purge_by_transport(&entry.transport);
                    if purged > 0 {
                        debug!(purged, transport = %entry.transport.id, "purged queued entries");
                    }
                }
            }
        }
        sent
    }
}

/// One packed request body captured by a server's receive filter.
pub struct ReceiveQueueEntry {
    pub body: Vec<u8>,
    pub method_index: u32,
    pub method_name: String,
}

/// FIFO of received requests awaiting replay. Same head/tail discipline as
/// the send queue so replay preserves enqueue order.
#[derive(Default)]
pub struct ReceiveQueue {
    inner: Mutex<VecDeque<ReceiveQueueEntry>>,
}

impl ReceiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: ReceiveQueueEntry) {
        self.inner.lock().push_front(entry);
    }

    pub fn pop(&self) -> Option<ReceiveQueueEntry> {
        self.inner.lock().pop_back()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: ServiceDescriptor = ServiceDescriptor {
        name: "cmsg.test",
        methods: &["alpha", "beta"],
    };

    #[test]
    fn filter_defaults_to_process() {
        let filter = QueueFilter::new(&DESC);
        assert_eq!(filter.lookup("alpha"), FilterPolicy::Process);
        assert_eq!(filter.lookup("beta"), FilterPolicy::Process);
    }

    #[test]
    fn unknown_method_lookup_is_error() {
        let filter = QueueFilter::new(&DESC);
        assert_eq!(filter.lookup("gamma"), FilterPolicy::Error);
        assert!(filter.set("gamma", FilterPolicy::Drop).is_err());
    }

    #[test]
    fn set_all_then_clear_restores_process() {
        let filter = QueueFilter::new(&DESC);
        filter.set_all(FilterPolicy::Queue);
        assert_eq!(filter.lookup("alpha"), FilterPolicy::Queue);
        filter.clear("alpha").unwrap();
        assert_eq!(filter.lookup("alpha"), FilterPolicy::Process);
        assert_eq!(filter.lookup("beta"), FilterPolicy::Queue);
        filter.clear_all();
        assert_eq!(filter.lookup("beta"), FilterPolicy::Process);
    }

    #[test]
    fn receive_queue_preserves_enqueue_order() {
        let queue = ReceiveQueue::new();
        for i in 0..3u32 {
            queue.push(ReceiveQueueEntry {
                body: vec![i as u8],
                method_index: i,
                method_name: format!("m{i}"),
            });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().method_index, 0);
        assert_eq!(queue.pop().unwrap().method_index, 1);
        assert_eq!(queue.pop().unwrap().method_index, 2);
    }
}
