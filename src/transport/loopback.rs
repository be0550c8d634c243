//! Loopback transport: a client paired directly with an owning in-process
//! server.
//!
//! Invocations route straight into the server's dispatcher without any
//! framing, so the transport itself never sends or receives bytes. It
//! exists to give loopback clients a descriptor identity (for composite
//! child ordering and structural lookups) and a connected state machine.

use async_trait::async_trait;

use super::{
    FrameMode, PeerAddr, RecvOutcome, Stream, Transport, TransportDescriptor, TransportKind,
};
use crate::error::TransportError;

pub struct LoopbackTransport {
    descriptor: TransportDescriptor,
    connected: bool,
}

impl LoopbackTransport {
    pub fn new(descriptor: TransportDescriptor) -> Self {
        debug_assert!(matches!(descriptor.kind, TransportKind::Loopback));
        Self {
            descriptor,
            connected: false,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut TransportDescriptor {
        &mut self.descriptor
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) {
        self.connected = false;
    }

    async fn send_frame(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        // The client core dispatches loopback invokes directly.
        Err(TransportError::Unsupported)
    }

    async fn recv_frame(&mut self, _mode: FrameMode) -> RecvOutcome {
        RecvOutcome::Closed
    }

    fn peer(&self) -> Option<PeerAddr> {
        Some(PeerAddr::Local)
    }

    async fn accept(&mut self) -> Result<(Stream, PeerAddr), TransportError> {
        Err(TransportError::Unsupported)
    }
}
