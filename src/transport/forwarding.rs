//! Forwarding transport: frames travel through a caller-supplied callback
//! instead of a socket.
//!
//! This lets an application tunnel CMSG over any medium it controls (a
//! management channel, a test harness, another protocol's payload). Sends
//! hand the complete frame to the callback; receives drain an in-memory
//! buffer the caller installs per invocation.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    FrameMode, PeerAddr, RecvOutcome, Stream, Transport, TransportDescriptor, TransportKind,
};
use crate::error::TransportError;
use crate::header::{self, HEADER_LEN};

/// Callback invoked with each complete outgoing frame.
pub type ForwardingSendFn = Arc<dyn Fn(&[u8]) -> std::io::Result<()> + Send + Sync>;

pub struct ForwardingTransport {
    descriptor: TransportDescriptor,
    send_fn: ForwardingSendFn,
    recv_buffer: VecDeque<u8>,
}

impl ForwardingTransport {
    pub fn new(oneway: bool, send_fn: ForwardingSendFn) -> Self {
        Self {
            descriptor: TransportDescriptor::new(TransportKind::Forwarding, oneway),
            send_fn,
            recv_buffer: VecDeque::new(),
        }
    }

    /// Install bytes to be consumed by the next receive. Called by the
    /// application when the tunnelled medium delivers data.
    pub fn set_receive_data(&mut self, data: &[u8]) {
        self.recv_buffer.extend(data.iter().copied());
    }

    /// Replace the send callback, keeping the descriptor identity.
    pub fn set_send_fn(&mut self, send_fn: ForwardingSendFn) {
        self.send_fn = send_fn;
    }

    fn pop_frame(&mut self) -> Option<Vec<u8>> {
        if self.recv_buffer.len() < HEADER_LEN {
            return None;
        }
        let head: Vec<u8> = self.recv_buffer.iter().take(HEADER_LEN).copied().collect();
        let parsed = header::parse(&head).ok()?;
        let total = parsed.frame_len();
        if self.recv_buffer.len() < total {
            return None;
        }
        Some(self.recv_buffer.drain(..total).collect())
    }
}

#[async_trait]
impl Transport for ForwardingTransport {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut TransportDescriptor {
        &mut self.descriptor
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {
        self.recv_buffer.clear();
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        (self.send_fn)(frame).map_err(TransportError::Io)
    }

    async fn recv_frame(&mut self, _mode: FrameMode) -> RecvOutcome {
        match self.pop_frame() {
            Some(frame) => RecvOutcome::Frame(frame),
            None => RecvOutcome::TimedOut,
        }
    }

    fn peer(&self) -> Option<PeerAddr> {
        Some(PeerAddr::Local)
    }

    async fn accept(&mut self) -> Result<(Stream, PeerAddr), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn as_forwarding(&mut self) -> Option<&mut ForwardingTransport> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MsgType, StatusCode};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn send_hands_frame_to_callback() {
        let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut transport = ForwardingTransport::new(
            true,
            Arc::new(move |frame| {
                sink.lock().push(frame.to_vec());
                Ok(())
            }),
        );

        let frame = header::pack(MsgType::MethodReq, StatusCode::Unset, Some("m"), &[1]);
        transport.send_frame(&frame).await.unwrap();
        assert_eq!(captured.lock().as_slice(), &[frame]);
    }

    #[tokio::test]
    async fn recv_drains_installed_buffer_frame_by_frame() {
        let mut transport = ForwardingTransport::new(false, Arc::new(|_| Ok(())));
        let a = header::pack(MsgType::MethodReply, StatusCode::Success, None, &[1, 2]);
        let b = header::pack(MsgType::MethodReply, StatusCode::Success, None, &[3]);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        transport.set_receive_data(&joined);

        match transport.recv_frame(FrameMode::Plain).await {
            RecvOutcome::Frame(frame) => assert_eq!(frame, a),
            other => panic!("unexpected {:?}", other),
        }
        match transport.recv_frame(FrameMode::Plain).await {
            RecvOutcome::Frame(frame) => assert_eq!(frame, b),
            other => panic!("unexpected {:?}", other),
        }
        match transport.recv_frame(FrameMode::Plain).await {
            RecvOutcome::TimedOut => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
