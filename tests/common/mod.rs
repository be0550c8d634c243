//! Shared message types and helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;

use cmsg::{MethodContext, Service, ServiceDescriptor};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoolMsg {
    #[prost(bool, tag = "1")]
    pub value: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct U32Msg {
    #[prost(uint32, tag = "1")]
    pub value: u32,
}

/// Echo service: replies with the boolean it was sent.
pub struct EchoBoolService {
    pub descriptor: &'static ServiceDescriptor,
    pub calls: AtomicU32,
}

impl EchoBoolService {
    pub fn new(descriptor: &'static ServiceDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for EchoBoolService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    async fn invoke(&self, _method_index: u32, ctx: &mut MethodContext) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match BoolMsg::decode(ctx.payload()) {
            Ok(msg) => ctx.reply(&msg),
            Err(_) => ctx.fail(),
        }
    }
}

/// Accumulator service: adds each request's value to a running total.
pub struct AccumulatorService {
    pub descriptor: &'static ServiceDescriptor,
    pub total: AtomicU32,
}

impl AccumulatorService {
    pub fn new(descriptor: &'static ServiceDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            total: AtomicU32::new(0),
        })
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for AccumulatorService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    async fn invoke(&self, _method_index: u32, ctx: &mut MethodContext) {
        if let Ok(msg) = U32Msg::decode(ctx.payload()) {
            self.total.fetch_add(msg.value, Ordering::SeqCst);
        }
        ctx.reply(&cmsg::proto::Empty {});
    }
}
