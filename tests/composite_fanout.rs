//! Composite fan-out across socket and loopback children.

mod common;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use common::BoolMsg;
use parking_lot::Mutex;
use prost::Message;

use cmsg::{
    Client, CompositeClient, CompositeStatus, FilterPolicy, MethodContext, Server, Service,
    ServiceDescriptor,
};

static FANOUT_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-fanout-test",
    methods: &["notify"],
};

/// Echoes the request and records which instance ran.
struct TracingService {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Service for TracingService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &FANOUT_DESCRIPTOR
    }

    async fn invoke(&self, _method_index: u32, ctx: &mut MethodContext) {
        self.log.lock().push(self.tag);
        match BoolMsg::decode(ctx.payload()) {
            Ok(msg) => ctx.reply(&msg),
            Err(_) => ctx.fail(),
        }
    }
}

fn unix_pair(
    tag: &'static str,
    path_tag: &str,
    log: &Arc<Mutex<Vec<&'static str>>>,
) -> Result<(Arc<Server>, Arc<Client>)> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("cmsg-fanout.{}.{}", std::process::id(), path_tag));
    let kind = cmsg::TransportKind::Unix { path };
    let service = Arc::new(TracingService {
        tag,
        log: log.clone(),
    });
    let server_transport =
        cmsg::transport::build(cmsg::TransportDescriptor::new(kind.clone(), false))?;
    let server = Server::new(server_transport, service);
    let client_transport =
        cmsg::transport::build(cmsg::TransportDescriptor::new(kind, false))?;
    let client = Client::new(client_transport, &FANOUT_DESCRIPTOR);
    Ok((server, client))
}

#[tokio::test]
async fn fan_out_reaches_all_children_with_loopback_last() -> Result<()> {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let (server_a, client_a) = unix_pair("unix-a", "a", &log)?;
    let (server_b, client_b) = unix_pair("unix-b", "b", &log)?;
    server_a.start().await?;
    server_b.start().await?;

    let loopback = Client::loopback(Arc::new(TracingService {
        tag: "loopback",
        log: log.clone(),
    }))?;

    let composite = CompositeClient::new(&FANOUT_DESCRIPTOR);
    // Deliberately added first; the composite must keep it at the tail.
    composite.add_child(loopback).await;
    composite.add_child(client_a).await;
    composite.add_child(client_b).await;

    let children = composite.children().await;
    assert!(children[2].is_loopback());

    let reply = composite
        .invoke::<_, BoolMsg>("notify", &BoolMsg { value: true })
        .await?;

    assert_eq!(reply.worst, CompositeStatus::Ok);
    assert_eq!(reply.replies.len(), 3);
    for r in &reply.replies {
        assert_eq!(r.as_ref().map(|m| m.value), Some(true));
    }

    let executed = log.lock().clone();
    assert_eq!(executed.len(), 3);
    assert!(executed.contains(&"unix-a"));
    assert!(executed.contains(&"unix-b"));
    assert!(executed.contains(&"loopback"));

    server_a.stop().await;
    server_b.stop().await;
    Ok(())
}

#[tokio::test]
async fn dropped_child_degrades_composite_status() -> Result<()> {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (server, client) = unix_pair("unix-c", "c", &log)?;
    server.start().await?;

    let dropper = Client::loopback(Arc::new(TracingService {
        tag: "dropped-loopback",
        log: log.clone(),
    }))?;
    dropper.filter().set("notify", FilterPolicy::Drop)?;

    let composite = CompositeClient::new(&FANOUT_DESCRIPTOR);
    composite.add_child(client).await;
    composite.add_child(dropper).await;

    let reply = composite
        .invoke::<_, BoolMsg>("notify", &BoolMsg { value: true })
        .await?;

    // The socket child replied, the dropped child degraded the status.
    assert_eq!(reply.worst, CompositeStatus::Dropped);
    assert_eq!(reply.replies.len(), 1);
    assert!(!log.lock().contains(&"dropped-loopback"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn lookup_children_by_address() -> Result<()> {
    let composite = CompositeClient::new(&FANOUT_DESCRIPTOR);

    let tcp_child = Client::tcp("10.1.2.3".parse()?, 7000, None, &FANOUT_DESCRIPTOR)?;
    let tipc_child = Client::tipc(18888, 42, 0, &FANOUT_DESCRIPTOR)?;
    composite.add_child(tcp_child.clone()).await;
    composite.add_child(tipc_child).await;

    let by_ip = composite.find_by_ipv4("10.1.2.3".parse()?).await;
    assert!(by_ip.is_some());
    assert!(Arc::ptr_eq(&by_ip.unwrap(), &tcp_child));

    assert!(composite.find_by_tipc_instance(42).await.is_some());
    assert!(composite.find_by_tipc_instance(43).await.is_none());

    let removed = composite
        .remove_child_by_transport(tcp_child.transport_descriptor())
        .await;
    assert!(removed.is_some());
    assert_eq!(composite.child_count().await, 1);
    Ok(())
}
