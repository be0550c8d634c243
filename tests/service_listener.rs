//! Service-listener daemon: registration, event delivery, late join.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::EchoBoolService;
use tokio::time::timeout;

use cmsg::service_listener::{self, Daemon, DaemonOptions, ServiceEvent};
use cmsg::{Server, ServiceDescriptor};

static WATCHED_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg.test",
    methods: &["simple_rpc_test"],
};

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// All daemon interactions share one UNIX socket path, so the scenarios
/// run under a single test body.
#[tokio::test]
async fn daemon_delivers_server_lifecycle_events() -> Result<()> {
    let daemon = Daemon::start(DaemonOptions::default()).await?;

    // Early listener: subscribed before any server exists.
    let mut early = service_listener::listen(WATCHED_DESCRIPTOR.name).await?;

    let service = EchoBoolService::new(&WATCHED_DESCRIPTOR);
    let server = Server::unix(service)?;
    server.start().await?;
    service_listener::register_server(&server).await?;

    match timeout(EVENT_WAIT, early.next()).await? {
        Some(ServiceEvent::Added(info)) => {
            let descriptor = info.to_descriptor().expect("transport info");
            assert!(descriptor.matches(server.transport_descriptor()));
        }
        other => panic!("expected Added, got {:?}", other),
    }

    // Late joiner: the existing server is replayed as one Added event.
    let mut late = service_listener::listen(WATCHED_DESCRIPTOR.name).await?;
    match timeout(EVENT_WAIT, late.next()).await? {
        Some(ServiceEvent::Added(_)) => {}
        other => panic!("expected replayed Added, got {:?}", other),
    }

    // Destroying the server produces exactly one Removed event per
    // listener.
    service_listener::unregister_server(&server).await?;
    server.stop().await;

    match timeout(EVENT_WAIT, early.next()).await? {
        Some(ServiceEvent::Removed(_)) => {}
        other => panic!("expected Removed, got {:?}", other),
    }
    match timeout(EVENT_WAIT, late.next()).await? {
        Some(ServiceEvent::Removed(_)) => {}
        other => panic!("expected Removed, got {:?}", other),
    }

    // No stray duplicates queued behind the expected events.
    assert!(timeout(Duration::from_millis(300), early.next()).await.is_err());

    early.unlisten().await?;
    late.unlisten().await?;

    // After unlistening, further registrations reach nobody; the dump
    // reflects an empty listener set.
    let dump = daemon.dump().await;
    assert!(dump.contains("services"));

    daemon.shutdown().await;
    Ok(())
}
