//! Server- and client-side queueing through the per-method filters.

mod common;

use anyhow::Result;
use common::{AccumulatorService, U32Msg};

use cmsg::{Client, FilterPolicy, InvokeReply, Server, ServiceDescriptor};

static QUEUE_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-queue-test",
    methods: &[
        "simple_server_queue_test_1",
        "simple_server_queue_test_2",
        "simple_server_queue_test_3",
    ],
};

const ADDR: &str = "127.0.0.1";

#[tokio::test]
async fn server_queues_filtered_method_and_replays() -> Result<()> {
    let service = AccumulatorService::new(&QUEUE_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18901, None, service.clone())?;
    server.start().await?;
    server
        .filter()
        .set("simple_server_queue_test_2", FilterPolicy::Queue)?;

    let client = Client::tcp(ADDR.parse()?, 18901, None, &QUEUE_DESCRIPTOR)?;

    let r1: InvokeReply<cmsg::proto::Empty> = client
        .invoke("simple_server_queue_test_1", &U32Msg { value: 1 })
        .await?;
    assert!(matches!(r1, InvokeReply::Ok(_)));

    let r2: InvokeReply<cmsg::proto::Empty> = client
        .invoke("simple_server_queue_test_2", &U32Msg { value: 2 })
        .await?;
    assert_eq!(r2, InvokeReply::Queued);

    let r3: InvokeReply<cmsg::proto::Empty> = client
        .invoke("simple_server_queue_test_3", &U32Msg { value: 3 })
        .await?;
    assert!(matches!(r3, InvokeReply::Ok(_)));

    // Tests 1 and 3 ran; test 2 sits in the queue.
    assert_eq!(service.total(), 4);
    assert_eq!(server.queue_len(), 1);

    let replayed = server.queue_process_all().await;
    assert_eq!(replayed, 1);
    assert_eq!(service.total(), 6);
    assert_eq!(server.queue_len(), 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn queue_process_some_respects_count_and_order() -> Result<()> {
    let service = AccumulatorService::new(&QUEUE_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18902, None, service.clone())?;
    server.start().await?;
    server.filter().set_all(FilterPolicy::Queue);

    let client = Client::tcp(ADDR.parse()?, 18902, None, &QUEUE_DESCRIPTOR)?;
    for value in [10u32, 20, 30] {
        let reply: InvokeReply<cmsg::proto::Empty> = client
            .invoke("simple_server_queue_test_1", &U32Msg { value })
            .await?;
        assert_eq!(reply, InvokeReply::Queued);
    }
    assert_eq!(server.queue_len(), 3);

    // Replays at most n entries, oldest first.
    assert_eq!(server.queue_process_some(2).await, 2);
    assert_eq!(service.total(), 30);
    assert_eq!(server.queue_len(), 1);

    assert_eq!(server.queue_process_some(5).await, 1);
    assert_eq!(service.total(), 60);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_queue_holds_frames_until_drained() -> Result<()> {
    let service = AccumulatorService::new(&QUEUE_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18903, None, service.clone())?;
    server.start().await?;

    let client = Client::tcp(ADDR.parse()?, 18903, None, &QUEUE_DESCRIPTOR)?;
    client
        .filter()
        .set("simple_server_queue_test_1", FilterPolicy::Queue)?;

    for value in [5u32, 7] {
        let reply: InvokeReply<cmsg::proto::Empty> = client
            .invoke("simple_server_queue_test_1", &U32Msg { value })
            .await?;
        assert_eq!(reply, InvokeReply::Queued);
    }
    assert_eq!(client.queue_len(), 2);
    assert_eq!(service.total(), 0);

    let delivered = client.queue_process_all().await;
    assert_eq!(delivered, 2);
    assert_eq!(client.queue_len(), 0);

    // Queued sends are fire-and-forget; wait for the server to process.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while service.total() != 12 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn drop_all_discards_queued_requests() -> Result<()> {
    let service = AccumulatorService::new(&QUEUE_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18904, None, service.clone())?;
    server.start().await?;
    server.filter().set_all(FilterPolicy::Queue);

    let client = Client::tcp(ADDR.parse()?, 18904, None, &QUEUE_DESCRIPTOR)?;
    let _: InvokeReply<cmsg::proto::Empty> = client
        .invoke("simple_server_queue_test_1", &U32Msg { value: 9 })
        .await?;
    assert_eq!(server.queue_len(), 1);

    server.drop_all_queued();
    assert_eq!(server.queue_len(), 0);
    assert_eq!(server.queue_process_all().await, 0);
    assert_eq!(service.total(), 0);

    server.stop().await;
    Ok(())
}
