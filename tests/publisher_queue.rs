//! Publisher queueing and unsubscription while notifications are queued.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::BoolMsg;
use prost::Message;

use cmsg::{
    FilterPolicy, MethodContext, PublishOutcome, Publisher, Service, ServiceDescriptor,
    Subscriber,
};

static NOTIFY_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-publish-test",
    methods: &["state_changed", "config_changed"],
};

// Separate service for the filter test so the two tests' subscription
// servers never share a socket path.
static FILTERED_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-publish-filter-test",
    methods: &["state_changed", "config_changed"],
};

struct CountingSubscriber {
    descriptor: &'static ServiceDescriptor,
    deliveries: AtomicU32,
}

#[async_trait]
impl Service for CountingSubscriber {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        self.descriptor
    }

    async fn invoke(&self, _method_index: u32, ctx: &mut MethodContext) {
        if BoolMsg::decode(ctx.payload()).is_ok() {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn wait_for(count: &AtomicU32, expected: u32) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while count.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn unsubscribe_during_queue_prunes_entries() -> Result<()> {
    let publisher = Publisher::new(&NOTIFY_DESCRIPTOR);
    publisher.start_subscription_server().await?;
    publisher.filter().set_all(FilterPolicy::Queue);

    let mut subscribers = Vec::new();
    let mut impls = Vec::new();
    for _ in 0..3 {
        let service = Arc::new(CountingSubscriber {
            descriptor: &NOTIFY_DESCRIPTOR,
            deliveries: AtomicU32::new(0),
        });
        let subscriber =
            Subscriber::new(service.clone(), NOTIFY_DESCRIPTOR.name).await?;
        subscriber.subscribe("state_changed").await?;
        impls.push(service);
        subscribers.push(subscriber);
    }

    assert_eq!(publisher.subscriber_count().await, 3);

    // Publish with queue-all: one entry per subscriber of the method.
    let outcome = publisher
        .publish("state_changed", &BoolMsg { value: true })
        .await?;
    assert_eq!(outcome, PublishOutcome::Queued(3));
    assert_eq!(publisher.queue_len(), 3);

    // Unsubscribing the third subscriber removes its queued entry.
    subscribers[2].unsubscribe("state_changed").await?;
    assert_eq!(publisher.queue_len(), 2);

    // Draining delivers to exactly the remaining two.
    publisher.queue_process_all().await;
    assert!(wait_for(&impls[0].deliveries, 1).await);
    assert!(wait_for(&impls[1].deliveries, 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(impls[2].deliveries.load(Ordering::SeqCst), 0);

    for subscriber in &subscribers {
        subscriber.shutdown().await;
    }
    publisher.stop_subscription_server().await;
    Ok(())
}

#[tokio::test]
async fn publish_is_filtered_per_method() -> Result<()> {
    let publisher = Publisher::new(&FILTERED_DESCRIPTOR);
    publisher.start_subscription_server().await?;

    let service = Arc::new(CountingSubscriber {
        descriptor: &FILTERED_DESCRIPTOR,
        deliveries: AtomicU32::new(0),
    });
    let subscriber = Subscriber::new(service.clone(), FILTERED_DESCRIPTOR.name).await?;
    subscriber.subscribe("state_changed").await?;
    assert_eq!(publisher.subscriber_count().await, 1);

    // A method nobody subscribed to goes nowhere.
    let outcome = publisher
        .publish("config_changed", &BoolMsg { value: true })
        .await?;
    assert_eq!(outcome, PublishOutcome::Delivered(0));

    // Dropped by the publisher's own filter.
    publisher.filter().set("state_changed", FilterPolicy::Drop)?;
    let outcome = publisher
        .publish("state_changed", &BoolMsg { value: true })
        .await?;
    assert_eq!(outcome, PublishOutcome::Dropped);

    // And delivered once the filter is cleared.
    publisher.filter().clear("state_changed")?;
    let outcome = publisher
        .publish("state_changed", &BoolMsg { value: true })
        .await?;
    assert_eq!(outcome, PublishOutcome::Delivered(1));
    assert!(wait_for(&service.deliveries, 1).await);

    subscriber.shutdown().await;
    publisher.stop_subscription_server().await;
    Ok(())
}
