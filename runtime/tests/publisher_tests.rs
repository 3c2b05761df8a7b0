//! Publisher behaviour against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::order_envelope;
use order_pipeline_core::ORDER_CREATED_QUEUE;
use order_pipeline_core::broker::{Broker, QueueSpec};
use order_pipeline_core::environment::Clock;
use order_pipeline_core::event::{Envelope, SCHEMA_VERSION};
use order_pipeline_runtime::publisher::{PublishError, Publisher};
use order_pipeline_runtime::retry::RetryPolicy;
use order_pipeline_runtime::topology::{TopologyError, TopologyManager};
use order_pipeline_testing::{InMemoryBroker, test_clock};
use std::sync::Arc;
use uuid::Uuid;

fn publisher(broker: &InMemoryBroker, retries: u32) -> Publisher {
    Publisher::new(Arc::new(broker.clone())).with_retry_policy(RetryPolicy::immediate(retries))
}

#[tokio::test]
async fn publish_event_declares_topology_and_confirms() {
    let broker = InMemoryBroker::new();
    let clock = test_clock();
    let publisher = publisher(&broker, 0).with_clock(Arc::new(clock.clone()));
    let cause = Uuid::new_v4();

    let event = order_envelope(11).event;
    let envelope = publisher.publish_event(event, Some(cause)).await.unwrap();

    assert_eq!(envelope.causation_id, Some(cause));
    assert_eq!(envelope.occurred_at, clock.now());
    assert_eq!(envelope.schema_version, SCHEMA_VERSION);
    assert!(broker.queue(ORDER_CREATED_QUEUE).is_some());
    assert!(broker.queue("order_created.dlq").is_some());
    assert_eq!(broker.envelopes(ORDER_CREATED_QUEUE), vec![envelope]);
}

#[tokio::test]
async fn reuses_one_channel_across_publishes() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 0);

    for id in 1..=3 {
        publisher
            .publish(ORDER_CREATED_QUEUE, &order_envelope(id))
            .await
            .unwrap();
    }

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.ready_count(ORDER_CREATED_QUEUE), 3);
}

#[tokio::test]
async fn retries_through_dropped_connections() {
    let broker = InMemoryBroker::new();
    broker.fail_next_publishes(2);
    let publisher = publisher(&broker, 3);

    let envelope = order_envelope(1);
    publisher.publish(ORDER_CREATED_QUEUE, &envelope).await.unwrap();

    assert_eq!(broker.connections_opened(), 3);
    assert_eq!(broker.envelopes(ORDER_CREATED_QUEUE), vec![envelope]);
}

#[tokio::test]
async fn exhausted_retries_surface_unavailable() {
    let broker = InMemoryBroker::new();
    broker.set_outage(true);
    let publisher = publisher(&broker, 2);

    let err = publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(1))
        .await
        .unwrap_err();

    match err {
        PublishError::Unavailable { queue, attempts, .. } => {
            assert_eq!(queue, ORDER_CREATED_QUEUE);
            assert_eq!(attempts, 3);
        },
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn recovers_after_outage_ends() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 0);

    publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(1))
        .await
        .unwrap();
    broker.set_outage(true);
    assert!(
        publisher
            .publish(ORDER_CREATED_QUEUE, &order_envelope(2))
            .await
            .is_err()
    );

    broker.set_outage(false);
    publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(3))
        .await
        .unwrap();
    assert_eq!(broker.ready_count(ORDER_CREATED_QUEUE), 2);
}

#[tokio::test]
async fn incompatible_queue_is_not_retried() {
    let broker = InMemoryBroker::new();
    let channel = broker.connect().await.unwrap();
    channel
        .declare_queue(&QueueSpec {
            durable: false,
            ..QueueSpec::durable(ORDER_CREATED_QUEUE)
        })
        .await
        .unwrap();

    let publisher = publisher(&broker, 5);
    let err = publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::Topology(TopologyError::Conflict { .. })
    ));
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn custom_dead_letter_suffix_is_declared() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 0).with_topology(TopologyManager::new(".dead"));

    publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(1))
        .await
        .unwrap();

    assert!(broker.queue("order_created.dead").is_some());
    assert!(broker.queue("order_created.dlq").is_none());
}

#[tokio::test]
async fn published_messages_survive_broker_restart() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 1);
    let envelope = order_envelope(4);

    publisher.publish(ORDER_CREATED_QUEUE, &envelope).await.unwrap();
    broker.restart();

    let bodies = broker.messages(ORDER_CREATED_QUEUE);
    assert_eq!(bodies.len(), 1);
    assert_eq!(
        Envelope::decode(ORDER_CREATED_QUEUE, &bodies[0]).unwrap(),
        envelope
    );

    publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(5))
        .await
        .unwrap();
    assert_eq!(broker.ready_count(ORDER_CREATED_QUEUE), 2);
}

#[tokio::test]
async fn closed_publisher_refuses_work() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 0);
    publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(1))
        .await
        .unwrap();

    publisher.close().await;

    assert!(matches!(
        publisher
            .publish(ORDER_CREATED_QUEUE, &order_envelope(2))
            .await,
        Err(PublishError::Closed)
    ));
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn deleted_queue_is_redeclared() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 2);
    publisher
        .publish(ORDER_CREATED_QUEUE, &order_envelope(1))
        .await
        .unwrap();

    broker.delete_queue(ORDER_CREATED_QUEUE);
    let envelope = order_envelope(2);
    publisher.publish(ORDER_CREATED_QUEUE, &envelope).await.unwrap();

    assert_eq!(broker.envelopes(ORDER_CREATED_QUEUE), vec![envelope]);
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn declare_creates_queues_up_front() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 0);

    publisher.declare(ORDER_CREATED_QUEUE).await.unwrap();

    assert!(broker.queue(ORDER_CREATED_QUEUE).is_some());
    assert!(broker.queue("order_created.dlq").is_some());
    assert_eq!(broker.ready_count(ORDER_CREATED_QUEUE), 0);
}

#[tokio::test]
async fn declare_reports_incompatible_queue() {
    let broker = InMemoryBroker::new();
    let channel = broker.connect().await.unwrap();
    channel
        .declare_queue(&QueueSpec {
            durable: false,
            ..QueueSpec::durable(ORDER_CREATED_QUEUE)
        })
        .await
        .unwrap();

    let err = publisher(&broker, 5)
        .declare(ORDER_CREATED_QUEUE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Topology(TopologyError::Conflict { .. })
    ));
}
