//! The three stages wired together over the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{Pipeline, WAIT, order_created};
use order_pipeline_core::domain::{OrderId, OrderRequest, PaymentStatus};
use order_pipeline_core::event::DomainEvent;
use order_pipeline_core::environment::Clock;
use order_pipeline_core::{ORDER_CREATED_QUEUE, PAYMENT_COMPLETED_QUEUE};
use order_pipeline_runtime::dead_letter::{DeadLetter, DeadLetterReason};
use order_pipeline_testing::eventually;

#[tokio::test]
async fn widget_order_flows_through_every_stage() {
    let pipeline = Pipeline::new();

    let placed = pipeline
        .service
        .place_order(OrderRequest::new("Widget", 2, 9.99))
        .await
        .unwrap();
    assert_eq!(placed.order.product, "Widget");
    assert_eq!(placed.order.quantity, 2);
    assert!((placed.order.price - 9.99).abs() < f64::EPSILON);
    assert!(placed.order.id.value() > 0);

    let queued = pipeline.broker.envelopes(ORDER_CREATED_QUEUE);
    assert_eq!(queued, vec![placed.envelope.clone()]);
    assert_eq!(
        queued[0].event,
        DomainEvent::OrderCreated(placed.order.clone())
    );

    let payment = pipeline.start_payment();
    assert!(eventually(WAIT, || pipeline.broker.ready_count(PAYMENT_COMPLETED_QUEUE) == 1).await);
    payment.stop().await;

    let payments = pipeline.payments.all();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].order_id, placed.order.id);
    assert_eq!(payments[0].status, PaymentStatus::Paid);

    let completed = pipeline.broker.envelopes(PAYMENT_COMPLETED_QUEUE);
    assert_eq!(completed[0].causation_id, Some(placed.envelope.message_id));
    let DomainEvent::PaymentCompleted(event) = &completed[0].event else {
        panic!("expected payment_completed, got {:?}", completed[0].event);
    };
    assert_eq!(event.order_id, placed.order.id);
    assert_eq!(event.status, PaymentStatus::Paid);
    assert_eq!(event.notified_at, pipeline.clock.now());

    let notification = pipeline.start_notification();
    assert!(eventually(WAIT, || pipeline.logs.len() == 1).await);
    assert!(eventually(WAIT, || pipeline.settled()).await);
    notification.stop().await;

    let log = &pipeline.logs.all()[0];
    assert_eq!(log.order_id, placed.order.id);
    assert_eq!(log.status, PaymentStatus::Paid);
    assert_eq!(log.notified_at, event.notified_at);
}

#[tokio::test]
async fn duplicate_order_created_creates_one_payment_and_reemits() {
    let pipeline = Pipeline::new();
    let envelope = order_created(42);
    pipeline.enqueue_order(&envelope);
    pipeline.enqueue_order(&envelope);

    let payment = pipeline.start_payment();
    assert!(eventually(WAIT, || pipeline.broker.ready_count(PAYMENT_COMPLETED_QUEUE) == 2).await);
    let report = payment.stop().await;

    assert_eq!(report.acked, 2);
    assert_eq!(pipeline.payments.for_order(OrderId::new(42)).len(), 1);

    let notification = pipeline.start_notification();
    assert!(eventually(WAIT, || pipeline.settled()).await);
    let report = notification.stop().await;

    assert_eq!(report.acked, 2);
    assert_eq!(pipeline.logs.for_order(OrderId::new(42)).len(), 1);
}

#[tokio::test]
async fn crash_between_commit_and_ack_converges() {
    let pipeline = Pipeline::new();
    pipeline.enqueue_order(&order_created(5));
    pipeline.broker.fail_next_acks(1);

    let payment = pipeline.start_payment();
    assert!(eventually(WAIT, || pipeline.broker.ready_count(PAYMENT_COMPLETED_QUEUE) == 2).await);
    assert!(
        eventually(WAIT, || {
            pipeline.broker.ready_count(ORDER_CREATED_QUEUE) == 0
                && pipeline.broker.unacked_count(ORDER_CREATED_QUEUE) == 0
        })
        .await
    );
    let report = payment.stop().await;
    assert!(report.reconnects >= 1);
    assert_eq!(pipeline.payments.len(), 1);

    pipeline.broker.fail_next_acks(1);
    let notification = pipeline.start_notification();
    assert!(eventually(WAIT, || pipeline.settled()).await);
    notification.stop().await;

    assert_eq!(pipeline.logs.len(), 1);
    assert_eq!(pipeline.logs.all()[0].order_id, OrderId::new(5));
}

#[tokio::test]
async fn store_failure_after_commit_is_retried_without_duplicates() {
    let pipeline = Pipeline::new();
    pipeline.enqueue_order(&order_created(8));
    pipeline.payments.fail_after_commit(1);

    let payment = pipeline.start_payment();
    assert!(eventually(WAIT, || pipeline.broker.ready_count(PAYMENT_COMPLETED_QUEUE) == 1).await);
    let report = payment.stop().await;

    assert_eq!(report.requeued, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(pipeline.payments.len(), 1);
}

#[tokio::test]
async fn processing_order_does_not_change_final_state() {
    let forward = Pipeline::new();
    forward.enqueue_order(&order_created(1));
    forward.enqueue_order(&order_created(2));

    let reverse = Pipeline::new();
    reverse.enqueue_order(&order_created(2));
    reverse.enqueue_order(&order_created(1));

    for pipeline in [&forward, &reverse] {
        let payment = pipeline.start_payment();
        let notification = pipeline.start_notification();
        assert!(eventually(WAIT, || pipeline.logs.len() == 2 && pipeline.settled()).await);
        payment.stop().await;
        notification.stop().await;
    }

    for id in [1, 2] {
        let order_id = OrderId::new(id);
        let state = |p: &Pipeline| {
            let payments: Vec<_> = p
                .payments
                .for_order(order_id)
                .into_iter()
                .map(|payment| (payment.order_id, payment.status))
                .collect();
            (payments, p.logs.for_order(order_id))
        };
        assert_eq!(state(&forward), state(&reverse));
        assert_eq!(state(&forward).1.len(), 1);
    }
}

#[tokio::test]
async fn poison_messages_are_contained() {
    let pipeline = Pipeline::new();
    pipeline.broker.inject(ORDER_CREATED_QUEUE, b"not json".to_vec());
    pipeline.enqueue_order(&order_created(0));
    pipeline.enqueue_order(&order_created(9));

    let payment = pipeline.start_payment();
    assert!(eventually(WAIT, || pipeline.payments.len() == 1).await);
    assert!(eventually(WAIT, || pipeline.broker.ready_count("order_created.dlq") == 2).await);
    let report = payment.stop().await;

    assert_eq!(report.dead_lettered, 2);
    assert_eq!(pipeline.payments.all()[0].order_id, OrderId::new(9));

    let letters: Vec<DeadLetter> = pipeline
        .broker
        .messages("order_created.dlq")
        .iter()
        .map(|body| serde_json::from_slice(body).unwrap())
        .collect();
    assert_eq!(letters[0].reason, DeadLetterReason::DecodeFailed);
    assert_eq!(letters[1].reason, DeadLetterReason::Rejected);
    assert!(letters.iter().all(|l| l.source_queue == ORDER_CREATED_QUEUE));
}

#[tokio::test]
async fn restarting_services_leaves_topology_unchanged() {
    let pipeline = Pipeline::new();

    for _ in 0..3 {
        let payment = pipeline.start_payment();
        let notification = pipeline.start_notification();
        pipeline
            .service
            .place_order(OrderRequest::new("Gadget", 1, 0.0))
            .await
            .unwrap();
        assert!(eventually(WAIT, || pipeline.settled()).await);
        payment.stop().await;
        notification.stop().await;
    }

    let queues = pipeline.broker.queues();
    let names: Vec<&str> = queues.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec![
            "order_created",
            "order_created.dlq",
            "payment_completed",
            "payment_completed.dlq",
        ]
    );
    assert!(queues.values().all(|spec| spec.durable));
    assert!(eventually(WAIT, || pipeline.logs.len() == 3).await);
}
