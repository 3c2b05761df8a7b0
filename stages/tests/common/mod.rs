//! A complete pipeline on the in-memory broker and stores.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use order_pipeline_core::domain::{Order, OrderId};
use order_pipeline_core::event::{DomainEvent, Envelope};
use order_pipeline_core::handler::MessageHandler;
use order_pipeline_core::{ORDER_CREATED_QUEUE, PAYMENT_COMPLETED_QUEUE};
use order_pipeline_runtime::consumer::{ConsumerConfig, ConsumerError, ConsumerLoop, ConsumerReport};
use order_pipeline_runtime::publisher::Publisher;
use order_pipeline_runtime::retry::RetryPolicy;
use order_pipeline_runtime::shutdown::{ShutdownSignal, ShutdownTrigger};
use order_pipeline_runtime::stage::StageHandler;
use order_pipeline_stages::{NotificationStage, OrderService, PaymentStage};
use order_pipeline_testing::{
    FixedClock, InMemoryBroker, InMemoryOrderStore, InMemoryPaymentLogStore, InMemoryPaymentStore,
    test_clock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Pipeline {
    pub broker: InMemoryBroker,
    pub clock: FixedClock,
    pub orders: InMemoryOrderStore,
    pub payments: InMemoryPaymentStore,
    pub logs: InMemoryPaymentLogStore,
    pub publisher: Arc<Publisher>,
    pub service: OrderService,
}

impl Pipeline {
    pub fn new() -> Self {
        let broker = InMemoryBroker::new();
        let clock = test_clock();
        let orders = InMemoryOrderStore::new().with_clock(Arc::new(clock.clone()));
        let payments = InMemoryPaymentStore::new();
        let logs = InMemoryPaymentLogStore::new();
        let publisher = Arc::new(
            Publisher::new(Arc::new(broker.clone()))
                .with_retry_policy(RetryPolicy::immediate(2))
                .with_clock(Arc::new(clock.clone())),
        );
        let service = OrderService::new(Arc::new(orders.clone()), Arc::clone(&publisher));

        Self {
            broker,
            clock,
            orders,
            payments,
            logs,
            publisher,
            service,
        }
    }

    pub fn payment_handler(&self) -> Arc<dyn MessageHandler> {
        let stage = PaymentStage::new(Arc::new(self.payments.clone()))
            .with_clock(Arc::new(self.clock.clone()));
        Arc::new(StageHandler::new(Arc::new(stage), Arc::clone(&self.publisher)))
    }

    pub fn notification_handler(&self) -> Arc<dyn MessageHandler> {
        let stage = NotificationStage::new(Arc::new(self.logs.clone()));
        Arc::new(StageHandler::terminal(Arc::new(stage)))
    }

    pub fn start_payment(&self) -> Running {
        Running::spawn(&self.broker, config(ORDER_CREATED_QUEUE), self.payment_handler())
    }

    pub fn start_notification(&self) -> Running {
        Running::spawn(
            &self.broker,
            config(PAYMENT_COMPLETED_QUEUE),
            self.notification_handler(),
        )
    }

    /// Place an `order_created` envelope directly on the queue.
    pub fn enqueue_order(&self, envelope: &Envelope) {
        self.broker
            .inject(ORDER_CREATED_QUEUE, envelope.to_bytes().unwrap());
    }

    /// Both queues are empty and nothing is in flight.
    pub fn settled(&self) -> bool {
        [ORDER_CREATED_QUEUE, PAYMENT_COMPLETED_QUEUE]
            .iter()
            .all(|q| self.broker.ready_count(q) == 0 && self.broker.unacked_count(q) == 0)
    }
}

pub fn config(queue: &str) -> ConsumerConfig {
    ConsumerConfig::new(queue)
        .with_max_redeliveries(2)
        .with_reconnect(RetryPolicy::immediate(5))
        .with_drain_timeout(Duration::from_secs(2))
}

pub fn order_created(order_id: i64) -> Envelope {
    Envelope::new(
        DomainEvent::OrderCreated(Order {
            id: OrderId::new(order_id),
            product: "Widget".to_string(),
            quantity: 2,
            price: 9.99,
            created_at: Utc::now(),
        }),
        Utc::now(),
    )
}

pub struct Running {
    trigger: ShutdownTrigger,
    task: JoinHandle<Result<ConsumerReport, ConsumerError>>,
}

impl Running {
    fn spawn(broker: &InMemoryBroker, config: ConsumerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let consumer = ConsumerLoop::new(Arc::new(broker.clone()), config);
        let (trigger, signal): (ShutdownTrigger, ShutdownSignal) = ShutdownSignal::pair();
        let task = tokio::spawn(async move { consumer.run(handler, signal).await });
        Self { trigger, task }
    }

    pub async fn stop(self) -> ConsumerReport {
        self.trigger.trigger();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
            .expect("consumer failed")
    }
}
