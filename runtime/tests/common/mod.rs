//! Shared fixtures for runtime integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use order_pipeline_core::ORDER_CREATED_QUEUE;
use order_pipeline_core::domain::{Order, OrderId};
use order_pipeline_core::event::{DomainEvent, Envelope};
use order_pipeline_core::handler::{HandlerError, HandlerFuture, MessageHandler};
use order_pipeline_runtime::consumer::{ConsumerConfig, ConsumerError, ConsumerLoop, ConsumerReport};
use order_pipeline_runtime::retry::RetryPolicy;
use order_pipeline_runtime::shutdown::{ShutdownSignal, ShutdownTrigger};
use order_pipeline_testing::InMemoryBroker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn order_envelope(order_id: i64) -> Envelope {
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

/// Place an `order_created` envelope directly on the queue.
pub fn enqueue(broker: &InMemoryBroker, envelope: &Envelope) {
    broker.inject(ORDER_CREATED_QUEUE, envelope.to_bytes().unwrap());
}

pub fn config() -> ConsumerConfig {
    ConsumerConfig::new(ORDER_CREATED_QUEUE)
        .with_reconnect(RetryPolicy::immediate(5))
        .with_drain_timeout(Duration::from_secs(2))
}

type Script = dyn Fn(&Envelope, u32) -> Result<(), HandlerError> + Send + Sync;

/// Handler driven by a closure of `(envelope, attempt for this message id)`.
pub struct ScriptedHandler {
    script: Box<Script>,
    delay: Duration,
    started: AtomicUsize,
    seen: Mutex<Vec<Envelope>>,
    attempts: Mutex<HashMap<Uuid, u32>>,
}

impl ScriptedHandler {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&Envelope, u32) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::new(Self::build(script, Duration::ZERO))
    }

    pub fn slow<F>(delay: Duration, script: F) -> Arc<Self>
    where
        F: Fn(&Envelope, u32) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Arc::new(Self::build(script, delay))
    }

    fn build<F>(script: F, delay: Duration) -> Self
    where
        F: Fn(&Envelope, u32) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay,
            started: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn ok() -> Arc<Self> {
        Self::new(|_, _| Ok(()))
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Envelope> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls_for(&self, message_id: Uuid) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&message_id)
            .copied()
            .unwrap_or(0)
    }
}

impl MessageHandler for ScriptedHandler {
    fn handle(&self, envelope: Envelope) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(envelope.message_id).or_insert(0);
                *count += 1;
                *count
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let result = (self.script)(&envelope, attempt);
            self.seen.lock().unwrap().push(envelope);
            result
        })
    }
}

/// A consumer loop running on a background task.
pub struct Running {
    pub consumer: Arc<ConsumerLoop>,
    pub trigger: ShutdownTrigger,
    pub task: JoinHandle<Result<ConsumerReport, ConsumerError>>,
}

impl Running {
    pub async fn stop(self) -> Result<ConsumerReport, ConsumerError> {
        self.trigger.trigger();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
    }
}

pub fn spawn_consumer(
    broker: &InMemoryBroker,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
) -> Running {
    let consumer = Arc::new(ConsumerLoop::new(Arc::new(broker.clone()), config));
    let (trigger, signal) = ShutdownSignal::pair();
    let task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(handler, signal).await })
    };
    Running {
        consumer,
        trigger,
        task,
    }
}
