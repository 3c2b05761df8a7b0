//! Consumer Loop.
//!
//! Subscribes to one queue, hands each decoded envelope to a
//! [`MessageHandler`], and settles the delivery from the handler's result.
//! Acknowledgement always follows the handler's side effects; a delivery is
//! never acknowledged on receipt.
//!
//! # State machine
//!
//! ```text
//!            ┌─────────────── connection fault (from any state) ───────────────┐
//!            ▼                                                                 │
//!  Disconnected ──► Connecting ──► Subscribed ◄──► Processing ──► Acking ──────┤
//!                                      │                    └───► Rejecting ───┘
//!                                      └── shutdown ──► Draining ──► Stopped
//! ```
//!
//! # Settlement
//!
//! | Outcome                                   | Action                                   |
//! |-------------------------------------------|------------------------------------------|
//! | body does not decode                      | dead-letter (`decode_failed`)            |
//! | handler `Ok`                              | ack                                      |
//! | `Transient`, attempts ≤ `max_redeliveries`| reject with requeue                      |
//! | `Transient`, attempts > `max_redeliveries`| dead-letter (`redelivery_exhausted`)     |
//! | `Permanent`                               | dead-letter (`rejected`)                 |
//!
//! Dead-lettering publishes a [`DeadLetter`] record and waits for its confirm
//! before acking the original. Without a dead-letter queue the original is
//! rejected without requeue.
//!
//! # Concurrency
//!
//! Handlers run on `concurrency` lanes. Deliveries are routed by `order_id`, so
//! messages for one order are handled one at a time, in arrival order. Only
//! the loop task touches the broker channel; lanes report outcomes back over an
//! mpsc channel.

use crate::dead_letter::{DeadLetter, DeadLetterReason};
use crate::metrics::ConsumerMetrics;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::topology::{DEFAULT_DEAD_LETTER_SUFFIX, TopologyError, TopologyManager};
use futures::{FutureExt, StreamExt};
use order_pipeline_core::broker::{
    Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, DeliveryTag, OutboundMessage,
};
use order_pipeline_core::domain::OrderId;
use order_pipeline_core::environment::{Clock, SystemClock};
use order_pipeline_core::event::Envelope;
use order_pipeline_core::handler::{HandlerError, MessageHandler};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Header naming the dead-letter reason on dead-lettered messages.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// Header naming the source queue on dead-lettered messages.
pub const SOURCE_QUEUE_HEADER: &str = "x-source-queue";

/// Message ids remembered by the redelivery tracker.
const TRACKER_CAPACITY: usize = 10_000;

/// Observable consumer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// No broker connection
    Disconnected,
    /// Connecting and declaring topology
    Connecting,
    /// Waiting for deliveries
    Subscribed,
    /// At least one handler is running
    Processing,
    /// Acknowledging a delivery
    Acking,
    /// Rejecting or dead-lettering a delivery
    Rejecting,
    /// Shutdown requested; finishing in-flight handlers
    Draining,
    /// The loop has exited
    Stopped,
}

impl ConsumerState {
    /// Lower-case name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Processing => "processing",
            Self::Acking => "acking",
            Self::Rejecting => "rejecting",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that stop a consumer loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The queue exists with incompatible properties.
    #[error(transparent)]
    Topology(TopologyError),

    /// Reconnection failed too many times in a row.
    #[error("Gave up reconnecting to '{queue}' after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        /// Queue being consumed
        queue: String,
        /// Consecutive failed attempts
        attempts: u32,
        /// Last connection error
        last_error: String,
    },

    /// The configuration cannot be run.
    #[error("Invalid consumer configuration: {0}")]
    InvalidConfig(String),
}

/// Consumer loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Queue to consume
    pub queue: String,
    /// Handler lanes
    pub concurrency: usize,
    /// Unacknowledged deliveries in flight
    pub prefetch: u16,
    /// Transient failures tolerated before dead-lettering
    pub max_redeliveries: u32,
    /// How long shutdown waits for in-flight handlers
    pub drain_timeout: Duration,
    /// Backoff between reconnect attempts; `max_retries` bounds consecutive failures
    pub reconnect: RetryPolicy,
    /// Where undeliverable messages go; `None` discards them
    pub dead_letter_queue: Option<String>,
}

impl ConsumerConfig {
    /// Defaults: one lane, prefetch 1, 5 redeliveries, 30s drain, 10
    /// reconnect attempts, dead-letter queue `<queue>.dlq`.
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let dead_letter_queue = Some(format!("{queue}{DEFAULT_DEAD_LETTER_SUFFIX}"));
        Self {
            queue,
            concurrency: 1,
            prefetch: 1,
            max_redeliveries: 5,
            drain_timeout: Duration::from_secs(30),
            reconnect: RetryPolicy::reconnect(10),
            dead_letter_queue,
        }
    }

    /// Set the number of lanes. Prefetch is raised to match if lower.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        let lanes = u16::try_from(concurrency).unwrap_or(u16::MAX);
        self.prefetch = self.prefetch.max(lanes);
        self
    }

    /// Set the prefetch limit.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the redelivery limit.
    #[must_use]
    pub const fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set or disable the dead-letter queue.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, dead_letter_queue: Option<String>) -> Self {
        self.dead_letter_queue = dead_letter_queue;
        self
    }

    fn validate(&self) -> Result<(), ConsumerError> {
        if self.queue.is_empty() {
            return Err(ConsumerError::InvalidConfig("queue name is empty".into()));
        }
        if self.concurrency == 0 {
            return Err(ConsumerError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.prefetch == 0 {
            return Err(ConsumerError::InvalidConfig("prefetch must be at least 1".into()));
        }
        if self.dead_letter_queue.as_deref() == Some(self.queue.as_str()) {
            return Err(ConsumerError::InvalidConfig(
                "dead-letter queue must differ from the consumed queue".into(),
            ));
        }
        Ok(())
    }
}

/// Counters returned when a consumer loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Deliveries acknowledged after a successful handler run
    pub acked: u64,
    /// Deliveries rejected with requeue
    pub requeued: u64,
    /// Deliveries moved to the dead-letter queue
    pub dead_lettered: u64,
    /// Deliveries rejected without requeue (no dead-letter queue)
    pub discarded: u64,
    /// Successful reconnections after a connection fault
    pub reconnects: u64,
}

/// Counts transient failures per message id.
///
/// Forgets an id once its message is settled for good. Bounded; the oldest
/// ids are evicted first.
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    failures: HashMap<Uuid, u32>,
    order: VecDeque<Uuid>,
}

impl RedeliveryTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt and return the failure count for `message_id`.
    pub fn record_failure(&mut self, message_id: Uuid) -> u32 {
        if !self.failures.contains_key(&message_id) {
            if self.order.len() >= TRACKER_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.failures.remove(&oldest);
                }
            }
            self.order.push_back(message_id);
        }
        let count = self.failures.entry(message_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Failures recorded for `message_id`.
    #[must_use]
    pub fn failures(&self, message_id: &Uuid) -> u32 {
        self.failures.get(message_id).copied().unwrap_or(0)
    }

    /// Forget `message_id`.
    pub fn forget(&mut self, message_id: &Uuid) {
        if self.failures.remove(message_id).is_some() {
            self.order.retain(|id| id != message_id);
        }
    }

    /// Number of tracked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no ids are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Lane index for an order.
#[must_use]
pub fn lane_for(order_id: OrderId, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    order_id.hash(&mut hasher);
    let lanes = u64::try_from(lanes.max(1)).unwrap_or(u64::MAX);
    usize::try_from(hasher.finish() % lanes).unwrap_or(0)
}

struct Job {
    tag: DeliveryTag,
    envelope: Envelope,
    body: Vec<u8>,
    delivery_attempt: u32,
}

struct Outcome {
    tag: DeliveryTag,
    message_id: Uuid,
    order_id: OrderId,
    body: Vec<u8>,
    delivery_attempt: u32,
    result: Result<(), HandlerError>,
}

enum SessionEnd {
    Shutdown,
    ConnectionLost(BrokerError),
}

enum OpenError {
    Topology(TopologyError),
    Broker(BrokerError),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topology(e) => write!(f, "{e}"),
            Self::Broker(e) => write!(f, "{e}"),
        }
    }
}

/// Long-running consumer for one queue.
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    topology: TopologyManager,
    clock: Arc<dyn Clock>,
    state: watch::Sender<ConsumerState>,
}

impl fmt::Debug for ConsumerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ConsumerLoop {
    /// Create a consumer loop.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            broker,
            config,
            topology: TopologyManager::default(),
            clock: Arc::new(SystemClock),
            state,
        }
    }

    /// Set the clock used for dead-letter timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The loop's configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::trace!(queue = %self.config.queue, from = %current, to = %state, "Consumer state");
                *current = state;
                true
            }
        });
    }

    /// Consume until `shutdown` fires.
    ///
    /// Connection faults end the current session and trigger a reconnect
    /// (re-running topology declaration) with backoff; messages that were in
    /// flight are redelivered by the broker.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::InvalidConfig`] before connecting
    /// - [`ConsumerError::Topology`] if the queue exists with incompatible properties
    /// - [`ConsumerError::ReconnectExhausted`] after too many consecutive failed connects
    pub async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: ShutdownSignal,
    ) -> Result<ConsumerReport, ConsumerError> {
        self.config.validate()?;

        let queue = self.config.queue.as_str();
        let mut report = ConsumerReport::default();
        let mut tracker = RedeliveryTracker::new();
        let mut consecutive_failures: u32 = 0;
        let mut sessions: u64 = 0;

        tracing::info!(
            queue,
            concurrency = self.config.concurrency,
            prefetch = self.config.prefetch,
            "Starting consumer"
        );

        let result = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            self.set_state(ConsumerState::Connecting);
            let (channel, stream) = match self.open_session().await {
                Ok(opened) => opened,
                Err(OpenError::Topology(e)) if !e.is_connection_level() => {
                    tracing::error!(queue, error = %e, "Topology conflict, consumer cannot start");
                    break Err(ConsumerError::Topology(e));
                },
                Err(e) => {
                    self.set_state(ConsumerState::Disconnected);
                    consecutive_failures += 1;
                    let limit = self.config.reconnect.max_retries.max(1);
                    if consecutive_failures >= limit {
                        tracing::error!(queue, attempts = consecutive_failures, error = %e, "Giving up reconnecting");
                        break Err(ConsumerError::ReconnectExhausted {
                            queue: queue.to_string(),
                            attempts: consecutive_failures,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.config.reconnect.backoff(consecutive_failures - 1);
                    tracing::warn!(
                        queue,
                        attempt = consecutive_failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        () = shutdown.wait() => break Ok(()),
                    }
                },
            };

            consecutive_failures = 0;
            if sessions > 0 {
                report.reconnects += 1;
                ConsumerMetrics::record_reconnect(queue);
                tracing::info!(queue, reconnects = report.reconnects, "Consumer reconnected");
            }
            sessions += 1;
            self.set_state(ConsumerState::Subscribed);

            let end = self
                .session(
                    channel.as_ref(),
                    stream,
                    &handler,
                    &mut shutdown,
                    &mut tracker,
                    &mut report,
                )
                .await;

            if let Err(e) = channel.close().await {
                tracing::debug!(queue, error = %e, "Error closing consumer channel");
            }

            match end {
                SessionEnd::Shutdown => break Ok(()),
                SessionEnd::ConnectionLost(e) => {
                    tracing::warn!(queue, error = %e, "Connection lost, reconnecting");
                    self.set_state(ConsumerState::Disconnected);
                },
            }
        };

        self.set_state(ConsumerState::Stopped);
        tracing::info!(
            queue,
            acked = report.acked,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            discarded = report.discarded,
            reconnects = report.reconnects,
            "Consumer stopped"
        );
        result.map(|()| report)
    }

    async fn open_session(&self) -> Result<(Box<dyn BrokerChannel>, DeliveryStream), OpenError> {
        let channel = self.broker.connect().await.map_err(OpenError::Broker)?;

        let declared = async {
            self.topology
                .ensure_queue(channel.as_ref(), &self.config.queue, true)
                .await?;
            if let Some(dlq) = &self.config.dead_letter_queue {
                self.topology.ensure_queue(channel.as_ref(), dlq, true).await?;
            }
            Ok::<_, TopologyError>(())
        }
        .await;

        let stream = match declared {
            Ok(()) => channel
                .consume(&self.config.queue, self.config.prefetch)
                .await
                .map_err(OpenError::Broker),
            Err(e) => Err(OpenError::Topology(e)),
        };

        match stream {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    tracing::debug!(error = %close_err, "Error closing channel after failed open");
                }
                Err(e)
            },
        }
    }

    async fn session(
        &self,
        channel: &dyn BrokerChannel,
        mut stream: DeliveryStream,
        handler: &Arc<dyn MessageHandler>,
        shutdown: &mut ShutdownSignal,
        tracker: &mut RedeliveryTracker,
        report: &mut ConsumerReport,
    ) -> SessionEnd {
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut lanes = Lanes::spawn(self.config.concurrency, handler, &outcome_tx);
        let mut settler = Settler {
            consumer: self,
            channel,
            tracker,
            report,
        };
        let mut in_flight: usize = 0;

        let end = loop {
            tokio::select! {
                biased;

                () = shutdown.wait() => break None,

                Some(outcome) = outcome_rx.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    if let Err(e) = settler.settle(outcome).await {
                        break Some(e);
                    }
                    self.set_state(busy_state(in_flight));
                }

                delivery = stream.next() => match delivery {
                    Some(Ok(delivery)) => match settler.dispatch(delivery, &mut lanes).await {
                        Ok(true) => {
                            in_flight += 1;
                            self.set_state(ConsumerState::Processing);
                        },
                        Ok(false) => self.set_state(busy_state(in_flight)),
                        Err(e) => break Some(e),
                    },
                    Some(Err(e)) => break Some(e),
                    None => break Some(BrokerError::ConnectionLost("delivery stream ended".into())),
                },
            }
        };

        if let Some(e) = end {
            lanes.abort();
            return SessionEnd::ConnectionLost(e);
        }

        drop(stream);
        self.set_state(ConsumerState::Draining);
        tracing::info!(
            queue = %self.config.queue,
            in_flight,
            timeout = ?self.config.drain_timeout,
            "Draining consumer"
        );

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while in_flight > 0 {
                let Some(outcome) = outcome_rx.recv().await else {
                    break;
                };
                in_flight -= 1;
                if let Err(e) = settler.settle(outcome).await {
                    tracing::warn!(error = %e, "Connection lost while draining");
                    break;
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                queue = %self.config.queue,
                abandoned = in_flight,
                "Drain timeout elapsed; unsettled deliveries will be redelivered"
            );
        }
        lanes.abort();
        SessionEnd::Shutdown
    }
}

const fn busy_state(in_flight: usize) -> ConsumerState {
    if in_flight == 0 {
        ConsumerState::Subscribed
    } else {
        ConsumerState::Processing
    }
}

struct Lanes {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Lanes {
    fn spawn(
        count: usize,
        handler: &Arc<dyn MessageHandler>,
        outcomes: &mpsc::UnboundedSender<Outcome>,
    ) -> Self {
        let mut senders = Vec::with_capacity(count);
        let mut tasks = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tasks.push(tokio::spawn(run_lane(
                Arc::clone(handler),
                rx,
                outcomes.clone(),
            )));
        }
        Self { senders, tasks }
    }

    fn send(&self, job: Job) -> Result<(), BrokerError> {
        let lane = lane_for(job.envelope.event.order_id(), self.senders.len());
        self.senders
            .get(lane)
            .ok_or_else(|| BrokerError::Other(format!("no lane {lane}")))?
            .send(job)
            .map_err(|_| BrokerError::Other("worker lane stopped".into()))
    }

    fn abort(&mut self) {
        self.senders.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_lane(
    handler: Arc<dyn MessageHandler>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    outcomes: mpsc::UnboundedSender<Outcome>,
) {
    while let Some(job) = jobs.recv().await {
        let message_id = job.envelope.message_id;
        let order_id = job.envelope.event.order_id();
        let queue = job.envelope.event.queue_name();
        let started = Instant::now();

        let result = AssertUnwindSafe(handler.handle(job.envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Permanent("handler panicked".to_string())));

        ConsumerMetrics::record_handler_duration(queue, started.elapsed());

        let outcome = Outcome {
            tag: job.tag,
            message_id,
            order_id,
            body: job.body,
            delivery_attempt: job.delivery_attempt,
            result,
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
}

/// Settles deliveries on the session's channel.
struct Settler<'a> {
    consumer: &'a ConsumerLoop,
    channel: &'a dyn BrokerChannel,
    tracker: &'a mut RedeliveryTracker,
    report: &'a mut ConsumerReport,
}

impl Settler<'_> {
    fn queue(&self) -> &str {
        &self.consumer.config.queue
    }

    /// Decode and route a delivery. Returns `true` if it went to a lane.
    async fn dispatch(
        &mut self,
        delivery: Delivery,
        lanes: &mut Lanes,
    ) -> Result<bool, BrokerError> {
        let delivery_attempt = delivery.delivery_count.unwrap_or(1).max(1);

        match Envelope::decode(self.queue(), &delivery.body) {
            Ok(envelope) => {
                tracing::debug!(
                    queue = %self.queue(),
                    message_id = %envelope.message_id,
                    order_id = %envelope.event.order_id(),
                    redelivered = delivery.redelivered,
                    attempt = delivery_attempt,
                    "Received message"
                );
                lanes.send(Job {
                    tag: delivery.tag,
                    envelope,
                    body: delivery.body,
                    delivery_attempt,
                })?;
                Ok(true)
            },
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue(),
                    tag = %delivery.tag,
                    error = %e,
                    "Undecodable message"
                );
                let message_id = delivery
                    .message_id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok());
                self.dead_letter(
                    delivery.tag,
                    message_id,
                    &delivery.body,
                    DeadLetterReason::DecodeFailed,
                    &e.to_string(),
                    delivery_attempt,
                )
                .await?;
                Ok(false)
            },
        }
    }

    /// Resolve a handler outcome. Only connection-level failures are returned.
    async fn settle(&mut self, outcome: Outcome) -> Result<(), BrokerError> {
        let queue = self.consumer.config.queue.clone();
        match outcome.result {
            Ok(()) => {
                self.consumer.set_state(ConsumerState::Acking);
                self.channel.ack(outcome.tag).await?;
                self.tracker.forget(&outcome.message_id);
                self.report.acked += 1;
                ConsumerMetrics::record_outcome(&queue, "acked");
                tracing::info!(
                    queue = %queue,
                    message_id = %outcome.message_id,
                    order_id = %outcome.order_id,
                    outcome = "acked",
                    "Message processed"
                );
                Ok(())
            },
            Err(HandlerError::Transient(reason)) => {
                let failures = self.tracker.record_failure(outcome.message_id);
                let attempts = failures.max(outcome.delivery_attempt);
                if attempts > self.consumer.config.max_redeliveries {
                    tracing::error!(
                        queue = %queue,
                        message_id = %outcome.message_id,
                        order_id = %outcome.order_id,
                        attempts,
                        error = %reason,
                        "Redelivery limit exceeded"
                    );
                    return self
                        .dead_letter(
                            outcome.tag,
                            Some(outcome.message_id),
                            &outcome.body,
                            DeadLetterReason::RedeliveryExhausted,
                            &reason,
                            attempts,
                        )
                        .await;
                }

                self.consumer.set_state(ConsumerState::Rejecting);
                self.channel.reject(outcome.tag, true).await?;
                self.report.requeued += 1;
                ConsumerMetrics::record_outcome(&queue, "requeued");
                tracing::warn!(
                    queue = %queue,
                    message_id = %outcome.message_id,
                    order_id = %outcome.order_id,
                    attempts,
                    error = %reason,
                    outcome = "requeued",
                    "Transient handler failure"
                );
                Ok(())
            },
            Err(HandlerError::Permanent(reason)) => {
                tracing::error!(
                    queue = %queue,
                    message_id = %outcome.message_id,
                    order_id = %outcome.order_id,
                    error = %reason,
                    "Permanent handler failure"
                );
                self.dead_letter(
                    outcome.tag,
                    Some(outcome.message_id),
                    &outcome.body,
                    DeadLetterReason::Rejected,
                    &reason,
                    outcome.delivery_attempt,
                )
                .await
            },
        }
    }

    async fn dead_letter(
        &mut self,
        tag: DeliveryTag,
        message_id: Option<Uuid>,
        body: &[u8],
        reason: DeadLetterReason,
        detail: &str,
        attempts: u32,
    ) -> Result<(), BrokerError> {
        self.consumer.set_state(ConsumerState::Rejecting);
        let queue = self.consumer.config.queue.clone();

        let Some(dlq) = self.consumer.config.dead_letter_queue.clone() else {
            self.channel.reject(tag, false).await?;
            self.forget(message_id);
            self.report.discarded += 1;
            ConsumerMetrics::record_outcome(&queue, "discarded");
            tracing::warn!(queue = %queue, ?message_id, reason = reason.as_str(), "Message discarded");
            return Ok(());
        };

        let record = DeadLetter::new(&queue, reason, detail, body, self.consumer.clock.now())
            .with_message_id(message_id)
            .with_attempts(attempts);

        let published = match record.to_bytes() {
            Ok(bytes) => {
                let message = OutboundMessage::json(Uuid::new_v4(), bytes)
                    .with_header(DEAD_LETTER_REASON_HEADER, reason.as_str())
                    .with_header(SOURCE_QUEUE_HEADER, queue.as_str());
                self.channel.publish(&dlq, message).await
            },
            Err(e) => Err(BrokerError::Other(e.to_string())),
        };

        match published {
            Ok(()) => {
                self.channel.ack(tag).await?;
                self.forget(message_id);
                self.report.dead_lettered += 1;
                ConsumerMetrics::record_outcome(&queue, "dead_lettered");
                ConsumerMetrics::record_dead_letter(&queue, reason.as_str());
                tracing::warn!(
                    queue = %queue,
                    dead_letter_queue = %dlq,
                    ?message_id,
                    reason = reason.as_str(),
                    attempts,
                    outcome = "dead_lettered",
                    "Message dead-lettered"
                );
                Ok(())
            },
            Err(e) if e.is_connection_level() => Err(e),
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    dead_letter_queue = %dlq,
                    ?message_id,
                    error = %e,
                    "Dead-letter publish failed, requeueing original"
                );
                self.channel.reject(tag, true).await?;
                self.report.requeued += 1;
                ConsumerMetrics::record_outcome(&queue, "requeued");
                Ok(())
            },
        }
    }

    fn forget(&mut self, message_id: Option<Uuid>) {
        if let Some(id) = message_id {
            self.tracker.forget(&id);
        }
    }
}
