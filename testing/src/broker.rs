//! In-memory broker for deterministic pipeline tests.
//!
//! Models the AMQP behaviour the pipeline relies on:
//!
//! - named queues with durability flags; conflicting redeclaration fails
//! - publishing to the default exchange (unroutable messages are dropped)
//! - manual-ack consumers with a per-channel prefetch limit
//! - closing or losing a channel requeues its unacknowledged deliveries at the
//!   head of their queues, marked redelivered, with a delivery count
//!
//! and adds fault injection: broker outages, severed connections, failing
//! publishes, acks that fail after the side effect (a crash between commit
//! and acknowledge), and broker restarts that keep only durable queues and
//! persistent messages.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use futures::Stream;
use order_pipeline_core::broker::{
    Broker, BrokerChannel, BrokerError, BrokerFuture, Delivery, DeliveryStream, DeliveryTag,
    OutboundMessage, QueueSpec,
};
use order_pipeline_core::event::Envelope;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    persistent: bool,
    headers: BTreeMap<String, String>,
    deliveries: u32,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct ChannelState {
    open: bool,
    severed: bool,
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: BTreeMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    connections_opened: u64,
    outage: bool,
    fail_publishes: u32,
    fail_acks: u32,
}

impl BrokerState {
    fn close_channel(&mut self, id: u64, severed: bool) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        channel.severed = severed;
        let unacked = std::mem::take(&mut channel.unacked);

        for (_, (queue, message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.ready.push_front(message);
            }
        }
    }

    fn sever_all(&mut self) {
        let ids: Vec<u64> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id, true);
        }
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState, BrokerError> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(BrokerError::ConnectionLost("channel is closed".to_string())),
        }
    }
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// While `true`, connects fail with `Unavailable`. Turning the outage on
    /// severs every open channel.
    pub fn set_outage(&self, outage: bool) {
        let mut state = self.state.lock().unwrap();
        state.outage = outage;
        if outage {
            state.sever_all();
        }
        drop(state);
        self.wake();
    }

    /// Drop every open connection, as a network failure would.
    pub fn sever_connections(&self) {
        self.state.lock().unwrap().sever_all();
        self.wake();
    }

    /// Restart the broker: connections drop, non-durable queues vanish, and
    /// durable queues keep only persistent messages.
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap();
        state.sever_all();
        state.queues.retain(|_, queue| queue.spec.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|message| message.persistent);
        }
        drop(state);
        self.wake();
    }

    /// Delete `queue` and its messages, as an operator would.
    pub fn delete_queue(&self, queue: &str) {
        self.state.lock().unwrap().queues.remove(queue);
        self.wake();
    }

    /// The next `count` publishes fail and drop their connection.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().unwrap().fail_publishes = count;
    }

    /// The next `count` acks fail and drop their connection, leaving the
    /// delivery unacknowledged: a crash after the side effect, before the ack.
    pub fn fail_next_acks(&self, count: u32) {
        self.state.lock().unwrap().fail_acks = count;
    }

    /// Place a raw persistent body on `queue`, declaring it durable if absent.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        let queue = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                spec: QueueSpec::durable(queue),
                ready: VecDeque::new(),
            });
        queue.ready.push_back(StoredMessage {
            body: body.into(),
            message_id: None,
            persistent: true,
            headers: BTreeMap::new(),
            deliveries: 0,
        });
        drop(state);
        self.wake();
    }

    /// Declared queues and their properties.
    #[must_use]
    pub fn queues(&self) -> BTreeMap<String, QueueSpec> {
        self.state
            .lock()
            .unwrap()
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.spec.clone()))
            .collect()
    }

    /// Properties of `queue`, if declared.
    #[must_use]
    pub fn queue(&self, queue: &str) -> Option<QueueSpec> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.spec.clone())
    }

    /// Bodies waiting on `queue`, head first.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Waiting messages on `queue` decoded as envelopes; undecodable bodies are skipped.
    #[must_use]
    pub fn envelopes(&self, queue: &str) -> Vec<Envelope> {
        self.messages(queue)
            .iter()
            .filter_map(|body| Envelope::decode(queue, body).ok())
            .collect()
    }

    /// Number of messages waiting on `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries from `queue` that are out and not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    /// Open channels.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .channels
            .values()
            .filter(|channel| channel.open)
            .count()
    }

    /// Successful connects since creation.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().unwrap().connections_opened
    }
}

impl Broker for InMemoryBroker {
    fn connect(&self) -> BrokerFuture<'_, Box<dyn BrokerChannel>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.outage {
                return Err(BrokerError::Unavailable("connection refused".to_string()));
            }
            state.next_channel += 1;
            state.connections_opened += 1;
            let id = state.next_channel;
            state.channels.insert(
                id,
                ChannelState {
                    open: true,
                    ..ChannelState::default()
                },
            );
            drop(state);

            let channel: Box<dyn BrokerChannel> = Box::new(InMemoryChannel {
                id,
                broker: self.clone(),
            });
            Ok(channel)
        })
    }
}

/// A channel on an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    fn deliveries(&self, queue: String) -> impl Stream<Item = Result<Delivery, BrokerError>> + Send + 'static {
        enum Step {
            Deliver(Delivery),
            Wait,
            Closed { severed: bool },
        }

        let id = self.id;
        let state = Arc::clone(&self.broker.state);
        let notify = Arc::clone(&self.broker.notify);

        async_stream::stream! {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let step = {
                    let mut guard = state.lock().unwrap();
                    let shared = &mut *guard;
                    match shared.channels.get_mut(&id) {
                        Some(channel) if channel.open => {
                            let in_flight = channel.unacked.len();
                            let message = if in_flight < usize::from(channel.prefetch.max(1)) {
                                shared.queues.get_mut(&queue).and_then(|q| q.ready.pop_front())
                            } else {
                                None
                            };
                            match message {
                                Some(mut message) => {
                                    message.deliveries += 1;
                                    channel.next_tag += 1;
                                    let tag = channel.next_tag;
                                    let delivery = Delivery {
                                        tag: DeliveryTag(tag),
                                        body: message.body.clone(),
                                        redelivered: message.deliveries > 1,
                                        delivery_count: Some(message.deliveries),
                                        message_id: message.message_id.clone(),
                                        headers: message.headers.clone(),
                                    };
                                    channel.unacked.insert(tag, (queue.clone(), message));
                                    Step::Deliver(delivery)
                                },
                                None => Step::Wait,
                            }
                        },
                        Some(channel) => Step::Closed { severed: channel.severed },
                        None => Step::Closed { severed: true },
                    }
                };

                match step {
                    Step::Deliver(delivery) => yield Ok(delivery),
                    Step::Wait => notified.await,
                    Step::Closed { severed } => {
                        if severed {
                            yield Err(BrokerError::ConnectionLost("connection reset".to_string()));
                        }
                        break;
                    },
                }
            }
        }
    }
}

impl BrokerChannel for InMemoryChannel {
    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            state.channel(self.id)?;

            if let Some(existing) = state.queues.get(&spec.name) {
                if existing.spec == *spec {
                    return Ok(());
                }
                let reason = format!(
                    "inequivalent arg: existing durable={}, exclusive={}, auto_delete={}",
                    existing.spec.durable, existing.spec.exclusive, existing.spec.auto_delete
                );
                return Err(BrokerError::PreconditionFailed {
                    queue: spec.name.clone(),
                    reason,
                });
            }

            state.queues.insert(
                spec.name.clone(),
                QueueState {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                },
            );
            Ok(())
        })
    }

    fn publish<'a>(&'a self, queue: &'a str, message: OutboundMessage) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            state.channel(self.id)?;

            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                state.close_channel(self.id, true);
                drop(state);
                self.broker.wake();
                return Err(BrokerError::ConnectionLost(
                    "connection dropped during publish".to_string(),
                ));
            }

            let Some(target) = state.queues.get_mut(queue) else {
                return Err(BrokerError::Unroutable(queue.to_string()));
            };
            target.ready.push_back(StoredMessage {
                body: message.body,
                message_id: Some(message.message_id.to_string()),
                persistent: message.persistent,
                headers: message.headers,
                deliveries: 0,
            });
            drop(state);
            self.broker.wake();
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, prefetch: u16) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            {
                let mut state = self.broker.state.lock().unwrap();
                if !state.queues.contains_key(queue) {
                    return Err(BrokerError::Other(format!("NOT_FOUND - no queue '{queue}'")));
                }
                state.channel(self.id)?.prefetch = prefetch;
            }
            let stream: DeliveryStream = Box::pin(self.deliveries(queue.to_string()));
            Ok(stream)
        })
    }

    fn ack(&self, tag: DeliveryTag) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            state.channel(self.id)?;

            if state.fail_acks > 0 {
                state.fail_acks -= 1;
                state.close_channel(self.id, true);
                drop(state);
                self.broker.wake();
                return Err(BrokerError::ConnectionLost(
                    "connection dropped before ack".to_string(),
                ));
            }

            let removed = state.channel(self.id)?.unacked.remove(&tag.0);
            drop(state);
            self.broker.wake();
            removed
                .map(|_| ())
                .ok_or_else(|| BrokerError::Other(format!("unknown delivery tag {tag}")))
        })
    }

    fn reject(&self, tag: DeliveryTag, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            let Some((queue, message)) = state.channel(self.id)?.unacked.remove(&tag.0) else {
                return Err(BrokerError::Other(format!("unknown delivery tag {tag}")));
            };
            if requeue {
                if let Some(queue) = state.queues.get_mut(&queue) {
                    queue.ready.push_front(message);
                }
            }
            drop(state);
            self.broker.wake();
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.broker.state.lock().unwrap().close_channel(self.id, false);
            self.broker.wake();
            Ok(())
        })
    }
}
