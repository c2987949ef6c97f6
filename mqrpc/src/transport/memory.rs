//! In-process broker.
//!
//! Models the subset of AMQP queue semantics the peers rely on: named queues
//! with exclusive, auto-delete and durable flags, round-robin delivery to
//! consumers, per-channel prefetch, and requeueing of unacknowledged
//! deliveries when a channel goes away. It also lets tests take the broker
//! down and cut live connections.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::{Channel, ChannelEvent, Connection, Consumer, Delivery, QueueFlags, Transport};
use crate::{ConnectionConfig, Error, ErrorKind, MsgMeta, Payload, Result};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
struct Stored {
    meta: MsgMeta,
    payload: Payload,
    redelivered: bool,
}

#[derive(Debug)]
struct Subscription {
    channel: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct QueueState {
    flags: QueueFlags,
    /// Declaring connection of an exclusive queue.
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<Subscription>,
    next_consumer: usize,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Stored)>,
    open: Arc<AtomicBool>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    unavailable: bool,
    next_id: u64,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, HashSet<u64>>,
    channels: HashMap<u64, ChannelState>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_closed(id: u64) -> Error {
        Error::new(ErrorKind::ChannelClosed, format!("channel {id} is closed"))
    }

    fn declare(&mut self, name: &str, flags: QueueFlags, connection: Option<u64>) -> Result<()> {
        if let Some(queue) = self.queues.get(name) {
            if queue.owner.is_some() && queue.owner != connection {
                return Err(Error::new(
                    ErrorKind::AssertQueueFailed,
                    format!("queue {name} is locked by another connection"),
                ));
            }
            return Ok(());
        }
        let owner = if flags.contains(QueueFlags::Exclusive) {
            connection
        } else {
            None
        };
        self.queues.insert(
            name.to_string(),
            QueueState {
                flags,
                owner,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn publish(&mut self, destination: &str, meta: MsgMeta, payload: Payload) {
        let Some(queue) = self.queues.get_mut(destination) else {
            tracing::debug!("no queue {destination}, message dropped");
            return;
        };
        queue.messages.push_back(Stored {
            meta,
            payload,
            redelivered: false,
        });
        self.dispatch(destination);
    }

    /// Hands ready messages of `name` to consumers with spare prefetch.
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let n = queue.consumers.len();
            let chosen = (0..n).map(|i| (queue.next_consumer + i) % n).find(|&idx| {
                let sub = &queue.consumers[idx];
                sub.no_ack || channels.get(&sub.channel).is_some_and(ChannelState::has_capacity)
            });
            let Some(idx) = chosen else {
                return;
            };
            let Some(stored) = queue.messages.pop_front() else {
                return;
            };
            let sub = &queue.consumers[idx];
            let Some(channel) = channels.get_mut(&sub.channel) else {
                queue.messages.push_front(stored);
                queue.consumers.remove(idx);
                continue;
            };

            channel.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: channel.next_tag,
                redelivered: stored.redelivered,
                meta: stored.meta.clone(),
                payload: stored.payload.clone(),
            };
            if sub.tx.send(delivery).is_err() {
                // the consumer went away without cancelling.
                queue.messages.push_front(stored);
                queue.consumers.remove(idx);
                continue;
            }
            if !sub.no_ack {
                channel
                    .unacked
                    .insert(channel.next_tag, (name.to_string(), stored));
            }
            queue.next_consumer = idx + 1;
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        channel.open.store(false, Ordering::Release);
        let _ = channel.events.send(ChannelEvent::Closed);
        if let Some(channels) = self.connections.get_mut(&channel.connection) {
            channels.remove(&id);
        }

        let mut touched = HashSet::new();
        for (_, (name, mut stored)) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&name) {
                stored.redelivered = true;
                queue.messages.push_front(stored);
                touched.insert(name);
            }
        }

        let mut deleted = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|sub| sub.channel != id);
            if queue.consumers.len() != before {
                touched.insert(name.clone());
                if queue.consumers.is_empty() && queue.flags.contains(QueueFlags::AutoDelete) {
                    deleted.push(name.clone());
                }
            }
        }
        for name in deleted {
            tracing::debug!("auto-delete queue {name} removed");
            self.queues.remove(&name);
            touched.remove(&name);
        }
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        let Some(channels) = self.connections.remove(&id) else {
            return;
        };
        for channel in channels {
            self.close_channel(channel);
        }
        self.queues.retain(|name, queue| {
            let keep = queue.owner != Some(id);
            if !keep {
                tracing::debug!("exclusive queue {name} removed");
            }
            keep
        });
    }
}

/// An in-process broker. Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, every connection attempt fails.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Closes every open connection, as if the network dropped.
    pub fn sever_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        tracing::info!("severing {} connection(s)", ids.len());
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Declares a queue outside of any connection.
    ///
    /// # Errors
    ///
    /// Fails if an exclusive queue with this name exists.
    pub fn declare_queue(&self, name: &str, flags: QueueFlags) -> Result<()> {
        self.state.lock().declare(name, flags, None)
    }

    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Number of messages ready for delivery in `name`.
    #[must_use]
    pub fn queue_len(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Ready messages of `name` in delivery order. Delivery tags are zero.
    #[must_use]
    pub fn peek(&self, name: &str) -> Vec<Delivery> {
        let state = self.state.lock();
        let Some(queue) = state.queues.get(name) else {
            return Vec::new();
        };
        queue
            .messages
            .iter()
            .map(|stored| Delivery {
                delivery_tag: 0,
                redelivered: stored.redelivered,
                meta: stored.meta.clone(),
                payload: stored.payload.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(Error::new(
                ErrorKind::ConnectFailed,
                format!("broker at {}:{} is unavailable", config.hostname, config.port),
            ));
        }
        let id = state.next_id();
        state.connections.insert(id, HashSet::new());
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

#[derive(Debug)]
struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(Error::new(
                ErrorKind::CreateChannelFailed,
                format!("connection {} is closed", self.id),
            ));
        }
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                open: open.clone(),
                events: events.clone(),
            },
        );
        if let Some(channels) = state.connections.get_mut(&self.id) {
            channels.insert(id);
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
            open,
            events,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.state.lock().close_connection(self.id);
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
    open: Arc<AtomicBool>,
    events: broadcast::Sender<ChannelEvent>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| BrokerState::channel_closed(self.id))?;
        channel.prefetch = count;
        Ok(())
    }

    async fn assert_queue(&self, name: &str, flags: QueueFlags) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(BrokerState::channel_closed(self.id));
        }
        state.declare(name, flags, Some(self.connection))
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(BrokerState::channel_closed(self.id));
        }
        let entry = state.queues.get_mut(queue).ok_or_else(|| {
            Error::new(ErrorKind::ConsumeFailed, format!("no queue {queue}"))
        })?;
        if entry.owner.is_some_and(|owner| owner != self.connection) {
            return Err(Error::new(
                ErrorKind::ConsumeFailed,
                format!("queue {queue} is locked by another connection"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumers.push(Subscription {
            channel: self.id,
            no_ack,
            tx,
        });
        state.dispatch(queue);
        Ok(Consumer::new(rx))
    }

    async fn send_to_queue(
        &self,
        destination: &str,
        payload: Payload,
        meta: &MsgMeta,
    ) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(BrokerState::channel_closed(self.id));
        }
        state.publish(destination, meta.clone(), payload);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or_else(|| BrokerState::channel_closed(self.id))?;
        let (queue, _) = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            Error::new(
                ErrorKind::AckFailed,
                format!("unknown delivery tag {delivery_tag}"),
            )
        })?;
        state.dispatch(&queue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open(broker: &MemoryBroker) -> (Arc<dyn Connection>, Arc<dyn Channel>) {
        let conn = broker.connect(&ConnectionConfig::default()).await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        (conn, channel)
    }

    fn meta(id: &str) -> MsgMeta {
        MsgMeta::request(id, "replies")
    }

    async fn nothing_delivered(consumer: &mut Consumer) -> bool {
        tokio::time::timeout(Duration::from_millis(10), consumer.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_prefetch_and_requeue() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work", QueueFlags::Durable).unwrap();
        let (_producer_conn, producer) = open(&broker).await;
        for id in ["1", "2", "3"] {
            producer
                .send_to_queue("work", Payload::from("job"), &meta(id))
                .await
                .unwrap();
        }

        let (conn, channel) = open(&broker).await;
        channel.prefetch(2).await.unwrap();
        let mut consumer = channel.consume("work", false).await.unwrap();
        let first = consumer.next().await.unwrap();
        let second = consumer.next().await.unwrap();
        assert_eq!(first.meta.correlation_id.as_deref(), Some("1"));
        assert_eq!(second.meta.correlation_id.as_deref(), Some("2"));
        assert!(nothing_delivered(&mut consumer).await);

        channel.ack(first.delivery_tag).await.unwrap();
        let third = consumer.next().await.unwrap();
        assert_eq!(third.meta.correlation_id.as_deref(), Some("3"));
        assert!(!third.redelivered);

        conn.close().await.unwrap();
        assert!(!channel.is_open());
        let requeued = broker.peek("work");
        let ids: Vec<_> = requeued
            .iter()
            .map(|d| d.meta.correlation_id.clone().unwrap())
            .collect();
        assert_eq!(ids, ["2", "3"]);
        assert!(requeued.iter().all(|d| d.redelivered));
    }

    #[tokio::test]
    async fn test_round_robin() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work", QueueFlags::Durable).unwrap();
        let (_c1, a) = open(&broker).await;
        let (_c2, b) = open(&broker).await;
        let mut ca = a.consume("work", true).await.unwrap();
        let mut cb = b.consume("work", true).await.unwrap();
        for id in ["1", "2"] {
            a.send_to_queue("work", Payload::Empty, &meta(id)).await.unwrap();
        }
        assert_eq!(ca.next().await.unwrap().meta.correlation_id.as_deref(), Some("1"));
        assert_eq!(cb.next().await.unwrap().meta.correlation_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_exclusive_queue_lifecycle() {
        let broker = MemoryBroker::new();
        let flags = QueueFlags::Exclusive | QueueFlags::AutoDelete;
        let (conn, channel) = open(&broker).await;
        channel.assert_queue("replies", flags).await.unwrap();
        let _consumer = channel.consume("replies", true).await.unwrap();

        let (_other_conn, other) = open(&broker).await;
        let err = other.assert_queue("replies", flags).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AssertQueueFailed);
        let err = other.consume("replies", true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConsumeFailed);

        conn.close().await.unwrap();
        assert!(!broker.queue_exists("replies"));
        other
            .send_to_queue("replies", Payload::Empty, &MsgMeta::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_outage() {
        let broker = MemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        let mut events = channel.events();

        broker.set_available(false);
        let err = broker
            .connect(&ConnectionConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::ConnectFailed);

        broker.sever_connections();
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Closed)));
        assert_eq!(broker.connection_count(), 0);
        let err = channel.prefetch(1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelClosed);

        broker.set_available(true);
        let (_conn, channel) = open(&broker).await;
        assert!(channel.is_open());
    }
}
