//! Port to the message transport.
//!
//! Peers only need a handful of broker operations: open a connection and a
//! channel, bound the number of unacknowledged deliveries, declare a queue,
//! consume from it, publish to a named queue and acknowledge a delivery.
//! Anything that can provide these (an AMQP broker, the in-process
//! [`memory::MemoryBroker`]) can carry RPC traffic.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::{ConnectionConfig, Error, MsgMeta, Payload, Result};

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

/// Queue declaration flags.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(transparent)]
#[serde(transparent)]
pub struct QueueFlags(u8);

bitflags! {
    impl QueueFlags: u8 {
        /// Only the declaring connection may use the queue; it is deleted
        /// when that connection closes.
        const Exclusive = 1;
        /// The queue is deleted once its last consumer goes away.
        const AutoDelete = 2;
        /// The queue survives broker restarts and client disconnects.
        const Durable = 4;
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Set when the message was delivered before and not acknowledged.
    pub redelivered: bool,
    pub meta: MsgMeta,
    pub payload: Payload,
}

/// Asynchronous notifications raised by a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel (or its connection) was closed. No further deliveries.
    Closed,
    /// The channel failed; it is closed as well.
    Error(Error),
    /// A published message could not be routed.
    Returned(Delivery),
    /// The channel's write buffer drained after back-pressure.
    Drain,
}

/// Stream of deliveries from one subscription. Ends when the channel closes.
#[derive(Debug)]
pub struct Consumer {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Factory for connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`ErrorKind::ConnectFailed`](crate::ErrorKind::ConnectFailed)
    /// when the broker cannot be reached or refuses the login.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// # Errors
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Closes the connection and every channel opened on it.
    ///
    /// # Errors
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Bounds the unacknowledged deliveries held by this channel's consumers.
    /// Zero means unbounded.
    ///
    /// # Errors
    async fn prefetch(&self, count: u16) -> Result<()>;

    /// Creates the queue if it does not exist yet.
    ///
    /// # Errors
    async fn assert_queue(&self, name: &str, flags: QueueFlags) -> Result<()>;

    /// Subscribes to a queue. With `no_ack` deliveries count as acknowledged
    /// as soon as they are sent.
    ///
    /// # Errors
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer>;

    /// Publishes `payload` to the queue named `destination`.
    ///
    /// # Errors
    async fn send_to_queue(&self, destination: &str, payload: Payload, meta: &MsgMeta)
    -> Result<()>;

    /// # Errors
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    fn is_open(&self) -> bool;

    fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_flags() {
        let flags = QueueFlags::Exclusive | QueueFlags::AutoDelete;
        assert!(flags.contains(QueueFlags::Exclusive));
        assert!(!flags.contains(QueueFlags::Durable));
        assert_eq!(serde_json::to_value(flags).unwrap(), 3);
        assert_eq!(QueueFlags::default(), QueueFlags::empty());
    }
}
