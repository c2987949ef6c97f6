use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{Error, ErrorKind, Message, Result};

/// Ordered buffer of messages waiting to be published.
///
/// All outbound traffic of a peer goes through here, so messages queued
/// during an outage are flushed ahead of anything enqueued afterwards.
#[derive(Debug)]
pub(crate) struct Outbox {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::default(),
            capacity,
            notify: Notify::new(),
        }
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::BufferFull`] when `capacity` messages are waiting.
    pub fn push(&self, msg: Message) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(Error::new(
                    ErrorKind::BufferFull,
                    format!("{} messages waiting to be published", queue.len()),
                ));
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Takes up to `limit` messages from the head of the buffer.
    pub fn take(&self, limit: usize) -> Vec<Message> {
        let mut queue = self.queue.lock();
        let n = limit.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Puts unpublished messages back at the head, keeping their order.
    pub fn restore(&self, msgs: Vec<Message>) {
        let mut queue = self.queue.lock();
        for msg in msgs.into_iter().rev() {
            queue.push_front(msg);
        }
    }

    /// Drops every buffered message. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let len = queue.len();
        queue.clear();
        len
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Resolves after the next [`push`](Self::push) or [`wake`](Self::wake),
    /// or immediately if one happened since the last wait.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MsgMeta, Payload};

    fn msg(destination: &str) -> Message {
        Message::new(destination, MsgMeta::default(), Payload::Empty)
    }

    fn names(msgs: &[Message]) -> Vec<&str> {
        msgs.iter().map(|m| m.destination.as_str()).collect()
    }

    #[test]
    fn test_fifo_with_restore() {
        let outbox = Outbox::new(8);
        for name in ["a", "b", "c"] {
            outbox.push(msg(name)).unwrap();
        }
        let batch = outbox.take(2);
        assert_eq!(names(&batch), ["a", "b"]);

        outbox.push(msg("d")).unwrap();
        outbox.restore(batch);
        let all = outbox.take(usize::MAX);
        assert_eq!(names(&all), ["a", "b", "c", "d"]);
        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn test_capacity() {
        let outbox = Outbox::new(2);
        outbox.push(msg("a")).unwrap();
        outbox.push(msg("b")).unwrap();
        let err = outbox.push(msg("c")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BufferFull);
        assert_eq!(outbox.clear(), 2);
        outbox.push(msg("c")).unwrap();
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let outbox = Outbox::new(4);
        outbox.push(msg("a")).unwrap();
        // the permit stored by push is consumed without blocking.
        outbox.notified().await;
        assert_eq!(outbox.take(8).len(), 1);
    }
}
