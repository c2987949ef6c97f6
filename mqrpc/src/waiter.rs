use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};

use crate::RpcError;

/// Final outcome of a call.
pub type Outcome = std::result::Result<Value, RpcError>;

struct PendingCall {
    method: String,
    params: Value,
    issued_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

/// Correlation table matching replies to in-flight calls.
///
/// Every entry is removed exactly once: by a reply ([`resolve`](Self::resolve)),
/// by the sweeper ([`expire`](Self::expire)), or by the owning client going
/// away ([`clear`](Self::clear)). Removal is the synchronization point, so a
/// reply and a sweep racing on the same id resolve the call once; the loser
/// finds the id unknown and does nothing.
#[derive(Default)]
pub struct Waiter {
    id_map: DashMap<String, PendingCall, RandomState>,
}

impl Waiter {
    /// Registers a pending call and returns the future that receives its
    /// outcome. An existing entry with the same id is replaced and its caller
    /// abandoned.
    pub fn register(&self, correlation_id: String, method: &str, params: Value) -> Reply {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            method: method.to_string(),
            params,
            issued_at: Instant::now(),
            tx,
        };
        match self.id_map.entry(correlation_id) {
            Entry::Occupied(mut entry) => {
                tracing::warn!("duplicate correlation id: {}", entry.key());
                entry.insert(call);
            }
            Entry::Vacant(entry) => {
                entry.insert(call);
            }
        }
        Reply { rx: Some(rx) }
    }

    /// Resolves the call registered under `correlation_id`.
    ///
    /// Returns false if the id is unknown, which happens for late replies to
    /// expired calls and for duplicate deliveries.
    pub fn resolve(&self, correlation_id: &str, outcome: Outcome) -> bool {
        self.resolve_with(correlation_id, |_| outcome)
    }

    /// Like [`resolve`](Self::resolve), building the outcome from the name of
    /// the called method.
    pub fn resolve_with(&self, correlation_id: &str, f: impl FnOnce(&str) -> Outcome) -> bool {
        if let Some((_, call)) = self.id_map.remove(correlation_id) {
            let outcome = f(&call.method);
            // the caller may have dropped its reply; nothing to do then.
            let _ = call.tx.send(outcome);
            true
        } else {
            false
        }
    }

    /// Fails every call issued at least `timeout` before `now` with
    /// [`RpcError::Timeout`]. Returns the number of expired calls.
    pub fn expire(&self, timeout: Duration, now: Instant) -> usize {
        let is_due = |call: &PendingCall| call.issued_at + timeout <= now;
        let due: Vec<String> = self
            .id_map
            .iter()
            .filter(|entry| is_due(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for correlation_id in due {
            if let Some((_, call)) = self.id_map.remove_if(&correlation_id, |_, call| is_due(call))
            {
                tracing::debug!(
                    "call {correlation_id} to {} timed out, params: {}",
                    call.method,
                    call.params
                );
                let _ = call.tx.send(Err(RpcError::Timeout {
                    method: call.method,
                }));
                expired += 1;
            }
        }
        expired
    }

    /// Removes a call without resolving it.
    pub fn discard(&self, correlation_id: &str) -> bool {
        self.id_map.remove(correlation_id).is_some()
    }

    /// Removes every call without resolving it. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let len = self.id_map.len();
        self.id_map.clear();
        len
    }

    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.id_map.contains_key(correlation_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.id_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_map.is_empty()
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.id_map.len())
            .finish()
    }
}

/// Future resolving to the outcome of one call.
///
/// It completes exactly once, with the result or an [`RpcError`]. If the
/// client is stopped while the call is pending, the call is abandoned and
/// this future never completes; bound the wait with
/// [`tokio::time::timeout`] if that matters to the caller.
#[derive(Debug)]
#[must_use = "a reply does nothing unless awaited"]
pub struct Reply {
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl Future for Reply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                self.rx = None;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                // sender dropped without an outcome: the call was abandoned.
                self.rx = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
