use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    Channel, ClientConfig, ConnectionState, Error, ErrorKind, Message, MsgMeta, Outcome,
    QueueFlags, Reply, Request, Response, Result, RpcError, TaskSupervisor, Transport, Waiter,
    config::generated_queue_name,
    link::{Endpoint, Link, LinkSettings},
    sweeper,
    transport::Delivery,
};

struct ClientInner {
    config: ClientConfig,
    server_queue: String,
    reply_queue: String,
    waiter: Arc<Waiter>,
    link: Arc<Link>,
    sweeper: Mutex<Option<TaskSupervisor>>,
}

/// RPC client calling the methods of one server queue.
///
/// Calls are published to the server queue with a fresh correlation id and
/// the client's private reply queue (`client-rpc-<uuid>`) as reply
/// destination. Replies are matched back to their calls by correlation id.
///
/// # Examples
///
/// ```rust,no_run
/// # use mqrpc::{Client, ClientConfig, transport::memory::MemoryBroker};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() {
/// let config: ClientConfig = serde_json::from_value(serde_json::json!({
///     "queue": "math",
///     "timeout": "20s",
/// }))
/// .unwrap();
/// let client = Client::new(config, Arc::new(MemoryBroker::new()));
/// client.run().await.unwrap();
///
/// let reply = client.call("fibonacci", 6).unwrap();
/// assert_eq!(reply.await, Ok(serde_json::json!(8)));
/// client.stop().await.unwrap();
/// # }
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let server_queue = config
            .queue
            .clone()
            .unwrap_or_else(|| generated_queue_name("server-rpc"));
        let reply_queue = generated_queue_name("client-rpc");
        let settings = LinkSettings {
            name: format!("client {reply_queue}"),
            connection: config.connection.clone(),
            prefetch: config.prefetch,
            reconnect: config.reconnect,
            reconnect_timeout: config.reconnect_timeout,
            buffer_capacity: config.buffer_capacity,
        };
        Self {
            inner: Arc::new(ClientInner {
                config,
                server_queue,
                reply_queue,
                waiter: Arc::default(),
                link: Link::new(settings, transport),
                sweeper: Mutex::default(),
            }),
        }
    }

    /// Starts the client: arms the timeout sweep and connects.
    ///
    /// Calling `run` on a running client does nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport failure of the first connection attempt. With
    /// `reconnect` enabled the client keeps running and retries later;
    /// otherwise it is stopped. Fails with [`ErrorKind::InvalidArgument`]
    /// when a timeout is set with a zero `sweepInterval`.
    pub async fn run(&self) -> Result<()> {
        let timeout = self.inner.config.timeout;
        if !timeout.is_zero() && self.inner.config.sweep_interval.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("sweepInterval must be non-zero with a timeout of {timeout:?}"),
            ));
        }
        if !timeout.is_zero() && !self.inner.link.is_activated() {
            let mut slot = self.inner.sweeper.lock();
            if slot.is_none() {
                let supervisor = TaskSupervisor::create();
                sweeper::start(
                    &supervisor,
                    self.inner.waiter.clone(),
                    timeout,
                    self.inner.config.sweep_interval,
                );
                *slot = Some(supervisor);
            }
        }

        let inner: Arc<dyn Endpoint> = self.inner.clone();
        let endpoint: Weak<dyn Endpoint> = Arc::downgrade(&inner);
        let result = self.inner.link.run(endpoint).await;
        if !self.inner.link.is_activated() {
            self.inner.stop_sweeper();
        }
        result
    }

    /// Stops the client. Pending calls are abandoned: their replies never
    /// complete. Stopping a stopped client is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails; transport errors while closing are logged.
    pub async fn stop(&self) -> Result<()> {
        self.inner.stop_sweeper();
        self.inner.link.stop().await;
        let abandoned = self.inner.waiter.clear();
        if abandoned > 0 {
            tracing::warn!("client stopped with {abandoned} call(s) pending");
        }
        Ok(())
    }

    /// Issues a call to `method` and returns the future of its outcome.
    ///
    /// The request is queued, not sent: while disconnected it waits in the
    /// outbound buffer and is published once the connection is back.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotRunning`] before [`run`](Self::run) or after
    /// [`stop`](Self::stop), [`ErrorKind::SerdeJsonError`] when `params` do
    /// not serialize and [`ErrorKind::BufferFull`] when too many messages
    /// wait to be published.
    pub fn call<P: Serialize>(&self, method: &str, params: P) -> Result<Reply> {
        let inner = &self.inner;
        if !inner.link.is_activated() {
            return Err(Error::new(
                ErrorKind::NotRunning,
                format!("client is not running, cannot call {method}"),
            ));
        }
        let params = serde_json::to_value(params)?;
        let request = Request::new(method, params.clone());
        let payload = request.to_payload()?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let reply = inner
            .waiter
            .register(correlation_id.clone(), method, params);
        let meta = MsgMeta::request(correlation_id.clone(), inner.reply_queue.clone());
        let msg = Message::new(inner.server_queue.clone(), meta, payload);
        if let Err(err) = inner.link.publish(msg) {
            inner.waiter.discard(&correlation_id);
            return Err(err);
        }
        tracing::debug!("call {correlation_id} to {method} queued");
        Ok(reply)
    }

    /// Callback flavour of [`call`](Self::call): `callback` runs once with the
    /// outcome, on a spawned task.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call); the callback is not invoked then.
    pub fn call_with<P, F>(&self, method: &str, params: P, callback: F) -> Result<()>
    where
        P: Serialize,
        F: FnOnce(Outcome) + Send + 'static,
    {
        let reply = self.call(method, params)?;
        tokio::spawn(async move { callback(reply.await) });
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.link.state()
    }

    pub async fn wait_for_state(&self, state: ConnectionState) {
        self.inner.link.wait_for_state(state).await;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.link.is_activated()
    }

    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    #[must_use]
    pub fn server_queue(&self) -> &str {
        &self.inner.server_queue
    }

    /// Number of calls waiting for their reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.waiter.len()
    }

    /// Number of requests waiting to be published.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.link.buffered()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.stop_sweeper();
        self.inner.link.detach();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_queue", &self.inner.server_queue)
            .field("reply_queue", &self.inner.reply_queue)
            .field("state", &self.inner.link.state())
            .field("pending", &self.inner.waiter.len())
            .finish()
    }
}

impl ClientInner {
    fn stop_sweeper(&self) {
        if let Some(supervisor) = self.sweeper.lock().take() {
            supervisor.stop();
        }
    }

    fn on_reply(&self, delivery: Delivery) {
        let Some(correlation_id) = delivery.meta.correlation_id else {
            tracing::warn!("reply without correlation id dropped");
            return;
        };
        let resolved = match Response::parse(&delivery.payload) {
            Ok(response) => self
                .waiter
                .resolve(&correlation_id, response.into_outcome()),
            Err(err) => self.waiter.resolve_with(&correlation_id, |method| {
                Err(RpcError::InternalError {
                    method: method.to_string(),
                    message: format!("undecodable reply: {err}"),
                    stack: None,
                })
            }),
        };
        if !resolved {
            tracing::debug!("reply to unknown call {correlation_id} dropped");
        }
    }
}

#[async_trait]
impl Endpoint for ClientInner {
    async fn attach(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        session: &TaskSupervisor,
    ) -> Result<()> {
        channel
            .assert_queue(&self.reply_queue, QueueFlags::Exclusive | QueueFlags::AutoDelete)
            .await?;
        let mut consumer = channel.consume(&self.reply_queue, true).await?;
        session.spawn(async move {
            while let Some(delivery) = consumer.next().await {
                self.on_reply(delivery);
            }
            tracing::debug!("reply consumer of {} ended", self.reply_queue);
        });
        Ok(())
    }
}
