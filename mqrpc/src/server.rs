use std::{
    future::Future,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::time::Instant;

use crate::{
    Channel, ConnectionState, HandlerError, JsonSchemaValidator, Message, MsgMeta, Outcome,
    ParamsValidator, QueueFlags, Request, Response, Result, Router, RpcError, ServerConfig,
    TaskSupervisor, Transport,
    config::generated_queue_name,
    link::{Endpoint, Link, LinkSettings},
    transport::Delivery,
};

struct ServerInner {
    queue: String,
    router: RwLock<Router>,
    link: Arc<Link>,
}

/// RPC server consuming requests from one durable queue.
///
/// The `Server` manages:
/// - Method bindings, each with an optional parameter validator
/// - The transport session, reconnecting when configured to
/// - Request dispatch, at most `prefetch` requests at a time
///
/// Each request is answered on its `replyTo` queue with the handler's result
/// or an error envelope. Handler failures and panics are reported to the
/// caller and never bring the server down.
///
/// # Examples
///
/// ```rust,no_run
/// # use mqrpc::{HandlerError, Server, ServerConfig, transport::memory::MemoryBroker};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() {
/// let config: ServerConfig =
///     serde_json::from_value(serde_json::json!({"queue": "math"})).unwrap();
/// let server = Server::new(config, Arc::new(MemoryBroker::new()));
/// server.bind("double", |n: i64| async move { Ok::<_, HandlerError>(n * 2) });
/// server
///     .bind_schema("double", &serde_json::json!({"type": "integer"}))
///     .unwrap();
/// server.run().await.unwrap();
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_router(config, Router::default(), transport)
    }

    /// Creates a server serving the bindings of `router`.
    pub fn with_router(config: ServerConfig, router: Router, transport: Arc<dyn Transport>) -> Self {
        let queue = config
            .queue
            .clone()
            .unwrap_or_else(|| generated_queue_name("server-rpc"));
        let settings = LinkSettings {
            name: format!("server {queue}"),
            connection: config.connection,
            prefetch: config.prefetch,
            reconnect: config.reconnect,
            reconnect_timeout: config.reconnect_timeout,
            buffer_capacity: config.buffer_capacity,
        };
        Self {
            inner: Arc::new(ServerInner {
                queue,
                router: RwLock::new(router),
                link: Link::new(settings, transport),
            }),
        }
    }

    /// Binds `handler` to `method`, replacing any previous handler. Returns
    /// whether `method` is bound afterwards.
    ///
    /// Params are deserialized into `P` before the handler runs; bind with
    /// `P = serde_json::Value` to receive them untouched.
    pub fn bind<F, Fut, P, R>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
    {
        self.inner.router.write().bind(method, handler)
    }

    /// Validates the params of `method` against a JSON Schema.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::SchemaCompileFailed`](crate::ErrorKind::SchemaCompileFailed)
    /// if `schema` is not a valid schema.
    pub fn bind_schema(&self, method: impl Into<String>, schema: &Value) -> Result<bool> {
        let validator = JsonSchemaValidator::compile(schema)?;
        Ok(self.bind_validator(method, Arc::new(validator)))
    }

    /// Validates the params of `method` against the schema derived from `T`.
    ///
    /// # Errors
    pub fn bind_schema_for<T: JsonSchema>(&self, method: impl Into<String>) -> Result<bool> {
        let schema = serde_json::to_value(schemars::schema_for!(T))?;
        self.bind_schema(method, &schema)
    }

    pub fn bind_validator(
        &self,
        method: impl Into<String>,
        validator: Arc<dyn ParamsValidator>,
    ) -> bool {
        self.inner.router.write().bind_validator(method, validator)
    }

    pub fn unbind(&self, method: &str) -> bool {
        self.inner.router.write().unbind(method)
    }

    pub fn unbind_schema(&self, method: &str) -> bool {
        self.inner.router.write().unbind_schema(method)
    }

    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.inner.router.read().has_method(method)
    }

    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        self.inner.router.read().method_names().cloned().collect()
    }

    /// Declares the request queue and starts consuming.
    ///
    /// # Errors
    ///
    /// Returns the transport failure of the first connection attempt.
    pub async fn run(&self) -> Result<()> {
        let inner: Arc<dyn Endpoint> = self.inner.clone();
        let endpoint: Weak<dyn Endpoint> = Arc::downgrade(&inner);
        self.inner.link.run(endpoint).await
    }

    /// Stops consuming and closes the transport session. Unacknowledged
    /// requests go back to the queue. Stopping a stopped server is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails; transport errors while closing are logged.
    pub async fn stop(&self) -> Result<()> {
        self.inner.link.stop().await;
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
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.link.detach();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("queue", &self.inner.queue)
            .field("state", &self.inner.link.state())
            .field("router", &*self.inner.router.read())
            .finish()
    }
}

impl ServerInner {
    async fn handle(self: Arc<Self>, channel: Arc<dyn Channel>, delivery: Delivery) {
        let Delivery {
            delivery_tag,
            meta,
            payload,
            ..
        } = delivery;
        let request = match Request::parse(&payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("malformed request on {} dropped: {err}", self.queue);
                Self::ack(channel.as_ref(), delivery_tag).await;
                return;
            }
        };

        let method = request.method.clone();
        let start_time = Instant::now();
        let outcome = self.execute(request).await;
        let elapsed = start_time.elapsed();
        match &outcome {
            Ok(_) => tracing::debug!("{method} done in {elapsed:?}"),
            Err(err) => tracing::warn!("{method} failed in {elapsed:?}: {err}"),
        }
        Self::ack(channel.as_ref(), delivery_tag).await;

        let Some(reply_to) = meta.reply_to else {
            tracing::debug!("{method} has no reply destination");
            return;
        };
        let payload = match Response::from_outcome(outcome).to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("failed to encode the response of {method}: {err}");
                return;
            }
        };
        let msg = Message::new(reply_to, MsgMeta::response(meta.correlation_id), payload);
        if let Err(err) = self.link.publish(msg) {
            tracing::warn!("response of {method} dropped: {err}");
        }
    }

    async fn execute(&self, request: Request) -> Outcome {
        let Request { method, params, .. } = request;
        let func = self.router.read().prepare(&method, &params)?;
        match tokio::spawn(func(params)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = if err.is_panic() {
                    let panic = err.into_panic();
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    format!("handler panicked: {reason}")
                } else {
                    "handler cancelled".to_string()
                };
                Err(RpcError::InternalError {
                    method,
                    message,
                    stack: None,
                })
            }
        }
    }

    async fn ack(channel: &dyn Channel, delivery_tag: u64) {
        if let Err(err) = channel.ack(delivery_tag).await {
            tracing::warn!("failed to ack delivery {delivery_tag}: {err}");
        }
    }
}

#[async_trait]
impl Endpoint for ServerInner {
    async fn attach(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        session: &TaskSupervisor,
    ) -> Result<()> {
        channel.assert_queue(&self.queue, QueueFlags::Durable).await?;
        let mut consumer = channel.consume(&self.queue, false).await?;
        session.spawn(async move {
            while let Some(delivery) = consumer.next().await {
                tokio::spawn(self.clone().handle(channel.clone(), delivery));
            }
            tracing::debug!("request consumer of {} ended", self.queue);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionConfig, Payload, transport::memory::MemoryBroker};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server(broker: &MemoryBroker) -> Server {
        let config: ServerConfig = serde_json::from_value(json!({"queue": "math"})).unwrap();
        Server::new(config, Arc::new(broker.clone()))
    }

    async fn send(broker: &MemoryBroker, payload: Payload, meta: MsgMeta) {
        let conn = broker.connect(&ConnectionConfig::default()).await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.send_to_queue("math", payload, &meta).await.unwrap();
    }

    async fn wait_for_len(broker: &MemoryBroker, queue: &str, len: usize) {
        while broker.queue_len(queue) != len {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_bindings() {
        let server = server(&MemoryBroker::new());
        assert!(server.queue() == "math");
        assert!(server.bind("echo", |v: Value| async move { Ok(v) }));
        assert!(server.has_method("echo"));
        assert!(server.bind("echo", |v: Value| async move { Ok(v) }));
        assert!(server.bind_schema("echo", &json!({"type": "number"})).unwrap());
        assert!(server.bind_schema_for::<u32>("echo").unwrap());
        assert!(server.bind_schema("echo", &json!({"type": 1})).is_err());
        assert_eq!(server.method_names(), ["echo"]);
        assert!(server.unbind_schema("echo"));
        assert!(server.unbind("echo"));
        assert!(!server.has_method("echo"));
    }

    #[tokio::test]
    async fn test_request_without_reply_to() {
        let broker = MemoryBroker::new();
        let server = server(&broker);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        server.bind("hit", move |_: Value| {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
        });
        server.run().await.unwrap();

        let request = Request::new("hit", Value::Null).to_payload().unwrap();
        send(&broker, request, MsgMeta::response(Some("1".into()))).await;
        while hits.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        wait_for_len(&broker, "math", 0).await;
        server.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_responses() {
        let broker = MemoryBroker::new();
        broker.declare_queue("replies", QueueFlags::Durable).unwrap();
        let server = server(&broker);
        server.bind("boom", |_: Value| async move {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        server.run().await.unwrap();

        send(&broker, Payload::from("garbage"), MsgMeta::request("0", "replies")).await;
        let request = Request::new("boom", Value::Null).to_payload().unwrap();
        send(&broker, request, MsgMeta::request("1", "replies")).await;
        let request = Request::new("missing", Value::Null).to_payload().unwrap();
        send(&broker, request, MsgMeta::request("2", "replies")).await;

        wait_for_len(&broker, "replies", 2).await;
        let mut replies = broker.peek("replies");
        replies.sort_by(|a, b| a.meta.correlation_id.cmp(&b.meta.correlation_id));
        let outcomes: Vec<Outcome> = replies
            .iter()
            .map(|d| Response::parse(&d.payload).unwrap().into_outcome())
            .collect();
        assert!(matches!(
            &outcomes[0],
            Err(RpcError::InternalError { method, message, .. })
                if method == "boom" && message.contains("kaboom")
        ));
        assert_eq!(
            outcomes[1],
            Err(RpcError::MethodNotFound {
                method: "missing".into()
            })
        );
        assert_eq!(broker.queue_len("math"), 0);
        server.stop().await.unwrap();
    }
}
