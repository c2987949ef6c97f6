//! Request/response RPC over a message-queue broker.
//!
//! A [`Server`] consumes requests from a durable queue and answers each on
//! the reply queue named by the request. A [`Client`] publishes requests
//! carrying a correlation id and matches the replies arriving on its private
//! queue back to the pending calls. Both peers survive broker outages: while
//! disconnected, outbound messages are buffered and published in order once
//! the connection is re-established.
//!
//! The broker is reached through the [`Transport`] port. An in-process
//! [`transport::memory::MemoryBroker`] is always available; the `amqp`
//! feature adds an AMQP 0-9-1 transport.
#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod rpc_error;
pub use rpc_error::{
    ErrorBody, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, RpcError, TIMEOUT, Violation,
};

mod payload;
pub use payload::Payload;

mod msg;
pub use msg::{Message, MsgMeta, Request, Response};

mod config;
pub use config::{ClientConfig, ConnectionConfig, DEFAULT_BUFFER_CAPACITY, ServerConfig};

pub mod transport;
pub use transport::{Channel, ChannelEvent, Connection, Consumer, Delivery, QueueFlags, Transport};

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod waiter;
pub use waiter::{Outcome, Reply, Waiter};

mod sweeper;

mod outbox;

mod link;
pub use link::ConnectionState;

mod schema;
pub use schema::{JsonSchemaValidator, ParamsValidator};

mod router;
pub use router::{HandlerError, Method, Router};

mod client;
pub use client::Client;

mod server;
pub use server::Server;
